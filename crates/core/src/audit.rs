//! Temporal audit store primitives.
//!
//! A live row only ever holds the current belief. The state it replaced is
//! kept as an [`AuditSnapshot`]: a copy of the row with a closed window on
//! both time axes. Snapshots are append-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bitemporal start of the current state of a live row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalCore {
    /// Event time of the fact that produced this state.
    pub valid_from: DateTime<Utc>,
    /// Processing time of the fact that produced this state.
    pub stored_from: DateTime<Utc>,
}

impl TemporalCore {
    pub fn new(valid_from: DateTime<Utc>, stored_from: DateTime<Utc>) -> Self {
        Self {
            valid_from,
            stored_from,
        }
    }
}

/// An entity subject to reconciliation.
///
/// `Clone` is the entity's copy operation; [`Temporal::to_audit`] produces
/// its paired snapshot type.
pub trait Temporal: Clone {
    fn temporal(&self) -> &TemporalCore;
    fn temporal_mut(&mut self) -> &mut TemporalCore;
    /// Source system that last wrote this entity.
    fn source_system(&self) -> &str;

    fn valid_from(&self) -> DateTime<Utc> {
        self.temporal().valid_from
    }

    fn stored_from(&self) -> DateTime<Utc> {
        self.temporal().stored_from
    }

    fn to_audit(&self, valid_until: DateTime<Utc>, stored_until: DateTime<Utc>) -> AuditSnapshot<Self> {
        retire(self, valid_until, stored_until)
    }
}

/// Immutable historical copy of an entity over a closed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSnapshot<E> {
    /// The entity exactly as it was before being superseded.
    pub row: E,
    pub valid_until: DateTime<Utc>,
    pub stored_until: DateTime<Utc>,
}

impl<E: Temporal> AuditSnapshot<E> {
    pub fn valid_from(&self) -> DateTime<Utc> {
        self.row.valid_from()
    }

    pub fn stored_from(&self) -> DateTime<Utc> {
        self.row.stored_from()
    }

    /// Was this the state held by the ledger at processing time `at`?
    ///
    /// Half-open on the transaction-time axis: `[stored_from, stored_until)`.
    pub fn was_stored_at(&self, at: DateTime<Utc>) -> bool {
        self.row.stored_from() <= at && at < self.stored_until
    }
}

/// Close the window of `entity`'s current state.
///
/// `valid_until` is normally the superseding fact's event time. A trusted
/// source may correct an untrusted row with a fact that happened earlier than
/// the row's own event time; the window is then closed at `valid_from` so it
/// never runs backwards.
pub fn retire<E: Temporal>(
    entity: &E,
    valid_until: DateTime<Utc>,
    stored_until: DateTime<Utc>,
) -> AuditSnapshot<E> {
    AuditSnapshot {
        valid_until: valid_until.max(entity.valid_from()),
        stored_until,
        row: entity.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Bed {
        temporal: TemporalCore,
        source: String,
        label: &'static str,
    }

    impl Temporal for Bed {
        fn temporal(&self) -> &TemporalCore {
            &self.temporal
        }
        fn temporal_mut(&mut self) -> &mut TemporalCore {
            &mut self.temporal
        }
        fn source_system(&self) -> &str {
            &self.source
        }
    }

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn bed(valid_from: &str, stored_from: &str) -> Bed {
        Bed {
            temporal: TemporalCore::new(dt(valid_from), dt(stored_from)),
            source: "EPIC".into(),
            label: "B11S-05",
        }
    }

    #[test]
    fn retire_copies_row_and_closes_window() {
        let live = bed("2024-01-01T10:00:00Z", "2024-01-01T10:00:05Z");
        let snapshot = live.to_audit(dt("2024-01-01T12:00:00Z"), dt("2024-01-01T12:00:03Z"));

        assert_eq!(snapshot.row, live);
        assert_eq!(snapshot.valid_from(), dt("2024-01-01T10:00:00Z"));
        assert_eq!(snapshot.valid_until, dt("2024-01-01T12:00:00Z"));
        assert_eq!(snapshot.stored_until, dt("2024-01-01T12:00:03Z"));
        assert_eq!(snapshot.row.label, "B11S-05");
    }

    #[test]
    fn retire_never_closes_before_valid_from() {
        let live = bed("2024-01-01T10:00:00Z", "2024-01-01T10:00:05Z");
        let snapshot = retire(&live, dt("2024-01-01T09:00:00Z"), dt("2024-01-01T12:00:00Z"));
        assert_eq!(snapshot.valid_until, snapshot.valid_from());
    }

    #[test]
    fn stored_window_is_half_open() {
        let live = bed("2024-01-01T10:00:00Z", "2024-01-01T10:00:00Z");
        let snapshot = retire(&live, dt("2024-01-01T12:00:00Z"), dt("2024-01-01T12:00:00Z"));

        assert!(snapshot.was_stored_at(dt("2024-01-01T10:00:00Z")));
        assert!(snapshot.was_stored_at(dt("2024-01-01T11:59:59Z")));
        assert!(!snapshot.was_stored_at(dt("2024-01-01T12:00:00Z")));
        assert!(!snapshot.was_stored_at(dt("2024-01-01T09:59:59Z")));
    }
}
