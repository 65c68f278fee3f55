//! Update arbiter: may this fact change this entity?

use chrono::{DateTime, Utc};

use crate::audit::Temporal;
use crate::row_state::RowState;
use crate::store::Record;
use crate::trust::TrustPolicy;

/// Which rule gates updates to an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Trusted sources may correct untrusted history; among trusted sources
    /// only facts that are not older than the stored state apply; untrusted
    /// sources never override existing state.
    TrustedSource,
    /// Any source, as long as the fact is not older than the stored state.
    ForwardOnly,
}

/// Decides, once per fact/entity pair, whether an existing entity may be
/// mutated. A rejection is not an error: the fact is simply stale or inferior
/// for that entity.
#[derive(Debug, Clone, Copy)]
pub struct Arbiter<'a> {
    trust: &'a TrustPolicy,
}

impl<'a> Arbiter<'a> {
    pub fn new(trust: &'a TrustPolicy) -> Self {
        Self { trust }
    }

    pub fn trust(&self) -> &'a TrustPolicy {
        self.trust
    }

    /// An entity just created by this fact may always be updated.
    pub fn permits<E: Record>(
        &self,
        policy: UpdatePolicy,
        fact_source: &str,
        fact_datetime: DateTime<Utc>,
        state: &RowState<E>,
    ) -> bool {
        if state.is_entity_created() {
            return true;
        }
        let entity = state.entity();
        let not_older = entity.valid_from() <= fact_datetime;
        match policy {
            UpdatePolicy::TrustedSource => {
                self.trust.is_trusted(fact_source)
                    && (!self.trust.is_trusted(entity.source_system()) || not_older)
            }
            UpdatePolicy::ForwardOnly => not_older,
        }
    }
}
