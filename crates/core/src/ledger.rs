// ---------------------------------------------------------------------------
// Ledger: entry point
// ---------------------------------------------------------------------------

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase};
use serde::{Deserialize, Serialize};

use crate::arbiter::{Arbiter, UpdatePolicy};
use crate::audit::{AuditSnapshot, Temporal};
use crate::facts::{Fact, FactEnvelope};
use crate::model::{HospitalVisit, LocationVisit, NotesMetadata, PlannedMovement, VisitObservation};
use crate::observations::{NoteFact, ObservationFact};
use crate::row_state::RowState;
use crate::store::{self, Record, Tally, UnitOfWork};
use crate::trust::TrustPolicy;
use crate::{movements, observations, visits, KardexError, RecordId, Result};

/// Why a fact did not change its primary entity.
///
/// None of these are errors: the fact was recognised and deliberately not
/// applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Stored state is newer or from a more trusted source.
    Superseded,
    /// Replay of something already recorded.
    Duplicate,
    /// Cancellation merged into one already waiting for its request.
    AwaitingRequest,
    /// Deletion of a visit the ledger does not hold.
    UnknownVisit,
}

/// Result of processing one fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub ignored: Option<IgnoreReason>,
}

impl Outcome {
    fn new(tally: Tally, ignored: Option<IgnoreReason>) -> Self {
        let mut outcome = Self {
            created: tally.created,
            updated: tally.updated,
            deleted: tally.deleted,
            ignored,
        };
        if outcome.ignored.is_none() && outcome.is_noop() {
            outcome.ignored = Some(IgnoreReason::Duplicate);
        }
        outcome
    }

    /// Nothing was written.
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Per-fact state shared by the lifecycle handlers.
pub(crate) struct FactContext<'a> {
    pub envelope: &'a FactEnvelope,
    pub stored_from: DateTime<Utc>,
    pub arbiter: Arbiter<'a>,
}

impl FactContext<'_> {
    pub fn event_datetime(&self) -> DateTime<Utc> {
        self.envelope.event_datetime
    }

    pub fn source(&self) -> &str {
        &self.envelope.source_system
    }

    pub fn encounter(&self) -> Result<&str> {
        self.envelope.encounter.as_deref().ok_or_else(|| {
            KardexError::MissingIdentity(format!(
                "{} fact has no encounter",
                self.envelope.fact.name()
            ))
        })
    }

    /// Arbitrate using the state's own message time as the fact time.
    pub fn permits<E: Record>(&self, policy: UpdatePolicy, state: &RowState<E>) -> bool {
        self.arbiter
            .permits(policy, self.source(), state.message_datetime(), state)
    }

    pub fn existing<E: Record>(&self, entity: E) -> RowState<E> {
        RowState::existing(entity, self.event_datetime(), self.stored_from)
    }

    pub fn created<E: Record>(&self, entity: E) -> RowState<E> {
        RowState::created(entity, self.event_datetime(), self.stored_from)
    }
}

/// Kardex reconciliation ledger.
///
/// Holds the live entity tables and their audit tables in one redb
/// database. Each call to [`Ledger::process`] applies one fact inside one
/// write transaction: lookup, arbitration, mutation and audit either all
/// commit or none do.
///
/// # Example
///
/// ```rust,no_run
/// use chrono::Utc;
/// use kardex::{Fact, FactEnvelope, Ledger, TrustPolicy};
///
/// let ledger = Ledger::open_in_memory(TrustPolicy::new(["EPIC"])).unwrap();
/// let fact = FactEnvelope::new("EPIC", Utc::now(), Fact::UpdatePatientInfo)
///     .with_mrn("40800000")
///     .with_encounter("123412341234");
/// ledger.process(&fact).unwrap();
/// assert!(ledger.visit("123412341234").unwrap().is_some());
/// ```
pub struct Ledger {
    db: Database,
    trust: TrustPolicy,
}

impl Ledger {
    /// Open or create a ledger backed by the file at `path`.
    pub fn open(path: impl AsRef<Path>, trust: TrustPolicy) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db, trust)
    }

    /// Create a ledger with no file I/O. Data is lost when it is dropped.
    pub fn open_in_memory(trust: TrustPolicy) -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db, trust)
    }

    fn init(db: Database, trust: TrustPolicy) -> Result<Self> {
        store::init_tables(&db)?;
        Ok(Self { db, trust })
    }

    pub fn trust_policy(&self) -> &TrustPolicy {
        &self.trust
    }

    /// Apply one fact, stamping it with the current processing time.
    pub fn process(&self, envelope: &FactEnvelope) -> Result<Outcome> {
        self.process_at(envelope, Utc::now())
    }

    /// Apply one fact with an explicit processing time.
    ///
    /// On error nothing is written and the fact may be redelivered.
    pub fn process_at(&self, envelope: &FactEnvelope, stored_from: DateTime<Utc>) -> Result<Outcome> {
        let mut uow = UnitOfWork::begin(&self.db)?;
        let ctx = FactContext {
            envelope,
            stored_from,
            arbiter: Arbiter::new(&self.trust),
        };

        let ignored = match &envelope.fact {
            Fact::PendingMovement {
                kind,
                planned_location,
                hospital_service,
            } => movements::process_request(&mut uow, &ctx, *kind, planned_location, hospital_service)?,
            Fact::CancelPendingMovement {
                kind,
                planned_location,
                cancelled_datetime,
            } => movements::process_cancellation(
                &mut uow,
                &ctx,
                *kind,
                planned_location,
                *cancelled_datetime,
            )?,
            Fact::MoveVisitInformation { previous_encounter } => {
                visits::move_visit(&mut uow, &ctx, previous_encounter)?
            }
            Fact::DeleteVisit => visits::delete_visit(&mut uow, &ctx)?,
            Fact::Observation {
                observation_id,
                observation_type,
                value_as_text,
                value_as_real,
                unit,
            } => {
                let fact = ObservationFact {
                    observation_id,
                    observation_type,
                    value_as_text,
                    value_as_real,
                    unit,
                };
                observations::process_observation(&mut uow, &ctx, fact)?
            }
            Fact::NotesMetadata {
                note_id,
                note_type,
                started_datetime,
                last_edit_datetime,
                editor_role,
            } => {
                let fact = NoteFact {
                    note_id,
                    note_type,
                    started_datetime,
                    last_edit_datetime: *last_edit_datetime,
                    editor_role,
                };
                observations::process_notes(&mut uow, &ctx, fact)?
            }
            Fact::UpdatePatientInfo
            | Fact::RegisterPatient { .. }
            | Fact::AdmitPatient { .. }
            | Fact::TransferPatient { .. }
            | Fact::DischargePatient { .. }
            | Fact::CancelAdmitPatient { .. }
            | Fact::CancelDischargePatient { .. } => visits::process_visit_fact(&mut uow, &ctx)?,
        };

        let outcome = Outcome::new(uow.commit()?, ignored);
        if let Some(reason) = outcome.ignored {
            tracing::debug!(
                fact = envelope.fact.name(),
                encounter = ?envelope.encounter,
                source = %envelope.source_system,
                ?reason,
                "fact not applied"
            );
        }
        Ok(outcome)
    }

    // -- produced state ----------------------------------------------------

    /// The live visit for an encounter number.
    pub fn visit(&self, encounter: &str) -> Result<Option<HospitalVisit>> {
        let read_txn = self.db.begin_read()?;
        let visit_id: Option<String> = {
            let index = read_txn.open_table(store::encounter_index())?;
            let found = index.get(encounter)?.map(|guard| guard.value().to_string());
            found
        };
        match visit_id {
            Some(id) => {
                let table = read_txn.open_table(HospitalVisit::TABLE)?;
                store::get_from(&table, &id)
            }
            None => Ok(None),
        }
    }

    /// Every retired state of the visit, ordered by `stored_until`.
    ///
    /// Includes snapshots taken under an earlier encounter number if the
    /// visit is still live, and snapshots of a deleted visit.
    pub fn visit_audits(&self, encounter: &str) -> Result<Vec<AuditSnapshot<HospitalVisit>>> {
        let live_id = self.visit(encounter)?.map(|v| v.visit_id);
        let read_txn = self.db.begin_read()?;
        let visit_ids = {
            let history = read_txn.open_table(store::encounter_history())?;
            store::visit_ids_for(&history, encounter)?
        };
        let table = read_txn.open_table(HospitalVisit::AUDIT_TABLE)?;
        let mut audits: Vec<AuditSnapshot<HospitalVisit>> = Vec::new();
        for visit_id in &visit_ids {
            let prefix = format!("{visit_id}:");
            audits.extend(store::scan_from::<AuditSnapshot<HospitalVisit>>(&table, &prefix)?);
        }
        audits.retain(|a| a.row.encounter == encounter || live_id.as_ref() == Some(&a.row.visit_id));
        audits.sort_by_key(|a| a.stored_until);
        Ok(audits)
    }

    /// What the ledger believed about the visit at processing time `at`.
    pub fn visit_as_of(&self, encounter: &str, at: DateTime<Utc>) -> Result<Option<HospitalVisit>> {
        if let Some(visit) = self.visit(encounter)? {
            if visit.stored_from() <= at {
                return Ok(Some(visit));
            }
        }
        Ok(self
            .visit_audits(encounter)?
            .into_iter()
            .find(|a| a.was_stored_at(at))
            .map(|a| a.row))
    }

    pub fn location_visits(&self, encounter: &str) -> Result<Vec<LocationVisit>> {
        self.dependents(encounter)
    }

    pub fn planned_movements(&self, encounter: &str) -> Result<Vec<PlannedMovement>> {
        self.dependents(encounter)
    }

    pub fn observations(&self, encounter: &str) -> Result<Vec<VisitObservation>> {
        self.dependents(encounter)
    }

    pub fn notes(&self, encounter: &str) -> Result<Vec<NotesMetadata>> {
        self.dependents(encounter)
    }

    /// Retired states of every `R` recorded against a visit, ordered by
    /// `stored_until`.
    pub fn audits_for_visit<R: Record>(&self, visit_id: &RecordId) -> Result<Vec<AuditSnapshot<R>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(R::AUDIT_TABLE)?;
        let mut audits: Vec<AuditSnapshot<R>> = store::scan_from(&table, &format!("{visit_id}:"))?;
        audits.sort_by_key(|a| a.stored_until);
        Ok(audits)
    }

    fn dependents<R: Record>(&self, encounter: &str) -> Result<Vec<R>> {
        let Some(visit) = self.visit(encounter)? else {
            return Ok(Vec::new());
        };
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(R::TABLE)?;
        store::scan_from(&table, &format!("{}:", visit.visit_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::{FieldValue, MovementType};
    use crate::model::MovementState;
    use tempfile::NamedTempFile;

    const ENCOUNTER: &str = "123412341234";
    const SDEC: &str = "1020100166^SDEC BY02^11 SDEC";

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn open_ledger() -> Ledger {
        Ledger::open_in_memory(TrustPolicy::new(["EPIC", "HL7"])).unwrap()
    }

    fn fact(source: &str, event: &str, fact: Fact) -> FactEnvelope {
        FactEnvelope::new(source, dt(event), fact)
            .with_mrn("40800000")
            .with_encounter(ENCOUNTER)
    }

    fn admit(event: &str) -> FactEnvelope {
        fact(
            "EPIC",
            event,
            Fact::AdmitPatient {
                admission_datetime: FieldValue::Known(dt(event)),
                location: FieldValue::Known("T11S^B11S^B11S-05".into()),
            },
        )
    }

    fn discharge(source: &str, event: &str) -> FactEnvelope {
        fact(
            source,
            event,
            Fact::DischargePatient {
                discharge_datetime: dt(event),
                disposition: FieldValue::Known("Home".into()),
                destination: FieldValue::Unknown,
                admission_datetime: FieldValue::Unknown,
            },
        )
    }

    fn class_update(event: &str, patient_class: &str) -> FactEnvelope {
        fact("EPIC", event, Fact::UpdatePatientInfo)
            .with_patient_class(FieldValue::Known(patient_class.into()))
    }

    fn request(event: &str) -> FactEnvelope {
        fact(
            "EPIC",
            event,
            Fact::PendingMovement {
                kind: MovementType::Transfer,
                planned_location: FieldValue::Known(SDEC.into()),
                hospital_service: FieldValue::Unknown,
            },
        )
    }

    fn cancel(event: &str) -> FactEnvelope {
        fact(
            "EPIC",
            event,
            Fact::CancelPendingMovement {
                kind: MovementType::Transfer,
                planned_location: FieldValue::Known(SDEC.into()),
                cancelled_datetime: dt(event),
            },
        )
    }

    #[test]
    fn first_fact_creates_minimal_visit() {
        let ledger = open_ledger();
        let outcome = ledger
            .process_at(&class_update("2024-01-01T10:00:00Z", "EMERGENCY"), dt("2024-01-01T10:00:05Z"))
            .unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.ignored, None);

        let visit = ledger.visit(ENCOUNTER).unwrap().unwrap();
        assert_eq!(visit.mrn, "40800000");
        assert_eq!(visit.patient_class.as_deref(), Some("EMERGENCY"));
        assert_eq!(visit.valid_from(), dt("2024-01-01T10:00:00Z"));
        assert_eq!(visit.stored_from(), dt("2024-01-01T10:00:05Z"));
        assert!(ledger.visit_audits(ENCOUNTER).unwrap().is_empty());
    }

    #[test]
    fn fact_without_encounter_is_rejected() {
        let ledger = open_ledger();
        let envelope = FactEnvelope::new("EPIC", dt("2024-01-01T10:00:00Z"), Fact::UpdatePatientInfo)
            .with_mrn("40800000");
        assert!(matches!(
            ledger.process(&envelope),
            Err(KardexError::MissingIdentity(_))
        ));
    }

    #[test]
    fn request_without_prior_row_is_requested() {
        let ledger = open_ledger();
        ledger.process(&request("2022-04-21T10:00:00Z")).unwrap();

        let rows = ledger.planned_movements(ENCOUNTER).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state(), MovementState::Requested);
        assert_eq!(rows[0].event_datetime, Some(dt("2022-04-21T10:00:00Z")));
        assert_eq!(rows[0].cancelled_datetime, None);
    }

    #[test]
    fn pending_movement_converges_in_either_order() {
        let in_order = open_ledger();
        in_order.process(&request("2022-04-21T09:15:00Z")).unwrap();
        in_order.process(&cancel("2022-04-21T09:30:00Z")).unwrap();

        let reversed = open_ledger();
        reversed.process(&cancel("2022-04-21T09:30:00Z")).unwrap();
        reversed.process(&request("2022-04-21T09:15:00Z")).unwrap();

        let times = |ledger: &Ledger| {
            ledger
                .planned_movements(ENCOUNTER)
                .unwrap()
                .iter()
                .map(|m| (m.state(), m.event_datetime, m.cancelled_datetime))
                .collect::<Vec<_>>()
        };
        assert_eq!(times(&in_order), times(&reversed));
        assert_eq!(
            times(&in_order),
            vec![(
                MovementState::Resolved,
                Some(dt("2022-04-21T09:15:00Z")),
                Some(dt("2022-04-21T09:30:00Z"))
            )]
        );
    }

    #[test]
    fn untrusted_source_never_changes_trusted_visit() {
        let ledger = open_ledger();
        ledger.process(&admit("2024-01-01T10:00:00Z")).unwrap();
        let before = ledger.visit(ENCOUNTER).unwrap().unwrap();

        let outcome = ledger.process(&discharge("caboodle", "2024-01-02T10:00:00Z")).unwrap();
        assert_eq!(outcome.ignored, Some(IgnoreReason::Superseded));
        assert!(outcome.is_noop());
        assert_eq!(ledger.visit(ENCOUNTER).unwrap().unwrap(), before);
        assert!(ledger.visit_audits(ENCOUNTER).unwrap().is_empty());
        assert!(ledger.location_visits(ENCOUNTER).unwrap()[0].is_open());
    }

    #[test]
    fn trusted_source_corrects_untrusted_visit() {
        let ledger = open_ledger();
        ledger.process(&discharge("caboodle", "2024-01-02T10:00:00Z")).unwrap();
        let outcome = ledger.process(&class_update("2024-01-01T09:00:00Z", "INPATIENT")).unwrap();
        assert_eq!(outcome.updated, 1);

        let visit = ledger.visit(ENCOUNTER).unwrap().unwrap();
        assert_eq!(visit.source_system, "EPIC");
        assert_eq!(visit.patient_class.as_deref(), Some("INPATIENT"));

        let audits = ledger.visit_audits(ENCOUNTER).unwrap();
        assert_eq!(audits.len(), 1);
        assert!(audits[0].valid_until >= audits[0].valid_from());
    }

    #[test]
    fn redelivered_discharge_leaves_one_audit_row() {
        let ledger = open_ledger();
        ledger.process(&admit("2024-01-01T10:00:00Z")).unwrap();

        let first = ledger.process(&discharge("EPIC", "2024-01-02T10:00:00Z")).unwrap();
        assert_eq!(first.updated, 2); // visit and its open stay
        let after_first = ledger.visit(ENCOUNTER).unwrap().unwrap();

        let second = ledger.process(&discharge("EPIC", "2024-01-02T10:00:00Z")).unwrap();
        assert_eq!(second.ignored, Some(IgnoreReason::Duplicate));
        assert!(second.is_noop());
        assert_eq!(ledger.visit(ENCOUNTER).unwrap().unwrap(), after_first);
        assert_eq!(ledger.visit_audits(ENCOUNTER).unwrap().len(), 1);
    }

    #[test]
    fn audit_chain_is_complete_and_contiguous() {
        let ledger = open_ledger();
        ledger
            .process_at(&class_update("2024-01-01T10:00:00Z", "EMERGENCY"), dt("2024-01-01T10:00:01Z"))
            .unwrap();
        let updates = [
            ("2024-01-01T11:00:00Z", "INPATIENT", "2024-01-01T11:00:01Z"),
            ("2024-01-01T12:00:00Z", "DAY CASE", "2024-01-01T12:00:01Z"),
            ("2024-01-01T13:00:00Z", "INPATIENT", "2024-01-01T13:00:01Z"),
        ];
        for (event, class, stored) in updates {
            ledger.process_at(&class_update(event, class), dt(stored)).unwrap();
        }

        let audits = ledger.visit_audits(ENCOUNTER).unwrap();
        assert_eq!(audits.len(), updates.len());
        for (audit, (event, _, stored)) in audits.iter().zip(updates) {
            assert_eq!(audit.valid_until, dt(event));
            assert_eq!(audit.stored_until, dt(stored));
        }
        for pair in audits.windows(2) {
            assert!(pair[0].valid_until <= pair[1].valid_from());
            assert_eq!(pair[0].stored_until, pair[1].stored_from());
        }
        let live = ledger.visit(ENCOUNTER).unwrap().unwrap();
        assert_eq!(audits.last().unwrap().stored_until, live.stored_from());
    }

    #[test]
    fn backdated_correction_keeps_audit_chain_contiguous() {
        let ledger = open_ledger();
        let untrusted = fact("caboodle", "2024-01-01T10:00:00Z", Fact::UpdatePatientInfo)
            .with_patient_class(FieldValue::Known("EMERGENCY".into()));
        ledger.process_at(&untrusted, dt("2024-01-01T10:00:01Z")).unwrap();

        let corrected = ledger
            .process_at(&class_update("2024-01-01T09:00:00Z", "INPATIENT"), dt("2024-01-01T10:05:00Z"))
            .unwrap();
        assert_eq!(corrected.updated, 1);
        let visit = ledger.visit(ENCOUNTER).unwrap().unwrap();
        assert_eq!(visit.valid_from(), dt("2024-01-01T10:00:00Z"));

        // The visit is now trusted state from 10:00; an older trusted fact is stale.
        let stale = ledger
            .process_at(&class_update("2024-01-01T09:30:00Z", "DAY CASE"), dt("2024-01-01T10:10:00Z"))
            .unwrap();
        assert_eq!(stale.ignored, Some(IgnoreReason::Superseded));

        ledger
            .process_at(&class_update("2024-01-01T11:00:00Z", "DAY CASE"), dt("2024-01-01T11:00:01Z"))
            .unwrap();

        let audits = ledger.visit_audits(ENCOUNTER).unwrap();
        assert_eq!(audits.len(), 2);
        for audit in &audits {
            assert!(audit.valid_from() <= audit.valid_until);
        }
        for pair in audits.windows(2) {
            assert!(pair[0].valid_until <= pair[1].valid_from());
            assert_eq!(pair[0].stored_until, pair[1].stored_from());
        }
        assert_eq!(audits[1].row.patient_class.as_deref(), Some("INPATIENT"));
    }

    #[test]
    fn retraction_older_than_state_is_ignored() {
        let ledger = open_ledger();
        ledger.process(&admit("2024-01-01T10:00:00Z")).unwrap();
        ledger.process(&class_update("2024-01-01T12:00:00Z", "INPATIENT")).unwrap();

        let outcome = ledger
            .process(&fact(
                "EPIC",
                "2024-01-01T12:30:00Z",
                Fact::CancelAdmitPatient {
                    cancelled_datetime: dt("2024-01-01T11:00:00Z"),
                },
            ))
            .unwrap();
        assert!(outcome.is_noop());
        let visit = ledger.visit(ENCOUNTER).unwrap().unwrap();
        assert_eq!(visit.admission_datetime, Some(dt("2024-01-01T10:00:00Z")));
        assert_eq!(ledger.location_visits(ENCOUNTER).unwrap().len(), 1);
    }

    #[test]
    fn deletion_cascades_with_final_snapshots() {
        let ledger = open_ledger();
        ledger
            .process_at(&admit("2024-01-01T10:00:00Z"), dt("2024-01-01T10:00:01Z"))
            .unwrap();
        ledger
            .process_at(&request("2024-01-01T11:00:00Z"), dt("2024-01-01T11:00:01Z"))
            .unwrap();
        let visit = ledger.visit(ENCOUNTER).unwrap().unwrap();

        let outcome = ledger
            .process_at(
                &fact("EPIC", "2024-01-02T08:00:00Z", Fact::DeleteVisit),
                dt("2024-01-02T08:00:01Z"),
            )
            .unwrap();
        assert_eq!(outcome.deleted, 3);

        assert!(ledger.visit(ENCOUNTER).unwrap().is_none());
        assert!(ledger.location_visits(ENCOUNTER).unwrap().is_empty());
        assert!(ledger.planned_movements(ENCOUNTER).unwrap().is_empty());

        let audits = ledger.visit_audits(ENCOUNTER).unwrap();
        let last = audits.last().unwrap();
        assert_eq!(last.row.visit_id, visit.visit_id);
        assert_eq!(last.valid_until, dt("2024-01-02T08:00:00Z"));
        assert_eq!(last.stored_until, dt("2024-01-02T08:00:01Z"));

        let stays = ledger.audits_for_visit::<LocationVisit>(&visit.visit_id).unwrap();
        assert_eq!(stays.len(), 1);
        assert_eq!(stays[0].valid_until, dt("2024-01-02T08:00:00Z"));
        let planned = ledger.audits_for_visit::<PlannedMovement>(&visit.visit_id).unwrap();
        assert_eq!(planned.len(), 1);

        let replay = ledger
            .process(&fact("EPIC", "2024-01-02T08:00:00Z", Fact::DeleteVisit))
            .unwrap();
        assert_eq!(replay.ignored, Some(IgnoreReason::UnknownVisit));
    }

    #[test]
    fn visit_as_of_answers_past_beliefs() {
        let ledger = open_ledger();
        ledger
            .process_at(&class_update("2024-01-01T10:00:00Z", "EMERGENCY"), dt("2024-01-01T10:00:01Z"))
            .unwrap();
        ledger
            .process_at(&class_update("2024-01-01T11:00:00Z", "INPATIENT"), dt("2024-01-01T11:00:01Z"))
            .unwrap();

        let class_at = |at: &str| {
            ledger
                .visit_as_of(ENCOUNTER, dt(at))
                .unwrap()
                .and_then(|v| v.patient_class)
        };
        assert_eq!(class_at("2024-01-01T09:00:00Z"), None);
        assert_eq!(class_at("2024-01-01T10:30:00Z").as_deref(), Some("EMERGENCY"));
        assert_eq!(class_at("2024-01-01T11:00:01Z").as_deref(), Some("INPATIENT"));
    }

    #[test]
    fn failed_fact_writes_nothing() {
        let ledger = open_ledger();
        let envelope = fact(
            "EPIC",
            "2024-01-01T10:00:00Z",
            Fact::PendingMovement {
                kind: MovementType::Discharge,
                planned_location: FieldValue::Retract,
                hospital_service: FieldValue::Unknown,
            },
        );
        assert!(matches!(
            ledger.process(&envelope),
            Err(KardexError::IncompatibleData(_))
        ));
        assert!(ledger.visit(ENCOUNTER).unwrap().is_none());
    }

    #[test]
    fn file_backed_ledger_survives_reopen() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        {
            let ledger = Ledger::open(&path, TrustPolicy::new(["EPIC"])).unwrap();
            ledger.process(&admit("2024-01-01T10:00:00Z")).unwrap();
        }

        let ledger = Ledger::open(&path, TrustPolicy::new(["EPIC"])).unwrap();
        let visit = ledger.visit(ENCOUNTER).unwrap().unwrap();
        assert_eq!(visit.admission_datetime, Some(dt("2024-01-01T10:00:00Z")));
        assert_eq!(ledger.location_visits(ENCOUNTER).unwrap().len(), 1);
        assert!(ledger.trust_policy().is_trusted("EPIC"));
    }
}
