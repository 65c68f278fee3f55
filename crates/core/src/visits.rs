//! Hospital visit lifecycle: creation, generic updates, admission and
//! discharge, renumbering and deletion.

use tracing::{debug, info};

use crate::arbiter::UpdatePolicy;
use crate::audit::Temporal;
use crate::facts::{Fact, FactEnvelope};
use crate::ledger::{FactContext, IgnoreReason};
use crate::locations::{self, Movement};
use crate::model::{HospitalVisit, LocationVisit, NotesMetadata, PlannedMovement, VisitObservation};
use crate::row_state::RowState;
use crate::store::{Record, UnitOfWork};
use crate::{KardexError, RecordId, Result};

/// Visit as left by a visit-level fact.
pub(crate) struct VisitUpdate {
    pub visit: HospitalVisit,
    /// The arbiter let this fact change the visit.
    pub applied: bool,
}

/// Load the fact's visit, or start a minimal one if the encounter is new.
pub(crate) fn get_or_create_visit(
    uow: &UnitOfWork,
    ctx: &FactContext<'_>,
) -> Result<RowState<HospitalVisit>> {
    let encounter = ctx.encounter()?;
    if let Some(visit) = uow.find_visit(encounter)? {
        return Ok(ctx.existing(visit));
    }
    let mrn = ctx.envelope.mrn.as_deref().ok_or_else(|| {
        KardexError::MissingIdentity(format!("cannot create visit {encounter} without an mrn"))
    })?;
    debug!(encounter, mrn, source = ctx.source(), "creating minimal visit");
    Ok(ctx.created(HospitalVisit::new(
        encounter,
        mrn,
        ctx.source(),
        ctx.event_datetime(),
        ctx.stored_from,
    )))
}

/// Persist a visit row state, indexing its encounter if it is new.
pub(crate) fn save_visit(state: RowState<HospitalVisit>, uow: &mut UnitOfWork) -> Result<HospitalVisit> {
    let created = state.is_entity_created();
    let visit = state.save_entity_or_audit_log_if_required(uow)?;
    if created {
        uow.index_encounter(&visit.encounter, &visit.visit_id)?;
    }
    Ok(visit)
}

/// The fact's visit, created if missing but otherwise left untouched.
pub(crate) fn get_or_create_minimal_visit(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
) -> Result<HospitalVisit> {
    let state = get_or_create_visit(uow, ctx)?;
    save_visit(state, uow)
}

fn update_generic(state: &mut RowState<HospitalVisit>, envelope: &FactEnvelope) {
    state.assign_field_value(envelope.patient_class.clone(), |v| &mut v.patient_class);
    state.assign_field_value(envelope.arrival_method.clone(), |v| &mut v.arrival_method);
}

/// Apply generic visit fields plus `specific` under the trusted-source
/// arbiter, then persist.
pub(crate) fn update_visit(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    specific: impl FnOnce(&mut RowState<HospitalVisit>),
) -> Result<VisitUpdate> {
    let mut state = get_or_create_visit(uow, ctx)?;
    let applied = ctx.permits(UpdatePolicy::TrustedSource, &state);
    if applied {
        update_generic(&mut state, ctx.envelope);
        specific(&mut state);
        if state.is_entity_updated() {
            state.assign_if_different(ctx.source().to_string(), |v| &mut v.source_system);
        }
    } else {
        debug!(
            encounter = %state.entity().encounter,
            source = ctx.source(),
            stored_source = %state.entity().source_system,
            "visit update not permitted"
        );
    }
    let visit = save_visit(state, uow)?;
    Ok(VisitUpdate { visit, applied })
}

fn apply_visit_fields(state: &mut RowState<HospitalVisit>, fact: &Fact) {
    match fact {
        Fact::RegisterPatient {
            presentation_datetime,
        } => {
            state.assign_field_value(presentation_datetime.clone(), |v| &mut v.presentation_datetime);
        }
        Fact::AdmitPatient {
            admission_datetime, ..
        } => {
            state.assign_field_value(admission_datetime.clone(), |v| &mut v.admission_datetime);
        }
        Fact::DischargePatient {
            discharge_datetime,
            disposition,
            destination,
            admission_datetime,
        } => {
            state.assign_if_different(Some(*discharge_datetime), |v| &mut v.discharge_datetime);
            state.assign_field_value(disposition.clone(), |v| &mut v.discharge_disposition);
            state.assign_field_value(destination.clone(), |v| &mut v.discharge_destination);
            if state.entity().admission_datetime.is_none() {
                state.assign_field_value(admission_datetime.clone(), |v| &mut v.admission_datetime);
            }
        }
        Fact::CancelAdmitPatient { cancelled_datetime } => {
            state.remove_if_exists(|v| &mut v.admission_datetime, *cancelled_datetime);
        }
        Fact::CancelDischargePatient { cancelled_datetime } => {
            state.remove_if_exists(|v| &mut v.discharge_datetime, *cancelled_datetime);
            state.remove_if_exists(|v| &mut v.discharge_disposition, *cancelled_datetime);
            state.remove_if_exists(|v| &mut v.discharge_destination, *cancelled_datetime);
        }
        _ => {}
    }
}

/// Register, admit, transfer, discharge, their cancellations and plain
/// patient-info updates.
pub(crate) fn process_visit_fact(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
) -> Result<Option<IgnoreReason>> {
    let fact = &ctx.envelope.fact;
    let mut previous_admission = None;
    let mut previous_discharge = None;
    let update = update_visit(uow, ctx, |state| {
        previous_admission = state.entity().admission_datetime;
        previous_discharge = state.entity().discharge_datetime;
        apply_visit_fields(state, fact);
    })?;
    if !update.applied {
        return Ok(Some(IgnoreReason::Superseded));
    }

    let visit = &update.visit;
    match fact {
        Fact::AdmitPatient {
            admission_datetime,
            location,
        } => {
            if let Some(location) = location.known() {
                let admitted_at = admission_datetime
                    .known()
                    .copied()
                    .unwrap_or(ctx.event_datetime());
                locations::move_patient(uow, ctx, visit, location, admitted_at, Movement::Admit)?;
            }
        }
        Fact::TransferPatient {
            location,
            previous_location,
            hold_current_location,
        } => {
            if let Some(location) = location.known() {
                let movement = Movement::Transfer {
                    previous_location: previous_location.known().map(String::as_str),
                    hold_current: *hold_current_location,
                };
                locations::move_patient(uow, ctx, visit, location, ctx.event_datetime(), movement)?;
            }
        }
        Fact::DischargePatient {
            discharge_datetime, ..
        } => {
            locations::discharge(uow, ctx, visit, *discharge_datetime)?;
        }
        Fact::CancelAdmitPatient { .. } => {
            if let (Some(admitted_at), None) = (previous_admission, visit.admission_datetime) {
                locations::cancel_admission(uow, ctx, visit, admitted_at)?;
            }
        }
        Fact::CancelDischargePatient { cancelled_datetime } => {
            if let (Some(discharged_at), None) = (previous_discharge, visit.discharge_datetime) {
                locations::reopen(uow, ctx, visit, discharged_at, *cancelled_datetime)?;
            }
        }
        _ => {}
    }
    Ok(None)
}

/// Renumber the visit known as `previous_encounter` to the fact's encounter.
pub(crate) fn move_visit(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    previous_encounter: &str,
) -> Result<Option<IgnoreReason>> {
    let encounter = ctx.encounter()?;
    let previous = if previous_encounter == encounter {
        None
    } else {
        uow.find_visit(previous_encounter)?
    };

    let Some(previous) = previous else {
        let update = update_visit(uow, ctx, |_| {})?;
        return Ok((!update.applied).then_some(IgnoreReason::Superseded));
    };
    if uow.find_visit(encounter)?.is_some() {
        return Err(KardexError::IncompatibleData(format!(
            "cannot move visit {previous_encounter} to {encounter}: both encounters exist"
        )));
    }

    let mut state = ctx.existing(previous);
    if !ctx.permits(UpdatePolicy::TrustedSource, &state) {
        return Ok(Some(IgnoreReason::Superseded));
    }
    state.assign_if_different(encounter.to_string(), |v| &mut v.encounter);
    if let Some(mrn) = &ctx.envelope.mrn {
        state.assign_if_different(mrn.clone(), |v| &mut v.mrn);
    }
    update_generic(&mut state, ctx.envelope);
    state.assign_if_different(ctx.source().to_string(), |v| &mut v.source_system);
    let visit = save_visit(state, uow)?;

    uow.unindex_encounter(previous_encounter)?;
    uow.index_encounter(encounter, &visit.visit_id)?;
    info!(from = previous_encounter, to = encounter, "moved visit to new encounter");
    Ok(None)
}

fn delete_dependents<R: Record>(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    visit_id: &RecordId,
) -> Result<usize> {
    let rows: Vec<R> = uow.find_for_visit(visit_id)?;
    for row in &rows {
        uow.retire_and_delete(row, ctx.event_datetime(), ctx.stored_from)?;
    }
    Ok(rows.len())
}

/// Delete a visit and every row recorded against it, leaving a final audit
/// snapshot of each.
pub(crate) fn delete_visit(uow: &mut UnitOfWork, ctx: &FactContext<'_>) -> Result<Option<IgnoreReason>> {
    let encounter = ctx.encounter()?;
    let Some(visit) = uow.find_visit(encounter)? else {
        return Ok(Some(IgnoreReason::UnknownVisit));
    };
    if visit.valid_from() > ctx.event_datetime() {
        return Ok(Some(IgnoreReason::Superseded));
    }

    let dependents = delete_dependents::<LocationVisit>(uow, ctx, &visit.visit_id)?
        + delete_dependents::<PlannedMovement>(uow, ctx, &visit.visit_id)?
        + delete_dependents::<VisitObservation>(uow, ctx, &visit.visit_id)?
        + delete_dependents::<NotesMetadata>(uow, ctx, &visit.visit_id)?;
    uow.retire_and_delete(&visit, ctx.event_datetime(), ctx.stored_from)?;
    uow.unindex_encounter(encounter)?;
    info!(encounter, dependents, source = ctx.source(), "deleted visit");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use crate::facts::{Fact, FactEnvelope, FieldValue};
    use crate::ledger::{IgnoreReason, Ledger};
    use crate::trust::TrustPolicy;
    use crate::KardexError;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn ledger() -> Ledger {
        Ledger::open_in_memory(TrustPolicy::new(["EPIC"])).unwrap()
    }

    fn epic(event: &str, fact: Fact) -> FactEnvelope {
        FactEnvelope::new("EPIC", dt(event), fact)
            .with_mrn("40800000")
            .with_encounter("123412341234")
    }

    #[test]
    fn discharge_fills_unknown_admission() {
        let ledger = ledger();
        ledger
            .process(&epic(
                "2024-01-03T10:00:00Z",
                Fact::DischargePatient {
                    discharge_datetime: dt("2024-01-03T10:00:00Z"),
                    disposition: FieldValue::Known("Home".into()),
                    destination: FieldValue::Unknown,
                    admission_datetime: FieldValue::Known(dt("2024-01-01T08:00:00Z")),
                },
            ))
            .unwrap();

        let visit = ledger.visit("123412341234").unwrap().unwrap();
        assert_eq!(visit.admission_datetime, Some(dt("2024-01-01T08:00:00Z")));
        assert_eq!(visit.discharge_datetime, Some(dt("2024-01-03T10:00:00Z")));
        assert_eq!(visit.discharge_disposition.as_deref(), Some("Home"));
    }

    #[test]
    fn discharge_keeps_known_admission() {
        let ledger = ledger();
        ledger
            .process(&epic(
                "2024-01-01T09:00:00Z",
                Fact::AdmitPatient {
                    admission_datetime: FieldValue::Known(dt("2024-01-01T09:00:00Z")),
                    location: FieldValue::Unknown,
                },
            ))
            .unwrap();
        ledger
            .process(&epic(
                "2024-01-03T10:00:00Z",
                Fact::DischargePatient {
                    discharge_datetime: dt("2024-01-03T10:00:00Z"),
                    disposition: FieldValue::Unknown,
                    destination: FieldValue::Unknown,
                    admission_datetime: FieldValue::Known(dt("2024-01-01T08:00:00Z")),
                },
            ))
            .unwrap();

        let visit = ledger.visit("123412341234").unwrap().unwrap();
        assert_eq!(visit.admission_datetime, Some(dt("2024-01-01T09:00:00Z")));
    }

    #[test]
    fn cancel_discharge_clears_discharge_fields() {
        let ledger = ledger();
        ledger
            .process(&epic(
                "2024-01-03T10:00:00Z",
                Fact::DischargePatient {
                    discharge_datetime: dt("2024-01-03T10:00:00Z"),
                    disposition: FieldValue::Known("Home".into()),
                    destination: FieldValue::Known("Usual Place".into()),
                    admission_datetime: FieldValue::Unknown,
                },
            ))
            .unwrap();
        let outcome = ledger
            .process(&epic(
                "2024-01-03T11:00:00Z",
                Fact::CancelDischargePatient {
                    cancelled_datetime: dt("2024-01-03T11:00:00Z"),
                },
            ))
            .unwrap();
        assert_eq!(outcome.updated, 1);

        let visit = ledger.visit("123412341234").unwrap().unwrap();
        assert_eq!(visit.discharge_datetime, None);
        assert_eq!(visit.discharge_disposition, None);
        assert_eq!(visit.discharge_destination, None);
        assert_eq!(ledger.visit_audits("123412341234").unwrap().len(), 1);
    }

    #[test]
    fn new_encounter_without_mrn_is_missing_identity() {
        let ledger = ledger();
        let fact = FactEnvelope::new("EPIC", dt("2024-01-01T10:00:00Z"), Fact::UpdatePatientInfo)
            .with_encounter("123412341234");
        assert!(matches!(ledger.process(&fact), Err(KardexError::MissingIdentity(_))));
        assert!(ledger.visit("123412341234").unwrap().is_none());
    }

    #[test]
    fn move_visit_renumbers_and_audits() {
        let ledger = ledger();
        ledger
            .process(&epic("2024-01-01T10:00:00Z", Fact::UpdatePatientInfo))
            .unwrap();
        let before = ledger.visit("123412341234").unwrap().unwrap();

        let moved = FactEnvelope::new(
            "EPIC",
            dt("2024-01-02T10:00:00Z"),
            Fact::MoveVisitInformation {
                previous_encounter: "123412341234".into(),
            },
        )
        .with_mrn("40800000")
        .with_encounter("999999999999");
        let outcome = ledger.process(&moved).unwrap();
        assert_eq!((outcome.created, outcome.updated), (0, 1));

        assert!(ledger.visit("123412341234").unwrap().is_none());
        let after = ledger.visit("999999999999").unwrap().unwrap();
        assert_eq!(after.visit_id, before.visit_id);
        let audits = ledger.visit_audits("999999999999").unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].row.encounter, "123412341234");
    }

    #[test]
    fn move_visit_onto_existing_encounter_is_incompatible() {
        let ledger = ledger();
        ledger
            .process(&epic("2024-01-01T10:00:00Z", Fact::UpdatePatientInfo))
            .unwrap();
        let other = FactEnvelope::new("EPIC", dt("2024-01-01T10:00:00Z"), Fact::UpdatePatientInfo)
            .with_mrn("40800000")
            .with_encounter("999999999999");
        ledger.process(&other).unwrap();

        let moved = FactEnvelope::new(
            "EPIC",
            dt("2024-01-02T10:00:00Z"),
            Fact::MoveVisitInformation {
                previous_encounter: "123412341234".into(),
            },
        )
        .with_encounter("999999999999");
        assert!(matches!(ledger.process(&moved), Err(KardexError::IncompatibleData(_))));
        assert!(ledger.visit("123412341234").unwrap().is_some());
    }

    #[test]
    fn stale_delete_is_superseded() {
        let ledger = ledger();
        ledger
            .process(&epic("2024-01-02T10:00:00Z", Fact::UpdatePatientInfo))
            .unwrap();
        let outcome = ledger
            .process(&epic("2024-01-01T10:00:00Z", Fact::DeleteVisit))
            .unwrap();
        assert_eq!(outcome.ignored, Some(IgnoreReason::Superseded));
        assert!(ledger.visit("123412341234").unwrap().is_some());
    }

    #[test]
    fn delete_of_unknown_visit_is_ignored() {
        let ledger = ledger();
        let outcome = ledger
            .process(&epic("2024-01-01T10:00:00Z", Fact::DeleteVisit))
            .unwrap();
        assert_eq!(outcome.ignored, Some(IgnoreReason::UnknownVisit));
        assert!(outcome.is_noop());
    }
}
