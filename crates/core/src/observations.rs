//! Visit observations and clinical note metadata.
//!
//! Both hang off a visit, keyed by their source identifier, and are updated
//! forward-only: any source may update them, but never with a fact older
//! than the stored state.

use chrono::{DateTime, Utc};

use crate::arbiter::UpdatePolicy;
use crate::audit::TemporalCore;
use crate::facts::FieldValue;
use crate::ledger::{FactContext, IgnoreReason};
use crate::model::{HospitalVisit, NotesMetadata, VisitObservation};
use crate::row_state::RowState;
use crate::store::{Record, UnitOfWork};
use crate::{visits, Result};

/// Observation fields as carried by the fact.
pub(crate) struct ObservationFact<'a> {
    pub observation_id: &'a str,
    pub observation_type: &'a str,
    pub value_as_text: &'a FieldValue<String>,
    pub value_as_real: &'a FieldValue<f64>,
    pub unit: &'a FieldValue<String>,
}

/// Note metadata fields as carried by the fact.
pub(crate) struct NoteFact<'a> {
    pub note_id: &'a str,
    pub note_type: &'a FieldValue<String>,
    pub started_datetime: &'a FieldValue<DateTime<Utc>>,
    pub last_edit_datetime: DateTime<Utc>,
    pub editor_role: &'a FieldValue<String>,
}

fn finish<E: Record>(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    mut state: RowState<E>,
    source_system: impl Fn(&mut E) -> &mut String,
) -> Result<Option<IgnoreReason>> {
    if state.is_entity_updated() {
        state.assign_if_different(ctx.source().to_string(), source_system);
    }
    state.save_entity_or_audit_log_if_required(uow)?;
    Ok(None)
}

fn load<E: Record>(
    uow: &UnitOfWork,
    visit: &HospitalVisit,
    id: &str,
    message_datetime: DateTime<Utc>,
    stored_from: DateTime<Utc>,
    create: impl FnOnce() -> E,
) -> Result<RowState<E>> {
    let key = format!("{}:{}", visit.visit_id, id);
    Ok(match uow.find::<E>(&key)? {
        Some(existing) => RowState::existing(existing, message_datetime, stored_from),
        None => RowState::created(create(), message_datetime, stored_from),
    })
}

pub(crate) fn process_observation(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    fact: ObservationFact<'_>,
) -> Result<Option<IgnoreReason>> {
    let visit = visits::get_or_create_minimal_visit(uow, ctx)?;
    let mut state = load(
        uow,
        &visit,
        fact.observation_id,
        ctx.event_datetime(),
        ctx.stored_from,
        || VisitObservation {
            observation_id: fact.observation_id.to_string(),
            visit_id: visit.visit_id.clone(),
            observation_type: fact.observation_type.to_string(),
            value_as_text: None,
            value_as_real: None,
            unit: None,
            source_system: ctx.source().to_string(),
            temporal: TemporalCore::new(ctx.event_datetime(), ctx.stored_from),
        },
    )?;
    if !ctx.permits(UpdatePolicy::ForwardOnly, &state) {
        return Ok(Some(IgnoreReason::Superseded));
    }

    state.assign_if_different(fact.observation_type.to_string(), |o| &mut o.observation_type);
    state.assign_field_value(fact.value_as_text.clone(), |o| &mut o.value_as_text);
    state.assign_field_value(fact.value_as_real.clone(), |o| &mut o.value_as_real);
    state.assign_field_value(fact.unit.clone(), |o| &mut o.unit);
    finish(uow, ctx, state, |o| &mut o.source_system)
}

/// Note metadata is arbitrated on the note's last edit time, not the
/// envelope's event time.
pub(crate) fn process_notes(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    fact: NoteFact<'_>,
) -> Result<Option<IgnoreReason>> {
    let visit = visits::get_or_create_minimal_visit(uow, ctx)?;
    let mut state = load(
        uow,
        &visit,
        fact.note_id,
        fact.last_edit_datetime,
        ctx.stored_from,
        || NotesMetadata {
            note_id: fact.note_id.to_string(),
            visit_id: visit.visit_id.clone(),
            note_type: None,
            started_datetime: None,
            last_edit_datetime: None,
            editor_role: None,
            source_system: ctx.source().to_string(),
            temporal: TemporalCore::new(fact.last_edit_datetime, ctx.stored_from),
        },
    )?;
    if !ctx.permits(UpdatePolicy::ForwardOnly, &state) {
        return Ok(Some(IgnoreReason::Superseded));
    }

    state.assign_field_value(fact.note_type.clone(), |n| &mut n.note_type);
    state.assign_field_value(fact.started_datetime.clone(), |n| &mut n.started_datetime);
    state.assign_if_different(Some(fact.last_edit_datetime), |n| &mut n.last_edit_datetime);
    state.assign_field_value(fact.editor_role.clone(), |n| &mut n.editor_role);
    finish(uow, ctx, state, |n| &mut n.source_system)
}
