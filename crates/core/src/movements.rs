//! Applies matcher decisions to stored planned movements.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::arbiter::UpdatePolicy;
use crate::audit::Temporal;
use crate::facts::{FieldValue, MovementType};
use crate::ledger::{FactContext, IgnoreReason};
use crate::matcher::{match_cancellation, match_request, CancelMatch, RequestMatch};
use crate::model::PlannedMovement;
use crate::row_state::RowState;
use crate::store::UnitOfWork;
use crate::{visits, KardexError, RecordId, Result};

fn planned_location_of(value: &FieldValue<String>) -> Result<Option<&str>> {
    match value {
        FieldValue::Known(location) => Ok(Some(location.as_str())),
        FieldValue::Unknown => Ok(None),
        FieldValue::Retract => Err(KardexError::IncompatibleData(
            "pending movement cannot retract its planned location".into(),
        )),
    }
}

fn slot_rows(
    uow: &UnitOfWork,
    visit_id: &RecordId,
    kind: MovementType,
    planned_location: Option<&str>,
) -> Result<Vec<PlannedMovement>> {
    let mut rows: Vec<PlannedMovement> = uow.find_for_visit(visit_id)?;
    rows.retain(|row| row.is_slot(kind, planned_location));
    Ok(rows)
}

/// Row state for completing a half-known row, or `None` if this fact may not
/// change it. The counterpart may carry an earlier event time than the row;
/// valid time never moves backwards.
fn attach(ctx: &FactContext<'_>, row: &PlannedMovement) -> Option<RowState<PlannedMovement>> {
    let message_datetime = ctx.event_datetime().max(row.valid_from());
    let state = RowState::existing(row.clone(), message_datetime, ctx.stored_from);
    if !ctx.permits(UpdatePolicy::TrustedSource, &state) {
        debug!(source = ctx.source(), owner = %row.source_system, "planned movement update not permitted");
        return None;
    }
    Some(state)
}

fn finish(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    mut state: RowState<PlannedMovement>,
) -> Result<Option<IgnoreReason>> {
    if state.is_entity_updated() {
        state.assign_if_different(ctx.source().to_string(), |m| &mut m.source_system);
    }
    state.save_entity_or_audit_log_if_required(uow)?;
    Ok(None)
}

/// A planned transfer or discharge was requested at the fact's event time.
pub(crate) fn process_request(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    kind: MovementType,
    planned_location: &FieldValue<String>,
    hospital_service: &FieldValue<String>,
) -> Result<Option<IgnoreReason>> {
    let location = planned_location_of(planned_location)?;
    let visit = visits::update_visit(uow, ctx, |_| {})?.visit;
    let slot = slot_rows(uow, &visit.visit_id, kind, location)?;
    let requested_at = ctx.event_datetime();

    let mut state = match match_request(&slot, requested_at) {
        RequestMatch::Duplicate(_) => return Ok(Some(IgnoreReason::Duplicate)),
        RequestMatch::AttachRequest(row) => {
            debug!(%kind, ?location, cancelled = ?row.cancelled_datetime, "request attached to waiting cancellation");
            let Some(mut state) = attach(ctx, row) else {
                return Ok(Some(IgnoreReason::Superseded));
            };
            state.assign_if_different(Some(requested_at), |m| &mut m.event_datetime);
            state
        }
        RequestMatch::Create => {
            debug!(%kind, ?location, "new planned movement");
            let mut movement = PlannedMovement::new(
                visit.visit_id.clone(),
                kind,
                location.map(str::to_string),
                ctx.source(),
                ctx.event_datetime(),
                ctx.stored_from,
            );
            movement.event_datetime = Some(requested_at);
            ctx.created(movement)
        }
    };
    state.assign_field_value(hospital_service.clone(), |m| &mut m.hospital_service);
    finish(uow, ctx, state)
}

/// A planned transfer or discharge was cancelled at `cancelled_at`.
pub(crate) fn process_cancellation(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    kind: MovementType,
    planned_location: &FieldValue<String>,
    cancelled_at: DateTime<Utc>,
) -> Result<Option<IgnoreReason>> {
    let location = planned_location_of(planned_location)?;
    let visit = visits::update_visit(uow, ctx, |_| {})?.visit;
    let slot = slot_rows(uow, &visit.visit_id, kind, location)?;

    let state = match match_cancellation(&slot, cancelled_at) {
        CancelMatch::Duplicate(_) => return Ok(Some(IgnoreReason::Duplicate)),
        CancelMatch::AwaitingRequest(row) => {
            debug!(%kind, ?location, waiting = ?row.cancelled_datetime, "cancellation merged into waiting row");
            return Ok(Some(IgnoreReason::AwaitingRequest));
        }
        CancelMatch::AttachCancellation(row) => {
            debug!(%kind, ?location, requested = ?row.event_datetime, "cancellation attached to request");
            let Some(mut state) = attach(ctx, row) else {
                return Ok(Some(IgnoreReason::Superseded));
            };
            state.assign_if_different(Some(cancelled_at), |m| &mut m.cancelled_datetime);
            state
        }
        CancelMatch::Create => {
            debug!(%kind, ?location, "cancellation waiting for its request");
            let mut movement = PlannedMovement::new(
                visit.visit_id.clone(),
                kind,
                location.map(str::to_string),
                ctx.source(),
                ctx.event_datetime(),
                ctx.stored_from,
            );
            movement.cancelled_datetime = Some(cancelled_at);
            ctx.created(movement)
        }
    };
    finish(uow, ctx, state)
}
