//! Location stays: which physical location a patient occupied, and when.
//!
//! A visit has at most one *current* stay: the latest open stay that is not
//! held underneath an open nested stay. Admissions and transfers open a new
//! stay and close the current one at the movement time; a held transfer
//! nests the new stay under the current one instead, and moving back to the
//! held location closes only the nested stay.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::arbiter::UpdatePolicy;
use crate::ledger::FactContext;
use crate::model::{HospitalVisit, LocationVisit};
use crate::store::UnitOfWork;
use crate::Result;

/// How the patient arrived at a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Movement<'a> {
    Admit,
    Transfer {
        /// Location the source says the patient came from.
        previous_location: Option<&'a str>,
        /// Keep the current stay open underneath the new one.
        hold_current: bool,
    },
}

fn current_stay(stays: &[LocationVisit]) -> Option<&LocationVisit> {
    stays
        .iter()
        .filter(|s| s.is_open())
        .filter(|s| {
            !stays.iter().any(|child| {
                child.is_open() && child.parent_location_visit_id.as_ref() == Some(&s.location_visit_id)
            })
        })
        .max_by_key(|s| s.admission_datetime)
}

/// Close an existing stay at `at`, subject to the arbiter. Returns whether
/// the stay may be closed by this fact.
fn close_stay(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    stay: &LocationVisit,
    at: DateTime<Utc>,
    inferred: bool,
) -> Result<bool> {
    let mut state = ctx.existing(stay.clone());
    if !ctx.permits(UpdatePolicy::TrustedSource, &state) {
        debug!(location = %stay.location, "location stay update not permitted");
        return Ok(false);
    }
    state.assign_if_different(Some(at), |s| &mut s.discharge_datetime);
    state.assign_if_different(inferred, |s| &mut s.inferred_discharge);
    if state.is_entity_updated() {
        state.assign_if_different(ctx.source().to_string(), |s| &mut s.source_system);
    }
    state.save_entity_or_audit_log_if_required(uow)?;
    Ok(true)
}

fn open_stay(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    stay: LocationVisit,
) -> Result<LocationVisit> {
    debug!(
        location = %stay.location,
        admitted = ?stay.admission_datetime,
        inferred = stay.inferred_admission,
        "opening location stay"
    );
    ctx.created(stay).save_entity_or_audit_log_if_required(uow)
}

/// Close `current` and open `next` in its place.
///
/// A movement older than the current stay cannot close it. The patient has
/// since moved on, so `next` is recorded as already closed when the current
/// stay began.
fn replace_current(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    current: &LocationVisit,
    mut next: LocationVisit,
    arrived_at: DateTime<Utc>,
    inferred: bool,
) -> Result<()> {
    if close_stay(uow, ctx, current, arrived_at, inferred)? {
        open_stay(uow, ctx, next)?;
        return Ok(());
    }
    match current.admission_datetime {
        Some(moved_on) if moved_on > arrived_at => {
            next.discharge_datetime = Some(moved_on);
            next.inferred_discharge = true;
            open_stay(uow, ctx, next)?;
        }
        _ => {
            debug!(location = %next.location, current = %current.location, "movement not recorded");
        }
    }
    Ok(())
}

/// Record the patient arriving at `location` at `arrived_at`.
pub(crate) fn move_patient(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    visit: &HospitalVisit,
    location: &str,
    arrived_at: DateTime<Utc>,
    movement: Movement<'_>,
) -> Result<()> {
    let stays: Vec<LocationVisit> = uow.find_for_visit(&visit.visit_id)?;
    if stays
        .iter()
        .any(|s| s.location == location && s.admission_datetime == Some(arrived_at))
    {
        return Ok(());
    }

    let new_stay = |parent| {
        let mut stay = LocationVisit::new(
            visit.visit_id.clone(),
            location,
            Some(arrived_at),
            ctx.source(),
            ctx.event_datetime(),
            ctx.stored_from,
        );
        stay.parent_location_visit_id = parent;
        stay
    };

    let Some(current) = current_stay(&stays) else {
        if let Movement::Transfer {
            previous_location: Some(previous),
            ..
        } = movement
        {
            if previous != location {
                let mut inferred = LocationVisit::new(
                    visit.visit_id.clone(),
                    previous,
                    None,
                    ctx.source(),
                    ctx.event_datetime(),
                    ctx.stored_from,
                );
                inferred.inferred_admission = true;
                inferred.discharge_datetime = Some(arrived_at);
                open_stay(uow, ctx, inferred)?;
            }
        }
        open_stay(uow, ctx, new_stay(None))?;
        return Ok(());
    };

    if current.location == location {
        return Ok(());
    }

    let parent = current
        .parent_location_visit_id
        .as_ref()
        .and_then(|id| stays.iter().find(|s| &s.location_visit_id == id));
    if parent.is_some_and(|p| p.location == location) {
        // back to the held stay
        close_stay(uow, ctx, current, arrived_at, false)?;
        return Ok(());
    }

    match movement {
        Movement::Transfer {
            hold_current: true, ..
        } => {
            open_stay(uow, ctx, new_stay(Some(current.location_visit_id.clone())))?;
            Ok(())
        }
        Movement::Transfer { .. } => {
            replace_current(uow, ctx, current, new_stay(None), arrived_at, false)
        }
        Movement::Admit => replace_current(uow, ctx, current, new_stay(None), arrived_at, true),
    }
}

/// Close every open stay of the visit at the discharge time.
pub(crate) fn discharge(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    visit: &HospitalVisit,
    discharged_at: DateTime<Utc>,
) -> Result<()> {
    let stays: Vec<LocationVisit> = uow.find_for_visit(&visit.visit_id)?;
    for stay in stays.iter().filter(|s| s.is_open()) {
        close_stay(uow, ctx, stay, discharged_at, false)?;
    }
    Ok(())
}

/// Retire the stays opened by a cancelled admission.
pub(crate) fn cancel_admission(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    visit: &HospitalVisit,
    admitted_at: DateTime<Utc>,
) -> Result<()> {
    let stays: Vec<LocationVisit> = uow.find_for_visit(&visit.visit_id)?;
    for stay in stays
        .iter()
        .filter(|s| !s.inferred_admission && s.admission_datetime == Some(admitted_at))
    {
        debug!(location = %stay.location, "removing stay of cancelled admission");
        uow.retire_and_delete(stay, ctx.event_datetime(), ctx.stored_from)?;
    }
    Ok(())
}

/// Reopen the stays closed by a cancelled discharge.
pub(crate) fn reopen(
    uow: &mut UnitOfWork,
    ctx: &FactContext<'_>,
    visit: &HospitalVisit,
    discharged_at: DateTime<Utc>,
    cancelled_at: DateTime<Utc>,
) -> Result<()> {
    let stays: Vec<LocationVisit> = uow.find_for_visit(&visit.visit_id)?;
    for stay in stays
        .iter()
        .filter(|s| s.discharge_datetime == Some(discharged_at))
    {
        let mut state = ctx.existing(stay.clone());
        if !ctx.permits(UpdatePolicy::TrustedSource, &state) {
            continue;
        }
        state.remove_if_exists(|s| &mut s.discharge_datetime, cancelled_at);
        state.assign_if_different(false, |s| &mut s.inferred_discharge);
        state.save_entity_or_audit_log_if_required(uow)?;
    }
    Ok(())
}
