//! Pending-event matcher.
//!
//! Pairs planned-movement requests with their cancellations for one
//! `(event type, visit, planned location)` slot, whichever arrives first.
//! Upstream guarantees that a request and the cancellation of the same
//! movement are close in time and do not overlap any other movement in the
//! same slot, so taking the earliest candidate by time reconstructs the
//! causal pairing even when arrival order is reversed.
//!
//! The functions here only decide; the caller applies the decision inside
//! the fact's unit of work.

use chrono::{DateTime, Utc};

use crate::model::PlannedMovement;

/// What to do with an incoming request at `event_datetime`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RequestMatch<'a> {
    /// A row already carries this request; replay, change nothing.
    Duplicate(&'a PlannedMovement),
    /// A cancellation is waiting for this request; attach the event time.
    AttachRequest(&'a PlannedMovement),
    /// No counterpart; create a new requested row.
    Create,
}

/// What to do with an incoming cancellation at `cancelled_datetime`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CancelMatch<'a> {
    /// A row already carries this cancellation; replay, change nothing.
    Duplicate(&'a PlannedMovement),
    /// An uncancelled request precedes this cancellation; attach it.
    AttachCancellation(&'a PlannedMovement),
    /// A previously received cancellation, cancelled at or after this one, is
    /// still waiting for its request. It stays the live slot; this
    /// cancellation is merged into it.
    AwaitingRequest(&'a PlannedMovement),
    /// No counterpart; create a row waiting for its request.
    Create,
}

/// Match a request against the rows of its slot.
///
/// Candidates are rows with the same event time, or cancellation-only rows
/// cancelled at or after the request. The earliest by `(event time,
/// cancellation time)` wins, unset times first. A row that already has this
/// exact event time is always reported as a duplicate so replay stays
/// idempotent.
pub fn match_request(slot: &[PlannedMovement], event_datetime: DateTime<Utc>) -> RequestMatch<'_> {
    if let Some(existing) = slot
        .iter()
        .find(|row| row.event_datetime == Some(event_datetime))
    {
        return RequestMatch::Duplicate(existing);
    }

    slot.iter()
        .filter(|row| {
            row.event_datetime.is_none()
                && row.cancelled_datetime.is_some_and(|c| c >= event_datetime)
        })
        .min_by_key(|row| (row.event_datetime, row.cancelled_datetime))
        .map_or(RequestMatch::Create, RequestMatch::AttachRequest)
}

/// Match a cancellation against the rows of its slot.
///
/// Candidates are uncancelled requests made at or before the cancellation,
/// and cancellation-only rows cancelled at or after it. The earliest by
/// `(cancellation time, event time)` wins, unset times first, so an
/// uncancelled request is preferred over a waiting cancellation.
pub fn match_cancellation(
    slot: &[PlannedMovement],
    cancelled_datetime: DateTime<Utc>,
) -> CancelMatch<'_> {
    if let Some(existing) = slot
        .iter()
        .find(|row| row.cancelled_datetime == Some(cancelled_datetime))
    {
        return CancelMatch::Duplicate(existing);
    }

    let candidate = slot
        .iter()
        .filter(|row| {
            let open_request = row.cancelled_datetime.is_none()
                && row.event_datetime.is_some_and(|e| e <= cancelled_datetime);
            let waiting_cancel = row.event_datetime.is_none()
                && row
                    .cancelled_datetime
                    .is_none_or(|c| c >= cancelled_datetime);
            open_request || waiting_cancel
        })
        .min_by_key(|row| (row.cancelled_datetime, row.event_datetime));

    match candidate {
        Some(row) if row.event_datetime.is_some() => CancelMatch::AttachCancellation(row),
        Some(row) => CancelMatch::AwaitingRequest(row),
        None => CancelMatch::Create,
    }
}
