//! Live entities held by the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{Temporal, TemporalCore};
use crate::facts::MovementType;
use crate::RecordId;

/// One hospital encounter for a patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HospitalVisit {
    pub visit_id: RecordId,
    /// Source system identifier of the encounter (CSN in Epic). Unique.
    pub encounter: String,
    /// Patient reference.
    pub mrn: String,
    pub source_system: String,
    /// When the patient was first seen as part of this visit; may precede
    /// admission.
    pub presentation_datetime: Option<DateTime<Utc>>,
    pub admission_datetime: Option<DateTime<Utc>>,
    pub discharge_datetime: Option<DateTime<Utc>>,
    pub patient_class: Option<String>,
    pub arrival_method: Option<String>,
    pub discharge_disposition: Option<String>,
    pub discharge_destination: Option<String>,
    pub temporal: TemporalCore,
}

impl HospitalVisit {
    /// Minimal visit known only by its identity.
    pub fn new(
        encounter: impl Into<String>,
        mrn: impl Into<String>,
        source_system: impl Into<String>,
        valid_from: DateTime<Utc>,
        stored_from: DateTime<Utc>,
    ) -> Self {
        Self {
            visit_id: RecordId::new(),
            encounter: encounter.into(),
            mrn: mrn.into(),
            source_system: source_system.into(),
            presentation_datetime: None,
            admission_datetime: None,
            discharge_datetime: None,
            patient_class: None,
            arrival_method: None,
            discharge_disposition: None,
            discharge_destination: None,
            temporal: TemporalCore::new(valid_from, stored_from),
        }
    }
}

/// A patient's occupancy of one physical location during a visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationVisit {
    pub location_visit_id: RecordId,
    pub visit_id: RecordId,
    pub location: String,
    /// Stay that remains held while this nested stay is open.
    pub parent_location_visit_id: Option<RecordId>,
    pub admission_datetime: Option<DateTime<Utc>>,
    pub discharge_datetime: Option<DateTime<Utc>>,
    /// Admission time was not stated by an admit or transfer fact.
    pub inferred_admission: bool,
    /// Discharge time was not stated by a transfer or discharge fact.
    pub inferred_discharge: bool,
    pub source_system: String,
    pub temporal: TemporalCore,
}

impl LocationVisit {
    pub fn new(
        visit_id: RecordId,
        location: impl Into<String>,
        admission_datetime: Option<DateTime<Utc>>,
        source_system: impl Into<String>,
        valid_from: DateTime<Utc>,
        stored_from: DateTime<Utc>,
    ) -> Self {
        Self {
            location_visit_id: RecordId::new(),
            visit_id,
            location: location.into(),
            parent_location_visit_id: None,
            admission_datetime,
            discharge_datetime: None,
            inferred_admission: false,
            inferred_discharge: false,
            source_system: source_system.into(),
            temporal: TemporalCore::new(valid_from, stored_from),
        }
    }

    pub fn is_open(&self) -> bool {
        self.discharge_datetime.is_none()
    }
}

/// Reconciliation state of a [`PlannedMovement`] slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementState {
    /// Request seen, no cancellation yet.
    Requested,
    /// Cancellation seen before its request.
    CancelledPendingRequest,
    /// A confirmed request that was later cancelled.
    Resolved,
    /// No row. Never persisted.
    Absent,
}

/// A planned transfer or discharge that has not been realised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedMovement {
    pub planned_movement_id: RecordId,
    pub visit_id: RecordId,
    pub event_type: MovementType,
    pub planned_location: Option<String>,
    pub hospital_service: Option<String>,
    /// Unset while only the cancellation is known.
    pub event_datetime: Option<DateTime<Utc>>,
    /// Unset while the request has not been cancelled.
    pub cancelled_datetime: Option<DateTime<Utc>>,
    pub source_system: String,
    pub temporal: TemporalCore,
}

impl PlannedMovement {
    pub fn new(
        visit_id: RecordId,
        event_type: MovementType,
        planned_location: Option<String>,
        source_system: impl Into<String>,
        valid_from: DateTime<Utc>,
        stored_from: DateTime<Utc>,
    ) -> Self {
        Self {
            planned_movement_id: RecordId::new(),
            visit_id,
            event_type,
            planned_location,
            hospital_service: None,
            event_datetime: None,
            cancelled_datetime: None,
            source_system: source_system.into(),
            temporal: TemporalCore::new(valid_from, stored_from),
        }
    }

    pub fn state(&self) -> MovementState {
        match (self.event_datetime, self.cancelled_datetime) {
            (Some(_), None) => MovementState::Requested,
            (None, Some(_)) => MovementState::CancelledPendingRequest,
            (Some(_), Some(_)) => MovementState::Resolved,
            (None, None) => MovementState::Absent,
        }
    }

    /// Does this row belong to the `(event type, planned location)` slot?
    /// The visit is implied by where the row is stored.
    pub fn is_slot(&self, event_type: MovementType, planned_location: Option<&str>) -> bool {
        self.event_type == event_type && self.planned_location.as_deref() == planned_location
    }
}

/// A single observation recorded against a visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitObservation {
    /// Internal id from the source system; unique within the visit.
    pub observation_id: String,
    pub visit_id: RecordId,
    pub observation_type: String,
    pub value_as_text: Option<String>,
    pub value_as_real: Option<f64>,
    pub unit: Option<String>,
    pub source_system: String,
    pub temporal: TemporalCore,
}

/// Metadata about a clinical note. The note body is never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotesMetadata {
    pub note_id: String,
    pub visit_id: RecordId,
    pub note_type: Option<String>,
    pub started_datetime: Option<DateTime<Utc>>,
    pub last_edit_datetime: Option<DateTime<Utc>>,
    pub editor_role: Option<String>,
    pub source_system: String,
    pub temporal: TemporalCore,
}

macro_rules! impl_temporal {
    ($($entity:ty),+ $(,)?) => {
        $(
            impl Temporal for $entity {
                fn temporal(&self) -> &TemporalCore {
                    &self.temporal
                }
                fn temporal_mut(&mut self) -> &mut TemporalCore {
                    &mut self.temporal
                }
                fn source_system(&self) -> &str {
                    &self.source_system
                }
            }
        )+
    };
}

impl_temporal!(
    HospitalVisit,
    LocationVisit,
    PlannedMovement,
    VisitObservation,
    NotesMetadata,
);
