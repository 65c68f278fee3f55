//! Fact envelopes: already-parsed clinical events as handed to the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tri-state field carried by a fact.
///
/// A source message either says nothing about a field, gives it a value, or
/// explicitly clears it. Those are three different instructions and must not
/// be collapsed into `Option`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum FieldValue<T> {
    /// The field was absent from the fact; leave stored state untouched.
    #[default]
    Unknown,
    /// The fact asserts this value.
    Known(T),
    /// The fact explicitly retracts any stored value.
    Retract,
}

impl<T> FieldValue<T> {
    pub fn is_unknown(&self) -> bool {
        matches!(self, FieldValue::Unknown)
    }

    /// The asserted value, if any.
    pub fn known(&self) -> Option<&T> {
        match self {
            FieldValue::Known(v) => Some(v),
            FieldValue::Unknown | FieldValue::Retract => None,
        }
    }
}

impl<T> From<T> for FieldValue<T> {
    fn from(v: T) -> Self {
        FieldValue::Known(v)
    }
}

/// Kind of a planned movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Transfer,
    Discharge,
}

impl std::fmt::Display for MovementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MovementType::Transfer => write!(f, "transfer"),
            MovementType::Discharge => write!(f, "discharge"),
        }
    }
}

/// What a fact says happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fact {
    /// Generic visit information only (patient class, arrival method).
    UpdatePatientInfo,
    RegisterPatient {
        #[serde(default)]
        presentation_datetime: FieldValue<DateTime<Utc>>,
    },
    AdmitPatient {
        #[serde(default)]
        admission_datetime: FieldValue<DateTime<Utc>>,
        #[serde(default)]
        location: FieldValue<String>,
    },
    TransferPatient {
        #[serde(default)]
        location: FieldValue<String>,
        #[serde(default)]
        previous_location: FieldValue<String>,
        /// Keep the current stay open underneath the new one (e.g. a bed
        /// held while the patient is away for a procedure).
        #[serde(default)]
        hold_current_location: bool,
    },
    DischargePatient {
        discharge_datetime: DateTime<Utc>,
        #[serde(default)]
        disposition: FieldValue<String>,
        #[serde(default)]
        destination: FieldValue<String>,
        #[serde(default)]
        admission_datetime: FieldValue<DateTime<Utc>>,
    },
    CancelAdmitPatient {
        cancelled_datetime: DateTime<Utc>,
    },
    CancelDischargePatient {
        cancelled_datetime: DateTime<Utc>,
    },
    /// A planned transfer or discharge.
    PendingMovement {
        kind: MovementType,
        #[serde(default)]
        planned_location: FieldValue<String>,
        #[serde(default)]
        hospital_service: FieldValue<String>,
    },
    /// Cancellation of a planned transfer or discharge.
    CancelPendingMovement {
        kind: MovementType,
        #[serde(default)]
        planned_location: FieldValue<String>,
        cancelled_datetime: DateTime<Utc>,
    },
    /// The visit previously known as `previous_encounter` is now the
    /// envelope's encounter.
    MoveVisitInformation { previous_encounter: String },
    /// Delete the visit and everything recorded against it.
    DeleteVisit,
    Observation {
        observation_id: String,
        observation_type: String,
        #[serde(default)]
        value_as_text: FieldValue<String>,
        #[serde(default)]
        value_as_real: FieldValue<f64>,
        #[serde(default)]
        unit: FieldValue<String>,
    },
    NotesMetadata {
        note_id: String,
        #[serde(default)]
        note_type: FieldValue<String>,
        #[serde(default)]
        started_datetime: FieldValue<DateTime<Utc>>,
        last_edit_datetime: DateTime<Utc>,
        #[serde(default)]
        editor_role: FieldValue<String>,
    },
}

impl Fact {
    pub fn name(&self) -> &'static str {
        match self {
            Fact::UpdatePatientInfo => "update_patient_info",
            Fact::RegisterPatient { .. } => "register_patient",
            Fact::AdmitPatient { .. } => "admit_patient",
            Fact::TransferPatient { .. } => "transfer_patient",
            Fact::DischargePatient { .. } => "discharge_patient",
            Fact::CancelAdmitPatient { .. } => "cancel_admit_patient",
            Fact::CancelDischargePatient { .. } => "cancel_discharge_patient",
            Fact::PendingMovement { .. } => "pending_movement",
            Fact::CancelPendingMovement { .. } => "cancel_pending_movement",
            Fact::MoveVisitInformation { .. } => "move_visit_information",
            Fact::DeleteVisit => "delete_visit",
            Fact::Observation { .. } => "observation",
            Fact::NotesMetadata { .. } => "notes_metadata",
        }
    }
}

/// One incoming clinical event.
///
/// Identity keys (`mrn`, `encounter`) are optional on the wire; a fact that
/// cannot be resolved to a visit is rejected when it is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactEnvelope {
    /// Declared source system, looked up in the [`TrustPolicy`].
    ///
    /// [`TrustPolicy`]: crate::TrustPolicy
    pub source_system: String,
    /// When the event happened in the hospital (valid time).
    pub event_datetime: DateTime<Utc>,
    #[serde(default)]
    pub mrn: Option<String>,
    #[serde(default)]
    pub encounter: Option<String>,
    #[serde(default)]
    pub patient_class: FieldValue<String>,
    #[serde(default)]
    pub arrival_method: FieldValue<String>,
    pub fact: Fact,
}

impl FactEnvelope {
    pub fn new(source_system: impl Into<String>, event_datetime: DateTime<Utc>, fact: Fact) -> Self {
        Self {
            source_system: source_system.into(),
            event_datetime,
            mrn: None,
            encounter: None,
            patient_class: FieldValue::Unknown,
            arrival_method: FieldValue::Unknown,
            fact,
        }
    }

    pub fn with_mrn(mut self, mrn: impl Into<String>) -> Self {
        self.mrn = Some(mrn.into());
        self
    }

    pub fn with_encounter(mut self, encounter: impl Into<String>) -> Self {
        self.encounter = Some(encounter.into());
        self
    }

    pub fn with_patient_class(mut self, patient_class: FieldValue<String>) -> Self {
        self.patient_class = patient_class;
        self
    }

    pub fn with_arrival_method(mut self, arrival_method: FieldValue<String>) -> Self {
        self.arrival_method = arrival_method;
        self
    }
}
