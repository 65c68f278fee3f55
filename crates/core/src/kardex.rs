//! Kardex: bitemporal reconciliation engine for clinical events.
//!
//! Kardex ingests already-parsed clinical facts about hospital visits,
//! location stays and planned movements, coming from several source systems
//! of differing reliability, and keeps one consistent, fully audited record
//! of what the hospital currently believes is true.
//!
//! Every live entity carries two time axes:
//!
//! - **Valid time** (`valid_from`): when the fact that produced the current
//!   state happened in the hospital.
//! - **Transaction time** (`stored_from`): when Kardex processed that fact.
//!
//! Whenever a live entity changes or is deleted, its previous state is
//! retired into an append-only [`AuditSnapshot`] with a closed window
//! (`valid_until` / `stored_until`), so both "what is true now" and "what did
//! we believe at processing time X" can be answered.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use kardex::{Fact, FactEnvelope, FieldValue, Ledger, TrustPolicy};
//!
//! let ledger = Ledger::open("hospital.redb", TrustPolicy::new(["EPIC"])).unwrap();
//!
//! let admit = FactEnvelope::new("EPIC", Utc::now(), Fact::AdmitPatient {
//!     admission_datetime: FieldValue::Known(Utc::now()),
//!     location: FieldValue::Known("T11S^B11S^B11S-05".to_string()),
//! })
//! .with_mrn("40800000")
//! .with_encounter("123412341234");
//!
//! let outcome = ledger.process(&admit).unwrap();
//! assert!(!outcome.is_noop());
//!
//! let visit = ledger.visit("123412341234").unwrap();
//! ```

mod arbiter;
mod audit;
mod facts;
mod ledger;
mod locations;
mod matcher;
mod model;
mod movements;
mod observations;
mod row_state;
mod store;
mod trust;
mod visits;

pub use arbiter::{Arbiter, UpdatePolicy};
pub use audit::{retire, AuditSnapshot, Temporal, TemporalCore};
pub use facts::{Fact, FactEnvelope, FieldValue, MovementType};
pub use ledger::{IgnoreReason, Ledger, Outcome};
pub use matcher::{match_cancellation, match_request, CancelMatch, RequestMatch};
pub use model::{
    HospitalVisit, LocationVisit, MovementState, NotesMetadata, PlannedMovement, VisitObservation,
};
pub use row_state::RowState;
pub use store::{Record, Tally, UnitOfWork};
pub use trust::TrustPolicy;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KardexError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    /// The fact cannot be tied to a visit and there is not enough
    /// information to create one.
    #[error("missing required identity: {0}")]
    MissingIdentity(String),
    /// The fact contradicts itself or the stored state in a way that cannot
    /// be reconciled.
    #[error("incompatible source data: {0}")]
    IncompatibleData(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<redb::DatabaseError> for KardexError {
    fn from(e: redb::DatabaseError) -> Self {
        KardexError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for KardexError {
    fn from(e: redb::TransactionError) -> Self {
        KardexError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for KardexError {
    fn from(e: redb::TableError) -> Self {
        KardexError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for KardexError {
    fn from(e: redb::StorageError) -> Self {
        KardexError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for KardexError {
    fn from(e: redb::CommitError) -> Self {
        KardexError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KardexError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A stable, time-sortable internal identifier for a stored row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
