// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------
//
// Every live entity type has its own table plus an append-only audit table.
// Values are JSON. Dependent rows use the composite key
// `"{visit_id}:{row id}"` so everything recorded against a visit is one
// prefix scan away; audit rows use `"{visit_id}:{ulid}"` for the same reason.

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use ulid::Ulid;

use crate::audit::{retire, AuditSnapshot, Temporal};
use crate::model::{HospitalVisit, LocationVisit, NotesMetadata, PlannedMovement, VisitObservation};
use crate::{RecordId, Result};

type JsonTable = TableDefinition<'static, &'static str, &'static str>;

/// Maps encounter number to internal visit id.
const ENCOUNTERS: JsonTable = TableDefinition::new("encounters");
/// Every visit id an encounter number has ever pointed at, keyed
/// `"{encounter}:{visit_id}"`. Never pruned, so audits of renumbered and
/// deleted visits stay reachable by encounter.
const ENCOUNTER_HISTORY: JsonTable = TableDefinition::new("encounter_history");

const VISITS: JsonTable = TableDefinition::new("hospital_visit");
const VISIT_AUDITS: JsonTable = TableDefinition::new("hospital_visit_audit");
const LOCATION_VISITS: JsonTable = TableDefinition::new("location_visit");
const LOCATION_VISIT_AUDITS: JsonTable = TableDefinition::new("location_visit_audit");
const PLANNED_MOVEMENTS: JsonTable = TableDefinition::new("planned_movement");
const PLANNED_MOVEMENT_AUDITS: JsonTable = TableDefinition::new("planned_movement_audit");
const OBSERVATIONS: JsonTable = TableDefinition::new("visit_observation");
const OBSERVATION_AUDITS: JsonTable = TableDefinition::new("visit_observation_audit");
const NOTES: JsonTable = TableDefinition::new("notes_metadata");
const NOTES_AUDITS: JsonTable = TableDefinition::new("notes_metadata_audit");

/// A persisted entity with a live table and an audit table.
pub trait Record: Temporal + Serialize + DeserializeOwned {
    const TABLE: JsonTable;
    const AUDIT_TABLE: JsonTable;

    /// Primary key in [`Record::TABLE`].
    fn key(&self) -> String;

    /// Visit the row belongs to (the visit's own id for visits).
    fn visit_id(&self) -> &RecordId;
}

impl Record for HospitalVisit {
    const TABLE: JsonTable = VISITS;
    const AUDIT_TABLE: JsonTable = VISIT_AUDITS;

    fn key(&self) -> String {
        self.visit_id.0.clone()
    }

    fn visit_id(&self) -> &RecordId {
        &self.visit_id
    }
}

impl Record for LocationVisit {
    const TABLE: JsonTable = LOCATION_VISITS;
    const AUDIT_TABLE: JsonTable = LOCATION_VISIT_AUDITS;

    fn key(&self) -> String {
        format!("{}:{}", self.visit_id, self.location_visit_id)
    }

    fn visit_id(&self) -> &RecordId {
        &self.visit_id
    }
}

impl Record for PlannedMovement {
    const TABLE: JsonTable = PLANNED_MOVEMENTS;
    const AUDIT_TABLE: JsonTable = PLANNED_MOVEMENT_AUDITS;

    fn key(&self) -> String {
        format!("{}:{}", self.visit_id, self.planned_movement_id)
    }

    fn visit_id(&self) -> &RecordId {
        &self.visit_id
    }
}

impl Record for VisitObservation {
    const TABLE: JsonTable = OBSERVATIONS;
    const AUDIT_TABLE: JsonTable = OBSERVATION_AUDITS;

    fn key(&self) -> String {
        format!("{}:{}", self.visit_id, self.observation_id)
    }

    fn visit_id(&self) -> &RecordId {
        &self.visit_id
    }
}

impl Record for NotesMetadata {
    const TABLE: JsonTable = NOTES;
    const AUDIT_TABLE: JsonTable = NOTES_AUDITS;

    fn key(&self) -> String {
        format!("{}:{}", self.visit_id, self.note_id)
    }

    fn visit_id(&self) -> &RecordId {
        &self.visit_id
    }
}

/// Create every table so read transactions never hit a missing one.
pub(crate) fn init_tables(db: &Database) -> Result<()> {
    let write_txn = db.begin_write()?;
    for table in [
        ENCOUNTERS,
        ENCOUNTER_HISTORY,
        VISITS,
        VISIT_AUDITS,
        LOCATION_VISITS,
        LOCATION_VISIT_AUDITS,
        PLANNED_MOVEMENTS,
        PLANNED_MOVEMENT_AUDITS,
        OBSERVATIONS,
        OBSERVATION_AUDITS,
        NOTES,
        NOTES_AUDITS,
    ] {
        write_txn.open_table(table)?;
    }
    write_txn.commit()?;
    Ok(())
}

pub(crate) fn get_from<R: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static str>,
    key: &str,
) -> Result<Option<R>> {
    let found = match table.get(key)? {
        Some(guard) => Some(serde_json::from_str(guard.value())?),
        None => None,
    };
    Ok(found)
}

/// Decode every row whose key starts with `prefix`, in key order.
pub(crate) fn scan_from<R: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static str>,
    prefix: &str,
) -> Result<Vec<R>> {
    let mut results = Vec::new();
    for entry in table.range(prefix..)? {
        let (k, v) = entry?;
        if !k.value().starts_with(prefix) {
            break;
        }
        results.push(serde_json::from_str(v.value())?);
    }
    Ok(results)
}

pub(crate) fn encounter_index() -> JsonTable {
    ENCOUNTERS
}

pub(crate) fn encounter_history() -> JsonTable {
    ENCOUNTER_HISTORY
}

/// Visit ids ever indexed under `encounter`, live or not.
pub(crate) fn visit_ids_for(
    history: &impl ReadableTable<&'static str, &'static str>,
    encounter: &str,
) -> Result<Vec<RecordId>> {
    let prefix = format!("{encounter}:");
    let mut ids = Vec::new();
    for entry in history.range(prefix.as_str()..)? {
        let (k, v) = entry?;
        if !k.value().starts_with(&prefix) {
            break;
        }
        ids.push(RecordId(v.value().to_string()));
    }
    Ok(ids)
}

/// Counts of what a unit of work changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
}

/// One atomic unit of work: everything a single fact does.
///
/// Wraps a redb write transaction. redb serialises writers, so two facts
/// contending on the same visit or planned-movement slot can never both
/// observe "no row" and both insert. Dropping a `UnitOfWork` without calling
/// [`UnitOfWork::commit`] rolls back every write made through it.
pub struct UnitOfWork {
    txn: WriteTransaction,
    tally: Tally,
}

impl UnitOfWork {
    pub fn begin(db: &Database) -> Result<Self> {
        Ok(Self {
            txn: db.begin_write()?,
            tally: Tally::default(),
        })
    }

    pub fn commit(self) -> Result<Tally> {
        self.txn.commit()?;
        Ok(self.tally)
    }

    pub fn tally(&self) -> Tally {
        self.tally
    }

    // -- repository primitives ---------------------------------------------

    pub fn find<R: Record>(&self, key: &str) -> Result<Option<R>> {
        let table = self.txn.open_table(R::TABLE)?;
        get_from(&table, key)
    }

    /// All live rows of type `R` recorded against `visit_id`.
    pub fn find_for_visit<R: Record>(&self, visit_id: &RecordId) -> Result<Vec<R>> {
        let table = self.txn.open_table(R::TABLE)?;
        scan_from(&table, &format!("{visit_id}:"))
    }

    pub fn save<R: Record>(&mut self, row: &R) -> Result<()> {
        let value = serde_json::to_string(row)?;
        let mut table = self.txn.open_table(R::TABLE)?;
        table.insert(row.key().as_str(), value.as_str())?;
        Ok(())
    }

    pub fn save_audit<R: Record>(&mut self, audit: &AuditSnapshot<R>) -> Result<()> {
        let key = format!("{}:{}", audit.row.visit_id(), Ulid::new());
        let value = serde_json::to_string(audit)?;
        let mut table = self.txn.open_table(R::AUDIT_TABLE)?;
        table.insert(key.as_str(), value.as_str())?;
        Ok(())
    }

    pub fn delete<R: Record>(&mut self, row: &R) -> Result<()> {
        let mut table = self.txn.open_table(R::TABLE)?;
        table.remove(row.key().as_str())?;
        Ok(())
    }

    // -- lifecycle writes --------------------------------------------------

    /// Persist a row that did not exist before this fact.
    pub fn create<R: Record>(&mut self, row: &R) -> Result<()> {
        self.save(row)?;
        self.tally.created += 1;
        Ok(())
    }

    /// Write the snapshot of the superseded state, then the new live row.
    pub fn supersede<R: Record>(&mut self, previous: &AuditSnapshot<R>, row: &R) -> Result<()> {
        self.save_audit(previous)?;
        self.save(row)?;
        self.tally.updated += 1;
        Ok(())
    }

    /// Write a final snapshot of `row` and remove it. No tombstone remains.
    pub fn retire_and_delete<R: Record>(
        &mut self,
        row: &R,
        valid_until: DateTime<Utc>,
        stored_until: DateTime<Utc>,
    ) -> Result<()> {
        self.save_audit(&retire(row, valid_until, stored_until))?;
        self.delete(row)?;
        self.tally.deleted += 1;
        Ok(())
    }

    // -- encounter index ---------------------------------------------------

    pub fn find_visit(&self, encounter: &str) -> Result<Option<HospitalVisit>> {
        let visit_id: Option<String> = {
            let index = self.txn.open_table(ENCOUNTERS)?;
            let found = index.get(encounter)?.map(|guard| guard.value().to_string());
            found
        };
        match visit_id {
            Some(id) => self.find(&id),
            None => Ok(None),
        }
    }

    pub fn index_encounter(&mut self, encounter: &str, visit_id: &RecordId) -> Result<()> {
        {
            let mut index = self.txn.open_table(ENCOUNTERS)?;
            index.insert(encounter, visit_id.0.as_str())?;
        }
        let key = format!("{encounter}:{visit_id}");
        let mut history = self.txn.open_table(ENCOUNTER_HISTORY)?;
        history.insert(key.as_str(), visit_id.0.as_str())?;
        Ok(())
    }

    /// Drop the live mapping; the history entry stays.
    pub fn unindex_encounter(&mut self, encounter: &str) -> Result<()> {
        let mut index = self.txn.open_table(ENCOUNTERS)?;
        index.remove(encounter)?;
        Ok(())
    }
}
