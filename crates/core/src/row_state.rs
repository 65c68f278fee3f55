//! Row state: one entity plus everything needed to update it auditably.

use chrono::{DateTime, Utc};

use crate::audit::Temporal;
use crate::facts::FieldValue;
use crate::store::{Record, UnitOfWork};
use crate::Result;

/// Unit of work for one entity instance under one fact.
///
/// Field mutation goes through the assignment methods, which only touch the
/// entity when its value actually changes. The first real change keeps a copy
/// of the entity as it was, so that [`RowState::save_entity_or_audit_log_if_required`]
/// can retire exactly that state.
///
/// Field accessors are passed as closures returning `&mut` to the field,
/// e.g. `|v| &mut v.discharge_datetime`.
#[derive(Debug, Clone)]
pub struct RowState<E> {
    entity: E,
    /// Entity as loaded, captured on first change.
    original: Option<E>,
    created: bool,
    /// Event time of the fact driving this update.
    message_datetime: DateTime<Utc>,
    /// Processing time of the fact driving this update.
    stored_from: DateTime<Utc>,
}

impl<E: Record> RowState<E> {
    /// Wrap an entity that this fact has just created.
    pub fn created(entity: E, message_datetime: DateTime<Utc>, stored_from: DateTime<Utc>) -> Self {
        Self {
            entity,
            original: None,
            created: true,
            message_datetime,
            stored_from,
        }
    }

    /// Wrap an entity loaded from the store.
    pub fn existing(entity: E, message_datetime: DateTime<Utc>, stored_from: DateTime<Utc>) -> Self {
        Self {
            entity,
            original: None,
            created: false,
            message_datetime,
            stored_from,
        }
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn into_entity(self) -> E {
        self.entity
    }

    pub fn is_entity_created(&self) -> bool {
        self.created
    }

    /// Has an existing entity been changed by this fact?
    pub fn is_entity_updated(&self) -> bool {
        self.original.is_some()
    }

    pub fn message_datetime(&self) -> DateTime<Utc> {
        self.message_datetime
    }

    pub fn stored_from(&self) -> DateTime<Utc> {
        self.stored_from
    }

    fn mark_dirty(&mut self) {
        if !self.created && self.original.is_none() {
            self.original = Some(self.entity.clone());
        }
    }

    /// Set the field to `new_value` if it differs from the current value.
    ///
    /// Equal values are a no-op and produce no audit row, which makes replay
    /// of an identical fact idempotent.
    pub fn assign_if_different<T: PartialEq>(
        &mut self,
        new_value: T,
        field: impl Fn(&mut E) -> &mut T,
    ) {
        if *field(&mut self.entity) == new_value {
            return;
        }
        self.mark_dirty();
        *field(&mut self.entity) = new_value;
    }

    /// Apply a tri-state fact field.
    ///
    /// `Unknown` leaves the field alone, `Known` assigns if different and
    /// `Retract` clears the field through [`RowState::remove_if_exists`],
    /// effective at this fact's event time.
    pub fn assign_field_value<T: PartialEq>(
        &mut self,
        value: FieldValue<T>,
        field: impl Fn(&mut E) -> &mut Option<T>,
    ) {
        match value {
            FieldValue::Unknown => {}
            FieldValue::Known(v) => self.assign_if_different(Some(v), field),
            FieldValue::Retract => {
                let retraction_time = self.message_datetime;
                self.remove_if_exists(field, retraction_time);
            }
        }
    }

    /// Clear the field if it is set and the entity's state is not newer than
    /// `retraction_time`.
    ///
    /// A retraction must not erase information recorded after the
    /// retraction's own effective time.
    pub fn remove_if_exists<T>(
        &mut self,
        field: impl Fn(&mut E) -> &mut Option<T>,
        retraction_time: DateTime<Utc>,
    ) {
        if field(&mut self.entity).is_none() || self.entity.valid_from() > retraction_time {
            return;
        }
        self.mark_dirty();
        *field(&mut self.entity) = None;
    }

    /// Persist the entity if it was created, or retire the loaded state and
    /// persist the new one if it changed. Returns the live entity.
    ///
    /// The snapshot's window is closed at this fact's event and processing
    /// times, and the live row then starts from them. A fact older than the
    /// loaded state closes the window at the state's own `valid_from`, and
    /// the live row starts there too.
    pub fn save_entity_or_audit_log_if_required(mut self, uow: &mut UnitOfWork) -> Result<E> {
        if self.created {
            uow.create(&self.entity)?;
        } else if let Some(original) = self.original.take() {
            let previous = original.to_audit(self.message_datetime, self.stored_from);
            let temporal = self.entity.temporal_mut();
            temporal.valid_from = self.message_datetime.max(original.valid_from());
            temporal.stored_from = self.stored_from;
            uow.supersede(&previous, &self.entity)?;
        }
        Ok(self.entity)
    }
}
