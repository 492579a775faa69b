//! Append-only row history with an active flag.
//!
//! Rows are never removed. Recording a new row in a slot deactivates the row
//! it replaces, so a slot holds at most one active row under normal operation.
//! Stored data that violates this is reported, never silently resolved.
use super::error::IntegrityError;
use std::fmt::Debug;

pub trait Versioned {
    /// Rows sharing a slot replace each other.
    type Slot: PartialEq + Debug;
    const KIND: &'static str;

    fn slot(&self) -> Self::Slot;
    fn is_active(&self) -> bool;
    fn deactivate(&mut self);
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct VersionedLog<T> {
    #[n(0)]
    rows: Vec<T>,
}

impl<T> Default for VersionedLog<T> {
    fn default() -> Self {
        Self { rows: vec![] }
    }
}

impl<T: Versioned> VersionedLog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from stored rows as-is, without enforcing the slot invariant.
    pub fn from_rows(rows: Vec<T>) -> Self {
        Self { rows }
    }

    /// Append `row`, deactivating whatever was active in its slot.
    /// Returns how many rows were deactivated.
    pub fn record(&mut self, row: T) -> usize {
        let slot = row.slot();
        let mut replaced = 0;
        for existing in self.rows.iter_mut() {
            if existing.is_active() && existing.slot() == slot {
                existing.deactivate();
                replaced += 1;
            }
        }
        self.rows.push(row);
        replaced
    }

    /// Deactivate every row. Idempotent.
    pub fn deactivate_all(&mut self) -> usize {
        let mut count = 0;
        for row in self.rows.iter_mut().filter(|r| r.is_active()) {
            row.deactivate();
            count += 1;
        }
        count
    }

    pub fn all(&self) -> &[T] {
        &self.rows
    }

    pub fn active(&self) -> impl Iterator<Item = &T> {
        self.rows.iter().filter(|r| r.is_active())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The single active row in `slot`, if any.
    pub fn active_in(&self, form_id: &str, slot: &T::Slot) -> Result<Option<&T>, IntegrityError> {
        let mut found = self.active().filter(|r| &r.slot() == slot);
        let first = found.next();
        let extra = found.count();
        if extra > 0 {
            return Err(IntegrityError::DuplicateActiveRows {
                form_id: form_id.to_string(),
                kind: T::KIND,
                slot: format!("{slot:?}"),
                count: extra + 1,
            });
        }
        Ok(first)
    }

    /// Mutable access to the single active row in `slot`, if any.
    pub fn active_in_mut(
        &mut self,
        form_id: &str,
        slot: &T::Slot,
    ) -> Result<Option<&mut T>, IntegrityError> {
        // validate first so the mutable borrow below is unambiguous
        self.active_in(form_id, slot)?;
        Ok(self
            .rows
            .iter_mut()
            .find(|r| r.is_active() && &r.slot() == slot))
    }

    /// Fail if any slot holds more than one active row.
    pub fn check_invariant(&self, form_id: &str) -> Result<(), IntegrityError> {
        for row in self.active() {
            self.active_in(form_id, &row.slot())?;
        }
        Ok(())
    }
}
