use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::{PersistError, Result};
use crate::state::StateValue;

/// Category of a state slot within a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotCategory {
    /// Ordinary read/write slot.
    Plain,
    /// Write-once slot; a second write is rejected.
    Once,
    /// Slot holding a value derived from other slots, cached for the unit.
    Derived,
}

#[derive(Debug)]
struct Slot {
    category: SlotCategory,
    value: StateValue,
}

/// Named state slots scoped to one unit of work.
///
/// Collection at unit end traverses the union of current values across all
/// three categories, so an entity reachable from both a plain slot and a
/// derived slot lands in the same dedup set.
#[derive(Debug, Default)]
pub struct UnitScope {
    slots: Mutex<HashMap<String, Slot>>,
}

impl UnitScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value under a key with the given category.
    ///
    /// Overwriting a `Once` slot is a state error; any other slot is simply
    /// replaced, category included.
    pub fn set(
        &self,
        key: impl Into<String>,
        category: SlotCategory,
        value: impl Into<StateValue>,
    ) -> Result<()> {
        let key = key.into();
        let mut slots = self.slots.lock()?;
        if let Some(existing) = slots.get(&key) {
            if existing.category == SlotCategory::Once {
                return Err(PersistError::StateError(format!(
                    "slot '{}' is write-once and already set",
                    key
                )));
            }
        }
        slots.insert(
            key,
            Slot {
                category,
                value: value.into(),
            },
        );
        Ok(())
    }

    /// Returns a clone of the current value under a key.
    pub fn get(&self, key: &str) -> Result<Option<StateValue>> {
        Ok(self.slots.lock()?.get(key).map(|slot| slot.value.clone()))
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.slots.lock()?.contains_key(key))
    }

    /// Current values of every slot in one category.
    pub fn current_values(&self, category: SlotCategory) -> Result<Vec<StateValue>> {
        Ok(self
            .slots
            .lock()?
            .values()
            .filter(|slot| slot.category == category)
            .map(|slot| slot.value.clone())
            .collect())
    }

    /// Union of current values across all slot categories; this is the
    /// traversal root for collection.
    pub fn all_current_values(&self) -> Result<Vec<StateValue>> {
        Ok(self
            .slots
            .lock()?
            .values()
            .map(|slot| slot.value.clone())
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.slots.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.slots.lock()?.is_empty())
    }
}
