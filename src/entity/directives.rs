use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::Result;
use crate::entity::{EntityId, EntityRef};

/// Persistence directives for one entity within one unit of work.
///
/// These are deliberately not stored on the entity itself: domain fields stay
/// free of persistence metadata, and the flags vanish with the unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directives {
    /// Never hand this entity to the storage engine.
    pub skip_persist: bool,
    /// Update by lazy reference, without reading the existing row.
    pub force_update: bool,
    /// Update the existing row if one is found by primary key, insert otherwise.
    pub for_upsert: bool,
    /// Remove the existing row. Takes precedence over every other flag.
    pub for_delete: bool,
}

/// Action the orchestrator takes for one collected entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveAction {
    Remove,
    UpdateByReference,
    Upsert,
    PersistAsIs,
}

impl Directives {
    /// Resolves the flags into a single action. Deletion wins over update and
    /// upsert; a forced update wins over upsert.
    pub fn action(&self) -> DirectiveAction {
        if self.for_delete {
            DirectiveAction::Remove
        } else if self.force_update {
            DirectiveAction::UpdateByReference
        } else if self.for_upsert {
            DirectiveAction::Upsert
        } else {
            DirectiveAction::PersistAsIs
        }
    }
}

/// Per-unit directive record, keyed by entity identity.
///
/// Each entry holds the entity handle alongside its directives: keeping the
/// handle alive pins the allocation, so an identity key can never be reused
/// by a later entity while its directives are still recorded.
#[derive(Debug, Default)]
pub struct DirectiveMap {
    entries: Mutex<HashMap<EntityId, (EntityRef, Directives)>>,
}

impl DirectiveMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the directives recorded for an entity, defaulting to none.
    pub fn get(&self, entity: &EntityRef) -> Result<Directives> {
        Ok(self
            .entries
            .lock()?
            .get(&EntityId::of(entity))
            .map(|(_, directives)| *directives)
            .unwrap_or_default())
    }

    /// Applies a mutation to the directives recorded for an entity.
    pub fn update(&self, entity: &EntityRef, apply: impl FnOnce(&mut Directives)) -> Result<()> {
        let mut entries = self.entries.lock()?;
        let entry = entries
            .entry(EntityId::of(entity))
            .or_insert_with(|| (entity.clone(), Directives::default()));
        apply(&mut entry.1);
        Ok(())
    }

    pub fn mark_skip_persist(&self, entity: &EntityRef) -> Result<()> {
        self.update(entity, |d| d.skip_persist = true)
    }

    pub fn mark_force_update(&self, entity: &EntityRef) -> Result<()> {
        self.update(entity, |d| d.force_update = true)
    }

    pub fn mark_for_upsert(&self, entity: &EntityRef) -> Result<()> {
        self.update(entity, |d| d.for_upsert = true)
    }

    pub fn mark_for_delete(&self, entity: &EntityRef) -> Result<()> {
        self.update(entity, |d| d.for_delete = true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityCell;

    #[test]
    fn delete_takes_precedence() {
        let directives = Directives {
            for_delete: true,
            for_upsert: true,
            force_update: true,
            ..Default::default()
        };
        assert_eq!(directives.action(), DirectiveAction::Remove);
    }

    #[test]
    fn force_update_wins_over_upsert() {
        let directives = Directives {
            force_update: true,
            for_upsert: true,
            ..Default::default()
        };
        assert_eq!(directives.action(), DirectiveAction::UpdateByReference);
    }

    #[test]
    fn default_action_is_persist_as_is() {
        assert_eq!(Directives::default().action(), DirectiveAction::PersistAsIs);
    }

    #[test]
    fn directives_are_per_instance() {
        let map = DirectiveMap::new();
        let a = EntityCell::new("User");
        let b = EntityCell::new("User");
        map.mark_for_delete(&a).unwrap();

        assert_eq!(map.get(&a).unwrap().action(), DirectiveAction::Remove);
        assert_eq!(map.get(&b).unwrap().action(), DirectiveAction::PersistAsIs);
    }

    #[test]
    fn dropped_entity_never_leaks_directives_to_new_allocations() {
        let map = DirectiveMap::new();

        // Mark a scratch entity and drop our handle. The map pins the
        // allocation, so entities created afterwards cannot land on its
        // address and inherit the stale flags.
        let scratch = EntityCell::new("User");
        map.mark_for_delete(&scratch).unwrap();
        map.mark_skip_persist(&scratch).unwrap();
        drop(scratch);

        for _ in 0..64 {
            let fresh = EntityCell::new("User");
            let directives = map.get(&fresh).unwrap();
            assert!(!directives.for_delete);
            assert!(!directives.skip_persist);
            assert_eq!(directives.action(), DirectiveAction::PersistAsIs);
        }
    }
}
