use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::core::{Result, Value};

/// Interned tag naming a persistable entity type.
///
/// Kinds are resolved against the registered type set of the active unit of
/// work; an object carrying an unregistered kind is not an entity as far as
/// collection is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKind(Arc<str>);

impl EntityKind {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityKind {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Shared handle to one entity instance.
///
/// Two handles refer to the same logical record iff they point at the same
/// allocation; all dedup downstream is identity-based, never field-based.
pub type EntityRef = Arc<EntityCell>;

/// One entity instance: a kind tag plus a guarded field map.
///
/// Holds domain fields only; persistence directives live in the unit's
/// [`DirectiveMap`](crate::entity::DirectiveMap), keyed by [`EntityId`].
#[derive(Debug)]
pub struct EntityCell {
    kind: EntityKind,
    fields: RwLock<BTreeMap<String, Value>>,
}

impl EntityCell {
    /// Creates an entity with no assigned fields.
    pub fn new(kind: impl Into<EntityKind>) -> EntityRef {
        Arc::new(Self {
            kind: kind.into(),
            fields: RwLock::new(BTreeMap::new()),
        })
    }

    /// Creates an entity from an initial field map.
    pub fn with_fields(kind: impl Into<EntityKind>, fields: BTreeMap<String, Value>) -> EntityRef {
        Arc::new(Self {
            kind: kind.into(),
            fields: RwLock::new(fields),
        })
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    /// Returns a clone of one field, or `None` if the field is absent.
    pub fn field(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.fields.read()?.get(name).cloned())
    }

    /// Sets one field to a defined value.
    pub fn set_field(&self, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.fields.write()?.insert(name.into(), value.into());
        Ok(())
    }

    /// Removes a field, returning it to the absent state.
    pub fn unset_field(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.fields.write()?.remove(name))
    }

    /// Returns a snapshot clone of all defined fields.
    pub fn fields(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.fields.read()?.clone())
    }

    /// Overwrites every field present in `source` onto this entity.
    ///
    /// Fields absent from `source` are left untouched, which is what makes
    /// reference updates and upsert merges partial.
    pub fn merge_fields(&self, source: &BTreeMap<String, Value>) -> Result<()> {
        let mut fields = self.fields.write()?;
        for (name, value) in source {
            fields.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

/// Identity of one entity instance, derived from its allocation address.
///
/// Stable for the lifetime of the handle; used as the key for dedup sets,
/// directive records, and lookup caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(usize);

impl EntityId {
    pub fn of(entity: &EntityRef) -> Self {
        Self(Arc::as_ptr(entity) as usize)
    }
}

/// Deduplicated collection of entities with identity-based membership.
///
/// Inserting the same instance twice is a no-op regardless of how many state
/// slots it was reached through.
#[derive(Debug, Default)]
pub struct EntitySet {
    entries: HashMap<EntityId, EntityRef>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity; returns `false` if the instance was already present.
    pub fn insert(&mut self, entity: EntityRef) -> bool {
        self.entries.insert(EntityId::of(&entity), entity).is_none()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.entries.contains_key(&EntityId::of(entity))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_set_deduplicates_same_instance() {
        let user = EntityCell::new("User");
        let mut set = EntitySet::new();
        assert!(set.insert(user.clone()));
        assert!(!set.insert(user.clone()));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn equal_fields_are_still_distinct_instances() {
        let a = EntityCell::new("User");
        let b = EntityCell::new("User");
        a.set_field("name", "x").unwrap();
        b.set_field("name", "x").unwrap();

        let mut set = EntitySet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn merge_leaves_absent_fields_untouched() {
        let target = EntityCell::new("User");
        target.set_field("name", "old").unwrap();
        target.set_field("note", "keep").unwrap();

        let source = EntityCell::new("User");
        source.set_field("name", "new").unwrap();

        target.merge_fields(&source.fields().unwrap()).unwrap();
        assert_eq!(target.field("name").unwrap(), Some(Value::from("new")));
        assert_eq!(target.field("note").unwrap(), Some(Value::from("keep")));
    }
}
