use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{PersistError, Result, Value};
use crate::entity::{EntityKind, EntityRef};

pub mod memory;

pub use memory::MemoryEngine;

/// Field-name to value mapping identifying one row; composite keys carry one
/// entry per declared key field.
pub type PrimaryKey = BTreeMap<String, Value>;

/// Storage metadata for one configured entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    name: String,
    primary_key: Vec<String>,
}

impl EntityType {
    pub fn new(
        name: impl Into<String>,
        primary_key: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntityKind {
        EntityKind::new(&self.name)
    }

    /// Declared primary-key field names, in declaration order.
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }
}

/// Backing store the reconciliation layer drives.
///
/// The engine owns durability, key generation, and change tracking; this
/// layer only decides which entities reach it and with which operation.
pub trait StorageEngine: Send + Sync {
    /// Forks an isolated session for one unit of work.
    fn fork_session(&self) -> Arc<dyn StorageSession>;

    /// Returns the metadata for a configured entity type.
    fn metadata(&self, kind: &EntityKind) -> Result<EntityType>;

    /// Lists every entity type the engine is configured with. The registered
    /// type set of a unit of work is built from this once, at unit open.
    fn configured_types(&self) -> Vec<EntityType>;
}

/// One engine session, scoped to a single unit of work.
///
/// Sessions must tolerate concurrent in-flight `find_one` and mark calls
/// before `flush`; no locking is added above this contract.
#[async_trait]
pub trait StorageSession: Send + Sync {
    /// Loads the row identified by `key`, attaching it to the session's
    /// identity map. Returns the already-attached instance when present.
    async fn find_one(&self, kind: &EntityKind, key: &PrimaryKey) -> Result<Option<EntityRef>>;

    /// Returns a lazy handle to the row identified by `key` without reading
    /// it. Fields later written onto the handle become the update payload.
    fn get_reference(&self, kind: &EntityKind, key: &PrimaryKey) -> Result<EntityRef>;

    /// Marks an entity for insert-or-update at the next flush.
    fn persist(&self, entity: &EntityRef) -> Result<()>;

    /// Marks an entity for removal at the next flush.
    fn remove(&self, entity: &EntityRef) -> Result<()>;

    /// Applies every pending mark as one batch.
    async fn flush(&self) -> Result<()>;
}

/// Builds the primary-key map for an entity from engine metadata.
///
/// Every declared key field must be defined on the entity; lookups and lazy
/// references cannot be built from a partial key.
pub fn primary_key_of(engine: &dyn StorageEngine, entity: &EntityRef) -> Result<PrimaryKey> {
    let meta = engine.metadata(entity.kind())?;
    let fields = entity.fields()?;
    let mut key = PrimaryKey::new();
    for name in meta.primary_key() {
        match fields.get(name) {
            Some(value) => {
                key.insert(name.clone(), value.clone());
            }
            None => {
                return Err(PersistError::MissingPrimaryKey(
                    name.clone(),
                    entity.kind().name().to_string(),
                ));
            }
        }
    }
    Ok(key)
}
