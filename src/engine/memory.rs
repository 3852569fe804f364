use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{Level, event};

use crate::core::{PersistError, Result, Value};
use crate::engine::{EntityType, PrimaryKey, StorageEngine, StorageSession};
use crate::entity::{EntityCell, EntityId, EntityKind, EntityRef};

const KEY_SEPARATOR: char = '\u{1f}';

/// Builds the canonical row key for a primary-key map, in declared field
/// order. Type names are included so `1` and `"1"` never collide.
fn encode_key(meta: &EntityType, key: &PrimaryKey) -> Result<String> {
    let mut parts = Vec::with_capacity(meta.primary_key().len());
    for name in meta.primary_key() {
        match key.get(name) {
            Some(value) => parts.push(format!("{}:{}", value.type_name(), value)),
            None => {
                return Err(PersistError::MissingPrimaryKey(
                    name.clone(),
                    meta.name().to_string(),
                ));
            }
        }
    }
    Ok(parts.join(&KEY_SEPARATOR.to_string()))
}

fn identity_key(kind: &EntityKind, encoded: &str) -> String {
    format!("{}{}{}", kind, KEY_SEPARATOR, encoded)
}

#[derive(Debug)]
struct Table {
    rows: BTreeMap<String, BTreeMap<String, Value>>,
    next_id: i64,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

#[derive(Debug, Default)]
struct Store {
    tables: HashMap<String, Table>,
    writes: u64,
    flushes: u64,
}

/// In-memory storage engine used as the reference backing store.
///
/// One shared store, one forked session per unit of work. Sessions attach
/// loaded rows to an identity map, track loaded field snapshots so unchanged
/// entities produce no write, and apply all pending marks in a single batch
/// under one store lock at flush.
pub struct MemoryEngine {
    store: Arc<Mutex<Store>>,
    types: HashMap<EntityKind, EntityType>,
    configured: Vec<EntityType>,
}

impl MemoryEngine {
    pub fn new(types: impl IntoIterator<Item = EntityType>) -> Arc<Self> {
        let configured: Vec<EntityType> = types.into_iter().collect();
        let types = configured
            .iter()
            .map(|t| (t.kind(), t.clone()))
            .collect();
        Arc::new(Self {
            store: Arc::new(Mutex::new(Store::default())),
            types,
            configured,
        })
    }

    fn type_of(&self, kind: &EntityKind) -> Result<&EntityType> {
        self.types
            .get(kind)
            .ok_or_else(|| PersistError::UnknownEntityType(kind.name().to_string()))
    }

    /// Inserts a row directly, bypassing sessions. Intended for seeding test
    /// fixtures and administrative backfills.
    pub async fn seed_row(
        &self,
        kind: &EntityKind,
        fields: BTreeMap<String, Value>,
    ) -> Result<PrimaryKey> {
        let meta = self.type_of(kind)?.clone();
        let mut store = self.store.lock().await;
        let table = store.tables.entry(meta.name().to_string()).or_default();
        let mut fields = fields;
        assign_generated_key(table, &meta, &mut fields)?;
        let mut key = PrimaryKey::new();
        for name in meta.primary_key() {
            if let Some(value) = fields.get(name) {
                key.insert(name.clone(), value.clone());
            }
        }
        let encoded = encode_key(&meta, &key)?;
        table.rows.insert(encoded, fields);
        store.writes += 1;
        Ok(key)
    }

    /// Returns a clone of the row identified by `key`, if present.
    pub async fn row(
        &self,
        kind: &EntityKind,
        key: &PrimaryKey,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        let meta = self.type_of(kind)?;
        let encoded = encode_key(meta, key)?;
        let store = self.store.lock().await;
        Ok(store
            .tables
            .get(meta.name())
            .and_then(|table| table.rows.get(&encoded))
            .cloned())
    }

    /// Number of rows currently stored for a type.
    pub async fn row_count(&self, kind: &EntityKind) -> Result<usize> {
        let meta = self.type_of(kind)?;
        let store = self.store.lock().await;
        Ok(store
            .tables
            .get(meta.name())
            .map(|table| table.rows.len())
            .unwrap_or(0))
    }

    /// Total row writes (inserts, updates, deletes) applied so far.
    pub async fn write_count(&self) -> u64 {
        self.store.lock().await.writes
    }

    /// Number of flushes executed so far across all sessions.
    pub async fn flush_count(&self) -> u64 {
        self.store.lock().await.flushes
    }
}

impl StorageEngine for MemoryEngine {
    fn fork_session(&self) -> Arc<dyn StorageSession> {
        Arc::new(MemorySession {
            store: self.store.clone(),
            types: self.types.clone(),
            state: StdMutex::new(SessionState::default()),
        })
    }

    fn metadata(&self, kind: &EntityKind) -> Result<EntityType> {
        self.type_of(kind).cloned()
    }

    fn configured_types(&self) -> Vec<EntityType> {
        self.configured.clone()
    }
}

#[derive(Debug)]
enum PendingOp {
    Persist(EntityRef),
    Remove(EntityRef),
}

#[derive(Debug, Default)]
struct SessionState {
    /// Attached instances, keyed by kind + encoded primary key.
    identity: HashMap<String, EntityRef>,
    /// Field snapshots taken at load time, for dirty detection at flush.
    snapshots: HashMap<EntityId, BTreeMap<String, Value>>,
    pending: Vec<PendingOp>,
    pending_persists: HashSet<EntityId>,
}

/// Session over the shared in-memory store, scoped to one unit of work.
pub struct MemorySession {
    store: Arc<Mutex<Store>>,
    types: HashMap<EntityKind, EntityType>,
    state: StdMutex<SessionState>,
}

impl MemorySession {
    fn type_of(&self, kind: &EntityKind) -> Result<&EntityType> {
        self.types
            .get(kind)
            .ok_or_else(|| PersistError::UnknownEntityType(kind.name().to_string()))
    }
}

#[async_trait]
impl StorageSession for MemorySession {
    async fn find_one(&self, kind: &EntityKind, key: &PrimaryKey) -> Result<Option<EntityRef>> {
        let meta = self.type_of(kind)?.clone();
        let encoded = encode_key(&meta, key)?;
        let ident = identity_key(kind, &encoded);

        if let Some(attached) = self.state.lock()?.identity.get(&ident).cloned() {
            return Ok(Some(attached));
        }

        let store = self.store.lock().await;
        let Some(row) = store
            .tables
            .get(meta.name())
            .and_then(|table| table.rows.get(&encoded))
            .cloned()
        else {
            return Ok(None);
        };
        drop(store);

        let entity = EntityCell::with_fields(kind.clone(), row.clone());
        let mut state = self.state.lock()?;
        // Re-check under the final lock: a concurrent lookup for the same
        // key may have attached an instance while the store was being read.
        // One row, one attached instance.
        if let Some(attached) = state.identity.get(&ident).cloned() {
            return Ok(Some(attached));
        }
        state.snapshots.insert(EntityId::of(&entity), row);
        state.identity.insert(ident, entity.clone());
        Ok(Some(entity))
    }

    fn get_reference(&self, kind: &EntityKind, key: &PrimaryKey) -> Result<EntityRef> {
        let meta = self.type_of(kind)?;
        let encoded = encode_key(meta, key)?;
        let ident = identity_key(kind, &encoded);

        let mut state = self.state.lock()?;
        if let Some(attached) = state.identity.get(&ident).cloned() {
            return Ok(attached);
        }

        // Lazy handle seeded with the key fields only; anything written onto
        // it afterwards counts as dirty.
        let entity = EntityCell::with_fields(kind.clone(), key.clone());
        state.snapshots.insert(EntityId::of(&entity), key.clone());
        state.identity.insert(ident, entity.clone());
        Ok(entity)
    }

    fn persist(&self, entity: &EntityRef) -> Result<()> {
        self.type_of(entity.kind())?;
        let mut state = self.state.lock()?;
        if state.pending_persists.insert(EntityId::of(entity)) {
            state.pending.push(PendingOp::Persist(entity.clone()));
        }
        Ok(())
    }

    fn remove(&self, entity: &EntityRef) -> Result<()> {
        self.type_of(entity.kind())?;
        self.state.lock()?.pending.push(PendingOp::Remove(entity.clone()));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let ops = {
            let mut state = self.state.lock()?;
            state.pending_persists.clear();
            state.pending.drain(..).collect::<Vec<_>>()
        };
        event!(Level::DEBUG, pending = ops.len(), "flushing session batch");

        let mut store = self.store.lock().await;
        store.flushes += 1;

        for op in ops {
            match op {
                PendingOp::Persist(entity) => {
                    let meta = self.type_of(entity.kind())?.clone();
                    let mut fields = entity.fields()?;
                    let id = EntityId::of(&entity);

                    let snapshot = self.state.lock()?.snapshots.get(&id).cloned();
                    if snapshot.as_ref() == Some(&fields) {
                        // Attached and unchanged since load: nothing to write.
                        continue;
                    }

                    let table = store.tables.entry(meta.name().to_string()).or_default();
                    if let Some((name, value)) = assign_generated_key(table, &meta, &mut fields)? {
                        entity.set_field(name, value)?;
                    }

                    let mut key = PrimaryKey::new();
                    for name in meta.primary_key() {
                        if let Some(value) = fields.get(name) {
                            key.insert(name.clone(), value.clone());
                        }
                    }
                    let encoded = encode_key(&meta, &key)?;
                    // Merge onto the existing row: a lazy reference carries
                    // only its written fields, untouched columns survive.
                    let row = table.rows.entry(encoded.clone()).or_default();
                    for (name, value) in &fields {
                        row.insert(name.clone(), value.clone());
                    }
                    store.writes += 1;

                    let mut state = self.state.lock()?;
                    state.snapshots.insert(id, fields);
                    state
                        .identity
                        .insert(identity_key(entity.kind(), &encoded), entity.clone());
                }
                PendingOp::Remove(entity) => {
                    let meta = self.type_of(entity.kind())?.clone();
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
                                    meta.name().to_string(),
                                ));
                            }
                        }
                    }
                    let encoded = encode_key(&meta, &key)?;
                    let removed = store
                        .tables
                        .get_mut(meta.name())
                        .map(|table| table.rows.remove(&encoded).is_some())
                        .unwrap_or(false);
                    if removed {
                        store.writes += 1;
                    }

                    let mut state = self.state.lock()?;
                    state.identity.remove(&identity_key(entity.kind(), &encoded));
                    state.snapshots.remove(&EntityId::of(&entity));
                }
            }
        }
        Ok(())
    }
}

/// Assigns a generated integer key when a single-field primary key is absent.
///
/// Returns the generated field so the caller can write it back onto the
/// entity handle, making it observable after flush. Explicit integer keys
/// bump the generator past themselves to keep later assignments collision
/// free.
fn assign_generated_key(
    table: &mut Table,
    meta: &EntityType,
    fields: &mut BTreeMap<String, Value>,
) -> Result<Option<(String, Value)>> {
    let [key_field] = meta.primary_key() else {
        return Ok(None);
    };
    match fields.get(key_field) {
        None => {
            let assigned = table.next_id;
            table.next_id += 1;
            let value = Value::Integer(assigned);
            fields.insert(key_field.clone(), value.clone());
            Ok(Some((key_field.clone(), value)))
        }
        Some(Value::Integer(explicit)) => {
            if *explicit >= table.next_id {
                table.next_id = explicit + 1;
            }
            Ok(None)
        }
        Some(_) => Ok(None),
    }
}
