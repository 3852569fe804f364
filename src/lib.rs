// ============================================================================
// autopersist: unit-of-work reconciliation layer
// ============================================================================
//
// Collects persistable entities from the state visible inside one unit of
// work, deduplicates them by instance identity, resolves per-entity
// directives (skip / force-update / upsert / delete), and reconciles the
// result against a backing store in one batched flush.

pub mod collect;
pub mod core;
pub mod engine;
pub mod entity;
pub mod orchestrate;
pub mod state;
pub mod unit;

// Re-export main types for convenience
pub use crate::core::{PersistError, Result, Value};
pub use collect::{EntityClassifier, collect_scope, collect_value};
pub use engine::{
    EntityType, MemoryEngine, PrimaryKey, StorageEngine, StorageSession, primary_key_of,
};
pub use entity::{
    DirectiveAction, DirectiveMap, Directives, EntityCell, EntityId, EntityKind, EntityRef,
    EntitySet,
};
pub use orchestrate::PersistOrchestrator;
pub use state::{SlotCategory, StateValue, UnitScope};
pub use unit::{
    UnitContext, assign_fields, current_session, current_unit, has_state, is_persistable,
    mark_for_delete, mark_for_upsert, mark_force_update, mark_skip_persist,
    register_post_persist_hook, run_unit_of_work, set_derived_state, set_once_state, set_state,
    state, try_current_session,
};
