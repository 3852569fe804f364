use std::collections::BTreeMap;

use crate::core::{PersistError, Value};
use crate::entity::EntityRef;

/// One node of the state tree held by a slot.
///
/// Anything an application computes during a unit of work is representable:
/// plain scalars, entities, ordered sequences, key-value maps, optional
/// values (`Absent` for the missing case), and fallible outcomes that carry
/// either a value or the error that produced it.
#[derive(Debug, Clone)]
pub enum StateValue {
    /// Nothing here: an unset optional or an intentionally empty slot.
    Absent,
    Scalar(Value),
    Entity(EntityRef),
    List(Vec<StateValue>),
    Map(BTreeMap<String, StateValue>),
    /// Result of a fallible computation stored as state. A carried error
    /// aborts collection for the whole unit rather than being swallowed.
    Outcome(Result<Box<StateValue>, PersistError>),
}

impl StateValue {
    pub fn scalar(value: impl Into<Value>) -> Self {
        Self::Scalar(value.into())
    }

    pub fn entity(entity: EntityRef) -> Self {
        Self::Entity(entity)
    }

    pub fn list(items: impl IntoIterator<Item = StateValue>) -> Self {
        Self::List(items.into_iter().collect())
    }

    pub fn ok(inner: StateValue) -> Self {
        Self::Outcome(Ok(Box::new(inner)))
    }

    pub fn err(error: PersistError) -> Self {
        Self::Outcome(Err(error))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

impl From<Value> for StateValue {
    fn from(value: Value) -> Self {
        Self::Scalar(value)
    }
}

impl From<EntityRef> for StateValue {
    fn from(entity: EntityRef) -> Self {
        Self::Entity(entity)
    }
}

impl From<Vec<StateValue>> for StateValue {
    fn from(items: Vec<StateValue>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, StateValue>> for StateValue {
    fn from(entries: BTreeMap<String, StateValue>) -> Self {
        Self::Map(entries)
    }
}

impl From<Option<StateValue>> for StateValue {
    fn from(value: Option<StateValue>) -> Self {
        value.unwrap_or(StateValue::Absent)
    }
}
