use std::collections::HashSet;

use tracing::{Level, event};

use crate::core::Result;
use crate::engine::EntityType;
use crate::entity::{DirectiveMap, EntityKind, EntitySet};
use crate::state::{StateValue, UnitScope};

/// Decides whether a value is a persistable entity.
///
/// Built once per unit of work from the storage engine's configured types;
/// membership is a capability resolved at registration, not a live type
/// check. Directive state never affects classification.
#[derive(Debug, Clone)]
pub struct EntityClassifier {
    kinds: HashSet<EntityKind>,
}

impl EntityClassifier {
    pub fn from_types<'a>(types: impl IntoIterator<Item = &'a EntityType>) -> Self {
        Self {
            kinds: types.into_iter().map(EntityType::kind).collect(),
        }
    }

    pub fn is_registered(&self, kind: &EntityKind) -> bool {
        self.kinds.contains(kind)
    }

    /// True iff the value holds an entity whose kind is registered.
    pub fn is_entity(&self, value: &StateValue) -> bool {
        match value {
            StateValue::Entity(entity) => self.is_registered(entity.kind()),
            _ => false,
        }
    }
}

/// Recursively collects every persistable entity reachable from `value` into
/// `out`, deduplicating by instance identity.
///
/// Cases, in priority order:
/// 1. an outcome carrying an error aborts the whole traversal with it;
/// 2. lists and maps are traversed element-wise and unioned;
/// 3. a successful outcome is unwrapped once and recursed into;
/// 4. a registered entity without `skip_persist` joins the set;
/// 5. everything else contributes nothing.
pub fn collect_value(
    classifier: &EntityClassifier,
    directives: &DirectiveMap,
    value: &StateValue,
    out: &mut EntitySet,
) -> Result<()> {
    match value {
        // A failed computation must not silently skip persistence of its
        // siblings, nor be swallowed.
        StateValue::Outcome(Err(error)) => Err(error.clone()),
        StateValue::List(items) => {
            for item in items {
                collect_value(classifier, directives, item, out)?;
            }
            Ok(())
        }
        StateValue::Map(entries) => {
            for item in entries.values() {
                collect_value(classifier, directives, item, out)?;
            }
            Ok(())
        }
        StateValue::Outcome(Ok(inner)) => collect_value(classifier, directives, inner, out),
        StateValue::Entity(entity) if classifier.is_registered(entity.kind()) => {
            if !directives.get(entity)?.skip_persist {
                out.insert(entity.clone());
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Collects over the union of every slot's current value in the scope.
///
/// One set spans all slot categories, so an instance reachable from both a
/// plain slot and a derived slot is persisted exactly once.
pub fn collect_scope(
    classifier: &EntityClassifier,
    directives: &DirectiveMap,
    scope: &UnitScope,
) -> Result<EntitySet> {
    let mut out = EntitySet::new();
    for value in scope.all_current_values()? {
        collect_value(classifier, directives, &value, &mut out)?;
    }
    event!(Level::DEBUG, entities = out.len(), "collected state tree");
    Ok(out)
}
