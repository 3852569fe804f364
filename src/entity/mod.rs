mod directives;
mod handle;

pub use directives::{DirectiveAction, DirectiveMap, Directives};
pub use handle::{EntityCell, EntityId, EntityKind, EntityRef, EntitySet};
