mod scope;
mod value;

pub use scope::{SlotCategory, UnitScope};
pub use value::StateValue;
