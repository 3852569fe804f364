mod error;
mod value;

pub use error::{PersistError, Result};
pub use value::Value;
