use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistError {
    #[error("No active unit of work")]
    NoActiveUnit,

    #[error("Entity type '{0}' is not configured on the storage engine")]
    UnknownEntityType(String),

    #[error("Missing primary key field '{0}' on entity of type '{1}'")]
    MissingPrimaryKey(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, PersistError>;

impl<T> From<std::sync::PoisonError<T>> for PersistError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
