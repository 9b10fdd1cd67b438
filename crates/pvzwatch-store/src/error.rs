use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task already exists: {id}")]
    TaskExists { id: Uuid },

    #[error("Invalid stored value: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
