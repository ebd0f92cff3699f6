use relay_pipeline::ValidationError;
use thiserror::Error;

/// Errors from the topic registry and event store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            other => StoreError::Storage(other.to_string()),
        }
    }
}

impl StoreError {
    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Validation(_) => "VALIDATION_ERROR",
            StoreError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
