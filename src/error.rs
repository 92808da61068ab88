use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MentorLoopError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    #[error("Atomic failure, nothing was written (safe to retry): {0}")]
    AtomicFailure(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Error: {0}")]
    Error(String),
}

impl MentorLoopError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        MentorLoopError::NotFound { entity, id }
    }

    /// True for errors that leave no trace and can be retried unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, MentorLoopError::AtomicFailure(_))
    }
}
