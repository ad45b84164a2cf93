use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    NotFound(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Turn a unique-key conflict into `ConstraintViolation`; anything else
    /// stays a database error.
    pub fn from_insert(err: sqlx::Error, context: impl Into<String>) -> Self {
        if is_unique_violation(&err) {
            StoreError::ConstraintViolation(context.into())
        } else {
            StoreError::Database(err)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        // SQLite reports primary-key conflicts with the same message prefix.
        return db_err.is_unique_violation() || db_err.message().contains("UNIQUE constraint failed");
    }
    false
}
