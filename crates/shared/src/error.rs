//! Storage error types shared by every repository implementation

use thiserror::Error;

/// Postgres error code for unique constraint violations
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("{entity} with duplicate {field}")]
    UniqueViolation { entity: &'static str, field: String },

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str) -> Self {
        StoreError::NotFound { entity }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }

    /// Map a sqlx error raised while operating on `entity`.
    pub fn from_sqlx(entity: &'static str, err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound { entity },
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                StoreError::UniqueViolation {
                    entity,
                    field: db_err.constraint().unwrap_or("unknown").to_string(),
                }
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::from_sqlx("record", err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
