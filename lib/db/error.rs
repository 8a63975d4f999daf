use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

/// Normalized persistence failure with a retryable/fatal split.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("retryable store error: {0}")]
    Retryable(String),
    #[error("store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

pub fn map_diesel_error(error: DieselError) -> StoreError {
    match error {
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::SerializationFailure
            | DatabaseErrorKind::ClosedConnection
            | DatabaseErrorKind::UnableToSendCommand => StoreError::Retryable(format!(
                "transient database error ({kind:?}): {}",
                info.message()
            )),
            _ => StoreError::Fatal(format!(
                "database error ({kind:?}): {}",
                info.message()
            )),
        },
        DieselError::RollbackTransaction => {
            StoreError::Retryable("transaction rollback requested by database".to_string())
        }
        other => StoreError::Fatal(format!("diesel error: {other}")),
    }
}

pub fn map_pool_error(error: impl std::fmt::Display) -> StoreError {
    StoreError::Retryable(format!("failed to acquire DB pool connection: {error}"))
}
