use crate::structure::StructureId;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorCode {
    SessionAlreadyFailed,
    SessionDisposed,
    SessionAlreadyDisposed,
    ConcurrencyConflict,
    NotFoundForUpdate,
    IdentityMismatch,
    UnsupportedByStore,
    UnsupportedConcurrencyToken,
    Serialization,
    Validation,
    InvalidConfig,
    MissingId,
    UniqueViolation,
    StructureSetNotFound,
    LockTimeout,
    Transaction,
}

impl StoreErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreErrorCode::SessionAlreadyFailed => "session_already_failed",
            StoreErrorCode::SessionDisposed => "session_disposed",
            StoreErrorCode::SessionAlreadyDisposed => "session_already_disposed",
            StoreErrorCode::ConcurrencyConflict => "concurrency_conflict",
            StoreErrorCode::NotFoundForUpdate => "not_found_for_update",
            StoreErrorCode::IdentityMismatch => "identity_mismatch",
            StoreErrorCode::UnsupportedByStore => "unsupported_by_store",
            StoreErrorCode::UnsupportedConcurrencyToken => "unsupported_concurrency_token",
            StoreErrorCode::Serialization => "serialization",
            StoreErrorCode::Validation => "validation",
            StoreErrorCode::InvalidConfig => "invalid_config",
            StoreErrorCode::MissingId => "missing_id",
            StoreErrorCode::UniqueViolation => "unique_violation",
            StoreErrorCode::StructureSetNotFound => "structure_set_not_found",
            StoreErrorCode::LockTimeout => "lock_timeout",
            StoreErrorCode::Transaction => "transaction",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {session_id} has already failed")]
    SessionAlreadyFailed { session_id: Uuid },
    #[error("session {session_id} has been disposed")]
    SessionDisposed { session_id: Uuid },
    #[error("session {session_id} is already disposed")]
    SessionAlreadyDisposed { session_id: Uuid },
    #[error("concurrency conflict on '{structure}' with id {id}")]
    ConcurrencyConflict { structure: String, id: StructureId },
    #[error("no item exists for update in '{structure}' with id {id}")]
    NotFoundForUpdate { structure: String, id: StructureId },
    #[error("modifier changed the identity of a '{structure}' item from {before} to {after}")]
    IdentityMismatch {
        structure: String,
        before: StructureId,
        after: String,
    },
    #[error("operation '{operation}' is not supported for '{structure}'")]
    UnsupportedByStore {
        structure: String,
        operation: &'static str,
    },
    #[error(
        "concurrency token member '{member}' on '{structure}' holds an unsupported value: {found}"
    )]
    UnsupportedConcurrencyToken {
        structure: String,
        member: String,
        found: String,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("item of '{structure}' has no value for id member '{member}'")]
    MissingId { structure: String, member: String },
    #[error("unique constraint violation on '{structure}.{member}' for value {value}")]
    UniqueViolation {
        structure: String,
        member: String,
        value: String,
    },
    #[error("structure set '{0}' does not exist")]
    StructureSetNotFound(String),
    #[error("timed out waiting for row lock on '{structure}' id {id}")]
    LockTimeout { structure: String, id: StructureId },
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl StoreError {
    pub fn code(&self) -> StoreErrorCode {
        match self {
            StoreError::SessionAlreadyFailed { .. } => StoreErrorCode::SessionAlreadyFailed,
            StoreError::SessionDisposed { .. } => StoreErrorCode::SessionDisposed,
            StoreError::SessionAlreadyDisposed { .. } => StoreErrorCode::SessionAlreadyDisposed,
            StoreError::ConcurrencyConflict { .. } => StoreErrorCode::ConcurrencyConflict,
            StoreError::NotFoundForUpdate { .. } => StoreErrorCode::NotFoundForUpdate,
            StoreError::IdentityMismatch { .. } => StoreErrorCode::IdentityMismatch,
            StoreError::UnsupportedByStore { .. } => StoreErrorCode::UnsupportedByStore,
            StoreError::UnsupportedConcurrencyToken { .. } => {
                StoreErrorCode::UnsupportedConcurrencyToken
            }
            StoreError::Serialization(_) => StoreErrorCode::Serialization,
            StoreError::Validation(_) => StoreErrorCode::Validation,
            StoreError::InvalidConfig { .. } => StoreErrorCode::InvalidConfig,
            StoreError::MissingId { .. } => StoreErrorCode::MissingId,
            StoreError::UniqueViolation { .. } => StoreErrorCode::UniqueViolation,
            StoreError::StructureSetNotFound(_) => StoreErrorCode::StructureSetNotFound,
            StoreError::LockTimeout { .. } => StoreErrorCode::LockTimeout,
            StoreError::Transaction(_) => StoreErrorCode::Transaction,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Errors a caller can act on by re-reading and retrying. Nothing in this
    /// crate retries on its own.
    pub fn is_caller_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. }
                | StoreError::NotFoundForUpdate { .. }
                | StoreError::LockTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
