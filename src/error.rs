use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Closed,
    Disabled,
    QuotaExceeded,
    Io,
}

impl std::fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageErrorKind::Closed => write!(f, "closed"),
            StorageErrorKind::Disabled => write!(f, "disabled"),
            StorageErrorKind::QuotaExceeded => write!(f, "quota exceeded"),
            StorageErrorKind::Io => write!(f, "io"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorErrorCode {
    ConcurrencyDenied,
    TransactionClosed,
    UnsupportedOperation,
    OutOfRetentionWindow,
    StorageClosed,
    StorageDisabled,
    StorageQuotaExceeded,
    StorageIo,
    ActorAborted,
    InvalidArgument,
    InvalidBookmark,
    InvalidConfig,
    SyncTransactionDepthExceeded,
}

impl ActorErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorErrorCode::ConcurrencyDenied => "concurrency_denied",
            ActorErrorCode::TransactionClosed => "transaction_closed",
            ActorErrorCode::UnsupportedOperation => "unsupported_operation",
            ActorErrorCode::OutOfRetentionWindow => "out_of_retention_window",
            ActorErrorCode::StorageClosed => "storage_closed",
            ActorErrorCode::StorageDisabled => "storage_disabled",
            ActorErrorCode::StorageQuotaExceeded => "storage_quota_exceeded",
            ActorErrorCode::StorageIo => "storage_io",
            ActorErrorCode::ActorAborted => "actor_aborted",
            ActorErrorCode::InvalidArgument => "invalid_argument",
            ActorErrorCode::InvalidBookmark => "invalid_bookmark",
            ActorErrorCode::InvalidConfig => "invalid_config",
            ActorErrorCode::SyncTransactionDepthExceeded => "sync_transaction_depth_exceeded",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActorError {
    #[error("{op} denied: input gate is held by another exclusive section")]
    ConcurrencyDenied { op: &'static str },
    #[error("{op} called on a transaction that is already committed or rolled back")]
    TransactionClosed { op: &'static str },
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("timestamp {requested_ms} predates the retention horizon {horizon_ms}")]
    OutOfRetentionWindow { requested_ms: i64, horizon_ms: i64 },
    #[error("storage {kind}: {message}")]
    Storage {
        kind: StorageErrorKind,
        message: String,
    },
    #[error("actor aborted: {reason}")]
    ActorAborted { reason: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid bookmark: {0}")]
    InvalidBookmark(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("synchronous transactions nested deeper than {depth}")]
    SyncTransactionDepthExceeded { depth: u32 },
}

impl ActorError {
    pub fn aborted(reason: impl Into<String>) -> Self {
        ActorError::ActorAborted {
            reason: reason.into(),
        }
    }

    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        ActorError::Storage {
            kind,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ActorErrorCode {
        match self {
            ActorError::ConcurrencyDenied { .. } => ActorErrorCode::ConcurrencyDenied,
            ActorError::TransactionClosed { .. } => ActorErrorCode::TransactionClosed,
            ActorError::UnsupportedOperation(_) => ActorErrorCode::UnsupportedOperation,
            ActorError::OutOfRetentionWindow { .. } => ActorErrorCode::OutOfRetentionWindow,
            ActorError::Storage { kind, .. } => match kind {
                StorageErrorKind::Closed => ActorErrorCode::StorageClosed,
                StorageErrorKind::Disabled => ActorErrorCode::StorageDisabled,
                StorageErrorKind::QuotaExceeded => ActorErrorCode::StorageQuotaExceeded,
                StorageErrorKind::Io => ActorErrorCode::StorageIo,
            },
            ActorError::ActorAborted { .. } => ActorErrorCode::ActorAborted,
            ActorError::InvalidArgument(_) => ActorErrorCode::InvalidArgument,
            ActorError::InvalidBookmark(_) => ActorErrorCode::InvalidBookmark,
            ActorError::InvalidConfig { .. } => ActorErrorCode::InvalidConfig,
            ActorError::SyncTransactionDepthExceeded { .. } => {
                ActorErrorCode::SyncTransactionDepthExceeded
            }
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ActorError::ActorAborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::{ActorError, ActorErrorCode, StorageErrorKind};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(
            ActorErrorCode::ConcurrencyDenied.as_str(),
            "concurrency_denied"
        );
        assert_eq!(
            ActorErrorCode::OutOfRetentionWindow.as_str(),
            "out_of_retention_window"
        );
        assert_eq!(ActorErrorCode::ActorAborted.as_str(), "actor_aborted");
    }

    #[test]
    fn storage_kind_maps_to_distinct_codes() {
        let err = ActorError::storage(StorageErrorKind::QuotaExceeded, "128 MiB limit");
        assert_eq!(err.code(), ActorErrorCode::StorageQuotaExceeded);
        assert_eq!(err.code_str(), "storage_quota_exceeded");
        assert_eq!(err.to_string(), "storage quota exceeded: 128 MiB limit");
    }

    #[test]
    fn aborted_errors_are_recognised() {
        let err = ActorError::aborted("broken");
        assert!(err.is_aborted());
        assert!(!ActorError::UnsupportedOperation("x".into()).is_aborted());
    }
}
