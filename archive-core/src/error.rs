use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;
use crate::substrate::SubstrateError;

/// Errors that end an archive invocation.
///
/// Every variant is fatal. A rejected push is the one expected failure and is
/// handled inside the append loop; it never surfaces here unless the retry
/// policy gives up.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The trigger is not one the archive records.
    #[error("Unsupported event type: {0}")]
    UnsupportedEventKind(String),

    /// The local log file could not be opened, read or written.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// git could not be started, or a command other than push failed.
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    /// A version control call exceeded the configured deadline.
    #[error("{operation} did not complete within {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Every allowed publish attempt was rejected.
    #[error("publish rejected on all {attempts} attempts")]
    ConvergenceFailed { attempts: u32 },

    /// The blocking task writing the log panicked or was cancelled.
    #[error("capture task failed: {0}")]
    Task(String),
}

impl ArchiveError {
    /// Whether git itself could not be invoked.
    pub fn is_substrate_unavailable(&self) -> bool {
        matches!(
            self,
            ArchiveError::Substrate(SubstrateError::Unavailable { .. })
        )
    }

    /// Whether the local log file is unusable.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            ArchiveError::Storage(StoreError::StorageUnavailable { .. })
        )
    }
}
