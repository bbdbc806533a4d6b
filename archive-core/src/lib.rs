pub mod append;
pub mod config;
pub mod error;
pub mod event;
pub mod store;
pub mod substrate;

pub use append::{archive_event, AppendLoop, CaptureReceipt, RetryPolicy};
pub use config::{ArchiveConfig, Identity};
pub use error::ArchiveError;
pub use event::{EventKind, EventRecord, RecordId, UnsupportedKind};
pub use store::{EventStore, StoreError};
pub use substrate::{CommitId, GitCli, PushOutcome, SubstrateError, VcsSubstrate};
