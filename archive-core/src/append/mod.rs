//! The convergent append loop.
//!
//! Several invocations may be appending to the same branch at once (CI runs
//! triggered in parallel). Nothing coordinates them except the remote: a push
//! only succeeds if it fast-forwards the branch, so git's ref update acts as a
//! compare-and-swap. Each attempt therefore:
//!
//! 1. notes the commit it starts from (its base),
//! 2. writes a brand new record into the local SQLite file,
//! 3. stages, commits and pushes that file,
//! 4. on rejection, resets to the base, pulls the newer remote state and
//!    starts over with another fresh record.
//!
//! SQLite files cannot be merged, so a losing attempt is thrown away whole.
//! The store handle is opened and closed inside each attempt; nothing from a
//! failed attempt is carried into the next one.


use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ArchiveConfig;
use crate::error::ArchiveError;
use crate::event::{EventKind, EventRecord};
use crate::store;
use crate::substrate::{CommitId, PushOutcome, SubstrateError, VcsSubstrate};

/// How often, and how patiently, a rejected publish is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Give up with `ConvergenceFailed` after this many attempts.
    /// `None` retries until a push succeeds.
    pub max_attempts: Option<u32>,
    /// Pause between a rejection and the next attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::ZERO,
        }
    }
}

/// Outcome of a successful capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureReceipt {
    /// The record that was published.
    pub record: EventRecord,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Drives one event from capture to publication.
pub struct AppendLoop<'a, S: VcsSubstrate + ?Sized> {
    substrate: &'a S,
    config: &'a ArchiveConfig,
}

impl<'a, S: VcsSubstrate + ?Sized> AppendLoop<'a, S> {
    pub fn new(substrate: &'a S, config: &'a ArchiveConfig) -> Self {
        Self { substrate, config }
    }

    fn branch(&self) -> Option<&str> {
        self.config.branch.as_deref()
    }

    /// Run a substrate call under the configured deadline, if any.
    async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T, ArchiveError>
    where
        F: Future<Output = Result<T, SubstrateError>>,
    {
        let result = match self.config.substrate_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| ArchiveError::Timeout { operation, timeout })?,
            None => call.await,
        };
        Ok(result?)
    }

    /// One-time setup: committer identity, then the target branch if one is
    /// configured (tracking it when the remote has it, otherwise starting it
    /// as an orphan).
    pub async fn prepare(&self) -> Result<(), ArchiveError> {
        let identity = &self.config.identity;
        info!("Configuring git user {} <{}>", identity.name, identity.email);
        self.call(
            "configure_identity",
            self.substrate
                .configure_identity(&identity.name, &identity.email),
        )
        .await?;
        info!("Configured git identity");

        let Some(branch) = self.branch() else {
            return Ok(());
        };
        let remote = self.config.remote.as_str();

        info!("Setting up branch {}", branch);
        let exists = self
            .call("branch_exists", self.substrate.branch_exists(remote, branch))
            .await?;
        if exists {
            self.call(
                "checkout_tracking_branch",
                self.substrate.checkout_tracking_branch(remote, branch),
            )
            .await?;
            info!("Checked out {}/{}", remote, branch);
        } else {
            self.call(
                "create_orphan_branch",
                self.substrate.create_orphan_branch(branch),
            )
            .await?;
            info!("Created orphan branch {}", branch);
        }

        Ok(())
    }

    /// Capture `payload` as a `kind` event and publish it, retrying on
    /// rejected pushes until one succeeds or the retry policy gives up.
    pub async fn append(
        &self,
        kind: EventKind,
        payload: &serde_json::Value,
    ) -> Result<CaptureReceipt, ArchiveError> {
        let store_path = self.config.store_path();
        let remote = self.config.remote.as_str();
        let mut attempts: u32 = 0;

        loop {
            attempts = next_attempt(attempts);

            let base = self.call("head", self.substrate.head()).await?;
            let record = EventRecord::capture(kind, payload);
            info!(
                "Attempt {}: capturing {} event {}",
                attempts, record.kind, record.id
            );

            write_record(&store_path, &record).await?;
            info!("Captured event {}", record.id);

            self.call(
                "stage_path",
                self.substrate.stage_path(&self.config.db_file),
            )
            .await?;
            self.call(
                "create_commit",
                self.substrate.create_commit(&record.commit_message()),
            )
            .await?;

            info!("Attempt {}: publishing to {}", attempts, remote);
            let outcome = self
                .call("push", self.substrate.push(remote, self.branch()))
                .await?;

            match outcome {
                PushOutcome::Published => {
                    info!(
                        "Success! Published event {} after {} attempt(s)",
                        record.id, attempts
                    );
                    return Ok(CaptureReceipt { record, attempts });
                }
                PushOutcome::Rejected { status } => {
                    warn!(
                        "Retrying because of conflicts (push exited with status {})",
                        status
                    );
                    self.discard_attempt(base.as_ref(), &store_path).await?;

                    if let Some(max_attempts) = self.config.retry.max_attempts {
                        if attempts >= max_attempts {
                            return Err(ArchiveError::ConvergenceFailed { attempts });
                        }
                    }

                    self.call("pull", self.substrate.pull(remote, self.branch()))
                        .await?;
                    info!("Pulled latest state from {}", remote);

                    if !self.config.retry.backoff.is_zero() {
                        tokio::time::sleep(self.config.retry.backoff).await;
                    }
                }
            }
        }
    }

    /// Throw away everything the rejected attempt did locally.
    async fn discard_attempt(
        &self,
        base: Option<&CommitId>,
        store_path: &Path,
    ) -> Result<(), ArchiveError> {
        match base {
            Some(commit) => info!("Resetting to {}", commit.short()),
            None => info!("Resetting to an empty branch"),
        }
        self.call("hard_reset", self.substrate.hard_reset(base))
            .await?;

        // With no earlier commit there is no earlier version of the file for
        // the reset to restore, so the file written by this attempt goes too.
        if base.is_none() {
            store::discard(store_path)?;
        }
        Ok(())
    }
}

/// Attempt counter step; an unbounded loop pins at `u32::MAX`.
fn next_attempt(attempts: u32) -> u32 {
    attempts.saturating_add(1)
}

/// Open, insert and close on the blocking pool; the handle never escapes.
async fn write_record(path: &Path, record: &EventRecord) -> Result<(), ArchiveError> {
    let path = path.to_path_buf();
    let record = record.clone();
    tokio::task::spawn_blocking(move || store::capture(&path, &record))
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))??;
    Ok(())
}

/// Archive one trigger event: validate its kind, set up git, then append.
///
/// An unsupported `kind` fails before any storage or version control call.
pub async fn archive_event<S: VcsSubstrate + ?Sized>(
    substrate: &S,
    config: &ArchiveConfig,
    kind: &str,
    payload: &serde_json::Value,
) -> Result<CaptureReceipt, ArchiveError> {
    let kind: EventKind = kind
        .parse()
        .map_err(|_| ArchiveError::UnsupportedEventKind(kind.to_string()))?;

    let append_loop = AppendLoop::new(substrate, config);
    append_loop.prepare().await?;
    append_loop.append(kind, payload).await
}
