//! Version-control capability used to publish the event log.
//!
//! The append loop never talks to git directly; it drives a [`VcsSubstrate`].
//! Production code uses [`GitCli`], which shells out to the `git` binary.
//! Tests use the fakes in [`fake`], which return scripted outcomes or simulate
//! a shared remote in memory.

pub mod fake;
mod git;

pub use git::{CommandRunner, GitCli, TokioCommandRunner};

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// Newtype for a commit identifier (a full SHA for the git implementation).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitId(pub String);

impl CommitId {
    /// Returns a truncated id for display (first 7 characters).
    pub fn short(&self) -> &str {
        &self.0[..7.min(self.0.len())]
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Result of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The remote ref now includes the local commit.
    Published,
    /// The remote refused the update (it has moved since our base was read).
    Rejected { status: i32 },
}

/// Errors raised by a substrate.
#[derive(Debug, Error)]
pub enum SubstrateError {
    /// The tool itself could not be started.
    #[error("version control tool unavailable ({program}): {message}")]
    Unavailable { program: String, message: String },

    /// A command other than push exited unsuccessfully.
    #[error("`{command}` exited with status {status}: {detail}")]
    CommandFailed {
        command: String,
        status: i32,
        detail: String,
    },
}

/// Operations the append loop needs from version control.
///
/// Paths are relative to the substrate's working directory. A `branch` of
/// `None` means "the checked-out branch and its configured upstream".
#[async_trait]
pub trait VcsSubstrate: Send + Sync {
    /// Set the author/committer identity for commits made by this process.
    async fn configure_identity(&self, name: &str, email: &str) -> Result<(), SubstrateError>;

    /// Whether `branch` exists on `remote`.
    async fn branch_exists(&self, remote: &str, branch: &str) -> Result<bool, SubstrateError>;

    /// Switch to a new branch with no history and an empty index.
    async fn create_orphan_branch(&self, branch: &str) -> Result<(), SubstrateError>;

    /// Check out `branch` tracking `remote`'s copy of it.
    async fn checkout_tracking_branch(
        &self,
        remote: &str,
        branch: &str,
    ) -> Result<(), SubstrateError>;

    /// Stage `path` for the next commit.
    async fn stage_path(&self, path: &Path) -> Result<(), SubstrateError>;

    /// Commit the staged changes.
    async fn create_commit(&self, message: &str) -> Result<(), SubstrateError>;

    /// Publish the local branch. A refusal is an outcome, not an error.
    async fn push(&self, remote: &str, branch: Option<&str>)
        -> Result<PushOutcome, SubstrateError>;

    /// Bring the local branch up to date with the remote.
    async fn pull(&self, remote: &str, branch: Option<&str>) -> Result<(), SubstrateError>;

    /// The checked-out commit, or `None` on a branch with no commits yet.
    async fn head(&self) -> Result<Option<CommitId>, SubstrateError>;

    /// Discard every local change made since `target`, index and working tree
    /// included. `None` returns the branch to having no commits.
    async fn hard_reset(&self, target: Option<&CommitId>) -> Result<(), SubstrateError>;
}
