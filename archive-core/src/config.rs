use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::append::RetryPolicy;

pub const DEFAULT_DB_FILE: &str = "github-archive.sqlite";
pub const DEFAULT_REMOTE: &str = "origin";
pub const DEFAULT_COMMITTER_NAME: &str = "github-archive-action";

/// Committer identity used for archive commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    /// GitHub's noreply address for `name`.
    pub fn noreply(name: &str) -> Self {
        Self {
            name: name.to_string(),
            email: format!("{}@users.noreply.github.com", name),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::noreply(DEFAULT_COMMITTER_NAME)
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Repository checkout holding the log file.
    /// Defaults to the current working directory.
    pub workdir: PathBuf,
    /// Log file path, relative to `workdir`.
    pub db_file: PathBuf,
    /// Dedicated branch to publish to. When unset, the checked-out branch and
    /// its upstream are used.
    pub branch: Option<String>,
    pub remote: String,
    pub identity: Identity,
    pub retry: RetryPolicy,
    /// Deadline for each git call. No deadline when unset.
    pub substrate_timeout: Option<Duration>,
    pub git_binary: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            db_file: PathBuf::from(DEFAULT_DB_FILE),
            branch: None,
            remote: DEFAULT_REMOTE.to_string(),
            identity: Identity::default(),
            retry: RetryPolicy::default(),
            substrate_timeout: None,
            git_binary: PathBuf::from("git"),
        }
    }
}

impl ArchiveConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from `GITHUB_ARCHIVE_*` variables supplied by `lookup`.
    ///
    /// Every variable is optional; empty or whitespace-only values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| non_empty(lookup(key));
        let defaults = Self::default();

        let workdir = var("GITHUB_ARCHIVE_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.workdir);

        let db_file = var("GITHUB_ARCHIVE_DB_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_file);

        let branch = var("GITHUB_ARCHIVE_BRANCH");

        let remote = var("GITHUB_ARCHIVE_REMOTE").unwrap_or(defaults.remote);

        let identity = match var("GITHUB_ARCHIVE_COMMITTER_NAME") {
            Some(name) => {
                let mut identity = Identity::noreply(&name);
                if let Some(email) = var("GITHUB_ARCHIVE_COMMITTER_EMAIL") {
                    identity.email = email;
                }
                identity
            }
            None => match var("GITHUB_ARCHIVE_COMMITTER_EMAIL") {
                Some(email) => Identity {
                    email,
                    ..defaults.identity
                },
                None => defaults.identity,
            },
        };

        let max_attempts = var("GITHUB_ARCHIVE_MAX_ATTEMPTS")
            .map(|v| {
                v.parse::<u32>()
                    .context("GITHUB_ARCHIVE_MAX_ATTEMPTS must be a positive number")
            })
            .transpose()?;
        if max_attempts == Some(0) {
            anyhow::bail!("GITHUB_ARCHIVE_MAX_ATTEMPTS must be at least 1");
        }

        let backoff = var("GITHUB_ARCHIVE_BACKOFF_MS")
            .map(|v| {
                v.parse::<u64>()
                    .context("GITHUB_ARCHIVE_BACKOFF_MS must be a valid number")
            })
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO);

        let substrate_timeout = var("GITHUB_ARCHIVE_GIT_TIMEOUT_SECS")
            .map(|v| {
                v.parse::<u64>()
                    .context("GITHUB_ARCHIVE_GIT_TIMEOUT_SECS must be a valid number")
            })
            .transpose()?
            .map(Duration::from_secs);

        let git_binary = var("GITHUB_ARCHIVE_GIT_BIN")
            .map(PathBuf::from)
            .unwrap_or(defaults.git_binary);

        Ok(ArchiveConfig {
            workdir,
            db_file,
            branch,
            remote,
            identity,
            retry: RetryPolicy {
                max_attempts,
                backoff,
            },
            substrate_timeout,
            git_binary,
        })
    }

    /// Full path of the log file.
    pub fn store_path(&self) -> PathBuf {
        self.workdir.join(&self.db_file)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
