use anyhow::{anyhow, Context, Result};
use archive_core::{archive_event, ArchiveConfig, EventKind, EventStore, GitCli};
use clap::{Parser, Subcommand};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// github-archive: append CI trigger events to a SQLite log kept in git
#[derive(Parser, Debug)]
#[command(name = "github-archive")]
#[command(about = "Archive GitHub events into a git-tracked SQLite log", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture the triggering event and publish it
    Capture(CaptureArgs),
    /// Print the records in the local log as JSON
    List(ListArgs),
}

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Repository checkout holding the log (defaults to GITHUB_ARCHIVE_WORKDIR, then ".")
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Log file path relative to the checkout (defaults to GITHUB_ARCHIVE_DB_FILE)
    #[arg(long)]
    db_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct CaptureArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Event kind (if not provided, will use GITHUB_EVENT_NAME environment variable)
    #[arg(long)]
    kind: Option<String>,

    /// JSON payload file (if not provided, will use GITHUB_EVENT_PATH environment variable)
    #[arg(long)]
    payload_file: Option<PathBuf>,

    /// Dedicated branch to publish to; created as an orphan if the remote lacks it
    #[arg(long)]
    branch: Option<String>,

    /// Remote to publish to
    #[arg(long)]
    remote: Option<String>,

    /// Give up after this many rejected publishes (retry forever if unset)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: Option<u32>,

    /// Pause between attempts, in milliseconds
    #[arg(long)]
    backoff_ms: Option<u64>,

    /// Deadline for each git command, in seconds
    #[arg(long)]
    git_timeout_secs: Option<u64>,

    /// git executable to run
    #[arg(long)]
    git_bin: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ListArgs {
    #[command(flatten)]
    store: StoreArgs,
}

impl StoreArgs {
    fn apply(&self, config: &mut ArchiveConfig) {
        if let Some(workdir) = &self.workdir {
            config.workdir = workdir.clone();
        }
        if let Some(db_file) = &self.db_file {
            config.db_file = db_file.clone();
        }
    }
}

impl CaptureArgs {
    fn apply(&self, config: &mut ArchiveConfig) {
        self.store.apply(config);
        if let Some(branch) = &self.branch {
            config.branch = Some(branch.clone());
        }
        if let Some(remote) = &self.remote {
            config.remote = remote.clone();
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = Some(max_attempts);
        }
        if let Some(backoff_ms) = self.backoff_ms {
            config.retry.backoff = Duration::from_millis(backoff_ms);
        }
        if let Some(secs) = self.git_timeout_secs {
            config.substrate_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(git_bin) = &self.git_bin {
            config.git_binary = git_bin.clone();
        }
    }
}

/// Work out the event kind and payload from flags, falling back to the
/// variables GitHub Actions sets for the triggering event.
///
/// The kind is validated before the payload file is touched.
fn resolve_event<F>(
    kind: Option<&str>,
    payload_file: Option<&Path>,
    lookup: F,
) -> Result<(EventKind, serde_json::Value)>
where
    F: Fn(&str) -> Option<String>,
{
    let kind = match kind {
        Some(kind) => kind.to_string(),
        None => lookup("GITHUB_EVENT_NAME")
            .ok_or_else(|| anyhow!("No event kind: pass --kind or set GITHUB_EVENT_NAME"))?,
    };
    let kind: EventKind = kind.parse()?;

    let payload_file = match payload_file {
        Some(path) => path.to_path_buf(),
        None => lookup("GITHUB_EVENT_PATH")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("No event payload: pass --payload-file or set GITHUB_EVENT_PATH"))?,
    };

    let raw = fs::read_to_string(&payload_file)
        .with_context(|| format!("Failed to read event payload {}", payload_file.display()))?;
    let payload = serde_json::from_str(&raw)
        .with_context(|| format!("Event payload {} is not valid JSON", payload_file.display()))?;

    Ok((kind, payload))
}

async fn run_capture(args: CaptureArgs) -> Result<()> {
    let mut config = ArchiveConfig::from_env()?;
    args.apply(&mut config);

    let (kind, payload) = resolve_event(
        args.kind.as_deref(),
        args.payload_file.as_deref(),
        |key| env::var(key).ok(),
    )?;

    info!(
        "Archiving {} event into {} ({})",
        kind,
        config.store_path().display(),
        config.branch.as_deref().unwrap_or("current branch")
    );

    let git = GitCli::new(config.git_binary.clone(), config.workdir.clone());
    let receipt = archive_event(&git, &config, kind.as_str(), &payload).await?;

    println!(
        "Captured event {} (id: {}) after {} attempt(s)",
        receipt.record.kind, receipt.record.id, receipt.attempts
    );
    Ok(())
}

fn run_list(args: ListArgs) -> Result<()> {
    let mut config = ArchiveConfig::from_env()?;
    args.store.apply(&mut config);

    let path = config.store_path();
    if !path.exists() {
        return Err(anyhow!("No event log at {}", path.display()));
    }

    let store = EventStore::open(&path)?;
    let records = store.records()?;
    store.close()?;

    let json = serde_json::to_string_pretty(&records).context("Failed to serialize records")?;
    println!("{}", json);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Capture(args) => run_capture(args).await,
        Commands::List(args) => run_list(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Workflow failed! {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_capture_flags_override_config() {
        let cli = Cli::try_parse_from([
            "github-archive",
            "capture",
            "--workdir",
            "/repo",
            "--branch",
            "github-meta",
            "--max-attempts",
            "4",
            "--backoff-ms",
            "100",
            "--git-timeout-secs",
            "60",
        ])
        .unwrap();
        let Commands::Capture(args) = cli.command else {
            panic!("expected capture");
        };

        let mut config = ArchiveConfig::default();
        args.apply(&mut config);
        assert_eq!(config.workdir, PathBuf::from("/repo"));
        assert_eq!(config.db_file, PathBuf::from("github-archive.sqlite"));
        assert_eq!(config.branch.as_deref(), Some("github-meta"));
        assert_eq!(config.retry.max_attempts, Some(4));
        assert_eq!(config.retry.backoff, Duration::from_millis(100));
        assert_eq!(config.substrate_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.remote, "origin");
    }

    #[test]
    fn test_zero_max_attempts_is_rejected() {
        let result = Cli::try_parse_from(["github-archive", "capture", "--max-attempts", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_event_from_github_environment() {
        let dir = tempfile::tempdir().unwrap();
        let payload_path = dir.path().join("event.json");
        fs::write(&payload_path, r#"{"action": "opened", "issue": {"number": 3}}"#).unwrap();

        let lookup = lookup_from(&[
            ("GITHUB_EVENT_NAME", "issues"),
            ("GITHUB_EVENT_PATH", payload_path.to_str().unwrap()),
        ]);
        let (kind, payload) = resolve_event(None, None, lookup).unwrap();

        assert_eq!(kind, EventKind::Issues);
        assert_eq!(payload["issue"]["number"], 3);
    }

    #[test]
    fn test_flags_take_precedence_over_environment() {
        let dir = tempfile::tempdir().unwrap();
        let payload_path = dir.path().join("payload.json");
        fs::write(&payload_path, "{}").unwrap();

        let lookup = lookup_from(&[
            ("GITHUB_EVENT_NAME", "issues"),
            ("GITHUB_EVENT_PATH", "/nonexistent/event.json"),
        ]);
        let (kind, payload) =
            resolve_event(Some("pull_request"), Some(&payload_path), lookup).unwrap();

        assert_eq!(kind, EventKind::PullRequest);
        assert_eq!(payload, serde_json::json!({}));
    }

    #[test]
    fn test_missing_event_inputs_are_errors() {
        let err = resolve_event(None, None, lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("GITHUB_EVENT_NAME"));

        let err = resolve_event(Some("issues"), None, lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("GITHUB_EVENT_PATH"));
    }

    #[test]
    fn test_unsupported_kind_is_reported_before_payload() {
        let lookup = lookup_from(&[
            ("GITHUB_EVENT_NAME", "push"),
            ("GITHUB_EVENT_PATH", "/nonexistent/event.json"),
        ]);
        let err = resolve_event(None, None, lookup).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported event type: push");
    }

    #[test]
    fn test_invalid_payload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let payload_path = dir.path().join("event.json");
        fs::write(&payload_path, "not json").unwrap();

        let err = resolve_event(Some("issues"), Some(&payload_path), lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }
}
