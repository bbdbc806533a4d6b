//! Races against a real bare repository, driven through `GitCli`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use archive_core::config::DEFAULT_DB_FILE;
use archive_core::{
    archive_event, ArchiveConfig, CaptureReceipt, CommitId, EventRecord, EventStore, GitCli,
    PushOutcome, SubstrateError, VcsSubstrate,
};
use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

fn git(cwd: &Path, args: &[&str]) -> Vec<u8> {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=Archive Test",
            "-c",
            "user.email=archive-test@example.com",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    output.stdout
}

/// A bare remote whose `main` holds one unrelated commit.
struct Remote {
    root: TempDir,
}

impl Remote {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        git(root.path(), &["init", "--quiet", "--bare", "remote.git"]);
        git(
            &root.path().join("remote.git"),
            &["symbolic-ref", "HEAD", "refs/heads/main"],
        );

        let seed = root.path().join("seed");
        std::fs::create_dir(&seed).unwrap();
        git(&seed, &["init", "--quiet"]);
        git(&seed, &["checkout", "--quiet", "-b", "main"]);
        std::fs::write(seed.join("README.md"), "archive test\n").unwrap();
        git(&seed, &["add", "README.md"]);
        git(&seed, &["commit", "--quiet", "-m", "Initial commit"]);
        let url = root.path().join("remote.git");
        git(&seed, &["remote", "add", "origin", url.to_str().unwrap()]);
        git(&seed, &["push", "--quiet", "origin", "main"]);

        Self { root }
    }

    fn bare(&self) -> PathBuf {
        self.root.path().join("remote.git")
    }

    /// A fresh working copy named `name`, on `main`.
    fn clone_as(&self, name: &str) -> PathBuf {
        let bare = self.bare();
        git(
            self.root.path(),
            &["clone", "--quiet", bare.to_str().unwrap(), name],
        );
        self.root.path().join(name)
    }

    fn records(&self, branch: &str) -> Vec<EventRecord> {
        let spec = format!("{}:{}", branch, DEFAULT_DB_FILE);
        let bytes = git(&self.bare(), &["show", &spec]);
        let path = self.root.path().join(format!("{}-snapshot.sqlite", branch));
        std::fs::write(&path, bytes).unwrap();
        EventStore::open(&path).unwrap().records().unwrap()
    }

    fn files(&self, branch: &str) -> Vec<String> {
        let listing = git(&self.bare(), &["ls-tree", "--name-only", branch]);
        String::from_utf8(listing)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn config_for(workdir: &Path, branch: Option<&str>) -> ArchiveConfig {
    ArchiveConfig {
        workdir: workdir.to_path_buf(),
        branch: branch.map(str::to_string),
        ..ArchiveConfig::default()
    }
}

/// Lets a rival invocation publish just before our first push.
struct RivalPublishesFirst<'a> {
    inner: &'a GitCli,
    rival: Mutex<Option<(&'a GitCli, &'a ArchiveConfig)>>,
    rival_receipt: Mutex<Option<CaptureReceipt>>,
}

impl<'a> RivalPublishesFirst<'a> {
    fn new(inner: &'a GitCli, rival: &'a GitCli, rival_config: &'a ArchiveConfig) -> Self {
        Self {
            inner,
            rival: Mutex::new(Some((rival, rival_config))),
            rival_receipt: Mutex::new(None),
        }
    }

    fn rival_receipt(&self) -> CaptureReceipt {
        self.rival_receipt
            .lock()
            .unwrap()
            .clone()
            .expect("Rival should have published")
    }
}

#[async_trait]
impl<'a> VcsSubstrate for RivalPublishesFirst<'a> {
    async fn configure_identity(&self, name: &str, email: &str) -> Result<(), SubstrateError> {
        self.inner.configure_identity(name, email).await
    }

    async fn branch_exists(&self, remote: &str, branch: &str) -> Result<bool, SubstrateError> {
        self.inner.branch_exists(remote, branch).await
    }

    async fn create_orphan_branch(&self, branch: &str) -> Result<(), SubstrateError> {
        self.inner.create_orphan_branch(branch).await
    }

    async fn checkout_tracking_branch(
        &self,
        remote: &str,
        branch: &str,
    ) -> Result<(), SubstrateError> {
        self.inner.checkout_tracking_branch(remote, branch).await
    }

    async fn stage_path(&self, path: &Path) -> Result<(), SubstrateError> {
        self.inner.stage_path(path).await
    }

    async fn create_commit(&self, message: &str) -> Result<(), SubstrateError> {
        self.inner.create_commit(message).await
    }

    async fn push(
        &self,
        remote: &str,
        branch: Option<&str>,
    ) -> Result<PushOutcome, SubstrateError> {
        let rival = self.rival.lock().unwrap().take();
        if let Some((substrate, config)) = rival {
            let payload = json!({"rival": true});
            let receipt = archive_event(substrate, config, "issue_comment", &payload)
                .await
                .unwrap();
            *self.rival_receipt.lock().unwrap() = Some(receipt);
        }
        self.inner.push(remote, branch).await
    }

    async fn pull(&self, remote: &str, branch: Option<&str>) -> Result<(), SubstrateError> {
        self.inner.pull(remote, branch).await
    }

    async fn head(&self) -> Result<Option<CommitId>, SubstrateError> {
        self.inner.head().await
    }

    async fn hard_reset(&self, target: Option<&CommitId>) -> Result<(), SubstrateError> {
        self.inner.hard_reset(target).await
    }
}

fn ids(records: &[EventRecord]) -> Vec<String> {
    let mut ids: Vec<String> = records.iter().map(|r| r.id.0.clone()).collect();
    ids.sort();
    ids
}

fn expected_ids(receipts: &[&CaptureReceipt]) -> Vec<String> {
    let mut ids: Vec<String> = receipts.iter().map(|r| r.record.id.0.clone()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn race_on_invoking_branch_converges() {
    let remote = Remote::new();
    let ours_dir = remote.clone_as("ours");
    let rival_dir = remote.clone_as("rival");
    let ours_config = config_for(&ours_dir, None);
    let rival_config = config_for(&rival_dir, None);
    let ours = GitCli::new("git", &ours_dir);
    let rival = GitCli::new("git", &rival_dir);

    let racing = RivalPublishesFirst::new(&ours, &rival, &rival_config);
    let payload = json!({"action": "opened"});
    let receipt = archive_event(&racing, &ours_config, "issues", &payload)
        .await
        .unwrap();
    let rival_receipt = racing.rival_receipt();

    assert_eq!(receipt.attempts, 2);
    assert_eq!(rival_receipt.attempts, 1);

    // Only the retried record and the rival's made it; the discarded attempt did not.
    let published = remote.records("main");
    assert_eq!(ids(&published), expected_ids(&[&receipt, &rival_receipt]));

    // The working copy ends on exactly what was published.
    let local = EventStore::open(ours_config.store_path()).unwrap();
    assert_eq!(ids(&local.records().unwrap()), ids(&published));
}

#[tokio::test]
async fn race_to_create_orphan_branch_converges() {
    let remote = Remote::new();
    let ours_dir = remote.clone_as("ours");
    let rival_dir = remote.clone_as("rival");
    let ours_config = config_for(&ours_dir, Some("github-meta"));
    let rival_config = config_for(&rival_dir, Some("github-meta"));
    let ours = GitCli::new("git", &ours_dir);
    let rival = GitCli::new("git", &rival_dir);

    // Both sides see no branch and start it as an orphan; the rival publishes
    // first, so our push from an unborn base is rejected.
    let racing = RivalPublishesFirst::new(&ours, &rival, &rival_config);
    let payload = json!({"action": "created"});
    let receipt = archive_event(&racing, &ours_config, "pull_request", &payload)
        .await
        .unwrap();
    let rival_receipt = racing.rival_receipt();

    assert_eq!(receipt.attempts, 2);
    let published = remote.records("github-meta");
    assert_eq!(ids(&published), expected_ids(&[&receipt, &rival_receipt]));
    assert_eq!(remote.files("github-meta"), vec![DEFAULT_DB_FILE.to_string()]);
    assert_eq!(remote.files("main"), vec!["README.md".to_string()]);
}

#[tokio::test]
async fn race_on_existing_dedicated_branch_converges() {
    let remote = Remote::new();

    let first_dir = remote.clone_as("first");
    let first_config = config_for(&first_dir, Some("github-meta"));
    let first = GitCli::new("git", &first_dir);
    let payload = json!({"action": "opened"});
    let first_receipt = archive_event(&first, &first_config, "issues", &payload)
        .await
        .unwrap();
    assert_eq!(first_receipt.attempts, 1);

    let ours_dir = remote.clone_as("ours");
    let rival_dir = remote.clone_as("rival");
    let ours_config = config_for(&ours_dir, Some("github-meta"));
    let rival_config = config_for(&rival_dir, Some("github-meta"));
    let ours = GitCli::new("git", &ours_dir);
    let rival = GitCli::new("git", &rival_dir);

    let racing = RivalPublishesFirst::new(&ours, &rival, &rival_config);
    let receipt = archive_event(&racing, &ours_config, "pull_request_review", &payload)
        .await
        .unwrap();
    let rival_receipt = racing.rival_receipt();

    assert_eq!(receipt.attempts, 2);
    let published = remote.records("github-meta");
    assert_eq!(
        ids(&published),
        expected_ids(&[&first_receipt, &receipt, &rival_receipt])
    );

    let local = EventStore::open(ours_config.store_path()).unwrap();
    assert_eq!(local.count().unwrap(), 3);
}
