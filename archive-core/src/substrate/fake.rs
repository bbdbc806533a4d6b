//! In-process substrates for exercising the append loop without git.
//!
//! - [`ScriptedSubstrate`] records every call and answers pushes from a
//!   script. It never touches the filesystem.
//! - [`SimulatedRemote`] / [`SimulatedClone`] model a shared remote and any
//!   number of working copies of it. Commits snapshot real files from each
//!   clone's working directory, pushes are compare-and-swap on the remote
//!   branch tip, and resets/pulls rewrite the working directory, so the loop
//!   can be run against real SQLite files racing for one branch.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Barrier;

use super::{CommitId, PushOutcome, SubstrateError, VcsSubstrate};

/// Branch used when the caller passes `None`.
pub const DEFAULT_BRANCH: &str = "main";

/// One recorded substrate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ConfigureIdentity { name: String, email: String },
    BranchExists { remote: String, branch: String },
    CreateOrphanBranch { branch: String },
    CheckoutTrackingBranch { remote: String, branch: String },
    StagePath { path: PathBuf },
    CreateCommit { message: String },
    Push { remote: String, branch: Option<String> },
    Pull { remote: String, branch: Option<String> },
    Head,
    HardReset { target: Option<CommitId> },
}

/// Operation names accepted by [`ScriptedSubstrate::failing_on`] and
/// [`ScriptedSubstrate::hanging_on`].
fn call_name(call: &Call) -> &'static str {
    match call {
        Call::ConfigureIdentity { .. } => "configure_identity",
        Call::BranchExists { .. } => "branch_exists",
        Call::CreateOrphanBranch { .. } => "create_orphan_branch",
        Call::CheckoutTrackingBranch { .. } => "checkout_tracking_branch",
        Call::StagePath { .. } => "stage_path",
        Call::CreateCommit { .. } => "create_commit",
        Call::Push { .. } => "push",
        Call::Pull { .. } => "pull",
        Call::Head => "head",
        Call::HardReset { .. } => "hard_reset",
    }
}

/// Substrate that records calls and replays a fixed sequence of push outcomes.
///
/// Once the script is exhausted every push is `Published`.
#[derive(Default)]
pub struct ScriptedSubstrate {
    calls: Mutex<Vec<Call>>,
    pushes: Mutex<VecDeque<PushOutcome>>,
    head: Option<CommitId>,
    remote_has_branch: bool,
    fail_on: Option<&'static str>,
    hang_on: Option<&'static str>,
}

impl ScriptedSubstrate {
    pub fn new() -> Self {
        Self {
            head: Some(CommitId::from("base")),
            ..Self::default()
        }
    }

    /// Answer successive pushes with `outcomes`.
    pub fn with_pushes(outcomes: impl IntoIterator<Item = PushOutcome>) -> Self {
        let substrate = Self::new();
        substrate.pushes.lock().unwrap().extend(outcomes);
        substrate
    }

    /// Answer `n` pushes with a rejection, then publish.
    pub fn rejecting(n: usize) -> Self {
        Self::with_pushes(std::iter::repeat(PushOutcome::Rejected { status: 1 }).take(n))
    }

    /// Make `branch_exists` report true.
    pub fn with_remote_branch(mut self) -> Self {
        self.remote_has_branch = true;
        self
    }

    /// Make `operation` fail as if git could not be started.
    pub fn failing_on(mut self, operation: &'static str) -> Self {
        self.fail_on = Some(operation);
        self
    }

    /// Make `operation` never complete.
    pub fn hanging_on(mut self, operation: &'static str) -> Self {
        self.hang_on = Some(operation);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, call: Call) -> Result<(), SubstrateError> {
        let name = call_name(&call);
        self.calls.lock().unwrap().push(call);
        if self.hang_on == Some(name) {
            std::future::pending::<()>().await;
        }
        if self.fail_on == Some(name) {
            return Err(SubstrateError::Unavailable {
                program: "git".to_string(),
                message: format!("{} failed to start", name),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VcsSubstrate for ScriptedSubstrate {
    async fn configure_identity(&self, name: &str, email: &str) -> Result<(), SubstrateError> {
        self.record(Call::ConfigureIdentity {
            name: name.to_string(),
            email: email.to_string(),
        })
        .await
    }

    async fn branch_exists(&self, remote: &str, branch: &str) -> Result<bool, SubstrateError> {
        self.record(Call::BranchExists {
            remote: remote.to_string(),
            branch: branch.to_string(),
        })
        .await?;
        Ok(self.remote_has_branch)
    }

    async fn create_orphan_branch(&self, branch: &str) -> Result<(), SubstrateError> {
        self.record(Call::CreateOrphanBranch {
            branch: branch.to_string(),
        })
        .await
    }

    async fn checkout_tracking_branch(
        &self,
        remote: &str,
        branch: &str,
    ) -> Result<(), SubstrateError> {
        self.record(Call::CheckoutTrackingBranch {
            remote: remote.to_string(),
            branch: branch.to_string(),
        })
        .await
    }

    async fn stage_path(&self, path: &Path) -> Result<(), SubstrateError> {
        self.record(Call::StagePath {
            path: path.to_path_buf(),
        })
        .await
    }

    async fn create_commit(&self, message: &str) -> Result<(), SubstrateError> {
        self.record(Call::CreateCommit {
            message: message.to_string(),
        })
        .await
    }

    async fn push(
        &self,
        remote: &str,
        branch: Option<&str>,
    ) -> Result<PushOutcome, SubstrateError> {
        self.record(Call::Push {
            remote: remote.to_string(),
            branch: branch.map(str::to_string),
        })
        .await?;
        Ok(self
            .pushes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PushOutcome::Published))
    }

    async fn pull(&self, remote: &str, branch: Option<&str>) -> Result<(), SubstrateError> {
        self.record(Call::Pull {
            remote: remote.to_string(),
            branch: branch.map(str::to_string),
        })
        .await
    }

    async fn head(&self) -> Result<Option<CommitId>, SubstrateError> {
        self.record(Call::Head).await?;
        Ok(self.head.clone())
    }

    async fn hard_reset(&self, target: Option<&CommitId>) -> Result<(), SubstrateError> {
        self.record(Call::HardReset {
            target: target.cloned(),
        })
        .await
    }
}

type Tree = BTreeMap<PathBuf, Vec<u8>>;

#[derive(Debug, Clone)]
struct Snapshot {
    parent: Option<CommitId>,
    tree: Tree,
}

#[derive(Default)]
struct RemoteState {
    /// Every commit created by any clone. Shared the way git objects are.
    commits: HashMap<CommitId, Snapshot>,
    branches: HashMap<String, CommitId>,
    next_commit: u64,
    accepted_pushes: u64,
    rejected_pushes: u64,
}

impl RemoteState {
    fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> bool {
        let mut current = Some(descendant.clone());
        while let Some(id) = current {
            if &id == ancestor {
                return true;
            }
            current = self.commits.get(&id).and_then(|c| c.parent.clone());
        }
        false
    }

    fn tree(&self, commit: Option<&CommitId>) -> Tree {
        commit
            .and_then(|id| self.commits.get(id))
            .map(|c| c.tree.clone())
            .unwrap_or_default()
    }
}

/// Shared in-memory remote. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct SimulatedRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl SimulatedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// A working copy of this remote rooted at `workdir`, on the default branch.
    pub fn clone_into(&self, workdir: impl Into<PathBuf>) -> SimulatedClone {
        SimulatedClone {
            remote: self.clone(),
            workdir: workdir.into(),
            local: Mutex::new(LocalState::default()),
            push_gate: Mutex::new(None),
        }
    }

    /// Contents of `path` at the tip of `branch`, if the branch and file exist.
    pub fn file_at_tip(&self, branch: &str, path: &Path) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let tip = state.branches.get(branch)?;
        state.commits.get(tip)?.tree.get(path).cloned()
    }

    /// Number of commits reachable from the tip of `branch`.
    pub fn history_len(&self, branch: &str) -> usize {
        let state = self.state.lock().unwrap();
        let mut len = 0;
        let mut current = state.branches.get(branch).cloned();
        while let Some(id) = current {
            len += 1;
            current = state.commits.get(&id).and_then(|c| c.parent.clone());
        }
        len
    }

    pub fn accepted_pushes(&self) -> u64 {
        self.state.lock().unwrap().accepted_pushes
    }

    pub fn rejected_pushes(&self) -> u64 {
        self.state.lock().unwrap().rejected_pushes
    }
}

#[derive(Default)]
struct LocalState {
    branch: Option<String>,
    head: Option<CommitId>,
    index: Tree,
    commit_messages: Vec<String>,
    identity: Option<(String, String)>,
}

/// Working copy of a [`SimulatedRemote`].
pub struct SimulatedClone {
    remote: SimulatedRemote,
    workdir: PathBuf,
    local: Mutex<LocalState>,
    push_gate: Mutex<Option<Arc<Barrier>>>,
}

impl SimulatedClone {
    /// Hold the first push until every party to `gate` has reached it.
    ///
    /// Used to line up concurrent invocations so they all commit on the same
    /// base before any of them publishes.
    pub fn with_push_gate(self, gate: Arc<Barrier>) -> Self {
        *self.push_gate.lock().unwrap() = Some(gate);
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Messages of every commit this clone has created, including discarded ones.
    pub fn commit_messages(&self) -> Vec<String> {
        self.local.lock().unwrap().commit_messages.clone()
    }

    pub fn identity(&self) -> Option<(String, String)> {
        self.local.lock().unwrap().identity.clone()
    }

    fn branch_name(&self, branch: Option<&str>) -> String {
        branch
            .map(str::to_string)
            .or_else(|| self.local.lock().unwrap().branch.clone())
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string())
    }

    /// Make the working directory and index match `tree`, removing tracked
    /// files the tree does not contain.
    fn checkout_tree(&self, local: &mut LocalState, tree: Tree) -> Result<(), SubstrateError> {
        for path in local.index.keys() {
            if !tree.contains_key(path) {
                let full = self.workdir.join(path);
                if full.exists() {
                    std::fs::remove_file(&full).map_err(|e| io_failure("checkout", e))?;
                }
            }
        }
        for (path, bytes) in &tree {
            std::fs::write(self.workdir.join(path), bytes).map_err(|e| io_failure("checkout", e))?;
        }
        local.index = tree;
        Ok(())
    }
}

fn io_failure(command: &str, error: std::io::Error) -> SubstrateError {
    SubstrateError::CommandFailed {
        command: command.to_string(),
        status: 128,
        detail: error.to_string(),
    }
}

#[async_trait]
impl VcsSubstrate for SimulatedClone {
    async fn configure_identity(&self, name: &str, email: &str) -> Result<(), SubstrateError> {
        self.local.lock().unwrap().identity = Some((name.to_string(), email.to_string()));
        Ok(())
    }

    async fn branch_exists(&self, _remote: &str, branch: &str) -> Result<bool, SubstrateError> {
        Ok(self
            .remote
            .state
            .lock()
            .unwrap()
            .branches
            .contains_key(branch))
    }

    async fn create_orphan_branch(&self, branch: &str) -> Result<(), SubstrateError> {
        let mut local = self.local.lock().unwrap();
        local.branch = Some(branch.to_string());
        local.head = None;
        local.index.clear();
        Ok(())
    }

    async fn checkout_tracking_branch(
        &self,
        _remote: &str,
        branch: &str,
    ) -> Result<(), SubstrateError> {
        let (tip, tree) = {
            let remote = self.remote.state.lock().unwrap();
            let tip = remote.branches.get(branch).cloned().ok_or_else(|| {
                SubstrateError::CommandFailed {
                    command: format!("checkout {}", branch),
                    status: 128,
                    detail: format!("remote branch {} not found", branch),
                }
            })?;
            let tree = remote.tree(Some(&tip));
            (tip, tree)
        };
        let mut local = self.local.lock().unwrap();
        local.branch = Some(branch.to_string());
        local.head = Some(tip);
        self.checkout_tree(&mut local, tree)
    }

    async fn stage_path(&self, path: &Path) -> Result<(), SubstrateError> {
        let full = self.workdir.join(path);
        let mut local = self.local.lock().unwrap();
        match std::fs::read(&full) {
            Ok(bytes) => {
                local.index.insert(path.to_path_buf(), bytes);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                local.index.remove(path);
            }
            Err(e) => return Err(io_failure("add", e)),
        }
        Ok(())
    }

    async fn create_commit(&self, message: &str) -> Result<(), SubstrateError> {
        let mut local = self.local.lock().unwrap();
        let mut remote = self.remote.state.lock().unwrap();
        remote.next_commit += 1;
        let id = CommitId(format!("{:040x}", remote.next_commit));
        remote.commits.insert(
            id.clone(),
            Snapshot {
                parent: local.head.clone(),
                tree: local.index.clone(),
            },
        );
        local.head = Some(id);
        local.commit_messages.push(message.to_string());
        Ok(())
    }

    async fn push(
        &self,
        _remote: &str,
        branch: Option<&str>,
    ) -> Result<PushOutcome, SubstrateError> {
        let gate = self.push_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.wait().await;
        }

        let branch = self.branch_name(branch);
        let head = self.local.lock().unwrap().head.clone();
        let Some(head) = head else {
            return Err(SubstrateError::CommandFailed {
                command: "push".to_string(),
                status: 1,
                detail: "nothing to push".to_string(),
            });
        };

        // Compare-and-swap on the branch tip: only a fast-forward is accepted.
        let mut remote = self.remote.state.lock().unwrap();
        let fast_forward = match remote.branches.get(&branch) {
            None => true,
            Some(tip) => remote.is_ancestor(tip, &head),
        };
        if fast_forward {
            remote.branches.insert(branch.clone(), head);
            remote.accepted_pushes += 1;
            drop(remote);
            self.local.lock().unwrap().branch = Some(branch);
            Ok(PushOutcome::Published)
        } else {
            remote.rejected_pushes += 1;
            Ok(PushOutcome::Rejected { status: 1 })
        }
    }

    async fn pull(&self, _remote: &str, branch: Option<&str>) -> Result<(), SubstrateError> {
        let branch = self.branch_name(branch);
        let mut local = self.local.lock().unwrap();
        let (tip, tree) = {
            let remote = self.remote.state.lock().unwrap();
            let Some(tip) = remote.branches.get(&branch).cloned() else {
                return Ok(());
            };
            let fast_forward = match &local.head {
                None => true,
                Some(head) => remote.is_ancestor(head, &tip),
            };
            if !fast_forward {
                return Err(SubstrateError::CommandFailed {
                    command: "pull --ff-only".to_string(),
                    status: 128,
                    detail: "Not possible to fast-forward, aborting.".to_string(),
                });
            }
            let tree = remote.tree(Some(&tip));
            (tip, tree)
        };
        local.head = Some(tip);
        self.checkout_tree(&mut local, tree)
    }

    async fn head(&self) -> Result<Option<CommitId>, SubstrateError> {
        Ok(self.local.lock().unwrap().head.clone())
    }

    async fn hard_reset(&self, target: Option<&CommitId>) -> Result<(), SubstrateError> {
        let mut local = self.local.lock().unwrap();
        match target {
            Some(commit) => {
                let tree = self.remote.state.lock().unwrap().tree(Some(commit));
                local.head = Some(commit.clone());
                self.checkout_tree(&mut local, tree)
            }
            None => {
                // Mirrors `update-ref -d HEAD` + `read-tree --empty`: the
                // working tree is left alone.
                local.head = None;
                local.index.clear();
                Ok(())
            }
        }
    }
}
