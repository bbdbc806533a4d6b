//! `VcsSubstrate` backed by the `git` command-line tool.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tracing::debug;

use super::{CommitId, PushOutcome, SubstrateError, VcsSubstrate};

/// Process-spawning seam, so command shapes can be tested without git.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[OsString], cwd: &Path) -> io::Result<Output>;
}

/// Runs commands with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &Path, args: &[OsString], cwd: &Path) -> io::Result<Output> {
        tokio::process::Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            // A deadline around the call drops the future; take the child with it.
            .kill_on_drop(true)
            .output()
            .await
    }
}

/// git CLI substrate rooted at a working directory.
pub struct GitCli<R: CommandRunner = TokioCommandRunner> {
    runner: R,
    binary: PathBuf,
    workdir: PathBuf,
}

impl GitCli<TokioCommandRunner> {
    pub fn new(binary: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self::with_runner(TokioCommandRunner, binary, workdir)
    }
}

impl<R: CommandRunner> GitCli<R> {
    pub fn with_runner(runner: R, binary: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Run git and return its output whatever the exit status.
    async fn run_raw(&self, args: &[OsString]) -> Result<Output, SubstrateError> {
        debug!("Running git {}", render_args(args));
        self.runner
            .run(&self.binary, args, &self.workdir)
            .await
            .map_err(|e| SubstrateError::Unavailable {
                program: self.binary.display().to_string(),
                message: e.to_string(),
            })
    }

    /// Run git, treating any non-zero exit as an error.
    async fn run(&self, args: &[OsString]) -> Result<Output, SubstrateError> {
        let output = self.run_raw(args).await?;
        if output.status.success() {
            return Ok(output);
        }
        Err(command_failed(args, &output))
    }
}

fn os_args<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    args.into_iter().map(Into::into).collect()
}

fn render_args(args: &[OsString]) -> String {
    args.iter()
        .map(|arg| arg.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn exit_code(output: &Output) -> i32 {
    // Killed by a signal: no code to report.
    output.status.code().unwrap_or(-1)
}

fn command_failed(args: &[OsString], output: &Output) -> SubstrateError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    let detail = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        format!("exit status {}", output.status)
    };

    SubstrateError::CommandFailed {
        command: format!("git {}", render_args(args)),
        status: exit_code(output),
        detail,
    }
}

#[async_trait]
impl<R: CommandRunner> VcsSubstrate for GitCli<R> {
    async fn configure_identity(&self, name: &str, email: &str) -> Result<(), SubstrateError> {
        self.run(&os_args(["config", "user.name", name])).await?;
        self.run(&os_args(["config", "user.email", email])).await?;
        Ok(())
    }

    async fn branch_exists(&self, remote: &str, branch: &str) -> Result<bool, SubstrateError> {
        let args = os_args(["ls-remote", "--exit-code", "--heads", remote, branch]);
        let output = self.run_raw(&args).await?;
        // --exit-code: 0 = found, 2 = no matching refs.
        match output.status.code() {
            Some(0) => Ok(true),
            Some(2) => Ok(false),
            _ => Err(command_failed(&args, &output)),
        }
    }

    async fn create_orphan_branch(&self, branch: &str) -> Result<(), SubstrateError> {
        self.run(&os_args(["checkout", "--orphan", branch])).await?;
        // The orphan starts with the previous branch's index; only the log
        // file should ever be committed here.
        self.run(&os_args([
            "rm",
            "-r",
            "--cached",
            "--quiet",
            "--ignore-unmatch",
            ".",
        ]))
        .await?;
        Ok(())
    }

    async fn checkout_tracking_branch(
        &self,
        remote: &str,
        branch: &str,
    ) -> Result<(), SubstrateError> {
        let tracking = format!("{}/{}", remote, branch);
        let refspec = format!("+refs/heads/{}:refs/remotes/{}", branch, tracking);
        self.run(&os_args(["fetch", remote, refspec.as_str()]))
            .await?;
        self.run(&os_args([
            "checkout",
            "-B",
            branch,
            "--track",
            tracking.as_str(),
        ]))
        .await?;
        Ok(())
    }

    async fn stage_path(&self, path: &Path) -> Result<(), SubstrateError> {
        let mut args = os_args(["add", "--"]);
        args.push(path.as_os_str().to_owned());
        self.run(&args).await?;
        Ok(())
    }

    async fn create_commit(&self, message: &str) -> Result<(), SubstrateError> {
        self.run(&os_args(["commit", "--quiet", "-m", message]))
            .await?;
        Ok(())
    }

    async fn push(
        &self,
        remote: &str,
        branch: Option<&str>,
    ) -> Result<PushOutcome, SubstrateError> {
        let args = match branch {
            Some(branch) => os_args(["push", "--set-upstream", remote, branch]),
            None => os_args(["push"]),
        };
        let output = self.run_raw(&args).await?;
        if output.status.success() {
            return Ok(PushOutcome::Published);
        }

        let status = exit_code(&output);
        debug!(
            "git push exited with status {}: {}",
            status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Ok(PushOutcome::Rejected { status })
    }

    async fn pull(&self, remote: &str, branch: Option<&str>) -> Result<(), SubstrateError> {
        // After a reset to the attempt's base the local branch is strictly
        // behind the remote, so the pull must fast-forward.
        let args = match branch {
            Some(branch) => os_args(["pull", "--ff-only", "--quiet", remote, branch]),
            None => os_args(["pull", "--ff-only", "--quiet"]),
        };
        self.run(&args).await?;
        Ok(())
    }

    async fn head(&self) -> Result<Option<CommitId>, SubstrateError> {
        let args = os_args(["rev-parse", "--verify", "--quiet", "HEAD"]);
        let output = self.run_raw(&args).await?;
        match output.status.code() {
            Some(0) => {
                let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok(Some(CommitId(sha)))
            }
            // Unborn branch.
            Some(1) => Ok(None),
            _ => Err(command_failed(&args, &output)),
        }
    }

    async fn hard_reset(&self, target: Option<&CommitId>) -> Result<(), SubstrateError> {
        match target {
            Some(commit) => {
                self.run(&os_args(["reset", "--hard", "--quiet", commit.0.as_str()]))
                    .await?;
            }
            None => {
                self.run(&os_args(["update-ref", "-d", "HEAD"])).await?;
                self.run(&os_args(["read-tree", "--empty"])).await?;
            }
        }
        Ok(())
    }
}
