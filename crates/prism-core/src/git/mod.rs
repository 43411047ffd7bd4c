//! Version-control capability and its `git` subprocess implementation.
//!
//! [`VersionControl`] exposes each git operation the workflow needs as a
//! method returning the raw [`ToolOutput`]; interpreting exit codes and
//! messages is left to [`BranchController`] and [`CommitPipeline`], so the
//! same logic runs against the real CLI and against recording test doubles.

pub mod branch;
pub mod commit;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::process::{ToolOutput, args, run_command};
use crate::workspace::Workspace;

pub use branch::{BranchController, BranchOrigin, BranchPolicy};
pub use commit::{CommitOutcome, CommitPipeline, CommitReceipt};

/// How a branch is pushed to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Rejected by the remote if it has diverged.
    Normal,
    /// Overwrites the remote branch, discarding remote-only commits.
    Force,
}

/// Author/committer identity used for workflow commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: "prism-bot".into(),
            email: "prism-bot@users.noreply.github.com".into(),
        }
    }
}

/// Git operations against a workspace clone.
///
/// Every method returns the subprocess output; an `Err` means the operation
/// could not be run at all (spawn failure, timeout).
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Clone `repo_url` into the (empty) workspace directory.
    async fn clone_repo(&self, ws: &Workspace, repo_url: &str) -> Result<ToolOutput>;

    /// Succeeds iff `refs/heads/<branch>` exists locally.
    async fn verify_local_branch(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput>;

    /// Lists `refs/heads/<branch>` on `origin`; empty stdout means absent.
    async fn ls_remote_branch(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput>;

    /// Fetch `origin/<branch>` into its remote-tracking ref.
    async fn fetch_branch(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput>;

    /// Create `branch` from HEAD and check it out.
    async fn create_branch(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput>;

    /// Create `branch` tracking `origin/<branch>` and check it out.
    async fn track_remote_branch(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput>;

    async fn checkout(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput>;

    /// Fast-forward `branch` from `origin`; never creates a merge commit.
    async fn pull(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput>;

    /// Push `branch` to `origin` with upstream tracking.
    async fn push(&self, ws: &Workspace, branch: &str, mode: PushMode) -> Result<ToolOutput>;

    /// Stage everything in the working tree.
    async fn add_all(&self, ws: &Workspace) -> Result<ToolOutput>;

    async fn commit(&self, ws: &Workspace, message: &str) -> Result<ToolOutput>;

    /// Resolve `rev` to a full commit hash on stdout.
    async fn rev_parse(&self, ws: &Workspace, rev: &str) -> Result<ToolOutput>;

    /// Exit 0 if `ancestor` is an ancestor of `descendant`, 1 if not.
    async fn is_ancestor(
        &self,
        ws: &Workspace,
        ancestor: &str,
        descendant: &str,
    ) -> Result<ToolOutput>;

    /// Move the current branch and working tree to `rev`.
    async fn reset_hard(&self, ws: &Workspace, rev: &str) -> Result<ToolOutput>;
}

// Compile-time assertion: VersionControl must be usable as `dyn VersionControl`.
const _: () = {
    fn _assert_object_safe(_: &dyn VersionControl) {}
};

/// [`VersionControl`] backed by the `git` executable.
#[derive(Clone)]
pub struct GitCli {
    program: String,
    identity: GitIdentity,
    timeout: Option<Duration>,
}

impl fmt::Debug for GitCli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitCli")
            .field("program", &self.program)
            .field("identity", &self.identity)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    /// Use `git` from `$PATH` with the default identity and no deadline.
    pub fn new() -> Self {
        Self {
            program: "git".into(),
            identity: GitIdentity::default(),
            timeout: None,
        }
    }

    pub fn with_identity(mut self, identity: GitIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Kill any git subprocess that runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn env(&self, ws: &Workspace) -> Vec<(String, String)> {
        let mut env = ws.auth().env();
        env.extend([
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
            // Commit no-op detection matches untranslated git output.
            ("LC_ALL".to_string(), "C".to_string()),
            ("LANGUAGE".to_string(), "C".to_string()),
            ("GIT_AUTHOR_NAME".to_string(), self.identity.name.clone()),
            ("GIT_AUTHOR_EMAIL".to_string(), self.identity.email.clone()),
            ("GIT_COMMITTER_NAME".to_string(), self.identity.name.clone()),
            ("GIT_COMMITTER_EMAIL".to_string(), self.identity.email.clone()),
        ]);
        env
    }

    async fn git(&self, ws: &Workspace, argv: Vec<String>) -> Result<ToolOutput> {
        tracing::debug!(args = ?argv, "running git");
        run_command(&self.program, &argv, ws.path(), &self.env(ws), self.timeout).await
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn clone_repo(&self, ws: &Workspace, repo_url: &str) -> Result<ToolOutput> {
        self.git(ws, args(["clone", "--", repo_url, "."])).await
    }

    async fn verify_local_branch(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.git(
            ws,
            args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")]),
        )
        .await
    }

    async fn ls_remote_branch(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.git(
            ws,
            args(["ls-remote", "--heads", "origin", &format!("refs/heads/{branch}")]),
        )
        .await
    }

    async fn fetch_branch(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.git(
            ws,
            args([
                "fetch",
                "origin",
                &format!("+refs/heads/{branch}:refs/remotes/origin/{branch}"),
            ]),
        )
        .await
    }

    async fn create_branch(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.git(ws, args(["checkout", "-b", branch])).await
    }

    async fn track_remote_branch(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.git(
            ws,
            args(["checkout", "-b", branch, "--track", &format!("origin/{branch}")]),
        )
        .await
    }

    async fn checkout(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.git(ws, args(["checkout", branch])).await
    }

    async fn pull(&self, ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.git(ws, args(["pull", "--ff-only", "origin", branch]))
            .await
    }

    async fn push(&self, ws: &Workspace, branch: &str, mode: PushMode) -> Result<ToolOutput> {
        let argv = match mode {
            PushMode::Normal => args(["push", "-u", "origin", branch]),
            PushMode::Force => args(["push", "--force", "-u", "origin", branch]),
        };
        self.git(ws, argv).await
    }

    async fn add_all(&self, ws: &Workspace) -> Result<ToolOutput> {
        self.git(ws, args(["add", "."])).await
    }

    async fn commit(&self, ws: &Workspace, message: &str) -> Result<ToolOutput> {
        self.git(ws, args(["commit", "-m", message])).await
    }

    async fn rev_parse(&self, ws: &Workspace, rev: &str) -> Result<ToolOutput> {
        self.git(
            ws,
            args(["rev-parse", "--verify", &format!("{rev}^{{commit}}")]),
        )
        .await
    }

    async fn is_ancestor(
        &self,
        ws: &Workspace,
        ancestor: &str,
        descendant: &str,
    ) -> Result<ToolOutput> {
        self.git(
            ws,
            args(["merge-base", "--is-ancestor", ancestor, descendant]),
        )
        .await
    }

    async fn reset_hard(&self, ws: &Workspace, rev: &str) -> Result<ToolOutput> {
        self.git(ws, args(["reset", "--hard", rev])).await
    }
}

/// Interpret a `rev-parse` output as a trimmed commit hash.
pub(crate) fn hash_from(output: &ToolOutput) -> Option<String> {
    let hash = output.stdout.trim();
    (output.success() && !hash.is_empty()).then(|| hash.to_string())
}
