//! Per-conversation branch reconciliation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::git::{PushMode, VersionControl};
use crate::process::ToolOutput;
use crate::workspace::Workspace;

/// Where a branch's existence is looked up before deciding to create it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BranchPolicy {
    /// Check local refs first, then `origin`. A branch that exists only on
    /// the remote is fetched and tracked instead of being recreated.
    #[default]
    Remote,
    /// Check local refs only. On a fresh clone every conversation branch is
    /// treated as new, and the initial push is rejected if the remote
    /// already has history for it.
    LocalOnly,
}

impl FromStr for BranchPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" => Ok(Self::Remote),
            "local" | "local-only" | "local_only" => Ok(Self::LocalOnly),
            other => Err(format!(
                "unknown branch policy '{other}' (expected 'remote' or 'local-only')"
            )),
        }
    }
}

impl fmt::Display for BranchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("remote"),
            Self::LocalOnly => f.write_str("local-only"),
        }
    }
}

/// How [`BranchController::ensure_branch`] obtained the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOrigin {
    /// Newly created from the current HEAD.
    Created,
    /// Already present locally; checked out and fast-forwarded.
    Existing,
    /// Present only on the remote; fetched and checked out with tracking.
    RemoteTracked,
}

/// Ensures a conversation branch is checked out and published.
#[derive(Clone)]
pub struct BranchController {
    vc: Arc<dyn VersionControl>,
    policy: BranchPolicy,
}

impl fmt::Debug for BranchController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchController")
            .field("policy", &self.policy)
            .finish()
    }
}

impl BranchController {
    pub fn new(vc: Arc<dyn VersionControl>, policy: BranchPolicy) -> Self {
        Self { vc, policy }
    }

    pub fn policy(&self) -> BranchPolicy {
        self.policy
    }

    /// Check out `branch`, creating it if needed, and push it with upstream
    /// tracking.
    ///
    /// An existing local branch is fast-forwarded from `origin`; a branch
    /// that cannot be fast-forwarded is a [`Error::BranchSync`].
    pub async fn ensure_branch(&self, ws: &Workspace, branch: &str) -> Result<BranchOrigin> {
        let origin = match self.checkout_existing(ws, branch).await? {
            Some(origin) => origin,
            None => {
                let out = self.vc.create_branch(ws, branch).await?;
                require(out, branch)?;
                BranchOrigin::Created
            }
        };
        tracing::info!(branch, ?origin, policy = %self.policy, "branch ready");

        let out = self.vc.push(ws, branch, PushMode::Normal).await?;
        if !out.success() {
            return Err(Error::Push {
                branch: branch.to_string(),
                output: out.combined(),
            });
        }
        Ok(origin)
    }

    /// Check out `branch` if it already exists (under the current policy)
    /// without creating or pushing anything.
    ///
    /// Returns `None` when the branch does not exist.
    pub async fn checkout_existing(
        &self,
        ws: &Workspace,
        branch: &str,
    ) -> Result<Option<BranchOrigin>> {
        if self.vc.verify_local_branch(ws, branch).await?.success() {
            tracing::debug!(branch, "branch exists locally");
            require(self.vc.checkout(ws, branch).await?, branch)?;
            if self.policy == BranchPolicy::Remote && !self.exists_on_remote(ws, branch).await? {
                // Local-only branch, nothing upstream to reconcile with yet.
                return Ok(Some(BranchOrigin::Existing));
            }
            require(self.vc.pull(ws, branch).await?, branch)?;
            return Ok(Some(BranchOrigin::Existing));
        }

        if self.policy == BranchPolicy::LocalOnly || !self.exists_on_remote(ws, branch).await? {
            return Ok(None);
        }

        tracing::debug!(branch, "branch exists on remote only");
        require(self.vc.fetch_branch(ws, branch).await?, branch)?;
        require(self.vc.track_remote_branch(ws, branch).await?, branch)?;
        Ok(Some(BranchOrigin::RemoteTracked))
    }

    async fn exists_on_remote(&self, ws: &Workspace, branch: &str) -> Result<bool> {
        let out = self.vc.ls_remote_branch(ws, branch).await?;
        if !out.success() {
            return Err(Error::BranchSync {
                branch: branch.to_string(),
                output: out.combined(),
            });
        }
        Ok(!out.stdout.trim().is_empty())
    }
}

fn require(out: ToolOutput, branch: &str) -> Result<()> {
    if out.success() {
        Ok(())
    } else {
        Err(Error::BranchSync {
            branch: branch.to_string(),
            output: out.combined(),
        })
    }
}
