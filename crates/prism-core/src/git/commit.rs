//! Stage, commit, and push a workspace; rewrite branch history.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::git::{PushMode, VersionControl, hash_from};
use crate::process::ToolOutput;
use crate::workspace::Workspace;

/// Whether the commit step recorded a new commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The working tree matched HEAD; no commit was created.
    NothingToCommit,
}

/// Result of [`CommitPipeline::commit_and_push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// HEAD after the commit step, trimmed.
    pub hash: String,
    pub outcome: CommitOutcome,
}

/// Messages git prints when there is nothing to record.
const NOTHING_TO_COMMIT: [&str; 2] = ["nothing to commit", "nothing added to commit"];

fn is_nothing_to_commit(out: &ToolOutput) -> bool {
    let text = out.combined();
    NOTHING_TO_COMMIT.iter().any(|needle| text.contains(needle))
}

#[derive(Clone)]
pub struct CommitPipeline {
    vc: Arc<dyn VersionControl>,
}

impl fmt::Debug for CommitPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitPipeline").finish_non_exhaustive()
    }
}

impl CommitPipeline {
    pub fn new(vc: Arc<dyn VersionControl>) -> Self {
        Self { vc }
    }

    /// Stage everything, commit with `message`, resolve HEAD, and push.
    ///
    /// An empty change set is not an error: the returned hash is then the
    /// unchanged HEAD. The push still runs so the remote matches.
    ///
    /// `PushMode::Force` discards any commits that exist only on the remote.
    pub async fn commit_and_push(
        &self,
        ws: &Workspace,
        branch: &str,
        message: &str,
        mode: PushMode,
    ) -> Result<CommitReceipt> {
        let out = self.vc.add_all(ws).await?;
        if !out.success() {
            return Err(Error::Git {
                command: "add".into(),
                output: out.combined(),
            });
        }

        let out = self.vc.commit(ws, message).await?;
        let outcome = if out.success() {
            CommitOutcome::Committed
        } else if is_nothing_to_commit(&out) {
            tracing::info!(branch, "nothing to commit, working tree clean");
            CommitOutcome::NothingToCommit
        } else {
            return Err(Error::Commit {
                output: out.combined(),
            });
        };

        let hash = self.head(ws).await?;
        self.push(ws, branch, mode).await?;

        tracing::info!(branch, commit = %hash, ?outcome, ?mode, "pushed branch");
        Ok(CommitReceipt { hash, outcome })
    }

    /// Remove `commit` and every later commit from `branch`, then
    /// force-push the rewritten branch.
    ///
    /// The branch must already be checked out. Returns the new HEAD.
    pub async fn drop_commit(&self, ws: &Workspace, branch: &str, commit: &str) -> Result<String> {
        let target = hash_from(&self.vc.rev_parse(ws, commit).await?)
            .ok_or_else(|| Error::NotFound(format!("commit {commit}")))?;

        let out = self.vc.is_ancestor(ws, &target, "HEAD").await?;
        match out.exit_code {
            Some(0) => {}
            Some(1) => {
                return Err(Error::NotFound(format!(
                    "commit {commit} on branch {branch}"
                )));
            }
            _ => {
                return Err(Error::Git {
                    command: "merge-base".into(),
                    output: out.combined(),
                });
            }
        }

        let parent = hash_from(&self.vc.rev_parse(ws, &format!("{target}^")).await?)
            .ok_or_else(|| {
                Error::InvalidInput(format!("commit {commit} is the root commit"))
            })?;

        let out = self.vc.reset_hard(ws, &parent).await?;
        if !out.success() {
            return Err(Error::Git {
                command: "reset".into(),
                output: out.combined(),
            });
        }
        self.push(ws, branch, PushMode::Force).await?;

        tracing::info!(branch, removed = %target, head = %parent, "dropped commit");
        Ok(parent)
    }

    /// Current HEAD hash.
    pub async fn head(&self, ws: &Workspace) -> Result<String> {
        let out = self.vc.rev_parse(ws, "HEAD").await?;
        hash_from(&out).ok_or_else(|| Error::Git {
            command: "rev-parse HEAD".into(),
            output: out.combined(),
        })
    }

    async fn push(&self, ws: &Workspace, branch: &str, mode: PushMode) -> Result<()> {
        let out = self.vc.push(ws, branch, mode).await?;
        if out.success() {
            Ok(())
        } else {
            Err(Error::Push {
                branch: branch.to_string(),
                output: out.combined(),
            })
        }
    }
}
