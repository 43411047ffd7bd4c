//! One-shot CLI handlers that drive the workflow directly, without the
//! HTTP server.
//!
//! Implements:
//! - `prism plan [conversation]`        -- upload local files and plan (default branch when omitted)
//! - `prism chat <conversation> <msg>`  -- let the model edit the branch, then plan
//! - `prism files <conversation>`       -- list the branch's `.tf` files
//! - `prism pr <conversation>`          -- open a pull request
//! - `prism delete-commit <conv> <sha>` -- drop a commit and its successors

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;

use prism_core::remote::NewPullRequest;
use prism_core::{ChangeRequest, ChangeSource, ConversationWorkflow, FileChange, RepoTarget};

/// Repository and tenant coordinates shared by every conversation command.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Repository clone URL
    #[arg(long, env = "PRISM_REPO_URL")]
    pub repo_url: String,
    /// Token used for git over HTTPS and the GitHub API
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: String,
    /// Tenant id; selects the state bucket
    #[arg(long, env = "PRISM_USER_ID", default_value = "")]
    pub user_id: String,
    /// Vault project id
    #[arg(long, env = "PRISM_PROJECT_ID", default_value = "")]
    pub project_id: String,
}

impl From<TargetArgs> for RepoTarget {
    fn from(args: TargetArgs) -> Self {
        Self {
            repo_url: args.repo_url,
            auth_token: args.token,
            user_id: args.user_id,
            project_id: args.project_id,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize output")?
    );
    Ok(())
}

/// Repository-relative `/`-separated name for a file given on the command line.
fn relative_name(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => bail!(
                "{} must be a relative path inside the repository",
                path.display()
            ),
        }
    }
    if parts.is_empty() {
        bail!("{} is not a file path", path.display());
    }
    Ok(parts.join("/"))
}

/// Collect the change set from `--dir` (every `.tf` file) and explicit paths.
pub fn collect_files(dir: Option<&Path>, files: &[PathBuf]) -> Result<Vec<FileChange>> {
    let mut changes = match dir {
        Some(dir) => prism_core::materialize::list_tf_files(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?,
        None => Vec::new(),
    };
    for path in files {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        changes.push(FileChange::new(relative_name(path)?, content));
    }
    Ok(changes)
}

pub async fn run_plan(
    workflow: &ConversationWorkflow,
    conversation: Option<String>,
    target: TargetArgs,
    changes: Vec<FileChange>,
    message: Option<String>,
) -> Result<()> {
    let Some(conversation) = conversation else {
        if !changes.is_empty() {
            bail!("files can only be uploaded to a conversation branch");
        }
        let plan = workflow.plan_default_branch(&target.into()).await?;
        return print_json(&serde_json::json!({ "plan": plan }));
    };
    if changes.is_empty() {
        bail!("no files to upload; pass paths or --dir");
    }
    let mut request = ChangeRequest::new(conversation, target.into(), ChangeSource::Files(changes));
    if let Some(message) = message {
        request = request.with_commit_message(message);
    }
    let result = workflow.run(request).await?;
    print_json(&result)
}

pub async fn run_chat(
    workflow: &ConversationWorkflow,
    conversation: String,
    target: TargetArgs,
    message: String,
) -> Result<()> {
    let request = ChangeRequest::new(conversation, target.into(), ChangeSource::Prompt(message));
    let result = workflow.run(request).await?;
    print_json(&result)
}

pub async fn run_files(
    workflow: &ConversationWorkflow,
    conversation: String,
    target: TargetArgs,
) -> Result<()> {
    let files = workflow
        .conversation_files(&conversation, &target.into())
        .await?;
    print_json(&files)
}

pub async fn run_pr(
    workflow: &ConversationWorkflow,
    conversation: String,
    target: TargetArgs,
    base: Option<String>,
    title: Option<String>,
    body: Option<String>,
) -> Result<()> {
    let request = NewPullRequest::for_conversation(
        &conversation,
        base.as_deref(),
        title.as_deref(),
        body.as_deref(),
    );
    let pr = workflow
        .open_pull_request(&conversation, &target.into(), request)
        .await?;
    println!("Pull request #{} opened: {}", pr.number, pr.url);
    Ok(())
}

pub async fn run_delete_commit(
    workflow: &ConversationWorkflow,
    conversation: String,
    commit: String,
    target: TargetArgs,
) -> Result<()> {
    let head = workflow
        .delete_commit(&conversation, &commit, &target.into())
        .await?;
    println!("Branch {conversation} reset to {head}.");
    Ok(())
}
