//! Conversation workflow: the composition root of the core.
//!
//! A plan run is a straight line that stops at the first failure:
//!
//! ```text
//! acquire -> ensure branch -> write files -> commit/push -> bucket
//!         -> restore state -> fetch secrets -> plan -> persist state
//! ```
//!
//! The workspace is released after every run, successful or not. Side
//! effects are not rolled back: if planning fails after the push, the
//! branch keeps the pushed commit and the caller sees the planning error.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::Instrument;

use crate::error::{Error, RemoteServiceError, Result, Service};
use crate::git::{BranchController, BranchPolicy, CommitPipeline, PushMode, VersionControl};
use crate::materialize;
use crate::model::{ConversationFiles, FileChange, PlanResult, RepoTarget, validate_conversation_id};
use crate::planner::{PlanExecutor, PlanningTool};
use crate::remote::{GitHost, ModelClient, NewPullRequest, PullRequest, RepoSlug};
use crate::secrets::{SecretInjector, SecretScope, VaultClient};
use crate::state::{Bucket, DEFAULT_STATE_PATH, ObjectStore, StateSynchronizer};
use crate::workspace::{Workspace, WorkspaceManager};

/// Tunables that are not per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// Directory under which workspaces are created.
    pub workspace_dir: PathBuf,
    pub branch_policy: BranchPolicy,
    /// State file location relative to the workspace root.
    pub state_path: PathBuf,
    /// Vault environment the secrets are read from, e.g. `dev`.
    pub secret_environment: String,
    pub secret_path: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            workspace_dir: std::env::temp_dir(),
            branch_policy: BranchPolicy::default(),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            secret_environment: "dev".into(),
            secret_path: "/".into(),
        }
    }
}

/// Capability implementations the workflow drives.
#[derive(Clone)]
pub struct Collaborators {
    pub version_control: Arc<dyn VersionControl>,
    pub planning_tool: Arc<dyn PlanningTool>,
    pub object_store: Arc<dyn ObjectStore>,
    pub vault: Arc<dyn VaultClient>,
    /// Needed only for prompt-driven changes.
    pub model: Option<Arc<dyn ModelClient>>,
    /// Needed only for pull requests.
    pub git_host: Option<Arc<dyn GitHost>>,
}

/// Where a run's file changes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSource {
    /// Files supplied by the caller. Pushed with force: uploads replace
    /// the branch tip.
    Files(Vec<FileChange>),
    /// A user message turned into files by the model. Pushed normally.
    Prompt(String),
}

#[derive(Debug, Clone)]
pub struct ChangeRequest {
    pub conversation_id: String,
    pub target: RepoTarget,
    pub source: ChangeSource,
    /// Overrides the derived commit message.
    pub commit_message: Option<String>,
}

impl ChangeRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        target: RepoTarget,
        source: ChangeSource,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            target,
            source,
            commit_message: None,
        }
    }

    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = Some(message.into());
        self
    }

    fn commit_message(&self) -> String {
        let custom = self
            .commit_message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty());
        if let Some(message) = custom {
            return message.to_string();
        }
        match &self.source {
            ChangeSource::Files(_) => format!(
                "Update terraform config for conversation {}",
                self.conversation_id
            ),
            ChangeSource::Prompt(message) => format!("AI: {}", message.trim()),
        }
    }

    fn push_mode(&self) -> PushMode {
        match self.source {
            ChangeSource::Files(_) => PushMode::Force,
            ChangeSource::Prompt(_) => PushMode::Normal,
        }
    }

    fn validate(&self) -> Result<()> {
        validate_conversation_id(&self.conversation_id)?;
        self.target.validate_for_plan()?;
        match &self.source {
            ChangeSource::Prompt(message) if message.trim().is_empty() => {
                Err(Error::InvalidInput("message is required".into()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct ConversationWorkflow {
    config: WorkflowConfig,
    workspaces: WorkspaceManager,
    branches: BranchController,
    commits: CommitPipeline,
    state: StateSynchronizer,
    secrets: SecretInjector,
    planner: PlanExecutor,
    model: Option<Arc<dyn ModelClient>>,
    git_host: Option<Arc<dyn GitHost>>,
}

impl fmt::Debug for ConversationWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationWorkflow")
            .field("config", &self.config)
            .field("model", &self.model.is_some())
            .field("git_host", &self.git_host.is_some())
            .finish_non_exhaustive()
    }
}

fn run_span(operation: &'static str, conversation: &str) -> tracing::Span {
    tracing::info_span!(
        "workflow",
        operation,
        run_id = %uuid::Uuid::new_v4(),
        conversation = %conversation,
    )
}

impl ConversationWorkflow {
    pub fn new(config: WorkflowConfig, collaborators: Collaborators) -> Self {
        let vc = collaborators.version_control;
        Self {
            workspaces: WorkspaceManager::new(config.workspace_dir.clone(), Arc::clone(&vc)),
            branches: BranchController::new(Arc::clone(&vc), config.branch_policy),
            commits: CommitPipeline::new(vc),
            state: StateSynchronizer::new(collaborators.object_store)
                .with_state_path(config.state_path.clone()),
            secrets: SecretInjector::new(collaborators.vault),
            planner: PlanExecutor::new(collaborators.planning_tool),
            model: collaborators.model,
            git_host: collaborators.git_host,
            config,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Apply a change set to the conversation branch and plan the result.
    pub async fn run(&self, request: ChangeRequest) -> Result<PlanResult> {
        request.validate()?;
        let span = run_span("run", &request.conversation_id);
        async {
            let ws = self.acquire(&request.target).await?;
            let result = self.run_in(&ws, &request).await;
            self.workspaces.release(ws);
            match &result {
                Ok(plan) => tracing::info!(commit = %plan.commit_hash, "workflow complete"),
                Err(e) => tracing::warn!(error = %e, kind = ?e.kind(), "workflow failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_in(&self, ws: &Workspace, request: &ChangeRequest) -> Result<PlanResult> {
        let branch = request.conversation_id.as_str();
        self.branches.ensure_branch(ws, branch).await?;

        let changes = match &request.source {
            ChangeSource::Files(files) => files.clone(),
            ChangeSource::Prompt(message) => self.generate_changes(ws, message).await?,
        };
        materialize::write(ws.path(), &changes)?;

        let receipt = self
            .commits
            .commit_and_push(ws, branch, &request.commit_message(), request.push_mode())
            .await?;

        let plan = self
            .plan_in(ws, &request.target)
            .await
            .inspect_err(|_| {
                tracing::warn!(commit = %receipt.hash, "commit was pushed before the failure and remains on the branch");
            })?;

        Ok(PlanResult {
            plan,
            modified_files: changes,
            branch: branch.to_string(),
            commit_hash: receipt.hash,
        })
    }

    async fn generate_changes(&self, ws: &Workspace, message: &str) -> Result<Vec<FileChange>> {
        let model = self.model.as_ref().ok_or_else(|| {
            RemoteServiceError::new(Service::Model, None, "no model client configured")
        })?;
        let current = materialize::list_tf_files(ws.path())?;
        tracing::info!(current_files = current.len(), "requesting file modifications");
        let files = model.generate_file_modifications(message, &current).await?;
        tracing::info!(files = files.len(), "model proposed file modifications");
        Ok(files)
    }

    /// Bucket, restore, secrets, plan, persist.
    async fn plan_in(&self, ws: &Workspace, target: &RepoTarget) -> Result<serde_json::Value> {
        let bucket = self.state.get_or_create_bucket(&target.user_id).await?;
        self.state.restore(&bucket, ws.path()).await?;

        let scope = SecretScope::new(
            self.config.secret_environment.clone(),
            target.project_id.clone(),
            self.config.secret_path.clone(),
        );
        let secrets = self.secrets.inject(&scope).await?;

        let plan = self.planner.plan(ws.path(), &secrets).await?;
        self.state.persist(&bucket, ws.path()).await?;
        Ok(plan)
    }

    /// Plan the repository's default branch without touching any branch.
    pub async fn plan_default_branch(&self, target: &RepoTarget) -> Result<serde_json::Value> {
        target.validate_for_plan()?;
        async {
            let ws = self.acquire(target).await?;
            let result = self.plan_in(&ws, target).await;
            self.workspaces.release(ws);
            result
        }
        .instrument(run_span("plan_default_branch", ""))
        .await
    }

    /// The `.tf` files currently on the conversation branch. Creates and
    /// pushes the branch if it does not exist yet.
    pub async fn conversation_files(
        &self,
        conversation_id: &str,
        target: &RepoTarget,
    ) -> Result<ConversationFiles> {
        validate_conversation_id(conversation_id)?;
        target.validate_repo()?;
        async {
            let ws = self.acquire(target).await?;
            let result = async {
                self.branches.ensure_branch(&ws, conversation_id).await?;
                materialize::list_tf_files(ws.path())
            }
            .await;
            self.workspaces.release(ws);
            result.map(ConversationFiles::from)
        }
        .instrument(run_span("conversation_files", conversation_id))
        .await
    }

    /// Drop `commit` and everything after it from the conversation branch
    /// and force-push. Returns the branch's new head.
    pub async fn delete_commit(
        &self,
        conversation_id: &str,
        commit: &str,
        target: &RepoTarget,
    ) -> Result<String> {
        validate_conversation_id(conversation_id)?;
        target.validate_repo()?;
        let commit = commit.trim();
        if commit.len() < 4 || commit.len() > 64 || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidInput(format!(
                "{commit:?} is not a commit hash"
            )));
        }
        async {
            let ws = self.acquire(target).await?;
            let result = async {
                if self
                    .branches
                    .checkout_existing(&ws, conversation_id)
                    .await?
                    .is_none()
                {
                    return Err(Error::NotFound(format!("branch {conversation_id}")));
                }
                self.commits.drop_commit(&ws, conversation_id, commit).await
            }
            .await;
            self.workspaces.release(ws);
            result
        }
        .instrument(run_span("delete_commit", conversation_id))
        .await
    }

    /// Open a pull request from the conversation branch.
    pub async fn open_pull_request(
        &self,
        conversation_id: &str,
        target: &RepoTarget,
        request: NewPullRequest,
    ) -> Result<PullRequest> {
        validate_conversation_id(conversation_id)?;
        target.validate_repo()?;
        let host = self.git_host.as_ref().ok_or_else(|| {
            RemoteServiceError::new(Service::GitHost, None, "no git host client configured")
        })?;
        let slug = RepoSlug::parse_github_url(&target.repo_url)?;
        async {
            if !host
                .branch_exists(&slug, &request.head, &target.auth_token)
                .await?
            {
                return Err(Error::NotFound(format!(
                    "branch {} in {slug}",
                    request.head
                )));
            }
            let pr = host
                .create_pull_request(&slug, &request, &target.auth_token)
                .await?;
            tracing::info!(repo = %slug, number = pr.number, url = %pr.url, "opened pull request");
            Ok(pr)
        }
        .instrument(run_span("open_pull_request", conversation_id))
        .await
    }

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        Ok(self.state.store().list_buckets().await?)
    }

    async fn acquire(&self, target: &RepoTarget) -> Result<Workspace> {
        self.workspaces
            .acquire(&target.repo_url, &target.auth_token)
            .await
    }
}
