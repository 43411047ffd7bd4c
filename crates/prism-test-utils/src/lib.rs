//! Shared test utilities for prism integration tests.
//!
//! Provides a local bare git remote to clone from, plus in-process doubles
//! for every collaborator the workflow drives. The doubles record what they
//! were asked to do so tests can assert on ordering and arguments.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use prism_core::error::{RemoteServiceError, Result, Service};
use prism_core::git::{PushMode, VersionControl};
use prism_core::model::{FileChange, RepoTarget, SecretSet};
use prism_core::planner::PlanningTool;
use prism_core::process::ToolOutput;
use prism_core::remote::{GitHost, ModelClient, NewPullRequest, PullRequest, RepoSlug};
use prism_core::secrets::{SecretListing, SecretScope, VaultClient};
use prism_core::state::{Bucket, ObjectStore};
use prism_core::workspace::Workspace;

// ---------------------------------------------------------------------------
// Git fixture
// ---------------------------------------------------------------------------

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Fixture", "-c", "user.email=fixture@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A bare repository acting as `origin`, seeded with one commit on `main`,
/// plus a base directory for workspaces.
pub struct GitFixture {
    dir: TempDir,
}

impl GitFixture {
    /// Create the remote with `README.md` and `main.tf` on `main`.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create fixture dir");
        let remote = dir.path().join("remote.git");
        std::fs::create_dir(&remote).unwrap();
        git(&remote, &["init", "--bare", "--quiet"]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        let fixture = Self { dir };
        fixture.push_commit(
            "main",
            &[("README.md", "# infra\n"), ("main.tf", "# root module\n")],
            "initial commit",
        );
        std::fs::create_dir(fixture.workspace_dir()).unwrap();
        fixture
    }

    pub fn remote_path(&self) -> PathBuf {
        self.dir.path().join("remote.git")
    }

    /// URL accepted by `git clone`.
    pub fn remote_url(&self) -> String {
        self.remote_path().to_string_lossy().into_owned()
    }

    /// Directory to create workspaces under.
    pub fn workspace_dir(&self) -> PathBuf {
        self.dir.path().join("workspaces")
    }

    /// Request coordinates pointing at this remote.
    pub fn target(&self) -> RepoTarget {
        RepoTarget {
            repo_url: self.remote_url(),
            auth_token: "test-token".into(),
            user_id: "user-1".into(),
            project_id: "project-1".into(),
        }
    }

    /// Commit `files` onto `branch` of the remote (creating the branch from
    /// `main` if needed) through a scratch clone. Returns the new head.
    pub fn push_commit(&self, branch: &str, files: &[(&str, &str)], message: &str) -> String {
        let scratch = TempDir::new().unwrap();
        let remote = self.remote_url();
        git(scratch.path(), &["clone", "--quiet", &remote, "."]);
        let has_main = !git(scratch.path(), &["branch", "-r"]).is_empty();
        if self.branch_head(branch).is_some() {
            git(scratch.path(), &["checkout", "--quiet", branch]);
        } else if has_main {
            git(scratch.path(), &["checkout", "--quiet", "-b", branch, "origin/main"]);
        } else {
            git(scratch.path(), &["checkout", "--quiet", "-b", branch]);
        }
        for (path, content) in files {
            let target = scratch.path().join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(target, content).unwrap();
        }
        git(scratch.path(), &["add", "."]);
        git(scratch.path(), &["commit", "--quiet", "-m", message]);
        git(scratch.path(), &["push", "--quiet", "origin", branch]);
        git(scratch.path(), &["rev-parse", "HEAD"])
    }

    /// Head of `branch` on the remote, if the branch exists.
    pub fn branch_head(&self, branch: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .current_dir(self.remote_path())
            .output()
            .expect("failed to run git");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Content of `path` at the tip of `branch` on the remote.
    pub fn file_at(&self, branch: &str, path: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["show", &format!("{branch}:{path}")])
            .current_dir(self.remote_path())
            .output()
            .expect("failed to run git");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Commit subjects on `branch`, newest first.
    pub fn log(&self, branch: &str) -> Vec<String> {
        git(&self.remote_path(), &["log", "--format=%s", branch])
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Number of workspace directories still present.
    pub fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(self.workspace_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

impl Default for GitFixture {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Version control double
// ---------------------------------------------------------------------------

/// Records every git operation and replays queued outputs.
///
/// Operations without a queued output succeed with empty stdout, except
/// `rev_parse`, which answers [`RecordingVersionControl::HEAD`], and
/// `verify_local_branch`, which reports the branch as absent.
#[derive(Default)]
pub struct RecordingVersionControl {
    calls: Mutex<Vec<String>>,
    queued: Mutex<HashMap<&'static str, VecDeque<ToolOutput>>>,
}

impl RecordingVersionControl {
    pub const HEAD: &'static str = "1111111111111111111111111111111111111111";

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue `output` as the next answer for operation `op`
    /// (e.g. `"commit"`, `"ls_remote_branch"`).
    pub fn respond(&self, op: &'static str, output: ToolOutput) {
        self.queued
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(output);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Operation names in call order, without arguments.
    pub fn ops(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| c.split(' ').next().unwrap_or_default().to_string())
            .collect()
    }

    fn record(&self, op: &'static str, detail: String) -> Result<ToolOutput> {
        let call = if detail.is_empty() {
            op.to_string()
        } else {
            format!("{op} {detail}")
        };
        self.calls.lock().unwrap().push(call);
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(VecDeque::pop_front);
        Ok(queued.unwrap_or_else(|| match op {
            "rev_parse" => ToolOutput::ok(format!("{}\n", Self::HEAD)),
            // No local branches unless a test says otherwise.
            "verify_local_branch" => ToolOutput::failed(1, ""),
            _ => ToolOutput::ok(""),
        }))
    }
}

#[async_trait]
impl VersionControl for RecordingVersionControl {
    async fn clone_repo(&self, _ws: &Workspace, repo_url: &str) -> Result<ToolOutput> {
        self.record("clone_repo", repo_url.to_string())
    }

    async fn verify_local_branch(&self, _ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.record("verify_local_branch", branch.to_string())
    }

    async fn ls_remote_branch(&self, _ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.record("ls_remote_branch", branch.to_string())
    }

    async fn fetch_branch(&self, _ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.record("fetch_branch", branch.to_string())
    }

    async fn create_branch(&self, _ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.record("create_branch", branch.to_string())
    }

    async fn track_remote_branch(&self, _ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.record("track_remote_branch", branch.to_string())
    }

    async fn checkout(&self, _ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.record("checkout", branch.to_string())
    }

    async fn pull(&self, _ws: &Workspace, branch: &str) -> Result<ToolOutput> {
        self.record("pull", branch.to_string())
    }

    async fn push(&self, _ws: &Workspace, branch: &str, mode: PushMode) -> Result<ToolOutput> {
        self.record("push", format!("{branch} {mode:?}"))
    }

    async fn add_all(&self, _ws: &Workspace) -> Result<ToolOutput> {
        self.record("add_all", String::new())
    }

    async fn commit(&self, _ws: &Workspace, message: &str) -> Result<ToolOutput> {
        self.record("commit", message.to_string())
    }

    async fn rev_parse(&self, _ws: &Workspace, rev: &str) -> Result<ToolOutput> {
        self.record("rev_parse", rev.to_string())
    }

    async fn is_ancestor(
        &self,
        _ws: &Workspace,
        ancestor: &str,
        descendant: &str,
    ) -> Result<ToolOutput> {
        self.record("is_ancestor", format!("{ancestor} {descendant}"))
    }

    async fn reset_hard(&self, _ws: &Workspace, rev: &str) -> Result<ToolOutput> {
        self.record("reset_hard", rev.to_string())
    }
}

// ---------------------------------------------------------------------------
// Planning tool double
// ---------------------------------------------------------------------------

/// What a [`CannedPlanningTool`] observed on one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanningCall {
    pub stage: &'static str,
    pub dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// State file content when the stage started, if the file existed.
    pub state: Option<String>,
}

/// Returns a fixed plan document and records each stage.
pub struct CannedPlanningTool {
    plan_json: String,
    failing_stage: Option<&'static str>,
    state_after_plan: Option<String>,
    calls: Mutex<Vec<PlanningCall>>,
}

impl CannedPlanningTool {
    const STATE_FILE: &'static str = "terraform.tfstate";

    pub fn new(plan: serde_json::Value) -> Self {
        Self {
            plan_json: plan.to_string(),
            failing_stage: None,
            state_after_plan: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Emit `raw` verbatim from `show_json`.
    pub fn with_raw_output(mut self, raw: impl Into<String>) -> Self {
        self.plan_json = raw.into();
        self
    }

    /// Make `stage` (`init`, `plan` or `show`) exit 1.
    pub fn failing_at(mut self, stage: &'static str) -> Self {
        self.failing_stage = Some(stage);
        self
    }

    /// Overwrite the state file during `plan`, as a real tool refreshing
    /// state would.
    pub fn writing_state(mut self, content: impl Into<String>) -> Self {
        self.state_after_plan = Some(content.into());
        self
    }

    pub fn calls(&self) -> Vec<PlanningCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, stage: &'static str, dir: &Path, env: &[(String, String)]) -> ToolOutput {
        self.calls.lock().unwrap().push(PlanningCall {
            stage,
            dir: dir.to_path_buf(),
            env: env.to_vec(),
            state: std::fs::read_to_string(dir.join(Self::STATE_FILE)).ok(),
        });
        if self.failing_stage == Some(stage) {
            ToolOutput::failed(1, format!("Error: {stage} exploded"))
        } else {
            ToolOutput::ok("")
        }
    }
}

#[async_trait]
impl PlanningTool for CannedPlanningTool {
    fn name(&self) -> &str {
        "canned"
    }

    async fn init(&self, dir: &Path, env: &[(String, String)]) -> Result<ToolOutput> {
        Ok(self.record("init", dir, env))
    }

    async fn plan(
        &self,
        dir: &Path,
        env: &[(String, String)],
        _plan_file: &str,
    ) -> Result<ToolOutput> {
        let out = self.record("plan", dir, env);
        if let (true, Some(state)) = (out.success(), &self.state_after_plan) {
            std::fs::write(dir.join(Self::STATE_FILE), state).unwrap();
        }
        Ok(out)
    }

    async fn show_json(
        &self,
        dir: &Path,
        env: &[(String, String)],
        _plan_file: &str,
    ) -> Result<ToolOutput> {
        let out = self.record("show", dir, env);
        if out.success() {
            Ok(ToolOutput::ok(self.plan_json.clone()))
        } else {
            Ok(out)
        }
    }
}

// ---------------------------------------------------------------------------
// Object store double
// ---------------------------------------------------------------------------

/// In-memory buckets. Missing objects answer 404.
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    create_calls: Mutex<usize>,
    download_error: Mutex<Option<RemoteServiceError>>,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every `get_object` fail with `err`.
    pub fn fail_downloads(&self, err: RemoteServiceError) {
        *self.download_error.lock().unwrap() = Some(err);
    }

    pub fn object(&self, bucket: &str, name: &str) -> Option<Vec<u8>> {
        self.buckets
            .lock()
            .unwrap()
            .get(bucket)
            .and_then(|objects| objects.get(name).cloned())
    }

    pub fn insert(&self, bucket: &str, name: &str, body: impl Into<Vec<u8>>) {
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default()
            .insert(name.to_string(), body.into());
    }

    pub fn create_calls(&self) -> usize {
        *self.create_calls.lock().unwrap()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_buckets(&self) -> Result<Vec<Bucket>, RemoteServiceError> {
        Ok(self
            .buckets
            .lock()
            .unwrap()
            .keys()
            .map(Bucket::named)
            .collect())
    }

    async fn create_bucket(&self, name: &str) -> Result<(), RemoteServiceError> {
        *self.create_calls.lock().unwrap() += 1;
        self.buckets
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn get_object(&self, bucket: &str, object: &str) -> Result<Vec<u8>, RemoteServiceError> {
        if let Some(err) = self.download_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.object(bucket, object).ok_or_else(|| {
            RemoteServiceError::new(
                Service::ObjectStore,
                Some(404),
                format!("NoSuchKey: {bucket}/{object}"),
            )
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        body: Vec<u8>,
    ) -> Result<(), RemoteServiceError> {
        let mut buckets = self.buckets.lock().unwrap();
        let objects = buckets.get_mut(bucket).ok_or_else(|| {
            RemoteServiceError::new(Service::ObjectStore, Some(404), "NoSuchBucket")
        })?;
        objects.insert(object.to_string(), body);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Vault double
// ---------------------------------------------------------------------------

/// Answers every listing with the same response and records the scopes.
pub struct StaticVault {
    listing: SecretListing,
    scopes: Mutex<Vec<SecretScope>>,
}

impl StaticVault {
    pub fn with_secrets<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values: SecretSet = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::answering(SecretListing::ok(values))
    }

    pub fn answering(listing: SecretListing) -> Self {
        Self {
            listing,
            scopes: Mutex::new(Vec::new()),
        }
    }

    pub fn scopes(&self) -> Vec<SecretScope> {
        self.scopes.lock().unwrap().clone()
    }
}

#[async_trait]
impl VaultClient for StaticVault {
    async fn list_secrets(&self, scope: &SecretScope) -> Result<SecretListing, RemoteServiceError> {
        self.scopes.lock().unwrap().push(scope.clone());
        Ok(self.listing.clone())
    }
}

// ---------------------------------------------------------------------------
// Model and git host doubles
// ---------------------------------------------------------------------------

/// Returns fixed files and records the message plus the files it was shown.
pub struct StubModel {
    files: Vec<FileChange>,
    requests: Mutex<Vec<(String, Vec<FileChange>)>>,
}

impl StubModel {
    pub fn returning(files: Vec<FileChange>) -> Self {
        Self {
            files,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(String, Vec<FileChange>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for StubModel {
    async fn generate_file_modifications(
        &self,
        message: &str,
        current_files: &[FileChange],
    ) -> Result<Vec<FileChange>, RemoteServiceError> {
        self.requests
            .lock()
            .unwrap()
            .push((message.to_string(), current_files.to_vec()));
        Ok(self.files.clone())
    }
}

/// Knows a fixed set of branches and numbers pull requests from 1.
#[derive(Default)]
pub struct StubGitHost {
    branches: BTreeSet<String>,
    created: Mutex<Vec<(RepoSlug, NewPullRequest)>>,
}

impl StubGitHost {
    pub fn with_branches<I: IntoIterator<Item = S>, S: Into<String>>(branches: I) -> Self {
        Self {
            branches: branches.into_iter().map(Into::into).collect(),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<(RepoSlug, NewPullRequest)> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitHost for StubGitHost {
    async fn branch_exists(
        &self,
        _slug: &RepoSlug,
        branch: &str,
        _token: &str,
    ) -> Result<bool, RemoteServiceError> {
        Ok(self.branches.contains(branch))
    }

    async fn create_pull_request(
        &self,
        slug: &RepoSlug,
        request: &NewPullRequest,
        _token: &str,
    ) -> Result<PullRequest, RemoteServiceError> {
        let mut created = self.created.lock().unwrap();
        created.push((slug.clone(), request.clone()));
        let number = created.len() as u64;
        Ok(PullRequest {
            number,
            url: format!("https://github.com/{slug}/pull/{number}"),
        })
    }
}
