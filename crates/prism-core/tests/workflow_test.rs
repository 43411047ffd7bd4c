//! End-to-end tests of the conversation workflow.
//!
//! Git runs for real against a local bare remote; the planning tool, object
//! store, vault, model and git host are in-process doubles.

use std::sync::Arc;

use prism_core::error::{Error, ErrorCategory};
use prism_core::git::{BranchPolicy, GitCli, PushMode};
use prism_core::process::ToolOutput;
use prism_core::remote::NewPullRequest;
use prism_core::secrets::SecretListing;
use prism_core::state::STATE_OBJECT_NAME;
use prism_core::{
    ChangeRequest, ChangeSource, Collaborators, ConversationWorkflow, FileChange, WorkflowConfig,
};
use prism_test_utils::{
    CannedPlanningTool, GitFixture, MemoryObjectStore, RecordingVersionControl, StaticVault,
    StubGitHost, StubModel,
};
use serde_json::json;

// ===========================================================================
// Test harness
// ===========================================================================

struct Harness {
    fixture: GitFixture,
    planner: Arc<CannedPlanningTool>,
    store: Arc<MemoryObjectStore>,
    vault: Arc<StaticVault>,
    model: Arc<StubModel>,
    host: Arc<StubGitHost>,
}

impl Harness {
    fn new() -> Self {
        Self::with_planner(
            CannedPlanningTool::new(json!({
                "format_version": "1.2",
                "resource_changes": [{"address": "x.this", "change": {"actions": ["create"]}}]
            }))
            .writing_state("{\"serial\":1}"),
        )
    }

    fn with_planner(planner: CannedPlanningTool) -> Self {
        Self {
            fixture: GitFixture::new(),
            planner: Arc::new(planner),
            store: MemoryObjectStore::new(),
            vault: Arc::new(StaticVault::with_secrets([("TF_VAR_token", "s3cret")])),
            model: Arc::new(StubModel::returning(vec![FileChange::new(
                "s3.tf",
                "resource \"aws_s3_bucket\" \"b\" {}",
            )])),
            host: Arc::new(StubGitHost::with_branches(["conv-42"])),
        }
    }

    fn workflow(&self) -> ConversationWorkflow {
        let config = WorkflowConfig {
            workspace_dir: self.fixture.workspace_dir(),
            branch_policy: BranchPolicy::Remote,
            ..WorkflowConfig::default()
        };
        ConversationWorkflow::new(
            config,
            Collaborators {
                version_control: Arc::new(GitCli::new()),
                planning_tool: self.planner.clone(),
                object_store: self.store.clone(),
                vault: self.vault.clone(),
                model: Some(self.model.clone()),
                git_host: Some(self.host.clone()),
            },
        )
    }

    fn upload(&self, conversation: &str, files: Vec<FileChange>) -> ChangeRequest {
        ChangeRequest::new(conversation, self.fixture.target(), ChangeSource::Files(files))
    }
}

// ===========================================================================
// Plan runs
// ===========================================================================

#[tokio::test]
async fn conv_42_single_file_produces_branch_commit_and_plan() {
    let h = Harness::new();
    let files = vec![FileChange::new("main.tf", "resource \"x\" {}")];
    let request = h
        .upload("conv-42", files.clone())
        .with_commit_message("AI: add resource");

    let result = h.workflow().run(request).await.unwrap();

    assert_eq!(result.branch, "conv-42");
    assert!(!result.commit_hash.is_empty());
    assert!(result.plan.is_object());
    assert_eq!(result.plan["format_version"], "1.2");
    assert_eq!(result.modified_files, files);

    assert_eq!(
        h.fixture.branch_head("conv-42").as_deref(),
        Some(result.commit_hash.as_str())
    );
    assert_eq!(h.fixture.log("conv-42")[0], "AI: add resource");
    assert_eq!(
        h.fixture.file_at("conv-42", "main.tf").as_deref(),
        Some("resource \"x\" {}")
    );
    // State was persisted after planning, and nothing was left on disk.
    assert_eq!(
        h.store.object("user-1", STATE_OBJECT_NAME).as_deref(),
        Some(b"{\"serial\":1}".as_slice())
    );
    assert_eq!(h.fixture.leftover_workspaces(), 0);
}

#[tokio::test]
async fn rerun_without_changes_keeps_hash_and_plans_against_restored_state() {
    let h = Harness::new();
    let wf = h.workflow();
    let first = wf
        .run(h.upload("conv-42", vec![FileChange::new("main.tf", "resource \"x\" {}")]))
        .await
        .unwrap();

    let second = wf.run(h.upload("conv-42", Vec::new())).await.unwrap();

    assert_eq!(second.commit_hash, first.commit_hash);
    assert!(second.modified_files.is_empty());
    assert!(second.plan.is_object());
    assert_eq!(h.fixture.log("conv-42").len(), 2);

    // The second plan started from the state the first one persisted.
    let plan_calls: Vec<_> = h
        .planner
        .calls()
        .into_iter()
        .filter(|c| c.stage == "plan")
        .collect();
    assert_eq!(plan_calls.len(), 2);
    assert_eq!(plan_calls[0].state.as_deref(), Some(""));
    assert_eq!(plan_calls[1].state.as_deref(), Some("{\"serial\":1}"));
}

#[tokio::test]
async fn secrets_reach_only_the_planning_tool() {
    let h = Harness::new();
    h.workflow()
        .run(h.upload("conv-1", vec![FileChange::new("a.tf", "# a")]))
        .await
        .unwrap();

    for call in h.planner.calls() {
        assert!(call.env.contains(&("TF_VAR_token".into(), "s3cret".into())));
    }
    assert!(std::env::var("TF_VAR_token").is_err());
    let scopes = h.vault.scopes();
    assert_eq!(scopes.len(), 1);
    assert_eq!(scopes[0].environment, "dev");
    assert_eq!(scopes[0].project_id, "project-1");
    assert_eq!(scopes[0].path, "/");
}

#[tokio::test]
async fn plan_failure_keeps_pushed_commit_and_releases_workspace() {
    let h = Harness::with_planner(CannedPlanningTool::new(json!({})).failing_at("plan"));

    let err = h
        .workflow()
        .run(h.upload("conv-9", vec![FileChange::new("main.tf", "# broken")]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PlanExecution { .. }), "{err:?}");
    assert_eq!(err.category(), ErrorCategory::Internal);
    // At-least-once: the commit made it to the remote before planning failed.
    assert_eq!(
        h.fixture.file_at("conv-9", "main.tf").as_deref(),
        Some("# broken")
    );
    // State is only persisted after a successful plan.
    assert!(h.store.object("user-1", STATE_OBJECT_NAME).is_none());
    assert_eq!(h.fixture.leftover_workspaces(), 0);
}

#[tokio::test]
async fn vault_rejection_aborts_before_planning() {
    let mut h = Harness::new();
    h.vault = Arc::new(StaticVault::answering(SecretListing::failed(403, "forbidden")));

    let err = h
        .workflow()
        .run(h.upload("conv-5", vec![FileChange::new("a.tf", "# a")]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SecretFetch { status: 403, .. }));
    assert!(h.planner.calls().is_empty());
    assert_eq!(h.fixture.leftover_workspaces(), 0);
}

#[tokio::test]
async fn escaping_path_is_rejected_before_commit() {
    let h = Harness::new();
    let err = h
        .workflow()
        .run(h.upload("conv-6", vec![FileChange::new("../outside.tf", "x")]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PathEscape { .. }));
    // The branch was published by ensure_branch but carries no new commit.
    assert_eq!(h.fixture.branch_head("conv-6"), h.fixture.branch_head("main"));
}

#[tokio::test]
async fn missing_fields_are_bad_requests() {
    let h = Harness::new();
    let mut target = h.fixture.target();
    target.user_id.clear();
    let err = h
        .workflow()
        .run(ChangeRequest::new("conv-1", target, ChangeSource::Files(Vec::new())))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::BadRequest);

    let err = h
        .workflow()
        .run(h.upload("bad id", Vec::new()))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::BadRequest);
}

// ===========================================================================
// Prompt-driven changes
// ===========================================================================

#[tokio::test]
async fn prompt_sends_current_files_to_model_and_commits_with_ai_prefix() {
    let h = Harness::new();
    h.fixture
        .push_commit("conv-8", &[("vpc.tf", "# vpc\n")], "earlier change");

    let result = h
        .workflow()
        .run(ChangeRequest::new(
            "conv-8",
            h.fixture.target(),
            ChangeSource::Prompt("add an s3 bucket".into()),
        ))
        .await
        .unwrap();

    let requests = h.model.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "add an s3 bucket");
    let shown: Vec<_> = requests[0].1.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(shown, ["main.tf", "vpc.tf"]);

    assert_eq!(result.modified_files[0].path, "s3.tf");
    assert_eq!(
        h.fixture.log("conv-8"),
        ["AI: add an s3 bucket", "earlier change", "initial commit"]
    );
}

// ===========================================================================
// Other operations
// ===========================================================================

#[tokio::test]
async fn conversation_files_lists_tf_files_on_branch() {
    let h = Harness::new();
    h.fixture.push_commit(
        "conv-2",
        &[("modules/net/vpc.tf", "# vpc\n"), ("notes.md", "x")],
        "add module",
    );

    let files = h
        .workflow()
        .conversation_files("conv-2", &h.fixture.target())
        .await
        .unwrap();

    assert_eq!(files.count, 2);
    let paths: Vec<_> = files.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, ["main.tf", "modules/net/vpc.tf"]);
    assert_eq!(h.fixture.leftover_workspaces(), 0);
}

#[tokio::test]
async fn plan_default_branch_leaves_branches_alone() {
    let h = Harness::new();
    let plan = h
        .workflow()
        .plan_default_branch(&h.fixture.target())
        .await
        .unwrap();

    assert_eq!(plan["format_version"], "1.2");
    assert!(h.store.object("user-1", STATE_OBJECT_NAME).is_some());
    assert_eq!(h.fixture.log("main"), ["initial commit"]);
}

#[tokio::test]
async fn delete_commit_rewrites_conversation_branch() {
    let h = Harness::new();
    let keep = h.fixture.push_commit("conv-3", &[("a.tf", "# a\n")], "keep me");
    let drop = h.fixture.push_commit("conv-3", &[("b.tf", "# b\n")], "drop me");

    let head = h
        .workflow()
        .delete_commit("conv-3", &drop, &h.fixture.target())
        .await
        .unwrap();

    assert_eq!(head, keep);
    assert_eq!(h.fixture.branch_head("conv-3").as_deref(), Some(keep.as_str()));
    assert_eq!(h.fixture.leftover_workspaces(), 0);
}

#[tokio::test]
async fn delete_commit_on_unknown_branch_is_not_found() {
    let h = Harness::new();
    let err = h
        .workflow()
        .delete_commit("conv-none", "abcdef12", &h.fixture.target())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);

    let err = h
        .workflow()
        .delete_commit("conv-none", "not-a-hash", &h.fixture.target())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::BadRequest);
}

#[tokio::test]
async fn pull_request_uses_conversation_defaults() {
    let h = Harness::new();
    let mut target = h.fixture.target();
    target.repo_url = "https://github.com/acme/infra.git".into();

    let pr = h
        .workflow()
        .open_pull_request(
            "conv-42",
            &target,
            NewPullRequest::for_conversation("conv-42", None, None, None),
        )
        .await
        .unwrap();

    assert_eq!(pr.number, 1);
    assert_eq!(pr.url, "https://github.com/acme/infra/pull/1");
    let created = h.host.created();
    assert_eq!(created[0].0.to_string(), "acme/infra");
    assert_eq!(created[0].1.base, "main");
    assert_eq!(created[0].1.title, "Terraform updates for conversation conv-42");

    let err = h
        .workflow()
        .open_pull_request(
            "conv-missing",
            &target,
            NewPullRequest::for_conversation("conv-missing", None, None, None),
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);
}

// ===========================================================================
// Step ordering with a recording version control
// ===========================================================================

#[tokio::test]
async fn steps_run_in_order_with_documented_push_modes() {
    let h = Harness::new();
    let vc = RecordingVersionControl::new();
    let wf = ConversationWorkflow::new(
        WorkflowConfig {
            workspace_dir: h.fixture.workspace_dir(),
            ..WorkflowConfig::default()
        },
        Collaborators {
            version_control: vc.clone(),
            planning_tool: h.planner.clone(),
            object_store: h.store.clone(),
            vault: h.vault.clone(),
            model: None,
            git_host: None,
        },
    );

    let result = wf
        .run(h.upload("conv-1", vec![FileChange::new("main.tf", "x")]))
        .await
        .unwrap();

    assert_eq!(result.commit_hash, RecordingVersionControl::HEAD);
    assert_eq!(
        vc.ops(),
        [
            "clone_repo",
            "verify_local_branch",
            "ls_remote_branch",
            "create_branch",
            "push",
            "add_all",
            "commit",
            "rev_parse",
            "push",
        ]
    );
    let pushes: Vec<_> = vc
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("push"))
        .collect();
    assert_eq!(
        pushes,
        [
            format!("push conv-1 {:?}", PushMode::Normal),
            format!("push conv-1 {:?}", PushMode::Force),
        ]
    );
    assert_eq!(
        vc.calls()[6],
        "commit Update terraform config for conversation conv-1"
    );
}

#[tokio::test]
async fn commit_failure_other_than_clean_tree_is_fatal() {
    let h = Harness::new();
    let vc = RecordingVersionControl::new();
    vc.respond("commit", ToolOutput::failed(1, "error: gpg failed to sign the data"));
    let wf = ConversationWorkflow::new(
        WorkflowConfig {
            workspace_dir: h.fixture.workspace_dir(),
            ..WorkflowConfig::default()
        },
        Collaborators {
            version_control: vc.clone(),
            planning_tool: h.planner.clone(),
            object_store: h.store.clone(),
            vault: h.vault.clone(),
            model: None,
            git_host: None,
        },
    );

    let err = wf
        .run(h.upload("conv-1", Vec::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Commit { ref output } if output.contains("gpg")));
    assert!(!vc.ops().contains(&"rev_parse".to_string()));
    assert!(h.planner.calls().is_empty());
    assert_eq!(h.fixture.leftover_workspaces(), 0);
}
