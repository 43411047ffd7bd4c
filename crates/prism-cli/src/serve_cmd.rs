use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use prism_core::remote::NewPullRequest;
use prism_core::{ChangeRequest, ChangeSource, ConversationWorkflow, ErrorCategory, FileChange, RepoTarget};

type AppState = Arc<ConversationWorkflow>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
}

impl From<prism_core::Error> for AppError {
    fn from(err: prism_core::Error) -> Self {
        let status = match err.category() {
            ErrorCategory::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("invalid JSON body: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Repository and tenant fields shared by the write routes.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TargetBody {
    pub repo_url: String,
    pub github_token: String,
    pub user_id: String,
    pub project_id: String,
}

impl From<TargetBody> for RepoTarget {
    fn from(body: TargetBody) -> Self {
        Self {
            repo_url: body.repo_url,
            auth_token: body.github_token,
            user_id: body.user_id,
            project_id: body.project_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadBody {
    #[serde(flatten)]
    pub target: TargetBody,
    #[serde(default)]
    pub files: Vec<FileChange>,
    /// Replaces the default commit message.
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    #[serde(flatten)]
    pub target: TargetBody,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PullRequestBody {
    pub repo_url: String,
    pub github_token: String,
    pub base_branch: Option<String>,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RepoQuery {
    pub repo_url: String,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub plan: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PullRequestResponse {
    pub pr_number: u64,
    pub pr_url: String,
    pub branch: String,
    pub base: String,
}

/// Token from `Authorization`, accepting `Bearer x`, `token x` or bare `x`.
fn header_token(headers: &HeaderMap) -> String {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim();
    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .or_else(|| raw.strip_prefix("token "))
        .unwrap_or(raw);
    token.trim().to_string()
}

fn read_target(query: RepoQuery, headers: &HeaderMap) -> RepoTarget {
    RepoTarget {
        repo_url: query.repo_url,
        auth_token: header_token(headers),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(workflow: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/plan", post(plan_default_branch))
        .route(
            "/conversations/{id}",
            get(conversation_files).post(upload_files),
        )
        .route("/conversations/{id}/chat", post(chat))
        .route("/conversations/{id}/pr", post(open_pull_request))
        .route(
            "/conversations/{id}/messages/{hash}",
            delete(delete_commit),
        )
        .route("/buckets", get(list_buckets))
        .layer(CorsLayer::permissive())
        .with_state(workflow)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(workflow: ConversationWorkflow, bind: &str, port: u16) -> Result<()> {
    let app = build_router(Arc::new(workflow));
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("prism serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("prism serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "prism",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn plan_default_branch(
    State(workflow): State<AppState>,
    body: Result<Json<TargetBody>, JsonRejection>,
) -> Result<Json<PlanResponse>, AppError> {
    let Json(body) = body?;
    let plan = workflow.plan_default_branch(&body.into()).await?;
    Ok(Json(PlanResponse { plan }))
}

async fn conversation_files(
    State(workflow): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    query: Result<Query<RepoQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let files = workflow
        .conversation_files(&id, &read_target(query, &headers))
        .await?;
    Ok(Json(files).into_response())
}

async fn upload_files(
    State(workflow): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<UploadBody>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = body?;
    if body.files.is_empty() {
        return Err(AppError::bad_request("at least one file is required"));
    }
    let mut request = ChangeRequest::new(id, body.target.into(), ChangeSource::Files(body.files));
    if let Some(message) = body.message {
        request = request.with_commit_message(message);
    }
    let result = workflow.run(request).await?;
    Ok(Json(result).into_response())
}

async fn chat(
    State(workflow): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = body?;
    let request = ChangeRequest::new(id, body.target.into(), ChangeSource::Prompt(body.message));
    let result = workflow.run(request).await?;
    Ok(Json(result).into_response())
}

async fn delete_commit(
    State(workflow): State<AppState>,
    Path((id, hash)): Path<(String, String)>,
    headers: HeaderMap,
    query: Result<Query<RepoQuery>, QueryRejection>,
) -> Result<StatusCode, AppError> {
    let Query(query) = query?;
    let head = workflow
        .delete_commit(&id, &hash, &read_target(query, &headers))
        .await?;
    tracing::info!(conversation = %id, dropped = %hash, head = %head, "commit deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn open_pull_request(
    State(workflow): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<PullRequestBody>, JsonRejection>,
) -> Result<Json<PullRequestResponse>, AppError> {
    let Json(body) = body?;
    let request = NewPullRequest::for_conversation(
        &id,
        body.base_branch.as_deref(),
        body.pr_title.as_deref(),
        body.pr_body.as_deref(),
    );
    let base = request.base.clone();
    let target = RepoTarget {
        repo_url: body.repo_url,
        auth_token: body.github_token,
        ..Default::default()
    };
    let pr = workflow.open_pull_request(&id, &target, request).await?;
    Ok(Json(PullRequestResponse {
        pr_number: pr.number,
        pr_url: pr.url,
        branch: id,
        base,
    }))
}

async fn list_buckets(State(workflow): State<AppState>) -> Result<Response, AppError> {
    let buckets = workflow.list_buckets().await?;
    Ok(Json(buckets).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use prism_core::git::GitCli;
    use prism_core::{Collaborators, ConversationWorkflow, WorkflowConfig};
    use prism_test_utils::{
        CannedPlanningTool, GitFixture, MemoryObjectStore, StaticVault, StubGitHost, StubModel,
    };

    use super::*;

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    struct Harness {
        fixture: GitFixture,
        store: Arc<MemoryObjectStore>,
        host: Arc<StubGitHost>,
        router: Router,
    }

    fn harness() -> Harness {
        let fixture = GitFixture::new();
        let store = MemoryObjectStore::new();
        let host = Arc::new(StubGitHost::with_branches(["conv-42"]));
        let collaborators = Collaborators {
            version_control: Arc::new(GitCli::new()),
            planning_tool: Arc::new(
                CannedPlanningTool::new(json!({"format_version": "1.2", "resource_changes": []}))
                    .writing_state("{\"serial\":1}"),
            ),
            object_store: store.clone(),
            vault: Arc::new(StaticVault::with_secrets([("TF_VAR_token", "s3cret")])),
            model: Some(Arc::new(StubModel::returning(vec![FileChange::new(
                "s3.tf",
                "resource \"aws_s3_bucket\" \"b\" {}\n",
            )]))),
            git_host: Some(host.clone()),
        };
        let config = WorkflowConfig {
            workspace_dir: fixture.workspace_dir(),
            ..Default::default()
        };
        let workflow = ConversationWorkflow::new(config, collaborators);
        Harness {
            router: build_router(Arc::new(workflow)),
            fixture,
            store,
            host,
        }
    }

    fn target_json(fixture: &GitFixture) -> Value {
        json!({
            "repo_url": fixture.remote_url(),
            "github_token": "test-token",
            "user_id": "user-1",
            "project_id": "project-1",
        })
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 16 * 1_048_576)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn encode(value: &str) -> String {
        value
            .bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    (b as char).to_string()
                }
                _ => format!("%{b:02X}"),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn index_reports_service() {
        let h = harness();
        let (status, body) = send(
            &h.router,
            Request::builder().uri("/").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "prism");
    }

    #[tokio::test]
    async fn upload_commits_and_plans() {
        let h = harness();
        let mut body = target_json(&h.fixture);
        body["files"] = json!([{"path": "main.tf", "content": "resource \"x\" {}"}]);

        let (status, json) = send(&h.router, post_json("/conversations/conv-42", body)).await;

        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(json["branch"], "conv-42");
        assert_eq!(json["plan"]["format_version"], "1.2");
        assert_eq!(json["modified_files"][0]["path"], "main.tf");
        assert_eq!(
            json["commit_hash"].as_str(),
            h.fixture.branch_head("conv-42").as_deref()
        );
        assert_eq!(
            h.fixture.file_at("conv-42", "main.tf").as_deref(),
            Some("resource \"x\" {}")
        );
        assert_eq!(
            h.store.object("user-1", "terraform.tfstate").as_deref(),
            Some(b"{\"serial\":1}".as_slice())
        );
        assert_eq!(h.fixture.leftover_workspaces(), 0);
    }

    #[tokio::test]
    async fn upload_without_files_is_bad_request() {
        let h = harness();
        let mut body = target_json(&h.fixture);
        body["files"] = json!([]);

        let (status, json) = send(&h.router, post_json("/conversations/conv-42", body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "at least one file is required");
    }

    #[tokio::test]
    async fn upload_missing_token_is_bad_request() {
        let h = harness();
        let body = json!({
            "repo_url": h.fixture.remote_url(),
            "files": [{"path": "main.tf", "content": ""}],
        });

        let (status, json) = send(&h.router, post_json("/conversations/conv-42", body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("auth_token"), "{json}");
    }

    #[tokio::test]
    async fn upload_escaping_path_is_internal_error() {
        let h = harness();
        let mut body = target_json(&h.fixture);
        body["files"] = json!([{"path": "../outside.tf", "content": "x"}]);

        let (status, json) = send(&h.router, post_json("/conversations/conv-42", body)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].as_str().unwrap().contains("outside.tf"), "{json}");
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let h = harness();
        let request = Request::builder()
            .method("POST")
            .uri("/plan")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let (status, json) = send(&h.router, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().starts_with("invalid JSON body"));
    }

    #[tokio::test]
    async fn plan_default_branch_returns_plan() {
        let h = harness();

        let (status, json) = send(&h.router, post_json("/plan", target_json(&h.fixture))).await;

        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(json["plan"]["format_version"], "1.2");
        assert!(h.fixture.branch_head("conv-42").is_none());
    }

    #[tokio::test]
    async fn chat_uses_model_changes() {
        let h = harness();
        let mut body = target_json(&h.fixture);
        body["message"] = json!("add an s3 bucket");

        let (status, json) = send(&h.router, post_json("/conversations/conv-7/chat", body)).await;

        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(json["modified_files"][0]["path"], "s3.tf");
        assert_eq!(h.fixture.log("conv-7")[0], "AI: add an s3 bucket");
    }

    #[tokio::test]
    async fn conversation_files_reads_branch() {
        let h = harness();
        h.fixture
            .push_commit("conv-9", &[("vpc.tf", "# vpc\n")], "add vpc");
        let uri = format!(
            "/conversations/conv-9?repo_url={}",
            encode(&h.fixture.remote_url())
        );
        let request = Request::builder()
            .uri(uri)
            .header("authorization", "Bearer test-token")
            .body(Body::empty())
            .unwrap();

        let (status, json) = send(&h.router, request).await;

        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(json["count"], 2);
        assert_eq!(json["files"][0]["path"], "main.tf");
        assert_eq!(json["files"][1]["path"], "vpc.tf");
    }

    #[tokio::test]
    async fn conversation_files_without_token_is_bad_request() {
        let h = harness();
        let uri = format!(
            "/conversations/conv-9?repo_url={}",
            encode(&h.fixture.remote_url())
        );

        let (status, _) = send(
            &h.router,
            Request::builder().uri(uri).body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_commit_rewinds_branch() {
        let h = harness();
        let first = h
            .fixture
            .push_commit("conv-5", &[("a.tf", "a")], "first change");
        let second = h
            .fixture
            .push_commit("conv-5", &[("b.tf", "b")], "second change");
        let uri = format!(
            "/conversations/conv-5/messages/{second}?repo_url={}",
            encode(&h.fixture.remote_url())
        );
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .header("authorization", "token test-token")
            .body(Body::empty())
            .unwrap();

        let (status, _) = send(&h.router, request).await;

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(h.fixture.branch_head("conv-5").as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn delete_commit_on_unknown_branch_is_not_found() {
        let h = harness();
        let uri = format!(
            "/conversations/nope/messages/abcdef12?repo_url={}",
            encode(&h.fixture.remote_url())
        );
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .header("authorization", "test-token")
            .body(Body::empty())
            .unwrap();

        let (status, json) = send(&h.router, request).await;

        assert_eq!(status, StatusCode::NOT_FOUND, "{json}");
    }

    #[tokio::test]
    async fn pull_request_uses_defaults() {
        let h = harness();
        let body = json!({
            "repo_url": "https://github.com/acme/infra.git",
            "github_token": "gh-token",
        });

        let (status, json) = send(&h.router, post_json("/conversations/conv-42/pr", body)).await;

        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(json["pr_number"], 1);
        assert_eq!(json["pr_url"], "https://github.com/acme/infra/pull/1");
        assert_eq!(json["branch"], "conv-42");
        assert_eq!(json["base"], "main");
        let created = h.host.created();
        assert_eq!(created[0].1.title, "Terraform updates for conversation conv-42");
    }

    #[tokio::test]
    async fn pull_request_for_missing_branch_is_not_found() {
        let h = harness();
        let body = json!({
            "repo_url": "https://github.com/acme/infra.git",
            "github_token": "gh-token",
            "base_branch": "develop",
        });

        let (status, _) = send(&h.router, post_json("/conversations/conv-99/pr", body)).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(h.host.created().is_empty());
    }

    #[tokio::test]
    async fn pull_request_with_non_github_url_is_bad_request() {
        let h = harness();
        let body = json!({
            "repo_url": "https://gitlab.com/acme/infra.git",
            "github_token": "gh-token",
        });

        let (status, _) = send(&h.router, post_json("/conversations/conv-42/pr", body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn buckets_are_listed() {
        let h = harness();
        h.store.insert("user-1", "terraform.tfstate", "{}");

        let (status, json) = send(
            &h.router,
            Request::builder().uri("/buckets").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!([{"name": "user-1"}]));
    }

    #[test]
    fn header_token_strips_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(header_token(&headers), "abc");
        headers.insert(header::AUTHORIZATION, "token xyz".parse().unwrap());
        assert_eq!(header_token(&headers), "xyz");
        headers.insert(header::AUTHORIZATION, "raw".parse().unwrap());
        assert_eq!(header_token(&headers), "raw");
        assert_eq!(header_token(&HeaderMap::new()), "");
    }
}
