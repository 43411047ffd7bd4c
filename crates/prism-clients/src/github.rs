//! GitHub REST client for branch lookups and pull requests.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;

use prism_core::error::{RemoteServiceError, Service};
use prism_core::remote::{GitHost, NewPullRequest, PullRequest, RepoSlug};

use crate::{http_client, status_error, transport_error, trim_base};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const ACCEPT_V3: &str = "application/vnd.github.v3+json";

#[derive(Deserialize)]
struct CreatedPull {
    number: u64,
    html_url: String,
}

#[derive(Debug)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
}

impl Default for GitHubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GitHubClient {
    pub fn new() -> Self {
        Self {
            http: http_client(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = trim_base(&api_base.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.api_base))
            .header(AUTHORIZATION, format!("token {token}"))
            .header(ACCEPT, ACCEPT_V3)
    }
}

#[async_trait]
impl GitHost for GitHubClient {
    async fn branch_exists(
        &self,
        slug: &RepoSlug,
        branch: &str,
        token: &str,
    ) -> Result<bool, RemoteServiceError> {
        let path = format!("/repos/{}/{}/branches/{branch}", slug.owner, slug.repo);
        let response = self
            .request(reqwest::Method::GET, &path, token)
            .send()
            .await
            .map_err(|e| transport_error(Service::GitHost, e))?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(Service::GitHost, response).await),
        }
    }

    async fn create_pull_request(
        &self,
        slug: &RepoSlug,
        request: &NewPullRequest,
        token: &str,
    ) -> Result<PullRequest, RemoteServiceError> {
        let path = format!("/repos/{}/{}/pulls", slug.owner, slug.repo);
        let response = self
            .request(reqwest::Method::POST, &path, token)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(Service::GitHost, e))?;
        if response.status() != StatusCode::CREATED {
            return Err(status_error(Service::GitHost, response).await);
        }
        let created: CreatedPull = response
            .json()
            .await
            .map_err(|e| transport_error(Service::GitHost, e))?;
        tracing::info!(repo = %slug, number = created.number, "pull request opened");
        Ok(PullRequest {
            number: created.number,
            url: created.html_url,
        })
    }
}
