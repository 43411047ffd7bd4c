//! Remote collaborators used outside the core plan sequence: the language
//! model that proposes file changes and the git host that opens pull
//! requests.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, RemoteServiceError, Result};
use crate::model::FileChange;

/// Turns a user message plus the current files into file modifications.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate_file_modifications(
        &self,
        message: &str,
        current_files: &[FileChange],
    ) -> Result<Vec<FileChange>, RemoteServiceError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn ModelClient) {}
};

/// `owner/repo` coordinates on a git host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSlug {
    pub owner: String,
    pub repo: String,
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

impl RepoSlug {
    /// Extract owner and repository from a GitHub clone URL.
    ///
    /// Accepts `https://github.com/o/r(.git)`, URLs with userinfo, and the
    /// scp-like `git@github.com:o/r.git` form.
    pub fn parse_github_url(url: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("not a GitHub repository URL: {url}"));
        let url = url.trim();

        let rest = if let Some(rest) = url.strip_prefix("git@github.com:") {
            rest
        } else {
            let without_scheme = url
                .strip_prefix("https://")
                .or_else(|| url.strip_prefix("http://"))
                .or_else(|| url.strip_prefix("ssh://"))
                .ok_or_else(invalid)?;
            let host_and_path = without_scheme
                .rsplit_once('@')
                .map_or(without_scheme, |(_, after)| after);
            host_and_path
                .strip_prefix("github.com/")
                .or_else(|| host_and_path.strip_prefix("www.github.com/"))
                .ok_or_else(invalid)?
        };

        let mut parts = rest.trim_end_matches('/').splitn(3, '/');
        let owner = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let repo = parts
            .next()
            .map(|r| r.strip_suffix(".git").unwrap_or(r))
            .filter(|s| !s.is_empty())
            .ok_or_else(invalid)?;
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }
}

/// Pull request to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

impl NewPullRequest {
    pub const DEFAULT_BASE: &'static str = "main";

    /// Defaults for a conversation branch; each override replaces one field
    /// when present and non-blank.
    pub fn for_conversation(
        conversation_id: &str,
        base: Option<&str>,
        title: Option<&str>,
        body: Option<&str>,
    ) -> Self {
        let pick = |value: Option<&str>, default: String| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .unwrap_or(default)
        };
        Self {
            head: conversation_id.to_string(),
            base: pick(base, Self::DEFAULT_BASE.to_string()),
            title: pick(
                title,
                format!("Terraform updates for conversation {conversation_id}"),
            ),
            body: pick(
                body,
                format!("Automated terraform configuration updates for conversation {conversation_id}"),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

#[async_trait]
pub trait GitHost: Send + Sync {
    async fn branch_exists(
        &self,
        slug: &RepoSlug,
        branch: &str,
        token: &str,
    ) -> Result<bool, RemoteServiceError>;

    async fn create_pull_request(
        &self,
        slug: &RepoSlug,
        request: &NewPullRequest,
        token: &str,
    ) -> Result<PullRequest, RemoteServiceError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn GitHost) {}
};
