//! Values exchanged between the workflow and its callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single file to write into the workspace, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

impl FileChange {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// The artifact produced by one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// The planning tool's JSON plan, kept as an untyped document.
    pub plan: serde_json::Value,
    pub modified_files: Vec<FileChange>,
    pub branch: String,
    pub commit_hash: String,
}

/// Flat key/value secrets, fetched per run and never persisted.
pub type SecretSet = BTreeMap<String, String>;

/// Infrastructure files currently on a conversation branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationFiles {
    pub files: Vec<FileChange>,
    pub count: usize,
}

impl From<Vec<FileChange>> for ConversationFiles {
    fn from(files: Vec<FileChange>) -> Self {
        Self {
            count: files.len(),
            files,
        }
    }
}

/// Repository and tenant coordinates shared by every workflow entry point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoTarget {
    pub repo_url: String,
    pub auth_token: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub project_id: String,
}

impl RepoTarget {
    /// Check the fields needed to clone the repository.
    pub fn validate_repo(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.repo_url.trim().is_empty() {
            missing.push("repo_url");
        }
        if self.auth_token.trim().is_empty() {
            missing.push("auth_token");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "{} required",
                missing.join(" and ")
            )))
        }
    }

    /// Check the fields needed to clone, restore state and fetch secrets.
    pub fn validate_for_plan(&self) -> Result<()> {
        self.validate_repo()?;
        if self.user_id.trim().is_empty() {
            return Err(Error::InvalidInput("user_id required".into()));
        }
        if self.project_id.trim().is_empty() {
            return Err(Error::InvalidInput("project_id required".into()));
        }
        Ok(())
    }
}

/// Reject an empty or malformed conversation id.
///
/// The id becomes a branch name verbatim, so it must be a valid ref
/// component.
pub fn validate_conversation_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::InvalidInput("conversation id is required".into()));
    }
    let bad = id.starts_with('-')
        || id.starts_with('.')
        || id.ends_with('.')
        || id.ends_with(".lock")
        || id.contains("..")
        || id.contains("@{")
        || id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if bad {
        return Err(Error::InvalidInput(format!(
            "conversation id {id:?} is not a valid branch name"
        )));
    }
    Ok(())
}
