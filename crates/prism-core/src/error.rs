//! Error types for the conversation-to-plan workflow.
//!
//! Every failure surfaces as an [`Error`] variant. [`Error::kind`] maps it
//! onto the coarse taxonomy used for diagnostics and [`Error::category`]
//! onto the status category reported to callers.

use std::fmt;
use std::path::Path;

use thiserror::Error;

/// Which remote collaborator produced a [`RemoteServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Vault,
    ObjectStore,
    Model,
    GitHost,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vault => "vault",
            Self::ObjectStore => "object store",
            Self::Model => "model",
            Self::GitHost => "git host",
        };
        f.write_str(name)
    }
}

/// A non-success response from a remote service.
///
/// The upstream status code and message are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServiceError {
    pub service: Service,
    /// Upstream HTTP-style status, if the service returned one.
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteServiceError {
    pub fn new(service: Service, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            service,
            status,
            message: message.into(),
        }
    }

    /// Whether the upstream reported the object as missing.
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl fmt::Display for RemoteServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "{} request failed (status {status}): {}",
                self.service, self.message
            ),
            None => write!(f, "{} request failed: {}", self.service, self.message),
        }
    }
}

impl std::error::Error for RemoteServiceError {}

/// Coarse failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputValidation,
    ExternalTool,
    RemoteService,
    PlanDecode,
    PathEscape,
    NotFound,
    Internal,
}

/// Status category reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    BadRequest,
    NotFound,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    /// A required request field is missing or malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested conversation, commit or branch does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// `git clone` or creating its target directory failed.
    #[error("failed to clone repository: {output}")]
    Clone { output: String },

    /// Branch checkout/creation/pull could not be reconciled.
    #[error("failed to sync branch {branch}: {output}")]
    BranchSync { branch: String, output: String },

    /// `git push` was rejected or failed.
    #[error("failed to push branch {branch}: {output}")]
    Push { branch: String, output: String },

    /// `git commit` failed for a reason other than an empty change set.
    #[error("failed to commit: {output}")]
    Commit { output: String },

    /// Any other git invocation exited non-zero.
    #[error("git {command} failed: {output}")]
    Git { command: String, output: String },

    /// A file change tried to leave the workspace root.
    #[error("path escapes workspace: {path}")]
    PathEscape { path: String },

    /// Writing a file change failed.
    #[error("failed to write {path}: {source}")]
    Materialize {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The vault returned a non-success status or an error message.
    #[error("failed to fetch secrets (status code {status}): {message}")]
    SecretFetch { status: u16, message: String },

    /// A secret key/value cannot be placed into a child environment.
    #[error("cannot inject secret {key:?}: {reason}")]
    InvalidSecret { key: String, reason: &'static str },

    /// A planning-tool stage exited non-zero.
    #[error("{stage} failed: {output}")]
    PlanExecution { stage: String, output: String },

    /// The planning tool's JSON rendering did not parse.
    #[error("failed to decode plan JSON: {source}")]
    PlanDecode {
        #[source]
        source: serde_json::Error,
    },

    /// A remote collaborator failed.
    #[error(transparent)]
    Remote(#[from] RemoteServiceError),

    /// An external program could not be started.
    #[error("failed to run {program}: {source}")]
    ToolSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An external program exceeded its deadline and was killed.
    #[error("{program} timed out after {secs}s")]
    ToolTimeout { program: String, secs: u64 },

    /// Local filesystem failure outside of file materialization.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn io_at(action: &str, path: &Path, source: std::io::Error) -> Self {
        Self::io(format!("failed to {action} {}", path.display()), source)
    }

    /// Classify this error within the failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InputValidation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Clone { .. }
            | Self::BranchSync { .. }
            | Self::Push { .. }
            | Self::Commit { .. }
            | Self::Git { .. }
            | Self::PlanExecution { .. }
            | Self::ToolSpawn { .. }
            | Self::ToolTimeout { .. } => ErrorKind::ExternalTool,
            Self::SecretFetch { .. } | Self::Remote(_) => ErrorKind::RemoteService,
            Self::PlanDecode { .. } => ErrorKind::PlanDecode,
            Self::PathEscape { .. } => ErrorKind::PathEscape,
            Self::Materialize { .. } | Self::InvalidSecret { .. } | Self::Io { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Map this error onto the status category reported to callers.
    pub fn category(&self) -> ErrorCategory {
        match self.kind() {
            ErrorKind::InputValidation => ErrorCategory::BadRequest,
            ErrorKind::NotFound => ErrorCategory::NotFound,
            _ => ErrorCategory::Internal,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_display_includes_status() {
        let err = RemoteServiceError::new(Service::Vault, Some(403), "forbidden");
        assert_eq!(err.to_string(), "vault request failed (status 403): forbidden");

        let err = RemoteServiceError::new(Service::Model, None, "connection reset");
        assert_eq!(err.to_string(), "model request failed: connection reset");
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            Error::InvalidInput("x".into()).kind(),
            ErrorKind::InputValidation
        );
        assert_eq!(
            Error::SecretFetch {
                status: 500,
                message: "boom".into()
            }
            .kind(),
            ErrorKind::RemoteService
        );
        assert_eq!(
            Error::PathEscape {
                path: "../x".into()
            }
            .kind(),
            ErrorKind::PathEscape
        );
        assert_eq!(
            Error::PlanExecution {
                stage: "terraform plan".into(),
                output: String::new()
            }
            .kind(),
            ErrorKind::ExternalTool
        );
        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(
            Error::PlanDecode { source: decode }.kind(),
            ErrorKind::PlanDecode
        );
    }

    #[test]
    fn categories() {
        assert_eq!(
            Error::InvalidInput("missing repo_url".into()).category(),
            ErrorCategory::BadRequest
        );
        assert_eq!(
            Error::NotFound("branch conv-1".into()).category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            Error::Commit {
                output: "fatal".into()
            }
            .category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn not_found_detection() {
        assert!(RemoteServiceError::new(Service::ObjectStore, Some(404), "NoSuchKey").is_not_found());
        assert!(!RemoteServiceError::new(Service::ObjectStore, Some(500), "oops").is_not_found());
    }
}
