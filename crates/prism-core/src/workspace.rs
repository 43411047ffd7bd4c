//! Ephemeral clone directories, one per workflow invocation.
//!
//! A [`Workspace`] owns a freshly created temporary directory holding a clone
//! of the target repository. The directory is removed when the workspace is
//! released or dropped, so every exit path (including errors and cancelled
//! futures) cleans up.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use tempfile::TempDir;

use crate::error::{Error, Result};
use crate::git::VersionControl;

/// Directory name prefix for workspace directories.
const WORKSPACE_PREFIX: &str = "cloned-repo-";

/// Credentials handed to every git subprocess of one workspace.
///
/// The token travels only through per-command environment variables
/// (`GIT_CONFIG_*`), never through `.git/config` or the remote URL.
#[derive(Clone, Default)]
pub struct GitAuth {
    token: Option<String>,
}

impl GitAuth {
    pub fn token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            token: (!token.trim().is_empty()).then_some(token),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Environment that injects an `Authorization` header for HTTPS remotes.
    pub fn env(&self) -> Vec<(String, String)> {
        let Some(token) = &self.token else {
            return Vec::new();
        };
        let credentials = BASE64_STANDARD.encode(format!("x-access-token:{token}"));
        vec![
            ("GIT_CONFIG_COUNT".into(), "1".into()),
            ("GIT_CONFIG_KEY_0".into(), "http.extraHeader".into()),
            (
                "GIT_CONFIG_VALUE_0".into(),
                format!("Authorization: Basic {credentials}"),
            ),
        ]
    }
}

impl fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitAuth")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A cloned repository in a temporary directory, exclusively owned by one
/// workflow invocation.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    auth: GitAuth,
}

impl Workspace {
    /// Create an empty workspace directory under `base_dir`.
    pub fn create(base_dir: &Path, auth: GitAuth) -> Result<Self> {
        std::fs::create_dir_all(base_dir).map_err(|e| Error::Clone {
            output: format!(
                "failed to create workspace base directory {}: {e}",
                base_dir.display()
            ),
        })?;
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(base_dir)
            .map_err(|e| Error::Clone {
                output: format!("failed to create temp dir: {e}"),
            })?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
            auth,
        })
    }

    /// Root of the working tree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn auth(&self) -> &GitAuth {
        &self.auth
    }

    /// Recursively delete the workspace directory.
    pub fn release(mut self) -> Result<()> {
        match self.dir.take() {
            Some(dir) => match dir.close() {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::io_at("remove workspace", &self.path, e)),
            },
            None => release_dir(&self.path),
        }
    }
}

/// Remove a workspace directory by path. Missing directories are fine.
pub fn release_dir(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_at("remove workspace", path, e)),
    }
}

/// Clones repositories into fresh workspaces.
#[derive(Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
    vc: Arc<dyn VersionControl>,
}

impl fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("base_dir", &self.base_dir)
            .finish()
    }
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>, vc: Arc<dyn VersionControl>) -> Self {
        Self {
            base_dir: base_dir.into(),
            vc,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Clone `repo_url` into a new workspace, authenticating with `auth_token`.
    ///
    /// On failure the partially populated directory is removed before the
    /// error is returned.
    pub async fn acquire(&self, repo_url: &str, auth_token: &str) -> Result<Workspace> {
        let workspace = Workspace::create(&self.base_dir, GitAuth::token(auth_token))?;
        tracing::info!(path = %workspace.path().display(), "cloning repository");

        let output = self.vc.clone_repo(&workspace, repo_url).await?;
        if !output.success() {
            // Dropping the workspace removes the directory.
            return Err(Error::Clone {
                output: output.combined(),
            });
        }
        Ok(workspace)
    }

    /// Release a workspace, logging rather than failing on cleanup errors.
    pub fn release(&self, workspace: Workspace) {
        let path = workspace.path().to_path_buf();
        match workspace.release() {
            Ok(()) => tracing::info!(path = %path.display(), "removed workspace"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove workspace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_env_carries_basic_header() {
        let env = GitAuth::token("ghp_secret").env();
        assert_eq!(env.len(), 3);
        assert_eq!(env[0], ("GIT_CONFIG_COUNT".into(), "1".into()));
        assert_eq!(env[1].1, "http.extraHeader");
        let expected = BASE64_STANDARD.encode("x-access-token:ghp_secret");
        assert_eq!(env[2].1, format!("Authorization: Basic {expected}"));
    }

    #[test]
    fn blank_token_yields_no_env() {
        assert!(GitAuth::token("  ").env().is_empty());
        assert!(GitAuth::none().env().is_empty());
    }

    #[test]
    fn debug_redacts_token() {
        let rendered = format!("{:?}", GitAuth::token("ghp_secret"));
        assert!(!rendered.contains("ghp_secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn create_and_release_workspace() {
        let base = TempDir::new().unwrap();
        let ws = Workspace::create(base.path(), GitAuth::none()).unwrap();
        let path = ws.path().to_path_buf();
        assert!(path.exists());
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(WORKSPACE_PREFIX)
        );
        ws.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn release_tolerates_already_removed_directory() {
        let base = TempDir::new().unwrap();
        let ws = Workspace::create(base.path(), GitAuth::none()).unwrap();
        std::fs::remove_dir_all(ws.path()).unwrap();
        ws.release().expect("release should be idempotent");
    }

    #[test]
    fn dropping_workspace_removes_directory() {
        let base = TempDir::new().unwrap();
        let path = {
            let ws = Workspace::create(base.path(), GitAuth::none()).unwrap();
            std::fs::write(ws.path().join("file.tf"), "x").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn release_dir_is_idempotent() {
        let base = TempDir::new().unwrap();
        let target = base.path().join("gone");
        std::fs::create_dir(&target).unwrap();
        release_dir(&target).unwrap();
        release_dir(&target).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn create_makes_missing_base_dir() {
        let base = TempDir::new().unwrap();
        let nested = base.path().join("a").join("b");
        let ws = Workspace::create(&nested, GitAuth::none()).unwrap();
        assert!(ws.path().starts_with(&nested));
    }
}
