//! Infrastructure state persistence through an object store.
//!
//! The object store is the source of truth for a tenant's state blob; the
//! file inside the workspace is a disposable working copy. Before planning
//! [`StateSynchronizer::restore`] makes the local file reflect the stored
//! blob (or creates an empty placeholder), and after a successful plan
//! [`StateSynchronizer::persist`] uploads it back.

pub mod fs_store;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, RemoteServiceError, Result};

pub use fs_store::FsObjectStore;

/// Object name of the state blob inside a tenant bucket.
pub const STATE_OBJECT_NAME: &str = "terraform.tfstate";

/// Location of the state file relative to the workspace root; the planning
/// tool's local backend reads it from here.
pub const DEFAULT_STATE_PATH: &str = "terraform.tfstate";

/// Shortest and longest bucket names accepted by S3-compatible stores.
const BUCKET_NAME_MIN: usize = 3;
const BUCKET_NAME_MAX: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    /// Creation timestamp as reported by the store, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Bucket {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: None,
        }
    }
}

/// Named blobs in named buckets.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<Bucket>, RemoteServiceError>;

    async fn create_bucket(&self, name: &str) -> Result<(), RemoteServiceError>;

    /// Fetch an object's bytes. A missing object is reported with status 404.
    async fn get_object(&self, bucket: &str, object: &str) -> Result<Vec<u8>, RemoteServiceError>;

    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        body: Vec<u8>,
    ) -> Result<(), RemoteServiceError>;

    /// Look the bucket up by name and create it only if it is missing.
    async fn get_or_create_bucket(&self, name: &str) -> Result<Bucket, RemoteServiceError> {
        if let Some(bucket) = self.list_buckets().await?.into_iter().find(|b| b.name == name) {
            return Ok(bucket);
        }
        tracing::info!(bucket = name, "creating bucket");
        self.create_bucket(name).await?;
        Ok(self
            .list_buckets()
            .await?
            .into_iter()
            .find(|b| b.name == name)
            .unwrap_or_else(|| Bucket::named(name)))
    }
}

// Compile-time assertion: ObjectStore must be usable as `dyn ObjectStore`.
const _: () = {
    fn _assert_object_safe(_: &dyn ObjectStore) {}
};

/// Derive the per-user bucket name.
///
/// Lower-cases the id, replaces anything outside `[a-z0-9.-]` with `-`,
/// trims separators from both ends and pads/truncates to the length limits.
pub fn bucket_name_for(user_id: &str) -> String {
    let mapped: String = user_id
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut name: String = mapped
        .trim_matches(|c| c == '-' || c == '.')
        .chars()
        .take(BUCKET_NAME_MAX)
        .collect();
    while name.len() < BUCKET_NAME_MIN {
        name.push('0');
    }
    name
}

/// What [`StateSynchronizer::restore`] found in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Downloaded { bytes: usize },
    /// No usable blob; a zero-length placeholder was written.
    CreatedEmpty,
}

#[derive(Clone)]
pub struct StateSynchronizer {
    store: Arc<dyn ObjectStore>,
    object_name: String,
    state_path: PathBuf,
}

impl fmt::Debug for StateSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSynchronizer")
            .field("object_name", &self.object_name)
            .field("state_path", &self.state_path)
            .finish()
    }
}

impl StateSynchronizer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            object_name: STATE_OBJECT_NAME.into(),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
        }
    }

    /// Override where the state file lives inside the workspace.
    pub fn with_state_path(mut self, state_path: impl Into<PathBuf>) -> Self {
        self.state_path = state_path.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Absolute state file path inside `ws_root`.
    pub fn local_path(&self, ws_root: &Path) -> PathBuf {
        ws_root.join(&self.state_path)
    }

    /// Resolve (creating if needed) the bucket for `user_id`.
    pub async fn get_or_create_bucket(&self, user_id: &str) -> Result<Bucket> {
        let name = bucket_name_for(user_id);
        let bucket = self.store.get_or_create_bucket(&name).await?;
        tracing::debug!(bucket = %bucket.name, "resolved state bucket");
        Ok(bucket)
    }

    /// Make the local state file reflect the stored blob.
    ///
    /// Any download failure (most commonly a missing object on a brand-new
    /// project) yields an empty placeholder instead of an error, truncating
    /// whatever the workspace held before.
    ///
    /// This includes transient failures such as a 5xx from the store. The
    /// planning tool does not rewrite the state file, so a later
    /// [`persist`](Self::persist) uploads the empty placeholder over the
    /// stored blob and the previous state is lost.
    pub async fn restore(&self, bucket: &Bucket, ws_root: &Path) -> Result<RestoreOutcome> {
        let path = self.local_path(ws_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io_at("create", parent, e))?;
        }

        let (body, outcome) = match self.store.get_object(&bucket.name, &self.object_name).await {
            Ok(body) => {
                let bytes = body.len();
                (body, RestoreOutcome::Downloaded { bytes })
            }
            Err(err) => {
                if err.is_not_found() {
                    tracing::info!(bucket = %bucket.name, "no stored state, starting empty");
                } else {
                    tracing::warn!(bucket = %bucket.name, error = %err, "state download failed, starting empty");
                }
                (Vec::new(), RestoreOutcome::CreatedEmpty)
            }
        };

        std::fs::write(&path, body).map_err(|e| Error::io_at("write", &path, e))?;
        tracing::info!(bucket = %bucket.name, ?outcome, "restored state");
        Ok(outcome)
    }

    /// Upload the local state file to the bucket. Returns the byte count.
    pub async fn persist(&self, bucket: &Bucket, ws_root: &Path) -> Result<usize> {
        let path = self.local_path(ws_root);
        let body = std::fs::read(&path).map_err(|e| Error::io_at("read", &path, e))?;
        let bytes = body.len();
        self.store
            .put_object(&bucket.name, &self.object_name, body)
            .await?;
        tracing::info!(bucket = %bucket.name, bytes, "persisted state");
        Ok(bytes)
    }
}
