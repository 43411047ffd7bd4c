//! Directory-backed [`ObjectStore`] for local development.
//!
//! Buckets are subdirectories of the root; objects are files inside them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{RemoteServiceError, Service};
use crate::state::{Bucket, ObjectStore};

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, RemoteServiceError> {
        check_name(bucket)?;
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, object: &str) -> Result<PathBuf, RemoteServiceError> {
        check_name(object)?;
        Ok(self.bucket_path(bucket)?.join(object))
    }
}

/// Names map directly onto path components, so separators are refused.
fn check_name(name: &str) -> Result<(), RemoteServiceError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(RemoteServiceError::new(
            Service::ObjectStore,
            Some(400),
            format!("invalid name {name:?}"),
        ));
    }
    Ok(())
}

fn io_error(context: String, e: std::io::Error) -> RemoteServiceError {
    let status = (e.kind() == std::io::ErrorKind::NotFound).then_some(404);
    RemoteServiceError::new(Service::ObjectStore, status, format!("{context}: {e}"))
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list_buckets(&self) -> Result<Vec<Bucket>, RemoteServiceError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(format!("list {}", self.root.display()), e)),
        };
        let mut buckets = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(format!("list {}", self.root.display()), e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                buckets.push(Bucket::named(entry.file_name().to_string_lossy()));
            }
        }
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn create_bucket(&self, name: &str) -> Result<(), RemoteServiceError> {
        let dir = self.bucket_path(name)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(format!("create bucket {name}"), e))
    }

    async fn get_object(&self, bucket: &str, object: &str) -> Result<Vec<u8>, RemoteServiceError> {
        let path = self.object_path(bucket, object)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(format!("get {bucket}/{object}"), e))
    }

    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        body: Vec<u8>,
    ) -> Result<(), RemoteServiceError> {
        let path = self.object_path(bucket, object)?;
        if !self.root.join(bucket).is_dir() {
            return Err(RemoteServiceError::new(
                Service::ObjectStore,
                Some(404),
                format!("bucket {bucket} does not exist"),
            ));
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| io_error(format!("put {bucket}/{object}"), e))
    }
}
