//! S3-compatible object store (MinIO, AWS) using path-style addressing and
//! SigV4-signed requests.

use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::Deserialize;
use url::Url;

use prism_core::error::{RemoteServiceError, Service};
use prism_core::state::{Bucket, ObjectStore};

use crate::sigv4::{self, Credentials, SignableRequest};
use crate::{http_client, transport_error};

const SERVICE: &str = "s3";

/// Connection settings for an S3-compatible endpoint.
#[derive(Clone)]
pub struct S3Config {
    /// `host:port`, without a scheme, e.g. `minio:9000`.
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub use_ssl: bool,
    pub region: String,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("use_ssl", &self.use_ssl)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListAllMyBucketsResult {
    #[serde(default)]
    buckets: BucketList,
}

#[derive(Debug, Default, Deserialize)]
struct BucketList {
    #[serde(rename = "Bucket", default)]
    bucket: Vec<BucketEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BucketEntry {
    name: String,
    #[serde(default)]
    creation_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct S3ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

fn parse_bucket_list(xml: &str) -> Result<Vec<Bucket>, RemoteServiceError> {
    let result: ListAllMyBucketsResult = quick_xml::de::from_str(xml).map_err(|e| {
        RemoteServiceError::new(
            Service::ObjectStore,
            None,
            format!("invalid ListBuckets response: {e}"),
        )
    })?;
    Ok(result
        .buckets
        .bucket
        .into_iter()
        .map(|b| Bucket {
            name: b.name,
            created_at: b.creation_date,
        })
        .collect())
}

/// `Code: Message` from an S3 error document, or the raw body.
fn error_message(status: u16, body: &str) -> String {
    match quick_xml::de::from_str::<S3ErrorBody>(body) {
        Ok(err) if err.message.is_empty() => err.code,
        Ok(err) => format!("{}: {}", err.code, err.message),
        Err(_) if body.trim().is_empty() => format!("HTTP {status}"),
        Err(_) => body.trim().to_string(),
    }
}

pub struct S3ObjectStore {
    http: reqwest::Client,
    base: Url,
    /// Value of the `Host` header as reqwest will send it.
    host: String,
    credentials: Credentials,
    region: String,
}

impl fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("base", &self.base.as_str())
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3ObjectStore {
    pub fn new(config: S3Config) -> Result<Self, RemoteServiceError> {
        let scheme = if config.use_ssl { "https" } else { "http" };
        let endpoint = config
            .endpoint
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/');
        let base = Url::parse(&format!("{scheme}://{endpoint}")).map_err(|e| {
            RemoteServiceError::new(
                Service::ObjectStore,
                None,
                format!("invalid endpoint {:?}: {e}", config.endpoint),
            )
        })?;
        let host = match (base.host_str(), base.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(RemoteServiceError::new(
                    Service::ObjectStore,
                    None,
                    format!("endpoint {:?} has no host", config.endpoint),
                ));
            }
        };
        Ok(Self {
            http: http_client(),
            base,
            host,
            credentials: Credentials {
                access_key_id: config.access_key_id,
                secret_access_key: config.secret_access_key,
            },
            region: config.region,
        })
    }

    fn path(bucket: Option<&str>, object: Option<&str>) -> String {
        let mut path = String::from("/");
        if let Some(bucket) = bucket {
            path.push_str(&sigv4::uri_encode(bucket, false));
            if let Some(object) = object {
                path.push('/');
                path.push_str(&sigv4::uri_encode(object, true));
            }
        }
        path
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, RemoteServiceError> {
        let now = Utc::now();
        let payload_sha256 = sigv4::sha256_hex(&body);
        let amz_date = sigv4::amz_date(now);
        let authorization = sigv4::authorization(
            &SignableRequest {
                method: method.as_str(),
                path,
                query: &[],
                headers: &[
                    ("host", &self.host),
                    ("x-amz-content-sha256", &payload_sha256),
                    ("x-amz-date", &amz_date),
                ],
                payload_sha256: &payload_sha256,
            },
            &self.credentials,
            &self.region,
            SERVICE,
            now,
        );

        let mut url = self.base.clone();
        url.set_path(path);
        tracing::debug!(%method, path, "s3 request");
        self.http
            .request(method, url)
            .header("x-amz-content-sha256", &payload_sha256)
            .header("x-amz-date", &amz_date)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(Service::ObjectStore, e))
    }

    async fn failure(response: reqwest::Response) -> RemoteServiceError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        RemoteServiceError::new(
            Service::ObjectStore,
            Some(status),
            error_message(status, &body),
        )
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_buckets(&self) -> Result<Vec<Bucket>, RemoteServiceError> {
        let response = self.send(Method::GET, &Self::path(None, None), Vec::new()).await?;
        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(Service::ObjectStore, e))?;
        parse_bucket_list(&body)
    }

    async fn create_bucket(&self, name: &str) -> Result<(), RemoteServiceError> {
        let body = if self.region.is_empty() || self.region == "us-east-1" {
            Vec::new()
        } else {
            format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.region
            )
            .into_bytes()
        };
        let response = self
            .send(Method::PUT, &Self::path(Some(name), None), body)
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let err = Self::failure(response).await;
        if err.message.starts_with("BucketAlreadyOwnedByYou") {
            return Ok(());
        }
        Err(err)
    }

    async fn get_object(&self, bucket: &str, object: &str) -> Result<Vec<u8>, RemoteServiceError> {
        let response = self
            .send(Method::GET, &Self::path(Some(bucket), Some(object)), Vec::new())
            .await?;
        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(Service::ObjectStore, e))?;
        Ok(bytes.to_vec())
    }

    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        body: Vec<u8>,
    ) -> Result<(), RemoteServiceError> {
        let response = self
            .send(Method::PUT, &Self::path(Some(bucket), Some(object)), body)
            .await?;
        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str, use_ssl: bool) -> S3Config {
        S3Config {
            endpoint: endpoint.into(),
            access_key_id: "minio-admin".into(),
            secret_access_key: "minio-admin-password".into(),
            use_ssl,
            region: "us-east-1".into(),
        }
    }

    #[test]
    fn parses_bucket_listing() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListAllMyBucketsResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Owner><ID>02d6176db174dc93cb1b899f7c6078f08654445fe8cf1b6ce98d8855f66bdbf4</ID><DisplayName>minio</DisplayName></Owner>
  <Buckets>
    <Bucket><Name>user-1</Name><CreationDate>2024-05-01T10:00:00.000Z</CreationDate></Bucket>
    <Bucket><Name>user-2</Name><CreationDate>2024-05-02T10:00:00.000Z</CreationDate></Bucket>
  </Buckets>
</ListAllMyBucketsResult>"#;
        let buckets = parse_bucket_list(xml).unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].name, "user-1");
        assert_eq!(
            buckets[1].created_at.as_deref(),
            Some("2024-05-02T10:00:00.000Z")
        );
    }

    #[test]
    fn parses_empty_bucket_listing() {
        let xml = r#"<ListAllMyBucketsResult><Owner><ID>x</ID></Owner><Buckets></Buckets></ListAllMyBucketsResult>"#;
        assert!(parse_bucket_list(xml).unwrap().is_empty());
    }

    #[test]
    fn formats_error_documents() {
        let xml = "<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>";
        assert_eq!(
            error_message(404, xml),
            "NoSuchKey: The specified key does not exist."
        );
        assert_eq!(error_message(404, ""), "HTTP 404");
        assert_eq!(error_message(502, "bad gateway"), "bad gateway");
    }

    #[test]
    fn host_keeps_explicit_port() {
        let store = S3ObjectStore::new(config("minio:9000", false)).unwrap();
        assert_eq!(store.host, "minio:9000");
        assert_eq!(store.base.as_str(), "http://minio:9000/");

        let store = S3ObjectStore::new(config("s3.amazonaws.com", true)).unwrap();
        assert_eq!(store.host, "s3.amazonaws.com");
        assert_eq!(store.base.scheme(), "https");
    }

    #[test]
    fn paths_are_path_style_and_encoded() {
        assert_eq!(S3ObjectStore::path(None, None), "/");
        assert_eq!(S3ObjectStore::path(Some("user-1"), None), "/user-1");
        assert_eq!(
            S3ObjectStore::path(Some("user-1"), Some("env/terraform state")),
            "/user-1/env/terraform%20state"
        );
    }
}
