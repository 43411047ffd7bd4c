//! HTTP implementations of prism's remote collaborators.
//!
//! | client | capability |
//! |--------|------------|
//! | [`InfisicalClient`] | [`VaultClient`](prism_core::secrets::VaultClient) |
//! | [`S3ObjectStore`] | [`ObjectStore`](prism_core::state::ObjectStore) |
//! | [`OpenRouterClient`] | [`ModelClient`](prism_core::remote::ModelClient) |
//! | [`GitHubClient`] | [`GitHost`](prism_core::remote::GitHost) |

pub mod github;
pub mod infisical;
pub mod openrouter;
pub mod s3;
pub mod sigv4;

use std::time::Duration;

use prism_core::error::{RemoteServiceError, Service};

pub use github::GitHubClient;
pub use infisical::InfisicalClient;
pub use openrouter::OpenRouterClient;
pub use s3::{S3Config, S3ObjectStore};

/// Request timeout applied to every client.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .user_agent(concat!("prism/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Convert a transport-level failure.
pub(crate) fn transport_error(service: Service, err: reqwest::Error) -> RemoteServiceError {
    RemoteServiceError::new(service, err.status().map(|s| s.as_u16()), err.to_string())
}

/// Turn a non-success response into an error carrying its status and body.
pub(crate) async fn status_error(service: Service, response: reqwest::Response) -> RemoteServiceError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        body.trim().to_string()
    };
    RemoteServiceError::new(service, Some(status), message)
}

/// Strip a trailing slash so paths can be appended with `format!`.
pub(crate) fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
