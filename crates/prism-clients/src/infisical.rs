//! Infisical secret vault over its REST API.
//!
//! Authenticates with a machine identity (universal auth) and caches the
//! access token until shortly before it expires. A 401 from the secrets
//! endpoint drops the cached token so the next call logs in again.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use prism_core::error::{RemoteServiceError, Service};
use prism_core::model::SecretSet;
use prism_core::secrets::{SecretListing, SecretScope, VaultClient};

use crate::{http_client, status_error, transport_error, trim_base};

/// Renew this long before the reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

pub const DEFAULT_SITE_URL: &str = "http://infisical-backend:8080";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    /// Seconds until the token expires.
    #[serde(default)]
    expires_in: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSecret {
    secret_key: String,
    #[serde(default)]
    secret_value: String,
}

#[derive(Deserialize)]
struct RawSecretsResponse {
    #[serde(default)]
    secrets: Vec<RawSecret>,
}

struct CachedToken {
    value: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() + EXPIRY_MARGIN < at)
    }
}

/// Outcome of a login attempt that reached the server.
enum Login {
    Token(String),
    Rejected(SecretListing),
}

pub struct InfisicalClient {
    http: reqwest::Client,
    site_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for InfisicalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfisicalClient")
            .field("site_url", &self.site_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl InfisicalClient {
    pub fn new(
        site_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: http_client(),
            site_url: trim_base(&site_url.into()),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
        }
    }

    async fn login(&self) -> Result<Login, RemoteServiceError> {
        let url = format!("{}/api/v1/auth/universal-auth/login", self.site_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "clientId": self.client_id,
                "clientSecret": self.client_secret,
            }))
            .send()
            .await
            .map_err(|e| transport_error(Service::Vault, e))?;

        if !response.status().is_success() {
            let err = status_error(Service::Vault, response).await;
            tracing::warn!(status = ?err.status, "vault login rejected");
            return Ok(Login::Rejected(SecretListing::failed(
                err.status.unwrap_or(500),
                format!("authentication failed: {}", err.message),
            )));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Service::Vault, e))?;
        let expires_at =
            (body.expires_in > 0).then(|| Instant::now() + Duration::from_secs(body.expires_in));
        *self.token.lock().await = Some(CachedToken {
            value: body.access_token.clone(),
            expires_at,
        });
        tracing::debug!(expires_in = body.expires_in, "vault login succeeded");
        Ok(Login::Token(body.access_token))
    }

    async fn access_token(&self) -> Result<Login, RemoteServiceError> {
        if let Some(cached) = self.token.lock().await.as_ref().filter(|t| t.is_fresh()) {
            return Ok(Login::Token(cached.value.clone()));
        }
        self.login().await
    }
}

#[async_trait]
impl VaultClient for InfisicalClient {
    async fn list_secrets(&self, scope: &SecretScope) -> Result<SecretListing, RemoteServiceError> {
        let token = match self.access_token().await? {
            Login::Token(token) => token,
            Login::Rejected(listing) => return Ok(listing),
        };

        let url = format!("{}/api/v3/secrets/raw", self.site_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .query(&[
                ("workspaceId", scope.project_id.as_str()),
                ("environment", scope.environment.as_str()),
                ("secretPath", scope.path.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(Service::Vault, e))?;

        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                self.token.lock().await.take();
            }
            let err = status_error(Service::Vault, response).await;
            return Ok(SecretListing::failed(status.as_u16(), err.message));
        }

        let body: RawSecretsResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Service::Vault, e))?;
        let values: SecretSet = body
            .secrets
            .into_iter()
            .map(|s| (s.secret_key, s.secret_value))
            .collect();
        Ok(SecretListing {
            values,
            status_code: status.as_u16(),
            error: String::new(),
        })
    }
}
