//! Secret retrieval for the planning tool's environment.
//!
//! Secrets are fetched per run and handed to the planning subprocess as an
//! explicit environment; the server process's own environment is never
//! modified.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, RemoteServiceError, Result};
use crate::model::SecretSet;

/// Vault coordinates of a secret set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretScope {
    pub environment: String,
    pub project_id: String,
    pub path: String,
}

impl SecretScope {
    pub fn new(
        environment: impl Into<String>,
        project_id: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            project_id: project_id.into(),
            path: path.into(),
        }
    }
}

/// Raw answer of a vault listing. `status_code` and `error` are reported
/// by the upstream and passed through unchanged.
#[derive(Clone, Default)]
pub struct SecretListing {
    pub values: SecretSet,
    pub status_code: u16,
    pub error: String,
}

impl SecretListing {
    pub fn ok(values: SecretSet) -> Self {
        Self {
            values,
            status_code: 200,
            error: String::new(),
        }
    }

    pub fn failed(status_code: u16, error: impl Into<String>) -> Self {
        Self {
            values: SecretSet::new(),
            status_code,
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code) && self.error.is_empty()
    }
}

impl fmt::Debug for SecretListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretListing")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .field("status_code", &self.status_code)
            .field("error", &self.error)
            .finish()
    }
}

#[async_trait]
pub trait VaultClient: Send + Sync {
    /// List the secrets in `scope`.
    ///
    /// Transport failures are an `Err`; upstream rejections come back as a
    /// listing with a non-success status or a non-empty error.
    async fn list_secrets(&self, scope: &SecretScope) -> Result<SecretListing, RemoteServiceError>;
}

// Compile-time assertion: VaultClient must be usable as `dyn VaultClient`.
const _: () = {
    fn _assert_object_safe(_: &dyn VaultClient) {}
};

/// Validated secrets ready to be placed in a child process environment.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct InjectedSecrets {
    values: SecretSet,
}

impl InjectedSecrets {
    /// Validate every pair; one invalid pair rejects the whole set.
    pub fn new(values: SecretSet) -> Result<Self> {
        for (key, value) in &values {
            check_pair(key, value)?;
        }
        Ok(Self { values })
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Key/value pairs for a subprocess environment.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl fmt::Debug for InjectedSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectedSecrets")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Reject a pair that could not be set as an environment variable.
fn check_pair(key: &str, value: &str) -> Result<()> {
    let reason = if key.is_empty() {
        Some("empty key")
    } else if key.contains('=') {
        Some("key contains '='")
    } else if key.contains('\0') {
        Some("key contains NUL")
    } else if value.contains('\0') {
        Some("value contains NUL")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidSecret {
            key: key.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[derive(Clone)]
pub struct SecretInjector {
    vault: Arc<dyn VaultClient>,
}

impl fmt::Debug for SecretInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretInjector").finish_non_exhaustive()
    }
}

impl SecretInjector {
    pub fn new(vault: Arc<dyn VaultClient>) -> Self {
        Self { vault }
    }

    /// Fetch the secrets in `scope` and validate every pair.
    ///
    /// A non-success status or non-empty upstream error becomes
    /// [`Error::SecretFetch`] with both passed through. A single invalid
    /// pair aborts the whole set.
    pub async fn inject(&self, scope: &SecretScope) -> Result<InjectedSecrets> {
        let listing = self.vault.list_secrets(scope).await?;
        if !listing.is_success() {
            return Err(Error::SecretFetch {
                status: listing.status_code,
                message: listing.error,
            });
        }

        let secrets = InjectedSecrets::new(listing.values)?;
        tracing::info!(
            environment = %scope.environment,
            path = %scope.path,
            count = secrets.count(),
            "fetched secrets"
        );
        Ok(secrets)
    }
}
