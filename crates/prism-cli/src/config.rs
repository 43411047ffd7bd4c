//! Configuration file management for prism.
//!
//! Provides a TOML-based config file at `~/.config/prism/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use prism_clients::S3Config;
use prism_clients::infisical::DEFAULT_SITE_URL;
use prism_clients::openrouter::DEFAULT_MODEL;
use prism_core::git::{BranchPolicy, GitIdentity};
use prism_core::state::DEFAULT_STATE_PATH;

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 1323;
const DEFAULT_MINIO_ENDPOINT: &str = "minio:9000";
const DEFAULT_MINIO_ACCESS_KEY: &str = "minio-admin";
const DEFAULT_MINIO_SECRET_KEY: &str = "minio-admin-password";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_WORKSPACE_DIR: &str = "/var/tmp";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

/// On-disk config. Every field is optional; missing ones fall through to
/// the defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub vault: VaultSection,
    pub object_store: ObjectStoreSection,
    pub model: ModelSection,
    pub git: GitSection,
    pub workspace: WorkspaceSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSection {
    pub site_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub environment: Option<String>,
    pub secret_path: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreSection {
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub use_ssl: Option<bool>,
    pub region: Option<String>,
    /// Use a local directory instead of S3.
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub api_key: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSection {
    pub name: Option<String>,
    pub email: Option<String>,
    pub branch_policy: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSection {
    pub dir: Option<PathBuf>,
    pub command_timeout_secs: Option<u64>,
    pub terraform_bin: Option<String>,
    pub state_path: Option<PathBuf>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the prism config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/prism` or `~/.config/prism`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("prism");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("prism")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(path)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values that can be given on the command line.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub workspace_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum ObjectStoreConfig {
    S3(S3Config),
    Filesystem(PathBuf),
}

#[derive(Clone)]
pub struct VaultConfig {
    pub site_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("site_url", &self.site_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct PrismConfig {
    pub bind: String,
    pub port: u16,
    pub vault: VaultConfig,
    pub secret_environment: String,
    pub secret_path: String,
    pub object_store: ObjectStoreConfig,
    pub model_api_key: Option<String>,
    pub model_name: String,
    pub workspace_dir: PathBuf,
    pub command_timeout: Option<Duration>,
    pub terraform_bin: String,
    pub state_path: PathBuf,
    pub git_identity: GitIdentity,
    pub branch_policy: BranchPolicy,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// CLI > env > file > default for string settings.
fn pick(cli: Option<String>, env: &str, file: Option<String>, default: &str) -> String {
    cli.or_else(|| env_var(env))
        .or(file)
        .unwrap_or_else(|| default.to_string())
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{name} must be true or false, got {other:?}"),
    }
}

impl PrismConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = match load_config() {
            Ok(file) => file,
            Err(e) if config_path().exists() => return Err(e),
            Err(_) => ConfigFile::default(),
        };
        Self::resolve_with(cli, file)
    }

    pub fn resolve_with(cli: &CliOverrides, file: ConfigFile) -> Result<Self> {
        let ConfigFile {
            server,
            vault,
            object_store,
            model,
            git,
            workspace,
        } = file;

        let bind = pick(cli.bind.clone(), "PRISM_BIND", server.bind, DEFAULT_BIND);
        let port = match (cli.port, env_var("PRISM_PORT")) {
            (Some(port), _) => port,
            (None, Some(raw)) => raw
                .parse()
                .with_context(|| format!("PRISM_PORT is not a valid port: {raw:?}"))?,
            (None, None) => server.port.unwrap_or(DEFAULT_PORT),
        };

        let state_dir = cli
            .state_dir
            .clone()
            .or_else(|| env_var("PRISM_STATE_DIR").map(PathBuf::from))
            .or(object_store.state_dir);
        let object_store = match state_dir {
            Some(dir) => ObjectStoreConfig::Filesystem(dir),
            None => {
                let use_ssl = match env_var("MINIO_USE_SSL") {
                    Some(raw) => parse_bool("MINIO_USE_SSL", &raw)?,
                    None => object_store.use_ssl.unwrap_or(false),
                };
                ObjectStoreConfig::S3(S3Config {
                    endpoint: pick(
                        None,
                        "MINIO_ENDPOINT",
                        object_store.endpoint,
                        DEFAULT_MINIO_ENDPOINT,
                    ),
                    access_key_id: pick(
                        None,
                        "MINIO_ACCESS_KEY_ID",
                        object_store.access_key_id,
                        DEFAULT_MINIO_ACCESS_KEY,
                    ),
                    secret_access_key: pick(
                        None,
                        "MINIO_SECRET_ACCESS_KEY",
                        object_store.secret_access_key,
                        DEFAULT_MINIO_SECRET_KEY,
                    ),
                    use_ssl,
                    region: pick(None, "MINIO_REGION", object_store.region, DEFAULT_REGION),
                })
            }
        };

        let command_timeout = match env_var("PRISM_COMMAND_TIMEOUT_SECS") {
            Some(raw) => Some(raw.parse::<u64>().with_context(|| {
                format!("PRISM_COMMAND_TIMEOUT_SECS is not a number: {raw:?}")
            })?),
            None => workspace.command_timeout_secs,
        }
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

        let branch_policy = pick(
            None,
            "PRISM_BRANCH_POLICY",
            git.branch_policy,
            &BranchPolicy::default().to_string(),
        )
        .parse::<BranchPolicy>()
        .map_err(anyhow::Error::msg)?;

        let default_identity = GitIdentity::default();

        Ok(Self {
            bind,
            port,
            vault: VaultConfig {
                site_url: pick(None, "INFISICAL_SITE_URL", vault.site_url, DEFAULT_SITE_URL),
                client_id: env_var("INFISICAL_CLIENT_ID").or(vault.client_id),
                client_secret: env_var("INFISICAL_CLIENT_SECRET").or(vault.client_secret),
            },
            secret_environment: pick(None, "PRISM_SECRET_ENVIRONMENT", vault.environment, "dev"),
            secret_path: pick(None, "PRISM_SECRET_PATH", vault.secret_path, "/"),
            object_store,
            model_api_key: env_var("OPENROUTER_API_KEY").or(model.api_key),
            model_name: pick(None, "PRISM_MODEL", model.name, DEFAULT_MODEL),
            workspace_dir: cli
                .workspace_dir
                .clone()
                .or_else(|| env_var("PRISM_WORKSPACE_DIR").map(PathBuf::from))
                .or(workspace.dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_DIR)),
            command_timeout,
            terraform_bin: pick(None, "PRISM_TERRAFORM_BIN", workspace.terraform_bin, "terraform"),
            state_path: workspace
                .state_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH)),
            git_identity: GitIdentity {
                name: pick(None, "PRISM_GIT_NAME", git.name, &default_identity.name),
                email: pick(None, "PRISM_GIT_EMAIL", git.email, &default_identity.email),
            },
            branch_policy,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
