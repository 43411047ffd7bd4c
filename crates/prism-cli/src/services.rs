//! Builds the workflow from resolved configuration with the real
//! subprocess and HTTP collaborators.

use std::sync::Arc;

use anyhow::{Context, Result};

use prism_clients::{GitHubClient, InfisicalClient, OpenRouterClient, S3ObjectStore};
use prism_core::git::GitCli;
use prism_core::planner::TerraformCli;
use prism_core::remote::ModelClient;
use prism_core::state::{FsObjectStore, ObjectStore};
use prism_core::{Collaborators, ConversationWorkflow, WorkflowConfig};

use crate::config::{ObjectStoreConfig, PrismConfig};

pub fn build_workflow(config: &PrismConfig) -> Result<ConversationWorkflow> {
    std::fs::create_dir_all(&config.workspace_dir).with_context(|| {
        format!(
            "failed to create workspace directory {}",
            config.workspace_dir.display()
        )
    })?;

    let object_store: Arc<dyn ObjectStore> = match &config.object_store {
        ObjectStoreConfig::Filesystem(dir) => {
            tracing::info!(dir = %dir.display(), "using filesystem object store");
            Arc::new(FsObjectStore::new(dir.clone()))
        }
        ObjectStoreConfig::S3(s3) => {
            tracing::info!(endpoint = %s3.endpoint, "using S3 object store");
            Arc::new(S3ObjectStore::new(s3.clone()).context("invalid object store endpoint")?)
        }
    };

    let (client_id, client_secret) = match (&config.vault.client_id, &config.vault.client_secret) {
        (Some(id), Some(secret)) => (id.clone(), secret.clone()),
        _ => {
            tracing::warn!(
                "INFISICAL_CLIENT_ID / INFISICAL_CLIENT_SECRET not set; secret fetches will fail"
            );
            (String::new(), String::new())
        }
    };
    let vault = InfisicalClient::new(config.vault.site_url.clone(), client_id, client_secret);

    let model = config.model_api_key.as_ref().map(|key| {
        Arc::new(OpenRouterClient::new(key.clone(), config.model_name.clone()))
            as Arc<dyn ModelClient>
    });
    if model.is_none() {
        tracing::info!("OPENROUTER_API_KEY not set; chat requests will fail");
    }

    let collaborators = Collaborators {
        version_control: Arc::new(
            GitCli::new()
                .with_identity(config.git_identity.clone())
                .with_timeout(config.command_timeout),
        ),
        planning_tool: Arc::new(
            TerraformCli::new(config.terraform_bin.clone()).with_timeout(config.command_timeout),
        ),
        object_store,
        vault: Arc::new(vault),
        model,
        git_host: Some(Arc::new(GitHubClient::new())),
    };

    let workflow_config = WorkflowConfig {
        workspace_dir: config.workspace_dir.clone(),
        branch_policy: config.branch_policy,
        state_path: config.state_path.clone(),
        secret_environment: config.secret_environment.clone(),
        secret_path: config.secret_path.clone(),
    };

    Ok(ConversationWorkflow::new(workflow_config, collaborators))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, ConfigFile};

    #[test]
    fn builds_with_filesystem_store() {
        let _lock = crate::test_util::lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let cli = CliOverrides {
            workspace_dir: Some(tmp.path().join("ws")),
            state_dir: Some(tmp.path().join("state")),
            ..Default::default()
        };
        let config = PrismConfig::resolve_with(&cli, ConfigFile::default()).unwrap();

        let workflow = build_workflow(&config).unwrap();

        assert_eq!(workflow.config().workspace_dir, tmp.path().join("ws"));
        assert!(tmp.path().join("ws").is_dir());
    }
}
