mod config;
mod conversation_cmds;
mod serve_cmd;
mod services;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use config::{CliOverrides, PrismConfig};
use conversation_cmds::TargetArgs;

#[derive(Parser)]
#[command(
    name = "prism",
    version,
    about = "Conversation-driven terraform planning service"
)]
struct Cli {
    /// Directory for temporary workspaces (overrides PRISM_WORKSPACE_DIR)
    #[arg(long, global = true)]
    workspace_dir: Option<PathBuf>,

    /// Keep state in this directory instead of S3 (overrides PRISM_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a prism config file
    Init {
        /// Infisical machine identity client id
        #[arg(long)]
        vault_client_id: Option<String>,
        /// Infisical machine identity client secret
        #[arg(long)]
        vault_client_secret: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the HTTP API
    Serve {
        /// Address to bind (overrides PRISM_BIND)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides PRISM_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Upload files to a conversation branch and plan it; plans the default
    /// branch when no conversation is given
    Plan {
        /// Conversation id (branch name)
        conversation: Option<String>,
        /// Files to upload, relative to the repository root
        files: Vec<PathBuf>,
        /// Upload every .tf file under this directory
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Commit message
        #[arg(long, short)]
        message: Option<String>,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Ask the model to change a conversation branch, then plan it
    Chat {
        conversation: String,
        message: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// List the terraform files on a conversation branch
    Files {
        conversation: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Open a GitHub pull request from a conversation branch
    Pr {
        conversation: String,
        /// Base branch (default: main)
        #[arg(long)]
        base: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        body: Option<String>,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Drop a commit and everything after it from a conversation branch
    DeleteCommit {
        conversation: String,
        commit: String,
        #[command(flatten)]
        target: TargetArgs,
    },
}

/// Execute the `prism init` command: write config file.
fn cmd_init(
    vault_client_id: Option<String>,
    vault_client_secret: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut cfg = config::ConfigFile::default();
    cfg.server.bind = Some(config::DEFAULT_BIND.to_string());
    cfg.server.port = Some(config::DEFAULT_PORT);
    cfg.vault.client_id = vault_client_id;
    cfg.vault.client_secret = vault_client_secret;

    let path = config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    if cfg.vault.client_id.is_none() {
        println!("  vault.client_id is unset; secret fetches need INFISICAL_CLIENT_ID.");
    }
    println!();
    println!("Next: run `prism serve`.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut overrides = CliOverrides {
        workspace_dir: cli.workspace_dir,
        state_dir: cli.state_dir,
        ..Default::default()
    };

    match cli.command {
        Commands::Init {
            vault_client_id,
            vault_client_secret,
            force,
        } => {
            cmd_init(vault_client_id, vault_client_secret, force)?;
        }
        Commands::Serve { bind, port } => {
            overrides.bind = bind;
            overrides.port = port;
            let resolved = PrismConfig::resolve(&overrides)?;
            let workflow = services::build_workflow(&resolved)?;
            serve_cmd::run_serve(workflow, &resolved.bind, resolved.port).await?;
        }
        Commands::Plan {
            conversation,
            files,
            dir,
            message,
            target,
        } => {
            let changes = conversation_cmds::collect_files(dir.as_deref(), &files)?;
            let workflow = services::build_workflow(&PrismConfig::resolve(&overrides)?)?;
            conversation_cmds::run_plan(&workflow, conversation, target, changes, message).await?;
        }
        Commands::Chat {
            conversation,
            message,
            target,
        } => {
            let workflow = services::build_workflow(&PrismConfig::resolve(&overrides)?)?;
            conversation_cmds::run_chat(&workflow, conversation, target, message).await?;
        }
        Commands::Files {
            conversation,
            target,
        } => {
            let workflow = services::build_workflow(&PrismConfig::resolve(&overrides)?)?;
            conversation_cmds::run_files(&workflow, conversation, target).await?;
        }
        Commands::Pr {
            conversation,
            base,
            title,
            body,
            target,
        } => {
            let workflow = services::build_workflow(&PrismConfig::resolve(&overrides)?)?;
            conversation_cmds::run_pr(&workflow, conversation, target, base, title, body).await?;
        }
        Commands::DeleteCommit {
            conversation,
            commit,
            target,
        } => {
            let workflow = services::build_workflow(&PrismConfig::resolve(&overrides)?)?;
            conversation_cmds::run_delete_commit(&workflow, conversation, commit, target).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that read or write process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
