//! Driving the IaC planning tool: init, plan, render the plan as JSON.

pub mod terraform;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::process::ToolOutput;
use crate::secrets::InjectedSecrets;

pub use terraform::TerraformCli;

/// Name of the binary plan file written by [`PlanningTool::plan`].
pub const PLAN_FILE: &str = "tfplan";

/// A planning tool run inside a workspace with an explicit extra
/// environment.
#[async_trait]
pub trait PlanningTool: Send + Sync {
    /// Short name used in diagnostics, e.g. `terraform`.
    fn name(&self) -> &str;

    /// Initialize providers and modules. Safe to repeat.
    async fn init(&self, dir: &Path, env: &[(String, String)]) -> Result<ToolOutput>;

    /// Write a binary plan to `plan_file`.
    async fn plan(&self, dir: &Path, env: &[(String, String)], plan_file: &str)
    -> Result<ToolOutput>;

    /// Render `plan_file` as JSON on stdout.
    async fn show_json(
        &self,
        dir: &Path,
        env: &[(String, String)],
        plan_file: &str,
    ) -> Result<ToolOutput>;
}

// Compile-time assertion: PlanningTool must be usable as `dyn PlanningTool`.
const _: () = {
    fn _assert_object_safe(_: &dyn PlanningTool) {}
};

#[derive(Clone)]
pub struct PlanExecutor {
    tool: Arc<dyn PlanningTool>,
}

impl fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("tool", &self.tool.name())
            .finish()
    }
}

impl PlanExecutor {
    pub fn new(tool: Arc<dyn PlanningTool>) -> Self {
        Self { tool }
    }

    /// Run init, plan, and show-as-JSON in `dir`, returning the parsed plan.
    ///
    /// `secrets` become the tool's extra environment. A non-zero exit at
    /// any stage is [`Error::PlanExecution`]; unparseable JSON is
    /// [`Error::PlanDecode`].
    pub async fn plan(&self, dir: &Path, secrets: &InjectedSecrets) -> Result<serde_json::Value> {
        let env = secrets.env_pairs();
        let name = self.tool.name();

        tracing::info!(tool = name, "initializing");
        let out = self.tool.init(dir, &env).await?;
        self.check(&out, "init")?;

        tracing::info!(tool = name, "planning");
        let out = self.tool.plan(dir, &env, PLAN_FILE).await?;
        self.check(&out, "plan")?;

        let out = self.tool.show_json(dir, &env, PLAN_FILE).await?;
        self.check(&out, "show")?;

        let plan: serde_json::Value =
            serde_json::from_str(&out.stdout).map_err(|source| Error::PlanDecode { source })?;
        tracing::info!(tool = name, "plan rendered");
        Ok(plan)
    }

    fn check(&self, out: &ToolOutput, stage: &str) -> Result<()> {
        if out.success() {
            return Ok(());
        }
        Err(Error::PlanExecution {
            stage: format!("{} {stage}", self.tool.name()),
            output: out.combined(),
        })
    }
}
