//! [`PlanningTool`] backed by the `terraform` executable.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::planner::PlanningTool;
use crate::process::{ToolOutput, args, run_command};

#[derive(Debug, Clone)]
pub struct TerraformCli {
    program: String,
    timeout: Option<Duration>,
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new("terraform")
    }
}

impl TerraformCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, dir: &Path, env: &[(String, String)], argv: Vec<String>) -> Result<ToolOutput> {
        let mut env = env.to_vec();
        env.push(("TF_IN_AUTOMATION".into(), "1".into()));
        env.push(("TF_INPUT".into(), "0".into()));
        tracing::debug!(args = ?argv, "running terraform");
        run_command(&self.program, &argv, dir, &env, self.timeout).await
    }
}

#[async_trait]
impl PlanningTool for TerraformCli {
    fn name(&self) -> &str {
        "terraform"
    }

    async fn init(&self, dir: &Path, env: &[(String, String)]) -> Result<ToolOutput> {
        self.run(dir, env, args(["init", "-upgrade", "-input=false", "-no-color"]))
            .await
    }

    async fn plan(
        &self,
        dir: &Path,
        env: &[(String, String)],
        plan_file: &str,
    ) -> Result<ToolOutput> {
        self.run(
            dir,
            env,
            args([
                "plan",
                "-no-color",
                "-input=false",
                &format!("-out={plan_file}"),
            ]),
        )
        .await
    }

    async fn show_json(
        &self,
        dir: &Path,
        env: &[(String, String)],
        plan_file: &str,
    ) -> Result<ToolOutput> {
        self.run(dir, env, args(["show", "-json", "-no-color", plan_file]))
            .await
    }
}
