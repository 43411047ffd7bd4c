//! Subprocess execution with captured output and an optional deadline.
//!
//! Every external tool (git, terraform) runs through [`run_command`] with an
//! explicit working directory and explicit extra environment; nothing here
//! touches the parent process's cwd or environment.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, or `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// A successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, trimmed; used for diagnostics.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (_, true) => stdout.to_string(),
            _ => format!("{stdout}\n{stderr}"),
        }
    }
}

/// Run `program args..` in `dir` with `env` added to the inherited
/// environment, and wait for it to finish.
///
/// When `timeout` is set and expires, the child is killed and
/// [`Error::ToolTimeout`] is returned.
pub async fn run_command(
    program: &str,
    args: &[String],
    dir: &Path,
    env: &[(String, String)],
    timeout: Option<Duration>,
) -> Result<ToolOutput> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| Error::ToolSpawn {
            program: program.to_string(),
            source,
        })?;

    // Drain both pipes while waiting so a chatty child cannot fill a pipe
    // buffer and block forever.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let run = async { tokio::join!(child.wait(), read_stdout, read_stderr) };

    let (status, stdout, stderr) = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(finished) => finished,
            Err(_) => {
                let _ = child.kill().await;
                tracing::warn!(program, secs = limit.as_secs(), "subprocess timed out, killed");
                return Err(Error::ToolTimeout {
                    program: program.to_string(),
                    secs: limit.as_secs(),
                });
            }
        },
        None => run.await,
    };

    let status = status.map_err(|source| Error::ToolSpawn {
        program: program.to_string(),
        source,
    })?;

    Ok(ToolOutput {
        exit_code: status.code(),
        stdout,
        stderr,
    })
}

/// Convenience for building owned argument vectors from literals.
pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
