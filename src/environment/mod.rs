//! Execution environments.
//!
//! A run gets one isolated checkout of the target repository. Agents read,
//! search and edit files there, and gates run commands there. The
//! orchestrator only holds an [`EnvironmentRef`]; a [`Provisioner`] turns
//! that reference back into a live [`Environment`] on every pass.

mod docker;
mod local;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{EnvironmentKind, EnvironmentSection};
use crate::store::Run;

pub use docker::DockerProvisioner;
pub use local::{LocalEnvironment, LocalProvisioner};

/// Maximum number of paths `list_files` returns.
pub const LIST_LIMIT: usize = 500;

/// Serializable handle to a provisioned environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRef {
    pub kind: EnvironmentKind,
    /// Container name, or checkout directory for local environments.
    pub id: String,
    /// Repository root inside the environment.
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    pub(crate) fn timed_out(timeout: Duration) -> Self {
        Self {
            exit_code: 124,
            stdout: String::new(),
            stderr: format!("command timed out after {}s", timeout.as_secs()),
        }
    }
}

/// A live checkout commands and file operations run against.
///
/// Paths are relative to the repository root. A non-zero exit code is a
/// normal [`CommandOutput`]; only failing to run the command at all is an
/// error.
#[async_trait]
pub trait Environment: Send + Sync {
    fn reference(&self) -> &EnvironmentRef;

    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    async fn read_file(&self, path: &str) -> Result<String>;

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    async fn list_files(&self, dir: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the environment for `run` with the target branch checked out.
    /// Calling it again for the same run reuses what exists.
    async fn provision(&self, run: &Run) -> Result<EnvironmentRef>;

    async fn attach(&self, reference: &EnvironmentRef) -> Result<Arc<dyn Environment>>;

    /// Tear the environment down. Releasing twice is not an error.
    async fn release(&self, reference: &EnvironmentRef) -> Result<()>;
}

/// Build the provisioner selected in config.
pub fn provisioner_from_config(config: &EnvironmentSection) -> Result<Arc<dyn Provisioner>> {
    Ok(match config.kind {
        EnvironmentKind::Local => Arc::new(LocalProvisioner::new(config.workspace_root())),
        EnvironmentKind::Docker => Arc::new(DockerProvisioner::new(config.images.clone())?),
    })
}

/// Validate a model-supplied relative path. Absolute paths and parent
/// traversal are refused.
pub fn relative_path(path: &str) -> Result<PathBuf> {
    let trimmed = path.trim();
    let candidate = Path::new(if trimmed.is_empty() { "." } else { trimmed });
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => bail!("path '{}' escapes the repository", path),
            Component::RootDir | Component::Prefix(_) => {
                bail!("path '{}' must be relative to the repository root", path)
            }
        }
    }
    Ok(clean)
}

/// Single-quote `s` for `sh -c`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

pub(crate) async fn run_with_timeout(
    mut command: tokio::process::Command,
    timeout: Duration,
) -> Result<CommandOutput> {
    command.kill_on_drop(true);
    let child = command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Err(_) => Ok(CommandOutput::timed_out(timeout)),
    }
}
