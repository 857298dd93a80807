use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    RemoveContainerOptionsBuilder, StartContainerOptions,
};
use futures::{StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;

use super::{CommandOutput, Environment, EnvironmentRef, LIST_LIMIT, Provisioner, relative_path, shell_quote};
use crate::config::EnvironmentKind;
use crate::store::Run;

const WORKDIR: &str = "/workspace";
const SETUP_TIMEOUT: Duration = Duration::from_secs(600);

/// One long-lived container per run, driven through the Docker Engine API.
pub struct DockerProvisioner {
    docker: Docker,
    images: HashMap<String, String>,
}

pub fn container_name(run_id: &str) -> String {
    let safe: String = run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("shipwright-{}", safe)
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code: 404, .. })
}

/// Append one demultiplexed exec chunk to `out`.
fn append_chunk(out: &mut CommandOutput, chunk: LogOutput) {
    match chunk {
        LogOutput::StdErr { message } => out.stderr.push_str(&String::from_utf8_lossy(&message)),
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            out.stdout.push_str(&String::from_utf8_lossy(&message))
        }
        LogOutput::StdIn { .. } => {}
    }
}

/// Run `cmd` inside `container`, optionally feeding `stdin`, and wait for
/// its exit code.
async fn exec_in(
    docker: &Docker,
    container: &str,
    cmd: Vec<String>,
    workdir: Option<&str>,
    stdin: Option<&str>,
) -> Result<CommandOutput> {
    let exec = docker
        .create_exec(
            container,
            CreateExecOptions {
                cmd: Some(cmd),
                working_dir: workdir.map(str::to_string),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                attach_stdin: Some(stdin.is_some()),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("Failed to create exec in {}", container))?;

    let mut out = CommandOutput {
        exit_code: -1,
        stdout: String::new(),
        stderr: String::new(),
    };
    match docker.start_exec(&exec.id, None).await? {
        StartExecResults::Attached { mut output, mut input } => {
            if let Some(content) = stdin {
                input.write_all(content.as_bytes()).await?;
                input.shutdown().await?;
            }
            drop(input);
            while let Some(chunk) = output.next().await {
                append_chunk(&mut out, chunk?);
            }
        }
        StartExecResults::Detached => bail!("exec in {} detached unexpectedly", container),
    }

    let inspected = docker.inspect_exec(&exec.id).await?;
    out.exit_code = inspected.exit_code.map(|code| code as i32).unwrap_or(-1);
    Ok(out)
}

fn sh(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}

impl DockerProvisioner {
    /// Connects lazily; no daemon round trip happens until a run is provisioned.
    pub fn new(images: HashMap<String, String>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("Failed to configure the Docker client")?;
        Ok(Self { docker, images })
    }

    fn image_for(&self, runtime: &str) -> Result<&str> {
        self.images
            .get(runtime)
            .map(String::as_str)
            .with_context(|| format!("No container image configured for runtime '{}'", runtime))
    }

    /// True when a running container with this name already exists. A
    /// stopped leftover is removed.
    async fn reusable(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_container(name, None::<InspectContainerOptions>).await {
            Ok(info) => {
                if info.state.and_then(|s| s.running).unwrap_or(false) {
                    return Ok(true);
                }
                self.remove(name).await?;
                Ok(false)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to inspect container {}", name)),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove container {}", name)),
        }
    }

    async fn pull(&self, image: &str) -> Result<()> {
        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .with_context(|| format!("Failed to pull image {}", image))?;
        Ok(())
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    async fn provision(&self, run: &Run) -> Result<EnvironmentRef> {
        let name = container_name(&run.id);
        let reference = EnvironmentRef {
            kind: EnvironmentKind::Docker,
            id: name.clone(),
            workdir: PathBuf::from(WORKDIR),
        };
        if self.reusable(&name).await? {
            return Ok(reference);
        }

        let image = self.image_for(&run.runtime)?;
        self.pull(image).await?;
        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(WORKDIR.to_string()),
            ..Default::default()
        };
        let options = CreateContainerOptionsBuilder::default().name(&name).build();
        self.docker
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("Failed to create container {}", name))?;
        self.docker
            .start_container(&name, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", name))?;

        let clone = format!(
            "git clone --branch {} {} {}",
            shell_quote(&run.target_branch),
            shell_quote(&run.repo_url),
            WORKDIR
        );
        let cloned = tokio::time::timeout(SETUP_TIMEOUT, exec_in(&self.docker, &name, sh(&clone), None, None))
            .await
            .unwrap_or_else(|_| Ok(CommandOutput::timed_out(SETUP_TIMEOUT)))?;
        if !cloned.success() {
            self.remove(&name).await?;
            bail!("git clone inside {} failed: {}", name, cloned.combined());
        }

        tracing::info!(run_id = %run.id, container = %name, image, "provisioned container");
        Ok(reference)
    }

    async fn attach(&self, reference: &EnvironmentRef) -> Result<Arc<dyn Environment>> {
        Ok(Arc::new(DockerEnvironment {
            docker: self.docker.clone(),
            reference: reference.clone(),
        }))
    }

    async fn release(&self, reference: &EnvironmentRef) -> Result<()> {
        self.remove(&reference.id).await?;
        tracing::info!(container = %reference.id, "released container");
        Ok(())
    }
}

pub struct DockerEnvironment {
    docker: Docker,
    reference: EnvironmentRef,
}

fn container_path(workdir: &Path, path: &str) -> Result<String> {
    Ok(workdir.join(relative_path(path)?).display().to_string())
}

impl DockerEnvironment {
    async fn run(&self, cmd: Vec<String>, stdin: Option<&str>, timeout: Duration) -> Result<CommandOutput> {
        let workdir = self.reference.workdir.display().to_string();
        let exec = exec_in(&self.docker, &self.reference.id, cmd, Some(&workdir), stdin);
        match tokio::time::timeout(timeout, exec).await {
            Ok(out) => out,
            Err(_) => Ok(CommandOutput::timed_out(timeout)),
        }
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn reference(&self) -> &EnvironmentRef {
        &self.reference
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.run(sh(command), None, timeout).await
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let full = container_path(&self.reference.workdir, path)?;
        let out = self.run(vec!["cat".to_string(), full], None, SETUP_TIMEOUT).await?;
        if !out.success() {
            bail!("Failed to read {}: {}", path, out.stderr.trim());
        }
        Ok(out.stdout)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let full = container_path(&self.reference.workdir, path)?;
        let script = format!("mkdir -p \"$(dirname {0})\" && cat > {0}", shell_quote(&full));
        let out = self.run(sh(&script), Some(content), SETUP_TIMEOUT).await?;
        if !out.success() {
            bail!("Failed to write {}: {}", path, out.stderr.trim());
        }
        Ok(())
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        let rel = relative_path(dir)?;
        let start = if rel.as_os_str().is_empty() {
            ".".to_string()
        } else {
            rel.display().to_string()
        };
        let command = format!(
            "find {} -type f -not -path '*/.git/*' | sed 's|^\\./||' | sort | head -n {}",
            shell_quote(&start),
            LIST_LIMIT
        );
        let out = self.exec(&command, SETUP_TIMEOUT).await?;
        if !out.success() {
            bail!("Failed to list {}: {}", dir, out.stderr.trim());
        }
        Ok(out.stdout.lines().map(str::to_string).collect())
    }
}
