use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{
    CommandOutput, Environment, EnvironmentRef, LIST_LIMIT, Provisioner, relative_path,
    run_with_timeout,
};
use crate::config::EnvironmentKind;
use crate::store::Run;

/// Checkouts under a workspace root on the host, one directory per run.
pub struct LocalProvisioner {
    root: PathBuf,
}

impl LocalProvisioner {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn provision(&self, run: &Run) -> Result<EnvironmentRef> {
        let dir = self.root.join(&run.id);
        let url = run.repo_url.clone();
        let branch = run.target_branch.clone();
        let target = dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if target.join(".git").exists() {
                return Ok(());
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            git2::build::RepoBuilder::new()
                .branch(&branch)
                .clone(&url, &target)
                .with_context(|| format!("Failed to clone {} ({})", url, branch))?;
            Ok(())
        })
        .await
        .context("Clone task panicked")??;

        tracing::info!(run_id = %run.id, dir = %dir.display(), "provisioned local checkout");
        Ok(EnvironmentRef {
            kind: EnvironmentKind::Local,
            id: dir.display().to_string(),
            workdir: dir,
        })
    }

    async fn attach(&self, reference: &EnvironmentRef) -> Result<Arc<dyn Environment>> {
        if !reference.workdir.is_dir() {
            anyhow::bail!("Checkout {} no longer exists", reference.workdir.display());
        }
        Ok(Arc::new(LocalEnvironment {
            reference: reference.clone(),
        }))
    }

    async fn release(&self, reference: &EnvironmentRef) -> Result<()> {
        let dir = reference.workdir.clone();
        if !dir.starts_with(&self.root) {
            anyhow::bail!("Refusing to remove {} outside the workspace root", dir.display());
        }
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        tracing::info!(dir = %dir.display(), "released local checkout");
        Ok(())
    }
}

pub struct LocalEnvironment {
    reference: EnvironmentRef,
}

impl LocalEnvironment {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            reference: EnvironmentRef {
                kind: EnvironmentKind::Local,
                id: workdir.display().to_string(),
                workdir,
            },
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(self.reference.workdir.join(relative_path(path)?))
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn reference(&self) -> &EnvironmentRef {
        &self.reference
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&self.reference.workdir);
        run_with_timeout(cmd, timeout)
            .await
            .with_context(|| format!("Failed to run '{}'", command))
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content)
            .await
            .with_context(|| format!("Failed to write {}", path))
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        let root = self.reference.workdir.clone();
        let start = self.resolve(dir)?;
        tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            let walker = walkdir::WalkDir::new(&start)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.file_name() != ".git");
            for entry in walker {
                let entry = entry.with_context(|| format!("Failed to list {}", start.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&root) {
                    files.push(rel.display().to_string());
                }
                if files.len() >= LIST_LIMIT {
                    break;
                }
            }
            Ok(files)
        })
        .await
        .context("List task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Run;
    use shipwright_common::Phase;

    fn init_repo(dir: &std::path::Path) {
        let repo = git2::Repository::init(dir).unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(std::path::Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@example.com").unwrap();
        let commit = repo
            .commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        let commit = repo.find_commit(commit).unwrap();
        repo.branch("main", &commit, true).unwrap();
    }

    fn run_for(url: &str) -> Run {
        Run {
            id: "run-1".into(),
            request: "r".into(),
            repo_url: url.into(),
            target_branch: "main".into(),
            runtime: "node".into(),
            environment: None,
            current_phase: Phase::Analysis,
            failure_reason: None,
            pr_url: None,
            created_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_provision_attach_release() {
        let origin = tempfile::tempdir().unwrap();
        init_repo(origin.path());
        let root = tempfile::tempdir().unwrap();
        let provisioner = LocalProvisioner::new(root.path().to_path_buf());

        let run = run_for(&origin.path().display().to_string());
        let reference = provisioner.provision(&run).await.unwrap();
        // Second provision reuses the checkout.
        let again = provisioner.provision(&run).await.unwrap();
        assert_eq!(reference, again);

        let env = provisioner.attach(&reference).await.unwrap();
        assert_eq!(env.read_file("README.md").await.unwrap(), "hello\n");

        provisioner.release(&reference).await.unwrap();
        assert!(!reference.workdir.exists());
        provisioner.release(&reference).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_operations_stay_inside_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalEnvironment::new(dir.path().to_path_buf());
        env.write_file("src/new.rs", "fn main() {}\n").await.unwrap();
        assert_eq!(env.read_file("src/new.rs").await.unwrap(), "fn main() {}\n");
        assert!(env.read_file("../outside").await.is_err());
        assert_eq!(env.list_files(".").await.unwrap(), vec!["src/new.rs".to_string()]);
    }

    #[tokio::test]
    async fn test_exec_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let env = LocalEnvironment::new(dir.path().to_path_buf());
        let out = env.exec("ls", Duration::from_secs(10)).await.unwrap();
        assert!(out.success());
        assert!(out.stdout.contains("marker"));
    }
}
