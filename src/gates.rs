//! Quality gate battery.
//!
//! Gates run inside the run's environment in a fixed order
//! (typecheck → test → lint → build) and the battery stops at the first
//! failure. A failing command is a result, never an error.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use shipwright_common::{GateName, GateResult, GateStatus};

use crate::config::GatesSection;
use crate::environment::Environment;
use crate::util::truncate_tail;

pub const SKIPPED_OUTPUT: &str = "skipped: no command";

/// The command each gate runs. `None` means the gate has nothing to check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCommands {
    pub typecheck: Option<String>,
    pub test: Option<String>,
    pub lint: Option<String>,
    pub build: Option<String>,
}

impl GateCommands {
    pub fn get(&self, gate: GateName) -> Option<&str> {
        match gate {
            GateName::Typecheck => self.typecheck.as_deref(),
            GateName::Test => self.test.as_deref(),
            GateName::Lint => self.lint.as_deref(),
            GateName::Build => self.build.as_deref(),
        }
    }

    /// True when no gate has a command, so the battery checks nothing.
    pub fn is_empty(&self) -> bool {
        GateName::ORDER.iter().all(|gate| self.get(*gate).is_none())
    }

    /// Configured commands win over detected ones, gate by gate.
    pub fn overlay(self, configured: &GatesSection) -> Self {
        Self {
            typecheck: configured.typecheck.clone().or(self.typecheck),
            test: configured.test.clone().or(self.test),
            lint: configured.lint.clone().or(self.lint),
            build: configured.build.clone().or(self.build),
        }
    }

    fn cargo() -> Self {
        Self {
            typecheck: Some("cargo check --all-targets".into()),
            test: Some("cargo test".into()),
            lint: Some("cargo clippy --all-targets -- -D warnings".into()),
            build: Some("cargo build".into()),
        }
    }

    fn python() -> Self {
        Self {
            typecheck: Some("python -m mypy .".into()),
            test: Some("python -m pytest".into()),
            lint: Some("python -m ruff check .".into()),
            build: Some("python -m build".into()),
        }
    }

    fn go() -> Self {
        Self {
            typecheck: Some("go vet ./...".into()),
            test: Some("go test ./...".into()),
            lint: Some("test -z \"$(gofmt -l .)\"".into()),
            build: Some("go build ./...".into()),
        }
    }

    /// Derive commands from `package.json` scripts.
    fn node(package_json: &str, has_tsconfig: bool) -> Self {
        let json: serde_json::Value = serde_json::from_str(package_json).unwrap_or_default();
        let script = |name: &str| json.get("scripts").and_then(|s| s.get(name)).is_some();
        Self {
            typecheck: if script("typecheck") {
                Some("npm run typecheck".into())
            } else if has_tsconfig {
                Some("npx tsc --noEmit".into())
            } else {
                None
            },
            test: script("test").then(|| "npm test".to_string()),
            lint: script("lint").then(|| "npm run lint".to_string()),
            build: script("build").then(|| "npm run build".to_string()),
        }
    }
}

/// Detect gate commands from marker files at the repository root.
pub async fn detect_commands(env: &dyn Environment) -> GateCommands {
    if env.read_file("Cargo.toml").await.is_ok() {
        return GateCommands::cargo();
    }
    if let Ok(package_json) = env.read_file("package.json").await {
        let has_tsconfig = env.read_file("tsconfig.json").await.is_ok();
        return GateCommands::node(&package_json, has_tsconfig);
    }
    if env.read_file("pyproject.toml").await.is_ok() {
        return GateCommands::python();
    }
    if env.read_file("go.mod").await.is_ok() {
        return GateCommands::go();
    }
    GateCommands::default()
}

pub struct GateRunner {
    config: GatesSection,
}

impl GateRunner {
    pub fn new(config: GatesSection) -> Self {
        Self { config }
    }

    pub async fn commands_for(&self, env: &dyn Environment) -> GateCommands {
        detect_commands(env).await.overlay(&self.config)
    }

    /// Run the battery in order, stopping after the first failure.
    pub async fn run(&self, env: &dyn Environment, commands: &GateCommands) -> Result<Vec<GateResult>> {
        if commands.is_empty() {
            tracing::warn!(
                env = %env.reference().id,
                "no gate commands detected or configured; every gate is skipped"
            );
        }
        let mut results = Vec::with_capacity(GateName::ORDER.len());
        for gate in GateName::ORDER {
            let Some(command) = commands.get(gate) else {
                results.push(GateResult {
                    gate,
                    status: GateStatus::Passed,
                    output: SKIPPED_OUTPUT.to_string(),
                });
                continue;
            };

            let out = env.exec(command, self.config.command_timeout()).await?;
            let status = if out.success() {
                GateStatus::Passed
            } else {
                GateStatus::Failed
            };
            tracing::info!(gate = %gate, command, exit_code = out.exit_code, "gate finished");
            results.push(GateResult {
                gate,
                status,
                output: truncate_tail(&out.combined(), self.config.output_limit),
            });
            if status == GateStatus::Failed {
                break;
            }
        }
        Ok(results)
    }
}

/// The failing gate's output, for retry prompts.
pub fn failure_summary(results: &[GateResult], limit: usize) -> Option<String> {
    results
        .iter()
        .find(|r| !r.passed())
        .map(|r| format!("{} failed:\n{}", r.gate, truncate_tail(&r.output, limit)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::LocalEnvironment;
    use shipwright_common::all_gates_passed;

    fn runner() -> GateRunner {
        GateRunner::new(GatesSection::default())
    }

    fn commands(typecheck: &str, test: &str, lint: &str, build: &str) -> GateCommands {
        GateCommands {
            typecheck: Some(typecheck.into()),
            test: Some(test.into()),
            lint: Some(lint.into()),
            build: Some(build.into()),
        }
    }

    #[tokio::test]
    async fn test_all_gates_pass_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalEnvironment::new(dir.path().to_path_buf());
        let results = runner()
            .run(&env, &commands("true", "echo tests ok", "true", "true"))
            .await
            .unwrap();
        let order: Vec<GateName> = results.iter().map(|r| r.gate).collect();
        assert_eq!(order, GateName::ORDER.to_vec());
        assert!(all_gates_passed(&results));
        assert!(results[1].output.contains("tests ok"));
    }

    #[tokio::test]
    async fn test_typecheck_failure_stops_battery() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalEnvironment::new(dir.path().to_path_buf());
        let results = runner()
            .run(
                &env,
                &commands(
                    "echo 'type error' >&2; exit 2",
                    "touch test-ran",
                    "touch lint-ran",
                    "touch build-ran",
                ),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        for marker in ["test-ran", "lint-ran", "build-ran"] {
            assert!(!dir.path().join(marker).exists());
        }
        assert_eq!(results[0].gate, GateName::Typecheck);
        assert_eq!(results[0].status, GateStatus::Failed);
        assert!(results[0].output.contains("type error"));
    }

    #[tokio::test]
    async fn test_missing_command_is_skipped_as_passed() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalEnvironment::new(dir.path().to_path_buf());
        let cmds = GateCommands {
            test: Some("true".into()),
            ..Default::default()
        };
        let results = runner().run(&env, &cmds).await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].output, SKIPPED_OUTPUT);
        assert!(all_gates_passed(&results));
    }

    #[tokio::test]
    async fn test_unrecognized_project_has_no_commands() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "docs only").unwrap();
        let env = LocalEnvironment::new(dir.path().to_path_buf());
        let cmds = runner().commands_for(&env).await;
        assert!(cmds.is_empty());

        let results = runner().run(&env, &cmds).await.unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.output == SKIPPED_OUTPUT));

        let mut config = GatesSection::default();
        config.test = Some("make check".into());
        assert!(!GateRunner::new(config).commands_for(&env).await.is_empty());
    }

    #[tokio::test]
    async fn test_output_is_tail_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalEnvironment::new(dir.path().to_path_buf());
        let mut config = GatesSection::default();
        config.output_limit = 50;
        let results = GateRunner::new(config)
            .run(
                &env,
                &commands("head -c 5000 /dev/zero | tr '\\0' x; echo; echo LAST LINE; exit 1", "true", "true", "true"),
            )
            .await
            .unwrap();
        assert!(results[0].output.ends_with("LAST LINE\n"));
        assert!(results[0].output.len() < 200);
    }

    #[tokio::test]
    async fn test_detects_cargo_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        let env = LocalEnvironment::new(dir.path().to_path_buf());
        let cmds = detect_commands(&env).await;
        assert_eq!(cmds.test.as_deref(), Some("cargo test"));
    }

    #[tokio::test]
    async fn test_detects_node_scripts_and_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"test": "vitest", "build": "vite build"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("tsconfig.json"), "{}").unwrap();
        let env = LocalEnvironment::new(dir.path().to_path_buf());

        let detected = detect_commands(&env).await;
        assert_eq!(detected.typecheck.as_deref(), Some("npx tsc --noEmit"));
        assert_eq!(detected.test.as_deref(), Some("npm test"));
        assert!(detected.lint.is_none());

        let mut config = GatesSection::default();
        config.lint = Some("npx eslint .".into());
        let merged = GateRunner::new(config).commands_for(&env).await;
        assert_eq!(merged.lint.as_deref(), Some("npx eslint ."));
        assert_eq!(merged.build.as_deref(), Some("npm run build"));
    }

    #[test]
    fn test_failure_summary_names_gate() {
        let results = vec![
            GateResult {
                gate: GateName::Typecheck,
                status: GateStatus::Passed,
                output: String::new(),
            },
            GateResult {
                gate: GateName::Test,
                status: GateStatus::Failed,
                output: "assertion failed".into(),
            },
        ];
        let summary = failure_summary(&results, 3000).unwrap();
        assert!(summary.starts_with("test failed:"));
        assert!(summary.contains("assertion failed"));
    }
}
