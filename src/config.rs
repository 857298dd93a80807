//! Configuration for shipwright.
//!
//! Reads `.shipwright/shipwright.toml`, then applies environment overrides,
//! then CLI flags. Every section and key is optional.
//!
//! ```toml
//! [llm]
//! model = "claude-sonnet-4-5"
//! max_tokens = 8192
//!
//! [agents]
//! analysis_max_steps = 25
//! implementation_max_steps = 60
//! max_spawn_depth = 2
//!
//! [approval]
//! timeout_hours = 336
//!
//! [gates]
//! test = "cargo test --workspace"
//! output_limit = 8000
//!
//! [environment]
//! kind = "docker"
//!
//! [environment.images]
//! node = "node:22-bookworm"
//!
//! [github]
//! token_env = "GITHUB_TOKEN"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".shipwright/shipwright.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
        }
    }
}

/// Step budgets for each agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsSection {
    #[serde(default = "default_analysis_steps")]
    pub analysis_max_steps: u32,
    #[serde(default = "default_approaches_steps")]
    pub approaches_max_steps: u32,
    #[serde(default = "default_judging_steps")]
    pub judging_max_steps: u32,
    #[serde(default = "default_implementation_steps")]
    pub implementation_max_steps: u32,
    #[serde(default = "default_subagent_steps")]
    pub subagent_max_steps: u32,
    /// How deep `spawn_agent` may nest below a phase orchestrator.
    #[serde(default = "default_max_spawn_depth")]
    pub max_spawn_depth: u32,
}

fn default_analysis_steps() -> u32 {
    25
}

fn default_approaches_steps() -> u32 {
    20
}

fn default_judging_steps() -> u32 {
    20
}

fn default_implementation_steps() -> u32 {
    60
}

fn default_subagent_steps() -> u32 {
    15
}

fn default_max_spawn_depth() -> u32 {
    2
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            analysis_max_steps: default_analysis_steps(),
            approaches_max_steps: default_approaches_steps(),
            judging_max_steps: default_judging_steps(),
            implementation_max_steps: default_implementation_steps(),
            subagent_max_steps: default_subagent_steps(),
            max_spawn_depth: default_max_spawn_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSection {
    /// How long a pending approval may wait before it times out.
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: u64,
    /// How often the scheduler looks for expired approvals.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_timeout_hours() -> u64 {
    24 * 14
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            timeout_hours: default_timeout_hours(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ApprovalSection {
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::hours(self.timeout_hours as i64)
    }
}

/// Quality gate commands. Unset commands are detected from the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatesSection {
    #[serde(default)]
    pub typecheck: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub lint: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    /// Bytes of gate output kept (from the tail).
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_output_limit() -> usize {
    8000
}

fn default_command_timeout() -> u64 {
    900
}

impl Default for GatesSection {
    fn default() -> Self {
        Self {
            typecheck: None,
            test: None,
            lint: None,
            build: None,
            output_limit: default_output_limit(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl GatesSection {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    /// A git checkout on the host, commands run through `sh -c`.
    #[default]
    Local,
    /// A long-lived container per run, commands run through `docker exec`.
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSection {
    #[serde(default)]
    pub kind: EnvironmentKind,
    /// Where local checkouts are created. Defaults to the platform data dir.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Runtime flavor → container image.
    #[serde(default = "default_images")]
    pub images: HashMap<String, String>,
}

fn default_images() -> HashMap<String, String> {
    HashMap::from([
        ("node".to_string(), "node:22-bookworm".to_string()),
        ("rust".to_string(), "rust:1-bookworm".to_string()),
        ("python".to_string(), "python:3.12-bookworm".to_string()),
        ("go".to_string(), "golang:1.23-bookworm".to_string()),
    ])
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            kind: EnvironmentKind::default(),
            workspace_root: None,
            images: default_images(),
        }
    }
}

impl EnvironmentSection {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("shipwright")
                .join("workspaces")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubSection {
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            api_url: default_api_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:3142".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".shipwright/shipwright.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written to a daily-rolling file here.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// Root of `shipwright.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipwrightConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub approval: ApprovalSection,
    #[serde(default)]
    pub gates: GatesSection,
    #[serde(default)]
    pub environment: EnvironmentSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ShipwrightConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shipwright.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config at {}", path.display()))
    }

    /// Load from `path` if it exists, otherwise defaults; then apply
    /// environment overrides.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `SHIPWRIGHT_*` overrides. The lookup is injected for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("SHIPWRIGHT_MODEL") {
            self.llm.model = model;
        }
        if let Some(db) = lookup("SHIPWRIGHT_DB") {
            self.database.path = PathBuf::from(db);
        }
        if let Some(bind) = lookup("SHIPWRIGHT_BIND") {
            self.server.bind = bind;
        }
        if let Some(level) = lookup("SHIPWRIGHT_LOG") {
            self.logging.level = level;
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Human-readable warnings for suspicious settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let budgets = [
            ("analysis_max_steps", self.agents.analysis_max_steps),
            ("approaches_max_steps", self.agents.approaches_max_steps),
            ("judging_max_steps", self.agents.judging_max_steps),
            ("implementation_max_steps", self.agents.implementation_max_steps),
            ("subagent_max_steps", self.agents.subagent_max_steps),
        ];
        for (name, value) in budgets {
            if value == 0 {
                warnings.push(format!("agents.{} is 0; that agent cannot act", name));
            }
        }
        if self.approval.timeout_hours == 0 {
            warnings.push("approval.timeout_hours is 0; every gate will time out".to_string());
        }
        if self.gates.output_limit < 200 {
            warnings.push(format!(
                "gates.output_limit {} is too small to hold a useful error",
                self.gates.output_limit
            ));
        }
        if self.environment.kind == EnvironmentKind::Docker && self.environment.images.is_empty() {
            warnings.push("environment.kind is docker but no images are configured".to_string());
        }
        warnings
    }
}
