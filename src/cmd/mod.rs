//! CLI command implementations.
//!
//! | Module      | Commands handled                 |
//! |-------------|----------------------------------|
//! | `run`       | `Run`, `Resume`, `Status`        |
//! | `approvals` | `Approvals`, `Respond`           |
//! | `config`    | `Config`                         |
//! | `serve`     | `Serve`                          |

pub mod approvals;
pub mod config;
pub mod run;
pub mod serve;

pub use approvals::{cmd_approvals, cmd_respond};
pub use config::cmd_config;
pub use run::{cmd_resume, cmd_run, cmd_status};
pub use serve::cmd_serve;

use std::sync::Arc;

use anyhow::{Context, Result};
use shipwright::codehost::GitHubCodeHost;
use shipwright::config::ShipwrightConfig;
use shipwright::environment::provisioner_from_config;
use shipwright::llm::anthropic::AnthropicProvider;
use shipwright::orchestrator::Engine;
use shipwright::orchestrator::scheduler::Scheduler;
use shipwright::store::{DbHandle, Store};

/// Open the run store. Needs no credentials.
pub fn open_db(config: &ShipwrightConfig) -> Result<DbHandle> {
    let store = Store::new(&config.database.path)
        .with_context(|| format!("Failed to open database at {}", config.database.path.display()))?;
    Ok(DbHandle::new(store))
}

/// Wire the engine from configuration and environment credentials.
pub fn build_scheduler(config: &ShipwrightConfig, db: DbHandle) -> Result<Scheduler> {
    let llm = AnthropicProvider::from_env(&config.llm)?;
    let code_host = GitHubCodeHost::from_env(&config.github)?;
    let engine = Engine {
        db,
        config: config.clone(),
        llm: Arc::new(llm),
        provisioner: provisioner_from_config(&config.environment)?,
        code_host: Arc::new(code_host),
    };
    Ok(Scheduler::new(Arc::new(engine)))
}
