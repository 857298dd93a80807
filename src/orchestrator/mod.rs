//! Run orchestration.
//!
//! [`Engine`] owns the long-lived collaborators and drives one pass of a
//! run's workflow. [`scheduler::Scheduler`] decides when passes happen.

pub mod retry;
pub mod scheduler;
mod workflow;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codehost::CodeHost;
use crate::config::ShipwrightConfig;
use crate::environment::{EnvironmentRef, Provisioner};
use crate::errors::WorkflowError;
use crate::llm::LlmProvider;
use crate::store::{DbHandle, NewRun, Run};

pub use workflow::{approaches_gate_request, branch_name, select_approach};

/// What a caller submits to start a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTrigger {
    pub request: String,
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub target_branch: String,
    #[serde(default = "default_runtime")]
    pub runtime: String,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_runtime() -> String {
    "node".to_string()
}

impl RunTrigger {
    pub fn validate(&self) -> Result<(), String> {
        if self.request.trim().is_empty() {
            return Err("request must not be empty".into());
        }
        if self.repo_url.trim().is_empty() {
            return Err("repoUrl must not be empty".into());
        }
        if self.target_branch.trim().is_empty() {
            return Err("targetBranch must not be empty".into());
        }
        Ok(())
    }

    pub fn into_new_run(self, id: String) -> NewRun {
        NewRun {
            id,
            request: self.request.trim().to_string(),
            repo_url: self.repo_url.trim().to_string(),
            target_branch: self.target_branch.trim().to_string(),
            runtime: self.runtime,
        }
    }
}

/// Where a run stands after a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Suspended {
        approval_id: String,
        resume_at: DateTime<Utc>,
    },
    Completed {
        pr_url: String,
    },
    Failed {
        reason: String,
    },
}

pub struct Engine {
    pub db: DbHandle,
    pub config: ShipwrightConfig,
    pub llm: Arc<dyn LlmProvider>,
    pub provisioner: Arc<dyn Provisioner>,
    pub code_host: Arc<dyn CodeHost>,
}

impl Engine {
    /// Execute one pass of the run's workflow.
    ///
    /// Infrastructure errors are returned and leave the run where it was so
    /// a later pass can retry. Any other failure is terminal.
    pub async fn drive(&self, run_id: &str) -> Result<RunState> {
        let run = self.load_run(run_id).await?;
        if let Some(state) = terminal_state(&run) {
            return Ok(state);
        }

        tracing::debug!(run_id = %run.id, phase = %run.current_phase, "driving run");
        let failure = match workflow::Workflow::new(self, run.clone()).execute().await {
            Ok(pr) => {
                self.release(run_id).await;
                return Ok(RunState::Completed { pr_url: pr.pr_url });
            }
            Err(failure) => failure,
        };

        match failure.error {
            WorkflowError::Suspended {
                approval_id,
                resume_at,
            } => {
                tracing::info!(run_id = %run.id, approval_id = %approval_id, %resume_at, "run suspended");
                Ok(RunState::Suspended {
                    approval_id,
                    resume_at,
                })
            }
            WorkflowError::Infrastructure(e) => {
                tracing::error!(run_id = %run.id, phase = %failure.phase, error = %e, "infrastructure failure; run left resumable");
                Err(e.context(format!("run {} failed in {}", run.id, failure.phase)))
            }
            error => {
                let reason = error.describe(failure.phase);
                tracing::warn!(run_id = %run.id, class = error.class(), reason = %reason, "run failed");
                let id = run.id.clone();
                let stored = reason.clone();
                self.db.call(move |db| db.fail_run(&id, &stored)).await?;
                self.release(run_id).await;
                Ok(RunState::Failed { reason })
            }
        }
    }

    async fn load_run(&self, run_id: &str) -> Result<Run> {
        let id = run_id.to_string();
        self.db
            .call(move |db| db.get_run(&id))
            .await?
            .with_context(|| format!("Run {} not found", run_id))
    }

    /// Release the run's environment. Failures are logged, never raised.
    async fn release(&self, run_id: &str) {
        let reference = match self.load_run(run_id).await {
            Ok(run) => run
                .environment
                .and_then(|v| serde_json::from_value::<EnvironmentRef>(v).ok()),
            Err(e) => {
                tracing::warn!(run_id, error = %e, "could not load run to release its environment");
                None
            }
        };
        let Some(reference) = reference else {
            return;
        };
        match self.provisioner.release(&reference).await {
            Ok(()) => tracing::info!(run_id, env = %reference.id, "environment released"),
            Err(e) => tracing::warn!(run_id, env = %reference.id, error = %e, "failed to release environment"),
        }
    }
}

fn terminal_state(run: &Run) -> Option<RunState> {
    match run.current_phase {
        shipwright_common::Phase::Completed => Some(RunState::Completed {
            pr_url: run.pr_url.clone().unwrap_or_default(),
        }),
        shipwright_common::Phase::Failed => Some(RunState::Failed {
            reason: run.failure_reason.clone().unwrap_or_default(),
        }),
        _ => None,
    }
}
