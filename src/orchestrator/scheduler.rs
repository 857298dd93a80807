//! Decides when workflow passes happen.
//!
//! A pass runs after a run is created, after an approval is answered, when
//! the sweeper times out an expired approval, and for orphaned runs at
//! startup. A pass that ends in an infrastructure error is retried by the
//! sweeper with exponential backoff. Passes for the same run never overlap.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shipwright_common::ApprovalResponsePayload;
use tokio_util::sync::CancellationToken;

use super::{Engine, RunState, RunTrigger};
use crate::approval::submit_response;
use crate::errors::ApprovalError;
use crate::store::{ApprovalRequest, Run};

/// First retry delay after an infrastructure error; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_secs(30);
const RETRY_CAP: Duration = Duration::from_secs(15 * 60);
/// Consecutive failed passes after which the sweeper stops retrying. The
/// run stays active for `shipwright resume` or the next startup.
const RETRY_LIMIT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub next_at: DateTime<Utc>,
}

fn backoff(attempts: u32) -> chrono::Duration {
    let factor = 1u32 << attempts.saturating_sub(1).min(16);
    let delay = RETRY_BASE.saturating_mul(factor).min(RETRY_CAP);
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::minutes(15))
}

#[derive(Clone)]
pub struct Scheduler {
    engine: Arc<Engine>,
    locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    retries: Arc<DashMap<String, RetryState>>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            locks: Arc::new(DashMap::new()),
            retries: Arc::new(DashMap::new()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run one pass for `run_id`, waiting for any pass already in flight.
    pub async fn drive(&self, run_id: &str) -> Result<RunState> {
        let lock = self.locks.entry(run_id.to_string()).or_default().clone();
        let _guard = lock.lock().await;
        let state = self.engine.drive(run_id).await;
        match &state {
            Ok(RunState::Completed { .. } | RunState::Failed { .. }) => {
                self.locks.remove(run_id);
                self.retries.remove(run_id);
            }
            Ok(RunState::Suspended { .. }) => {
                self.retries.remove(run_id);
            }
            Err(_) => self.schedule_retry(run_id),
        }
        state
    }

    fn schedule_retry(&self, run_id: &str) {
        let mut entry = self.retries.entry(run_id.to_string()).or_insert(RetryState {
            attempts: 0,
            next_at: Utc::now(),
        });
        entry.attempts += 1;
        if entry.attempts > RETRY_LIMIT {
            tracing::error!(run_id, attempts = entry.attempts - 1, "giving up on automatic retries");
            drop(entry);
            self.retries.remove(run_id);
            return;
        }
        entry.next_at = Utc::now() + backoff(entry.attempts);
        tracing::warn!(run_id, attempt = entry.attempts, next_at = %entry.next_at, "pass failed; retry scheduled");
    }

    /// Backoff state of a run whose last pass failed, if any.
    pub fn retry_state(&self, run_id: &str) -> Option<RetryState> {
        self.retries.get(run_id).map(|entry| *entry)
    }

    /// Re-drive runs whose retry time is at or before `now`. Returns their ids.
    pub fn retry_failed_passes(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        for mut entry in self.retries.iter_mut() {
            if entry.next_at <= now {
                // Pushed out so the next tick skips it while this pass runs.
                entry.next_at = now + backoff(entry.attempts);
                due.push(entry.key().clone());
            }
        }
        for run_id in &due {
            tracing::info!(run_id = %run_id, "retrying failed pass");
            self.spawn_drive(run_id);
        }
        due
    }

    /// Drive in the background. Errors are logged.
    pub fn spawn_drive(&self, run_id: &str) {
        let scheduler = self.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            match scheduler.drive(&run_id).await {
                Ok(state) => tracing::debug!(run_id = %run_id, ?state, "pass finished"),
                Err(e) => tracing::error!(run_id = %run_id, error = %format!("{:#}", e), "pass failed"),
            }
        });
    }

    /// Persist a new run. The caller decides whether to drive it inline.
    pub async fn create(&self, trigger: RunTrigger) -> Result<Run> {
        trigger.validate().map_err(anyhow::Error::msg)?;
        let new = trigger.into_new_run(uuid::Uuid::new_v4().to_string());
        let run = self.engine.db.call(move |db| db.create_run(&new)).await?;
        tracing::info!(run_id = %run.id, repo = %run.repo_url, "run created");
        Ok(run)
    }

    /// Create a run and start its first pass in the background.
    pub async fn start(&self, trigger: RunTrigger) -> Result<Run> {
        let run = self.create(trigger).await?;
        self.spawn_drive(&run.id);
        Ok(run)
    }

    /// Record a human's answer and resume the run it belongs to.
    pub async fn respond(
        &self,
        approval_id: &str,
        response: ApprovalResponsePayload,
    ) -> Result<Result<ApprovalRequest, ApprovalError>> {
        let outcome = submit_response(&self.engine.db, approval_id, response).await?;
        if let Ok(approval) = &outcome {
            tracing::info!(run_id = %approval.run_id, approval_id, "approval answered; resuming");
            self.spawn_drive(&approval.run_id);
        }
        Ok(outcome)
    }

    /// Time out every approval past its deadline and resume the affected
    /// runs. Returns the ids of those runs.
    pub async fn sweep(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let due = self
            .engine
            .db
            .call(move |db| db.list_due_approvals(now))
            .await?;

        let mut runs = Vec::new();
        for approval in due {
            let id = approval.id.clone();
            let row = self.engine.db.call(move |db| db.timeout_approval(&id)).await?;
            if row.timed_out {
                tracing::warn!(run_id = %row.run_id, approval_id = %row.id, "approval deadline passed");
            }
            if !runs.contains(&row.run_id) {
                runs.push(row.run_id);
            }
        }
        for run_id in &runs {
            self.spawn_drive(run_id);
        }
        Ok(runs)
    }

    /// Resume active runs that are not waiting on a human. These are runs
    /// whose process died mid-pass or that hit an infrastructure error.
    pub async fn resume_orphans(&self) -> Result<Vec<String>> {
        let (active, pending) = self
            .engine
            .db
            .call(|db| Ok((db.list_active_runs()?, db.list_pending_approvals()?)))
            .await?;
        let waiting: HashSet<String> = pending.into_iter().map(|a| a.run_id).collect();

        let orphans: Vec<String> = active
            .into_iter()
            .map(|run| run.id)
            .filter(|id| !waiting.contains(id))
            .collect();
        for run_id in &orphans {
            tracing::info!(run_id = %run_id, "resuming orphaned run");
            self.spawn_drive(run_id);
        }
        Ok(orphans)
    }

    /// Sweep on an interval until `shutdown` fires.
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        let period = Duration::from_secs(self.engine.config.approval.sweep_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %format!("{:#}", e), "approval sweep failed");
                    }
                    self.retry_failed_passes(Utc::now());
                }
            }
        }
        tracing::debug!("approval sweeper stopped");
    }
}
