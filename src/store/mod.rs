//! SQLite persistence for runs, phase results, agent invocations, approval
//! requests, memories and the workflow step journal.
//!
//! Every create is an `INSERT OR IGNORE` keyed on a caller-supplied
//! identity, so replaying a step after a crash never produces a second row.

pub mod models;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use shipwright_common::{
    ApprovalKind, ApprovalResponsePayload, MemoryKind, MemoryRecord, Phase, PhaseStatus,
};

use crate::errors::ApprovalError;
pub use models::*;

/// A run was asked to move somewhere the phase order does not allow.
#[derive(Debug, thiserror::Error)]
#[error("invalid phase transition {from} -> {to} for run {run_id}")]
pub struct InvalidTransition {
    pub run_id: String,
    pub from: Phase,
    pub to: Phase,
}

/// Async-safe handle to the store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl DbHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the store synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct Store {
    conn: Connection,
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse::<T>().map_err(|e| anyhow::anyhow!(e))
}

fn parse_json(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(&s).context("Stored JSON is invalid"))
        .transpose()
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(decode_ts).transpose()
}

struct RunRow {
    id: String,
    request: String,
    repo_url: String,
    target_branch: String,
    runtime: String,
    environment: Option<String>,
    current_phase: String,
    failure_reason: Option<String>,
    pr_url: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    const COLUMNS: &'static str = "id, request, repo_url, target_branch, runtime, environment, current_phase, failure_reason, pr_url, created_at, completed_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request: row.get(1)?,
            repo_url: row.get(2)?,
            target_branch: row.get(3)?,
            runtime: row.get(4)?,
            environment: row.get(5)?,
            current_phase: row.get(6)?,
            failure_reason: row.get(7)?,
            pr_url: row.get(8)?,
            created_at: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            request: self.request,
            repo_url: self.repo_url,
            target_branch: self.target_branch,
            runtime: self.runtime,
            environment: parse_json(self.environment)?,
            current_phase: parse_enum(&self.current_phase)?,
            failure_reason: self.failure_reason,
            pr_url: self.pr_url,
            created_at: decode_ts(&self.created_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

struct PhaseRow {
    id: String,
    run_id: String,
    phase: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl PhaseRow {
    const COLUMNS: &'static str =
        "id, run_id, phase, status, output, error, started_at, completed_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            phase: row.get(2)?,
            status: row.get(3)?,
            output: row.get(4)?,
            error: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_phase_result(self) -> Result<PhaseResult> {
        Ok(PhaseResult {
            id: self.id,
            run_id: self.run_id,
            phase: parse_enum(&self.phase)?,
            status: parse_enum::<PhaseStatus>(&self.status)?,
            output: parse_json(self.output)?,
            error: self.error,
            started_at: decode_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

struct InvocationRow {
    id: String,
    phase_result_id: String,
    parent_id: Option<String>,
    name: String,
    model: String,
    system_prompt: String,
    input: String,
    finish_reason: Option<String>,
    output: Option<String>,
    usage: Option<String>,
    steps: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl InvocationRow {
    const COLUMNS: &'static str = "id, phase_result_id, parent_id, name, model, system_prompt, input, finish_reason, output, usage, steps, started_at, completed_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            phase_result_id: row.get(1)?,
            parent_id: row.get(2)?,
            name: row.get(3)?,
            model: row.get(4)?,
            system_prompt: row.get(5)?,
            input: row.get(6)?,
            finish_reason: row.get(7)?,
            output: row.get(8)?,
            usage: row.get(9)?,
            steps: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
        })
    }

    fn into_invocation(self) -> Result<AgentInvocation> {
        Ok(AgentInvocation {
            id: self.id,
            phase_result_id: self.phase_result_id,
            parent_id: self.parent_id,
            name: self.name,
            model: self.model,
            system_prompt: self.system_prompt,
            input: serde_json::from_str(&self.input).context("Stored invocation input is invalid")?,
            finish_reason: self.finish_reason,
            output: self.output,
            usage: parse_json(self.usage)?,
            steps: parse_json(self.steps)?,
            started_at: decode_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

struct ApprovalRow {
    id: String,
    run_id: String,
    phase_result_id: Option<String>,
    tool_call_id: Option<String>,
    kind: String,
    request: String,
    response: Option<String>,
    requested_at: String,
    responded_at: Option<String>,
    deadline: String,
    timed_out: bool,
}

impl ApprovalRow {
    const COLUMNS: &'static str = "id, run_id, phase_result_id, tool_call_id, kind, request, response, requested_at, responded_at, deadline, timed_out";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            phase_result_id: row.get(2)?,
            tool_call_id: row.get(3)?,
            kind: row.get(4)?,
            request: row.get(5)?,
            response: row.get(6)?,
            requested_at: row.get(7)?,
            responded_at: row.get(8)?,
            deadline: row.get(9)?,
            timed_out: row.get(10)?,
        })
    }

    /// Payloads are stored schema-less and validated here, on read.
    fn into_approval(self) -> Result<ApprovalRequest> {
        let kind: ApprovalKind = parse_enum(&self.kind)?;
        let request: shipwright_common::ApprovalRequestPayload =
            serde_json::from_str(&self.request)
                .with_context(|| format!("Approval {} has an invalid request payload", self.id))?;
        if request.kind() != kind {
            anyhow::bail!(
                "Approval {} kind column '{}' disagrees with payload kind '{}'",
                self.id,
                kind,
                request.kind()
            );
        }
        let response = self
            .response
            .map(|raw| serde_json::from_str::<ApprovalResponsePayload>(&raw))
            .transpose()
            .with_context(|| format!("Approval {} has an invalid response payload", self.id))?;
        Ok(ApprovalRequest {
            id: self.id,
            run_id: self.run_id,
            phase_result_id: self.phase_result_id,
            tool_call_id: self.tool_call_id,
            kind,
            request,
            response,
            requested_at: decode_ts(&self.requested_at)?,
            responded_at: parse_opt_ts(self.responded_at)?,
            deadline: decode_ts(&self.deadline)?,
            timed_out: self.timed_out,
        })
    }
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
            .context("Failed to configure SQLite")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    request TEXT NOT NULL,
                    repo_url TEXT NOT NULL,
                    target_branch TEXT NOT NULL,
                    runtime TEXT NOT NULL,
                    environment TEXT,
                    current_phase TEXT NOT NULL DEFAULT 'analysis',
                    failure_reason TEXT,
                    pr_url TEXT,
                    created_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS memories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    dedupe_key TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(run_id, dedupe_key)
                );

                CREATE TABLE IF NOT EXISTS phase_results (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    output TEXT,
                    error TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    UNIQUE(run_id, phase)
                );

                CREATE TABLE IF NOT EXISTS agent_invocations (
                    id TEXT PRIMARY KEY,
                    phase_result_id TEXT NOT NULL REFERENCES phase_results(id) ON DELETE CASCADE,
                    parent_id TEXT REFERENCES agent_invocations(id),
                    name TEXT NOT NULL,
                    model TEXT NOT NULL,
                    system_prompt TEXT NOT NULL,
                    input TEXT NOT NULL,
                    finish_reason TEXT,
                    output TEXT,
                    usage TEXT,
                    steps TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS approval_requests (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    phase_result_id TEXT REFERENCES phase_results(id),
                    tool_call_id TEXT,
                    kind TEXT NOT NULL,
                    request TEXT NOT NULL,
                    response TEXT,
                    requested_at TEXT NOT NULL,
                    responded_at TEXT,
                    deadline TEXT NOT NULL,
                    timed_out INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS workflow_steps (
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_key TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    PRIMARY KEY (run_id, step_key)
                );

                CREATE INDEX IF NOT EXISTS idx_memories_run ON memories(run_id);
                CREATE INDEX IF NOT EXISTS idx_phase_results_run ON phase_results(run_id);
                CREATE INDEX IF NOT EXISTS idx_invocations_phase ON agent_invocations(phase_result_id);
                CREATE INDEX IF NOT EXISTS idx_approvals_run ON approval_requests(run_id);
                CREATE INDEX IF NOT EXISTS idx_approvals_pending
                    ON approval_requests(deadline) WHERE response IS NULL AND timed_out = 0;
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Insert a run in `analysis`. A second call with the same id is a no-op.
    pub fn create_run(&self, new: &NewRun) -> Result<Run> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO runs (id, request, repo_url, target_branch, runtime, current_phase, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.id,
                    new.request,
                    new.repo_url,
                    new.target_branch,
                    new.runtime,
                    Phase::Analysis.as_str(),
                    encode_ts(Utc::now()),
                ],
            )
            .context("Failed to insert run")?;
        self.get_run(&new.id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RunRow::COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], RunRow::from_row)
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    fn require_run(&self, id: &str) -> Result<Run> {
        self.get_run(id)?
            .with_context(|| format!("Run {} not found", id))
    }

    /// Runs that have not reached `completed` or `failed`, oldest first.
    pub fn list_active_runs(&self) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs WHERE current_phase NOT IN ('completed', 'failed') ORDER BY created_at",
            RunRow::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_active_runs")?;
        let rows = stmt
            .query_map([], RunRow::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    pub fn list_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs ORDER BY created_at DESC LIMIT ?1",
            RunRow::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![limit], RunRow::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    /// Record the execution environment reference. Set once.
    pub fn set_run_environment(&self, id: &str, environment: &serde_json::Value) -> Result<Run> {
        self.conn
            .execute(
                "UPDATE runs SET environment = ?2 WHERE id = ?1 AND environment IS NULL",
                params![id, environment.to_string()],
            )
            .context("Failed to set run environment")?;
        self.require_run(id)
    }

    /// Compare-and-set the run's phase along the fixed order.
    ///
    /// Re-applying a transition that already happened is a no-op; anything
    /// else outside the order fails with [`InvalidTransition`].
    pub fn advance_run(&self, id: &str, from: Phase, to: Phase) -> Result<Run> {
        let run = self.require_run(id)?;
        if run.current_phase == to {
            return Ok(run);
        }
        if run.current_phase != from || !from.can_transition_to(to) || to == Phase::Failed {
            return Err(InvalidTransition {
                run_id: id.to_string(),
                from: run.current_phase,
                to,
            }
            .into());
        }
        let completed_at = to.is_terminal().then(|| encode_ts(Utc::now()));
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET current_phase = ?2, completed_at = COALESCE(?4, completed_at)
                 WHERE id = ?1 AND current_phase = ?3",
                params![id, to.as_str(), from.as_str(), completed_at],
            )
            .context("Failed to advance run")?;
        if changed == 0 {
            anyhow::bail!("Run {} changed phase concurrently", id);
        }
        self.require_run(id)
    }

    /// `pr → completed`, recording the pull request URL.
    pub fn complete_run(&self, id: &str, pr_url: &str) -> Result<Run> {
        self.conn
            .execute(
                "UPDATE runs SET pr_url = COALESCE(pr_url, ?2) WHERE id = ?1",
                params![id, pr_url],
            )
            .context("Failed to record PR url")?;
        self.advance_run(id, Phase::Pr, Phase::Completed)
    }

    /// Move any non-terminal run to `failed`. Idempotent for failed runs.
    pub fn fail_run(&self, id: &str, reason: &str) -> Result<Run> {
        let run = self.require_run(id)?;
        match run.current_phase {
            Phase::Failed => return Ok(run),
            Phase::Completed => {
                return Err(InvalidTransition {
                    run_id: id.to_string(),
                    from: Phase::Completed,
                    to: Phase::Failed,
                }
                .into());
            }
            _ => {}
        }
        self.conn
            .execute(
                "UPDATE runs SET current_phase = 'failed', failure_reason = ?2, completed_at = ?3
                 WHERE id = ?1 AND current_phase NOT IN ('completed', 'failed')",
                params![id, reason, encode_ts(Utc::now())],
            )
            .context("Failed to fail run")?;
        self.require_run(id)
    }

    // ── Memories ──────────────────────────────────────────────────────

    /// Append records produced by `phase`. Keys are positional within the
    /// phase, so re-appending the same batch is a no-op.
    pub fn append_memories(&self, run_id: &str, phase: Phase, records: &[MemoryRecord]) -> Result<()> {
        let now = encode_ts(Utc::now());
        for (idx, record) in records.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO memories (run_id, dedupe_key, phase, kind, content, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        run_id,
                        format!("{}:{}", phase, idx),
                        record.phase.as_str(),
                        record.kind.as_str(),
                        record.content,
                        now,
                    ],
                )
                .context("Failed to insert memory")?;
        }
        Ok(())
    }

    /// All memories in append order.
    pub fn list_memories(&self, run_id: &str) -> Result<Vec<MemoryRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT phase, kind, content FROM memories WHERE run_id = ?1 ORDER BY id")
            .context("Failed to prepare list_memories")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("Failed to query memories")?;
        let mut memories = Vec::new();
        for row in rows {
            let (phase, kind, content) = row.context("Failed to read memory row")?;
            memories.push(MemoryRecord {
                phase: parse_enum(&phase)?,
                kind: parse_enum::<MemoryKind>(&kind)?,
                content,
            });
        }
        Ok(memories)
    }

    // ── Phase results ─────────────────────────────────────────────────

    /// Create the running record for (run, phase), or return the existing one.
    pub fn create_phase_result(&self, run_id: &str, phase: Phase) -> Result<PhaseResult> {
        let id = phase_result_id(run_id, phase);
        self.conn
            .execute(
                "INSERT OR IGNORE INTO phase_results (id, run_id, phase, status, started_at)
                 VALUES (?1, ?2, ?3, 'running', ?4)",
                params![id, run_id, phase.as_str(), encode_ts(Utc::now())],
            )
            .context("Failed to insert phase result")?;
        self.get_phase_result(&id)?
            .context("Phase result not found after insert")
    }

    pub fn get_phase_result(&self, id: &str) -> Result<Option<PhaseResult>> {
        let sql = format!("SELECT {} FROM phase_results WHERE id = ?1", PhaseRow::COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], PhaseRow::from_row)
            .optional()
            .context("Failed to query phase result")?;
        row.map(PhaseRow::into_phase_result).transpose()
    }

    pub fn list_phase_results(&self, run_id: &str) -> Result<Vec<PhaseResult>> {
        let sql = format!(
            "SELECT {} FROM phase_results WHERE run_id = ?1 ORDER BY started_at, rowid",
            PhaseRow::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_phase_results")?;
        let rows = stmt
            .query_map(params![run_id], PhaseRow::from_row)
            .context("Failed to query phase results")?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row.context("Failed to read phase result row")?.into_phase_result()?);
        }
        Ok(results)
    }

    /// `running → passed`. A second call is a no-op.
    pub fn pass_phase_result(&self, id: &str, output: &serde_json::Value) -> Result<PhaseResult> {
        self.conn
            .execute(
                "UPDATE phase_results SET status = 'passed', output = ?2, completed_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id, output.to_string(), encode_ts(Utc::now())],
            )
            .context("Failed to pass phase result")?;
        let result = self
            .get_phase_result(id)?
            .with_context(|| format!("Phase result {} not found", id))?;
        if result.status == PhaseStatus::Failed {
            anyhow::bail!("Phase result {} already failed; cannot pass it", id);
        }
        Ok(result)
    }

    /// Keep `output` on a running result that is about to fail, for
    /// diagnosis. Leaves the status alone.
    pub fn attach_phase_output(&self, id: &str, output: &serde_json::Value) -> Result<()> {
        self.conn
            .execute(
                "UPDATE phase_results SET output = ?2 WHERE id = ?1 AND status = 'running'",
                params![id, output.to_string()],
            )
            .context("Failed to attach phase output")?;
        Ok(())
    }

    /// `running → failed`, or `passed → failed` when the gate following the
    /// phase timed out. Failed results are never reopened.
    pub fn fail_phase_result(&self, id: &str, error: &str) -> Result<PhaseResult> {
        self.conn
            .execute(
                "UPDATE phase_results SET status = 'failed', error = ?2, completed_at = ?3
                 WHERE id = ?1 AND status IN ('running', 'passed')",
                params![id, error, encode_ts(Utc::now())],
            )
            .context("Failed to fail phase result")?;
        self.get_phase_result(id)?
            .with_context(|| format!("Phase result {} not found", id))
    }

    // ── Agent invocations ─────────────────────────────────────────────

    pub fn create_invocation(&self, new: &NewInvocation) -> Result<AgentInvocation> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO agent_invocations
                 (id, phase_result_id, parent_id, name, model, system_prompt, input, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.id,
                    new.phase_result_id,
                    new.parent_id,
                    new.name,
                    new.model,
                    new.system_prompt,
                    new.input.to_string(),
                    encode_ts(Utc::now()),
                ],
            )
            .context("Failed to insert agent invocation")?;
        self.get_invocation(&new.id)?
            .context("Invocation not found after insert")
    }

    /// Record how an agent stopped. Only the first completion sticks.
    pub fn complete_invocation(&self, id: &str, done: &InvocationCompletion) -> Result<AgentInvocation> {
        self.conn
            .execute(
                "UPDATE agent_invocations
                 SET finish_reason = ?2, output = ?3, usage = ?4, steps = ?5, completed_at = ?6
                 WHERE id = ?1 AND completed_at IS NULL",
                params![
                    id,
                    done.finish_reason,
                    done.output,
                    done.usage.to_string(),
                    done.steps.to_string(),
                    encode_ts(Utc::now()),
                ],
            )
            .context("Failed to complete agent invocation")?;
        self.get_invocation(id)?
            .with_context(|| format!("Invocation {} not found", id))
    }

    pub fn get_invocation(&self, id: &str) -> Result<Option<AgentInvocation>> {
        let sql = format!("SELECT {} FROM agent_invocations WHERE id = ?1", InvocationRow::COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], InvocationRow::from_row)
            .optional()
            .context("Failed to query invocation")?;
        row.map(InvocationRow::into_invocation).transpose()
    }

    pub fn list_invocations(&self, phase_result_id: &str) -> Result<Vec<AgentInvocation>> {
        let sql = format!(
            "SELECT {} FROM agent_invocations WHERE phase_result_id = ?1 ORDER BY started_at, rowid",
            InvocationRow::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_invocations")?;
        let rows = stmt
            .query_map(params![phase_result_id], InvocationRow::from_row)
            .context("Failed to query invocations")?;
        let mut invocations = Vec::new();
        for row in rows {
            invocations.push(row.context("Failed to read invocation row")?.into_invocation()?);
        }
        Ok(invocations)
    }

    // ── Approval requests ─────────────────────────────────────────────

    pub fn create_approval(&self, new: &NewApproval) -> Result<ApprovalRequest> {
        let request = serde_json::to_string(&new.request).context("Failed to encode approval request")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO approval_requests
                 (id, run_id, phase_result_id, tool_call_id, kind, request, requested_at, deadline)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.id,
                    new.run_id,
                    new.phase_result_id,
                    new.tool_call_id,
                    new.request.kind().as_str(),
                    request,
                    encode_ts(Utc::now()),
                    encode_ts(new.deadline),
                ],
            )
            .context("Failed to insert approval request")?;
        self.get_approval(&new.id)?
            .context("Approval not found after insert")
    }

    pub fn get_approval(&self, id: &str) -> Result<Option<ApprovalRequest>> {
        let sql = format!("SELECT {} FROM approval_requests WHERE id = ?1", ApprovalRow::COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], ApprovalRow::from_row)
            .optional()
            .context("Failed to query approval")?;
        row.map(ApprovalRow::into_approval).transpose()
    }

    fn query_approvals(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ApprovalRequest>> {
        let sql = format!(
            "SELECT {} FROM approval_requests WHERE {} ORDER BY requested_at, rowid",
            ApprovalRow::COLUMNS,
            filter
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare approval query")?;
        let rows = stmt
            .query_map(args, ApprovalRow::from_row)
            .context("Failed to query approvals")?;
        let mut approvals = Vec::new();
        for row in rows {
            approvals.push(row.context("Failed to read approval row")?.into_approval()?);
        }
        Ok(approvals)
    }

    /// Approvals still waiting for a human.
    pub fn list_pending_approvals(&self) -> Result<Vec<ApprovalRequest>> {
        self.query_approvals("response IS NULL AND timed_out = 0", &[])
    }

    pub fn list_run_approvals(&self, run_id: &str) -> Result<Vec<ApprovalRequest>> {
        self.query_approvals("run_id = ?1", &[&run_id])
    }

    /// Pending approvals whose deadline is at or before `now`.
    pub fn list_due_approvals(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>> {
        let now = encode_ts(now);
        self.query_approvals(
            "response IS NULL AND timed_out = 0 AND deadline <= ?1",
            &[&now],
        )
    }

    /// Set the response of a pending approval. The outer `Result` carries
    /// storage failures, the inner one the correlation/validation outcome.
    pub fn respond_approval(
        &self,
        id: &str,
        response: &ApprovalResponsePayload,
    ) -> Result<std::result::Result<ApprovalRequest, ApprovalError>> {
        let Some(existing) = self.get_approval(id)? else {
            return Ok(Err(ApprovalError::NotFound(id.to_string())));
        };
        if existing.timed_out {
            return Ok(Err(ApprovalError::TimedOut(id.to_string())));
        }
        if existing.response.is_some() {
            return Ok(Err(ApprovalError::AlreadyResolved(id.to_string())));
        }
        if existing.kind != response.kind() {
            return Ok(Err(ApprovalError::KindMismatch {
                id: id.to_string(),
                expected: existing.kind,
                actual: response.kind(),
            }));
        }
        if let Err(e) = existing.request.accepts(response) {
            return Ok(Err(ApprovalError::InvalidResponse {
                id: id.to_string(),
                message: e.to_string(),
            }));
        }

        let encoded = serde_json::to_string(response).context("Failed to encode approval response")?;
        let changed = self
            .conn
            .execute(
                "UPDATE approval_requests SET response = ?2, responded_at = ?3
                 WHERE id = ?1 AND response IS NULL AND timed_out = 0",
                params![id, encoded, encode_ts(Utc::now())],
            )
            .context("Failed to record approval response")?;
        if changed == 0 {
            // Lost a race with another responder or the timeout sweep.
            let current = self.get_approval(id)?.context("Approval vanished")?;
            return Ok(Err(if current.timed_out {
                ApprovalError::TimedOut(id.to_string())
            } else {
                ApprovalError::AlreadyResolved(id.to_string())
            }));
        }
        Ok(Ok(self.get_approval(id)?.context("Approval vanished")?))
    }

    /// Mark a pending approval timed out. Returns the row as it stands
    /// afterwards; a response that won the race is left intact.
    pub fn timeout_approval(&self, id: &str) -> Result<ApprovalRequest> {
        self.conn
            .execute(
                "UPDATE approval_requests SET timed_out = 1 WHERE id = ?1 AND response IS NULL",
                params![id],
            )
            .context("Failed to time out approval")?;
        self.get_approval(id)?
            .with_context(|| format!("Approval {} not found", id))
    }

    // ── Workflow step journal ─────────────────────────────────────────

    pub fn get_step(&self, run_id: &str, step_key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT outcome FROM workflow_steps WHERE run_id = ?1 AND step_key = ?2",
                params![run_id, step_key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query workflow step")
    }

    /// Record a step outcome. First write wins; the stored outcome is
    /// returned so a racing replay converges on one value.
    pub fn record_step(&self, run_id: &str, step_key: &str, outcome: &str) -> Result<String> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO workflow_steps (run_id, step_key, outcome, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, step_key, outcome, encode_ts(Utc::now())],
            )
            .context("Failed to record workflow step")?;
        self.get_step(run_id, step_key)?
            .context("Workflow step not found after insert")
    }

    pub fn count_steps(&self, run_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM workflow_steps WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to count workflow steps")
    }

    // ── Aggregates ────────────────────────────────────────────────────

    pub fn run_detail(&self, id: &str) -> Result<Option<RunDetail>> {
        let Some(run) = self.get_run(id)? else {
            return Ok(None);
        };
        let memories = self.list_memories(id)?;
        let phases = self.list_phase_results(id)?;
        let pending_approval = self
            .list_run_approvals(id)?
            .into_iter()
            .find(ApprovalRequest::is_pending);
        Ok(Some(RunDetail {
            run,
            memories,
            phases,
            pending_approval,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_common::{ApprovalRequestPayload, ChoiceOption};

    fn new_run(id: &str) -> NewRun {
        NewRun {
            id: id.to_string(),
            request: "Add dark mode".to_string(),
            repo_url: "https://github.com/acme/app".to_string(),
            target_branch: "main".to_string(),
            runtime: "node".to_string(),
        }
    }

    fn approval(store: &Store, id: &str, request: ApprovalRequestPayload) -> ApprovalRequest {
        store
            .create_approval(&NewApproval {
                id: id.to_string(),
                run_id: "r1".to_string(),
                phase_result_id: None,
                tool_call_id: None,
                request,
                deadline: Utc::now() + chrono::Duration::days(14),
            })
            .unwrap()
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let store = Store::new_in_memory()?;
        let table_count: i32 = store.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('runs', 'memories', 'phase_results', 'agent_invocations', 'approval_requests', 'workflow_steps')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 6);
        Ok(())
    }

    #[test]
    fn test_create_run_twice_yields_one_row() -> Result<()> {
        let store = Store::new_in_memory()?;
        let first = store.create_run(&new_run("r1"))?;
        let mut again = new_run("r1");
        again.request = "something else".to_string();
        let second = store.create_run(&again)?;

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.request, "Add dark mode");
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        assert_eq!(count, 1);
        assert_eq!(first.current_phase, Phase::Analysis);
        Ok(())
    }

    #[test]
    fn test_create_phase_result_twice_yields_one_row() -> Result<()> {
        let store = Store::new_in_memory()?;
        store.create_run(&new_run("r1"))?;
        let a = store.create_phase_result("r1", Phase::Analysis)?;
        let b = store.create_phase_result("r1", Phase::Analysis)?;
        assert_eq!(a.id, b.id);
        assert_eq!(store.list_phase_results("r1")?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_advance_run_follows_order() -> Result<()> {
        let store = Store::new_in_memory()?;
        store.create_run(&new_run("r1"))?;

        let run = store.advance_run("r1", Phase::Analysis, Phase::Approaches)?;
        assert_eq!(run.current_phase, Phase::Approaches);

        // Replayed advance is a no-op.
        let run = store.advance_run("r1", Phase::Analysis, Phase::Approaches)?;
        assert_eq!(run.current_phase, Phase::Approaches);

        // Skipping is refused.
        let err = store
            .advance_run("r1", Phase::Approaches, Phase::Implementation)
            .unwrap_err();
        assert!(err.downcast_ref::<InvalidTransition>().is_some());

        // Backwards is refused.
        let err = store
            .advance_run("r1", Phase::Approaches, Phase::Analysis)
            .unwrap_err();
        assert!(err.downcast_ref::<InvalidTransition>().is_some());
        Ok(())
    }

    #[test]
    fn test_complete_and_fail_are_terminal() -> Result<()> {
        let store = Store::new_in_memory()?;
        store.create_run(&new_run("r1"))?;
        for (from, to) in [
            (Phase::Analysis, Phase::Approaches),
            (Phase::Approaches, Phase::Judging),
            (Phase::Judging, Phase::Implementation),
            (Phase::Implementation, Phase::Pr),
        ] {
            store.advance_run("r1", from, to)?;
        }
        let run = store.complete_run("r1", "https://github.com/acme/app/pull/7")?;
        assert_eq!(run.current_phase, Phase::Completed);
        assert!(run.completed_at.is_some());
        assert!(store.fail_run("r1", "late failure").is_err());

        store.create_run(&new_run("r2"))?;
        let failed = store.fail_run("r2", "analysis failed (validation)")?;
        assert_eq!(failed.current_phase, Phase::Failed);
        let again = store.fail_run("r2", "other reason")?;
        assert_eq!(again.failure_reason.as_deref(), Some("analysis failed (validation)"));
        assert_eq!(store.list_active_runs()?.len(), 0);
        Ok(())
    }

    #[test]
    fn test_phase_result_transitions() -> Result<()> {
        let store = Store::new_in_memory()?;
        store.create_run(&new_run("r1"))?;
        let pr = store.create_phase_result("r1", Phase::Judging)?;
        let passed = store.pass_phase_result(&pr.id, &serde_json::json!({"ok": true}))?;
        assert_eq!(passed.status, PhaseStatus::Passed);

        // Gate timeout downgrade.
        let failed = store.fail_phase_result(&pr.id, "gate timed out")?;
        assert_eq!(failed.status, PhaseStatus::Failed);

        // Never reopened.
        assert!(store.pass_phase_result(&pr.id, &serde_json::json!({})).is_err());
        // Output is only attached while running.
        store.attach_phase_output(&pr.id, &serde_json::json!({"late": true}))?;
        assert_eq!(store.get_phase_result(&pr.id)?.unwrap().output, Some(serde_json::json!({"ok": true})));
        let still = store.create_phase_result("r1", Phase::Judging)?;
        assert_eq!(still.status, PhaseStatus::Failed);
        Ok(())
    }

    #[test]
    fn test_memories_append_only_and_idempotent() -> Result<()> {
        let store = Store::new_in_memory()?;
        store.create_run(&new_run("r1"))?;
        let batch = vec![
            MemoryRecord::new(Phase::Analysis, MemoryKind::Insight, "uses sqlite"),
            MemoryRecord::new(Phase::Analysis, MemoryKind::Constraint, "no new deps"),
        ];
        store.append_memories("r1", Phase::Analysis, &batch)?;
        store.append_memories("r1", Phase::Analysis, &batch)?;
        store.append_memories(
            "r1",
            Phase::Approaches,
            &[MemoryRecord::new(Phase::Approaches, MemoryKind::Decision, "option b")],
        )?;
        let memories = store.list_memories("r1")?;
        assert_eq!(memories.len(), 3);
        assert_eq!(memories[0].content, "uses sqlite");
        assert_eq!(memories[2].phase, Phase::Approaches);
        Ok(())
    }

    #[test]
    fn test_respond_approval_exactly_once() -> Result<()> {
        let store = Store::new_in_memory()?;
        store.create_run(&new_run("r1"))?;
        approval(
            &store,
            "a1",
            ApprovalRequestPayload::Approval {
                message: "Proceed?".into(),
            },
        );
        let yes = ApprovalResponsePayload::Approval {
            approved: true,
            reason: None,
        };
        let answered = store.respond_approval("a1", &yes)?.unwrap();
        assert_eq!(answered.response, Some(yes.clone()));
        assert!(answered.responded_at.is_some());

        let dup = store.respond_approval("a1", &yes)?;
        assert_eq!(dup.unwrap_err(), ApprovalError::AlreadyResolved("a1".into()));
        Ok(())
    }

    #[test]
    fn test_respond_unknown_correlation_is_rejected() -> Result<()> {
        let store = Store::new_in_memory()?;
        let res = store.respond_approval(
            "missing",
            &ApprovalResponsePayload::Text { text: "hi".into() },
        )?;
        assert_eq!(res.unwrap_err(), ApprovalError::NotFound("missing".into()));
        Ok(())
    }

    #[test]
    fn test_respond_kind_mismatch_and_bad_option() -> Result<()> {
        let store = Store::new_in_memory()?;
        store.create_run(&new_run("r1"))?;
        approval(
            &store,
            "c1",
            ApprovalRequestPayload::Choice {
                prompt: "Which?".into(),
                options: vec![
                    ChoiceOption { id: "a".into(), label: "A".into() },
                    ChoiceOption { id: "b".into(), label: "B".into() },
                ],
            },
        );
        let mismatch = store.respond_approval("c1", &ApprovalResponsePayload::Text { text: "a".into() })?;
        assert!(matches!(mismatch, Err(ApprovalError::KindMismatch { .. })));

        let unknown = store.respond_approval(
            "c1",
            &ApprovalResponsePayload::Choice { selected_id: "z".into() },
        )?;
        assert!(matches!(unknown, Err(ApprovalError::InvalidResponse { .. })));

        // Rejections did not consume the approval.
        assert!(store.get_approval("c1")?.unwrap().is_pending());
        Ok(())
    }

    #[test]
    fn test_timeout_blocks_later_response() -> Result<()> {
        let store = Store::new_in_memory()?;
        store.create_run(&new_run("r1"))?;
        approval(&store, "a1", ApprovalRequestPayload::Approval { message: "ok?".into() });
        let timed_out = store.timeout_approval("a1")?;
        assert!(timed_out.timed_out);

        let late = store.respond_approval(
            "a1",
            &ApprovalResponsePayload::Approval { approved: true, reason: None },
        )?;
        assert_eq!(late.unwrap_err(), ApprovalError::TimedOut("a1".into()));
        Ok(())
    }

    #[test]
    fn test_due_approvals() -> Result<()> {
        let store = Store::new_in_memory()?;
        store.create_run(&new_run("r1"))?;
        approval(&store, "a1", ApprovalRequestPayload::Approval { message: "ok?".into() });
        assert!(store.list_due_approvals(Utc::now())?.is_empty());
        let later = Utc::now() + chrono::Duration::days(15);
        assert_eq!(store.list_due_approvals(later)?.len(), 1);
        assert_eq!(store.list_pending_approvals()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_step_journal_first_write_wins() -> Result<()> {
        let store = Store::new_in_memory()?;
        store.create_run(&new_run("r1"))?;
        assert!(store.get_step("r1", "analysis/model/0")?.is_none());
        let first = store.record_step("r1", "analysis/model/0", "\"one\"")?;
        let second = store.record_step("r1", "analysis/model/0", "\"two\"")?;
        assert_eq!(first, "\"one\"");
        assert_eq!(second, "\"one\"");
        assert_eq!(store.count_steps("r1")?, 1);
        Ok(())
    }

    #[test]
    fn test_invocation_completes_once() -> Result<()> {
        let store = Store::new_in_memory()?;
        store.create_run(&new_run("r1"))?;
        let phase = store.create_phase_result("r1", Phase::Analysis)?;
        let parent = store.create_invocation(&NewInvocation {
            id: "inv-1".into(),
            phase_result_id: phase.id.clone(),
            parent_id: None,
            name: "analysis".into(),
            model: "m".into(),
            system_prompt: "sys".into(),
            input: serde_json::json!([]),
        })?;
        store.create_invocation(&NewInvocation {
            id: "inv-2".into(),
            phase_result_id: phase.id.clone(),
            parent_id: Some(parent.id.clone()),
            name: "explorer".into(),
            model: "m".into(),
            system_prompt: "sys".into(),
            input: serde_json::json!([]),
        })?;

        let done = InvocationCompletion {
            finish_reason: "end_turn".into(),
            output: "first".into(),
            usage: serde_json::json!({"input_tokens": 1}),
            steps: serde_json::json!([]),
        };
        store.complete_invocation("inv-1", &done)?;
        let mut again = done.clone();
        again.output = "second".into();
        let inv = store.complete_invocation("inv-1", &again)?;
        assert_eq!(inv.output.as_deref(), Some("first"));

        let all = store.list_invocations(&phase.id)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].parent_id.as_deref(), Some("inv-1"));
        Ok(())
    }
}
