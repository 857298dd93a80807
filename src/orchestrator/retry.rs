//! Implementation retry loop.
//!
//! Each attempt starts from a clean branch cut from the target ref, runs a
//! brand-new coding agent, then runs the gate battery. Failures feed the
//! next attempt's prompt; the branch itself never carries over.

use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use shipwright_common::{
    AnalysisOutput, Approach, ChangeType, CoderReport, Condition, FileChange, GateResult,
    ImplementationOutput, Validate, all_gates_passed,
};

use crate::agent::AgentContext;
use crate::environment::{Environment, shell_quote};
use crate::errors::WorkflowError;
use crate::gates::{GateRunner, failure_summary};
use crate::phases::RunBrief;
use crate::phases::implementation::{CoderBrief, run_attempt};
use crate::phases::prompts::PreviousAttempt;

/// Coding attempts before the phase fails.
pub const MAX_ATTEMPTS: u32 = 5;

/// Tail bytes of a failed gate's output quoted in the next attempt's prompt.
pub const RETRY_EXCERPT: usize = 3_000;

const GIT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ImplementationPlan<'a> {
    pub brief: &'a RunBrief,
    pub analysis: &'a AnalysisOutput,
    pub approach: &'a Approach,
    pub conditions: &'a [Condition],
    pub branch: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checked {
    gate_results: Vec<GateResult>,
    files: Vec<FileChange>,
}

pub async fn implement(
    ctx: &AgentContext,
    gates: &GateRunner,
    plan: &ImplementationPlan<'_>,
) -> Result<ImplementationOutput, WorkflowError> {
    let env = ctx.env.as_ref();
    let target = plan.brief.target_branch.as_str();
    let mut previous: Option<PreviousAttempt> = None;
    let mut last_results = Vec::new();

    for attempt in 1..=MAX_ATTEMPTS {
        let scope = format!("implementation/attempt-{}", attempt);

        ctx.journal
            .step(&format!("{}/prepare", scope), || async {
                prepare_branch(env, attempt, plan.branch, target).await?;
                Ok(())
            })
            .await?;

        let coder = CoderBrief {
            brief: plan.brief,
            analysis: plan.analysis,
            approach: plan.approach,
            conditions: plan.conditions,
            attempt,
            previous: previous.as_ref(),
        };
        let report: CoderReport = ctx
            .journal
            .step(&format!("{}/report", scope), || run_attempt(ctx, &coder))
            .await?;

        let checked: Checked = ctx
            .journal
            .step(&format!("{}/gates", scope), || async {
                let commands = gates.commands_for(env).await;
                let gate_results = gates.run(env, &commands).await?;
                let files = changed_files(env, target).await?;
                Ok(Checked { gate_results, files })
            })
            .await?;

        if all_gates_passed(&checked.gate_results) {
            ctx.journal
                .step(&format!("{}/commit", scope), || async {
                    commit(env, &commit_message(plan)).await?;
                    Ok(())
                })
                .await?;
            tracing::info!(
                run_id = %plan.brief.run_id,
                attempt,
                files = checked.files.len(),
                "implementation accepted"
            );
            let output = ImplementationOutput {
                branch: plan.branch.to_string(),
                files_changed: checked.files,
                gate_results: checked.gate_results,
                total_coder_attempts: attempt,
                conditions_addressed: report.conditions_addressed,
            };
            output
                .validate()
                .map_err(|e| WorkflowError::validation(ctx.phase, e.to_string()))?;
            return Ok(output);
        }

        let gate_failure = failure_summary(&checked.gate_results, RETRY_EXCERPT)
            .unwrap_or_else(|| "The gate battery did not complete.".to_string());
        tracing::warn!(
            run_id = %plan.brief.run_id,
            attempt,
            failed_gate = checked.gate_results.last().map(|r| r.gate.as_str()).unwrap_or("none"),
            "implementation attempt failed gates"
        );
        previous = Some(PreviousAttempt {
            attempt,
            touched_files: checked.files.iter().map(|f| f.path.clone()).collect(),
            summary: report.summary,
            gate_failure,
        });
        last_results = checked.gate_results;
    }

    Err(WorkflowError::GatesExhausted {
        attempts: MAX_ATTEMPTS,
        gate_results: last_results,
    })
}

/// Commands that put the branch at the target ref. Later attempts first
/// discard everything the previous coder left behind.
pub fn prepare_commands(attempt: u32, branch: &str, target: &str) -> Vec<String> {
    let checkout = format!(
        "git checkout -B {} {}",
        shell_quote(branch),
        shell_quote(&format!("origin/{}", target))
    );
    if attempt <= 1 {
        vec![checkout]
    } else {
        vec!["git reset --hard".to_string(), "git clean -fd".to_string(), checkout]
    }
}

async fn prepare_branch(env: &dyn Environment, attempt: u32, branch: &str, target: &str) -> anyhow::Result<()> {
    for command in prepare_commands(attempt, branch, target) {
        let out = env.exec(&command, GIT_TIMEOUT).await?;
        if !out.success() {
            bail!("`{}` failed: {}", command, out.combined().trim());
        }
    }
    tracing::debug!(attempt, branch, target, "branch prepared");
    Ok(())
}

/// Files changed relative to the target ref, staged or not.
async fn changed_files(env: &dyn Environment, target: &str) -> anyhow::Result<Vec<FileChange>> {
    let command = format!(
        "git add -A && git diff --cached --name-status {}",
        shell_quote(&format!("origin/{}", target))
    );
    let out = env
        .exec(&command, GIT_TIMEOUT)
        .await
        .context("Failed to list changed files")?;
    if !out.success() {
        bail!("`{}` failed: {}", command, out.combined().trim());
    }
    Ok(parse_name_status(&out.stdout))
}

/// Parse `git diff --name-status` output. Renames report the new path.
pub fn parse_name_status(output: &str) -> Vec<FileChange> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let status = fields.next()?;
            let change_type = ChangeType::from_git_status(status)?;
            let path = fields.last()?;
            Some(FileChange {
                path: path.to_string(),
                change_type,
            })
        })
        .collect()
}

fn commit_message(plan: &ImplementationPlan<'_>) -> String {
    format!("{}\n\n{}\n\nRun: {}", plan.approach.title, plan.approach.summary, plan.brief.run_id)
}

async fn commit(env: &dyn Environment, message: &str) -> anyhow::Result<()> {
    let command = format!(
        "git add -A && (git diff --cached --quiet || git -c user.name=shipwright -c user.email=shipwright@localhost commit -q -m {})",
        shell_quote(message)
    );
    let out = env.exec(&command, GIT_TIMEOUT).await?;
    if !out.success() {
        bail!("commit failed: {}", out.combined().trim());
    }
    Ok(())
}
