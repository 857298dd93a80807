//! Starting, resuming and inspecting runs: `shipwright run`, `resume`, `status`.

use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use shipwright::approval::submit_response;
use shipwright::config::ShipwrightConfig;
use shipwright::orchestrator::scheduler::Scheduler;
use shipwright::orchestrator::{RunState, RunTrigger};
use shipwright::store::{ApprovalRequest, PhaseResult};
use shipwright_common::{ApprovalRequestPayload, ApprovalResponsePayload, PhaseStatus};

use super::{build_scheduler, open_db};

pub async fn cmd_run(config: &ShipwrightConfig, trigger: RunTrigger, interactive: bool) -> Result<()> {
    let db = open_db(config)?;
    let scheduler = build_scheduler(config, db)?;
    let run = scheduler.create(trigger).await?;
    println!("{} {}", style("Run created:").bold(), style(&run.id).cyan());
    drive_until_settled(&scheduler, &run.id, interactive).await
}

pub async fn cmd_resume(config: &ShipwrightConfig, run_id: &str, interactive: bool) -> Result<()> {
    let db = open_db(config)?;
    let scheduler = build_scheduler(config, db)?;
    drive_until_settled(&scheduler, run_id, interactive).await
}

/// Drive `run_id` until it completes, fails, or waits on a human who is
/// not answering inline.
pub async fn drive_until_settled(scheduler: &Scheduler, run_id: &str, interactive: bool) -> Result<()> {
    loop {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(format!("driving run {}", run_id));
        spinner.enable_steady_tick(Duration::from_millis(120));
        let state = scheduler.drive(run_id).await;
        spinner.finish_and_clear();

        match state? {
            RunState::Completed { pr_url } => {
                println!("{} {}", style("Pull request opened:").green().bold(), pr_url);
                return Ok(());
            }
            RunState::Failed { reason } => {
                println!("{} {}", style("Run failed:").red().bold(), reason);
                anyhow::bail!("run {} failed", run_id);
            }
            RunState::Suspended { approval_id, resume_at } => {
                let id = approval_id.clone();
                let approval = scheduler
                    .engine()
                    .db
                    .call(move |db| db.get_approval(&id))
                    .await?
                    .with_context(|| format!("Approval {} not found", approval_id))?;
                print_approval(&approval);

                if !interactive {
                    println!(
                        "Waiting for an answer until {}. Reply with `shipwright respond {}`.",
                        resume_at.format("%Y-%m-%d %H:%M UTC"),
                        approval.id
                    );
                    return Ok(());
                }

                let response = prompt_for(&approval.request)?;
                if let Err(e) = submit_response(&scheduler.engine().db, &approval.id, response).await? {
                    anyhow::bail!("answer refused: {}", e);
                }
            }
        }
    }
}

pub fn print_approval(approval: &ApprovalRequest) {
    println!();
    println!(
        "{} {} ({})",
        style("Approval needed:").yellow().bold(),
        approval.id,
        approval.kind
    );
    match &approval.request {
        ApprovalRequestPayload::Approval { message } => println!("{}", message),
        ApprovalRequestPayload::Text { prompt, .. } => println!("{}", prompt),
        ApprovalRequestPayload::Choice { prompt, options } => {
            println!("{}", prompt);
            for option in options {
                println!("  {} {}", style(&option.id).cyan(), option.label);
            }
        }
    }
    println!();
}

fn prompt_for(request: &ApprovalRequestPayload) -> Result<ApprovalResponsePayload> {
    let response = match request {
        ApprovalRequestPayload::Approval { .. } => {
            let approved = Confirm::new().with_prompt("Approve?").default(true).interact()?;
            let reason = if approved {
                None
            } else {
                let reason: String = Input::new()
                    .with_prompt("Reason (optional)")
                    .allow_empty(true)
                    .interact_text()?;
                Some(reason).filter(|r| !r.trim().is_empty())
            };
            ApprovalResponsePayload::Approval { approved, reason }
        }
        ApprovalRequestPayload::Text { prompt, .. } => {
            let text: String = Input::new().with_prompt(prompt.as_str()).interact_text()?;
            ApprovalResponsePayload::Text { text }
        }
        ApprovalRequestPayload::Choice { prompt, options } => {
            let labels: Vec<&str> = options.iter().map(|o| o.label.as_str()).collect();
            let index = Select::new()
                .with_prompt(prompt.as_str())
                .items(&labels)
                .default(0)
                .interact()?;
            ApprovalResponsePayload::Choice {
                selected_id: options[index].id.clone(),
            }
        }
    };
    Ok(response)
}

pub async fn cmd_status(config: &ShipwrightConfig, run_id: Option<&str>) -> Result<()> {
    let db = open_db(config)?;

    let Some(run_id) = run_id else {
        let runs = db.call(|db| db.list_runs(50)).await?;
        if runs.is_empty() {
            println!("No runs yet.");
            return Ok(());
        }
        for run in runs {
            println!(
                "{}  {:<14} {}  {}",
                style(&run.id).cyan(),
                run.current_phase.to_string(),
                run.created_at.format("%Y-%m-%d %H:%M"),
                run.request.lines().next().unwrap_or_default()
            );
        }
        return Ok(());
    };

    let id = run_id.to_string();
    let detail = db
        .call(move |db| db.run_detail(&id))
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;

    let run = &detail.run;
    println!("{}", style(format!("Run {}", run.id)).bold());
    println!("  request:  {}", run.request);
    println!("  repo:     {} ({})", run.repo_url, run.target_branch);
    println!("  phase:    {}", run.current_phase);
    if let Some(url) = &run.pr_url {
        println!("  pr:       {}", url);
    }
    if let Some(reason) = &run.failure_reason {
        println!("  failure:  {}", style(reason).red());
    }

    println!();
    for phase in &detail.phases {
        println!("  {}", phase_line(phase));
    }
    if !detail.memories.is_empty() {
        println!();
        println!("  {} memories recorded", detail.memories.len());
    }
    if let Some(approval) = &detail.pending_approval {
        print_approval(approval);
    }
    Ok(())
}

fn phase_line(phase: &PhaseResult) -> String {
    let status = match phase.status {
        PhaseStatus::Passed => style("passed").green(),
        PhaseStatus::Failed => style("failed").red(),
        PhaseStatus::Running => style("running").yellow(),
    };
    match &phase.error {
        Some(error) => format!("{:<15} {}  {}", phase.phase.to_string(), status, error),
        None => format!("{:<15} {}", phase.phase.to_string(), status),
    }
}
