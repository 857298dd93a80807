//! Answering humans' questions from the terminal: `shipwright approvals`, `respond`.

use anyhow::Result;
use console::style;
use shipwright::approval::submit_response;
use shipwright::config::ShipwrightConfig;
use shipwright_common::ApprovalResponsePayload;

use super::run::{drive_until_settled, print_approval};
use super::{build_scheduler, open_db};

pub async fn cmd_approvals(config: &ShipwrightConfig) -> Result<()> {
    let db = open_db(config)?;
    let pending = db.call(|db| db.list_pending_approvals()).await?;
    if pending.is_empty() {
        println!("No pending approvals.");
        return Ok(());
    }
    for approval in &pending {
        println!(
            "{} {} (deadline {})",
            style("run").dim(),
            style(&approval.run_id).cyan(),
            approval.deadline.format("%Y-%m-%d %H:%M UTC")
        );
        print_approval(approval);
    }
    Ok(())
}

/// Record the answer, then resume the run inline if credentials allow.
pub async fn cmd_respond(
    config: &ShipwrightConfig,
    approval_id: &str,
    response: ApprovalResponsePayload,
    resume: bool,
) -> Result<()> {
    let db = open_db(config)?;
    let approval = match submit_response(&db, approval_id, response).await? {
        Ok(approval) => approval,
        Err(e) => anyhow::bail!("answer refused: {}", e),
    };
    println!("{} {}", style("Answer recorded for").green(), approval.id);

    if !resume {
        return Ok(());
    }
    let scheduler = match build_scheduler(config, db) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            println!(
                "{} {:#}\nRun `shipwright resume {}` once it is fixed.",
                style("Cannot resume here:").yellow(),
                e,
                approval.run_id
            );
            return Ok(());
        }
    };
    drive_until_settled(&scheduler, &approval.run_id, false).await
}
