use shipwright_common::outputs::parse_output;
use shipwright_common::{AnalysisOutput, Approach, CoderReport, Condition};

use super::RunBrief;
use super::prompts::{self, PreviousAttempt};
use crate::agent::{AgentContext, AgentSpec, Capabilities, run_agent};
use crate::errors::WorkflowError;
use crate::llm::Message;
use crate::util::truncate_head;

const SUMMARY_LIMIT: usize = 2_000;

/// Everything one coding attempt is briefed with.
pub struct CoderBrief<'a> {
    pub brief: &'a RunBrief,
    pub analysis: &'a AnalysisOutput,
    pub approach: &'a Approach,
    pub conditions: &'a [Condition],
    pub attempt: u32,
    pub previous: Option<&'a PreviousAttempt>,
}

/// Run a brand-new coding agent for one attempt.
///
/// The coder's report is informational; gates decide acceptance. A final
/// answer that is not a valid report is kept as a plain-text summary.
pub async fn run_attempt(ctx: &AgentContext, input: &CoderBrief<'_>) -> Result<CoderReport, WorkflowError> {
    let spec = AgentSpec {
        name: format!("coder-{}", input.attempt),
        scope: format!("implementation/attempt-{}/coder", input.attempt),
        system_prompt: prompts::coder_system(),
        input: vec![Message::user_text(prompts::coder_task(
            input.brief,
            input.analysis,
            input.approach,
            input.conditions,
            input.attempt,
            input.previous,
        ))],
        caps: Capabilities::coder(),
        max_steps: ctx.agents.implementation_max_steps,
        parent_id: None,
        depth: 0,
    };
    let run = run_agent(ctx, spec).await?;

    let report = match parse_output::<CoderReport>(&run.text) {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(
                run_id = %input.brief.run_id,
                attempt = input.attempt,
                error = %e,
                "coder report did not validate; keeping raw text"
            );
            CoderReport {
                summary: if run.text.trim().is_empty() {
                    format!("Attempt {} ended ({}) without a summary.", input.attempt, run.finish_reason.as_str())
                } else {
                    truncate_head(run.text.trim(), SUMMARY_LIMIT)
                },
                conditions_addressed: Vec::new(),
            }
        }
    };
    Ok(report)
}
