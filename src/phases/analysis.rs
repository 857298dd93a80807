use shipwright_common::AnalysisOutput;

use super::{RunBrief, prompts, run_structured};
use crate::agent::{AgentContext, Capabilities};
use crate::errors::WorkflowError;

pub async fn run(ctx: &AgentContext, brief: &RunBrief) -> Result<AnalysisOutput, WorkflowError> {
    let (output, run) = run_structured::<AnalysisOutput>(
        ctx,
        "analysis/agent".into(),
        prompts::analysis_system(),
        prompts::analysis_task(brief),
        Capabilities::read_only(),
        ctx.agents.analysis_max_steps,
    )
    .await?;
    tracing::info!(
        run_id = %brief.run_id,
        iterations = run.iterations,
        affected = output.affected_systems.len(),
        "analysis complete"
    );
    Ok(output)
}
