//! Phase orchestrators.
//!
//! Each phase configures the generic agent loop with its own prompt and
//! tools, then validates the agent's final answer against the phase's
//! output schema. A final answer that does not validate fails the phase.

pub mod analysis;
pub mod approaches;
pub mod implementation;
pub mod judging;
pub mod prompts;

use serde::de::DeserializeOwned;
use shipwright_common::outputs::parse_output;
use shipwright_common::{MemoryRecord, Validate};

use crate::agent::{AgentContext, AgentRun, AgentSpec, BUDGET_EXHAUSTED, Capabilities, run_agent};
use crate::errors::WorkflowError;
use crate::llm::Message;

/// Run-level context every phase receives.
#[derive(Debug, Clone)]
pub struct RunBrief {
    pub run_id: String,
    pub request: String,
    pub repo_url: String,
    pub target_branch: String,
    /// Every memory recorded so far, in append order.
    pub memories: Vec<MemoryRecord>,
}

/// Run one top-level phase agent and validate its final answer as `T`.
pub(crate) async fn run_structured<T>(
    ctx: &AgentContext,
    scope: String,
    system_prompt: String,
    task: String,
    caps: Capabilities,
    max_steps: u32,
) -> Result<(T, AgentRun), WorkflowError>
where
    T: DeserializeOwned + Validate,
{
    let spec = AgentSpec {
        name: ctx.phase.to_string(),
        scope,
        system_prompt,
        input: vec![Message::user_text(task)],
        caps,
        max_steps,
        parent_id: None,
        depth: 0,
    };
    let run = run_agent(ctx, spec).await?;
    match parse_output::<T>(&run.text) {
        Ok(output) => Ok((output, run)),
        Err(e) if run.finish_reason.as_str() == BUDGET_EXHAUSTED => Err(WorkflowError::validation(
            ctx.phase,
            format!("agent used all {} steps without a valid answer ({})", run.iterations, e),
        )),
        Err(e) => Err(WorkflowError::validation(ctx.phase, e.to_string())),
    }
}
