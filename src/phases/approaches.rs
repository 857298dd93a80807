use shipwright_common::{AnalysisOutput, ApproachesOutput};

use super::{RunBrief, prompts, run_structured};
use crate::agent::{AgentContext, Capabilities};
use crate::errors::WorkflowError;

pub async fn run(
    ctx: &AgentContext,
    brief: &RunBrief,
    analysis: &AnalysisOutput,
) -> Result<ApproachesOutput, WorkflowError> {
    let (output, _) = run_structured::<ApproachesOutput>(
        ctx,
        "approaches/agent".into(),
        prompts::approaches_system(),
        prompts::approaches_task(brief, analysis),
        Capabilities::read_only(),
        ctx.agents.approaches_max_steps,
    )
    .await?;
    tracing::info!(run_id = %brief.run_id, count = output.approaches.len(), "approaches generated");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEnvironment, ScriptedLlm, test_context, text_response};
    use shipwright_common::Phase;

    fn analysis() -> AnalysisOutput {
        AnalysisOutput {
            affected_systems: vec![],
            architectural_constraints: vec![],
            risks: vec![],
            codebase_map: vec![],
            feasibility_assessment: "fine".into(),
        }
    }

    fn brief() -> RunBrief {
        RunBrief {
            run_id: "r1".into(),
            request: "Add a health endpoint".into(),
            repo_url: "https://github.com/acme/app".into(),
            target_branch: "main".into(),
            memories: vec![],
        }
    }

    #[tokio::test]
    async fn test_single_approach_without_justification_fails() {
        let answer = serde_json::json!({
            "approaches": [{
                "id": "a", "title": "A", "summary": "s", "rationale": "r",
                "implementation": "i", "estimatedComplexity": "low"
            }],
            "recommendation": "a"
        });
        let llm = ScriptedLlm::new(vec![text_response(&answer.to_string())]);
        let ctx = test_context(llm, FakeEnvironment::new(), Phase::Approaches).await;
        let err = run(&ctx, &brief(), &analysis()).await.unwrap_err();
        match err {
            WorkflowError::Validation { message, .. } => {
                assert!(message.contains("singleApproachJustification"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prompt_includes_analysis() {
        let answer = serde_json::json!({
            "approaches": [
                {"id": "a", "title": "A", "summary": "s", "rationale": "r", "implementation": "i", "estimatedComplexity": "low"},
                {"id": "b", "title": "B", "summary": "s", "rationale": "r", "implementation": "i", "estimatedComplexity": "high"}
            ],
            "recommendation": "a"
        });
        let llm = ScriptedLlm::new(vec![text_response(&answer.to_string())]);
        let ctx = test_context(llm.clone(), FakeEnvironment::new(), Phase::Approaches).await;
        let output = run(&ctx, &brief(), &analysis()).await.unwrap();
        assert_eq!(output.approaches.len(), 2);

        let request = llm.request(0);
        let crate::llm::ContentBlock::Text { text } = &request.messages[0].content[0] else {
            panic!("expected text task");
        };
        assert!(text.contains("feasibilityAssessment"));
    }
}
