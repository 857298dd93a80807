//! Judging: the agent reports findings, the verdict is derived from them.

use shipwright_common::{AnalysisOutput, Approach, JudgingDraft, JudgingOutput, Validate, Verdict};

use super::{RunBrief, prompts, run_structured};
use crate::agent::{AgentContext, Capabilities};
use crate::errors::WorkflowError;
use crate::verdict::derive_verdict;

/// Judge `approach`. A rejected verdict fails the phase with
/// [`WorkflowError::Rejected`].
pub async fn run(
    ctx: &AgentContext,
    brief: &RunBrief,
    analysis: &AnalysisOutput,
    approach: &Approach,
) -> Result<JudgingOutput, WorkflowError> {
    let (draft, _) = run_structured::<JudgingDraft>(
        ctx,
        "judging/agent".into(),
        prompts::judging_system(),
        prompts::judging_task(brief, analysis, approach),
        Capabilities::judge(),
        ctx.agents.judging_max_steps,
    )
    .await?;

    if draft.selected_approach_id != approach.id {
        return Err(WorkflowError::validation(
            ctx.phase,
            format!(
                "judged approach '{}' but '{}' was selected",
                draft.selected_approach_id, approach.id
            ),
        ));
    }

    // Findings recorded through the tool come first; ones only listed in
    // the final answer are appended.
    let mut findings = ctx.scratch().findings;
    for finding in draft.findings {
        if !findings.contains(&finding) {
            findings.push(finding);
        }
    }

    let outcome = derive_verdict(&findings);
    let output = JudgingOutput {
        selected_approach_id: approach.id.clone(),
        findings,
        overall_verdict: outcome.verdict,
        conditions: outcome.conditions,
        rejection_reason: outcome.rejection_reason,
        overall_assessment: draft.overall_assessment,
    };
    output
        .validate()
        .map_err(|e| WorkflowError::validation(ctx.phase, e.to_string()))?;

    tracing::info!(
        run_id = %brief.run_id,
        approach = %approach.id,
        verdict = %output.overall_verdict,
        findings = output.findings.len(),
        "judging complete"
    );

    if output.overall_verdict == Verdict::Rejected {
        // The derived findings stay on the failed result.
        let value = serde_json::to_value(&output).map_err(anyhow::Error::from)?;
        let id = ctx.phase_result_id.clone();
        ctx.journal
            .db()
            .call(move |db| db.attach_phase_output(&id, &value))
            .await?;
        return Err(WorkflowError::Rejected {
            reason: output.rejection_reason.clone().unwrap_or_default(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEnvironment, ScriptedLlm, test_context, text_response, tool_response};
    use shipwright_common::{Phase, Severity};

    fn analysis() -> AnalysisOutput {
        AnalysisOutput {
            affected_systems: vec![],
            architectural_constraints: vec![],
            risks: vec![],
            codebase_map: vec![],
            feasibility_assessment: "fine".into(),
        }
    }

    fn approach() -> Approach {
        serde_json::from_value(serde_json::json!({
            "id": "a", "title": "A", "summary": "s", "rationale": "r",
            "implementation": "i", "estimatedComplexity": "low"
        }))
        .unwrap()
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

    fn finding(severity: &str, description: &str) -> serde_json::Value {
        serde_json::json!({
            "criterion": "testing",
            "severity": severity,
            "description": description,
            "recommendation": "fix it"
        })
    }

    fn answer() -> String {
        serde_json::json!({"selectedApproachId": "a", "overallAssessment": "reasonable"}).to_string()
    }

    #[tokio::test]
    async fn test_major_and_minor_approve_with_conditions() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![
                ("t1", "record_finding", finding("major", "no tests")),
                ("t2", "record_finding", finding("minor", "naming")),
            ]),
            text_response(&answer()),
        ]);
        let ctx = test_context(llm, FakeEnvironment::new(), Phase::Judging).await;
        let output = run(&ctx, &brief(), &analysis(), &approach()).await.unwrap();
        assert_eq!(output.overall_verdict, Verdict::ApprovedWithConditions);
        assert_eq!(output.conditions.len(), 2);
        assert_eq!(output.conditions[0].severity, Severity::Major);
        assert_eq!(output.conditions[0].description, "testing: no tests");
    }

    #[tokio::test]
    async fn test_critical_finding_rejects() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![("t1", "record_finding", finding("critical", "drops data"))]),
            text_response(&answer()),
        ]);
        let ctx = test_context(llm, FakeEnvironment::new(), Phase::Judging).await;
        let err = run(&ctx, &brief(), &analysis(), &approach()).await.unwrap_err();
        match err {
            WorkflowError::Rejected { reason } => assert!(reason.contains("drops data")),
            other => panic!("unexpected {:?}", other),
        }

        let id = ctx.phase_result_id.clone();
        let result = ctx
            .journal
            .db()
            .call(move |db| db.get_phase_result(&id))
            .await
            .unwrap()
            .unwrap();
        let kept: JudgingOutput = serde_json::from_value(result.output.unwrap()).unwrap();
        assert_eq!(kept.overall_verdict, Verdict::Rejected);
        assert_eq!(kept.findings.len(), 1);
        assert_eq!(kept.findings[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_wrong_approach_id_is_validation_error() {
        let wrong = serde_json::json!({"selectedApproachId": "zzz", "overallAssessment": "ok"});
        let llm = ScriptedLlm::new(vec![text_response(&wrong.to_string())]);
        let ctx = test_context(llm, FakeEnvironment::new(), Phase::Judging).await;
        let err = run(&ctx, &brief(), &analysis(), &approach()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
    }
}
