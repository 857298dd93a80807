//! Phase prompt templates.
//!
//! System prompts describe the role and the required final answer. Task
//! prompts carry the run's context: the request, accumulated memories and
//! the validated outputs of earlier phases.

use shipwright_common::{AnalysisOutput, Approach, Condition, render_memories};

use super::RunBrief;

const TOOL_GUIDANCE: &str = "\
## Tools

- Use `list_files`, `read_file` and `search` to ground every claim in the code.
- Use `run_command` for read-only inspection (e.g. `git log -5`, dependency listings).
- Use `spawn_agent` to delegate a focused investigation; you get its answer back.
- Use `record_memory` for insights, decisions, constraints or failures later phases must know.
- Use `request_feedback` only when a human must decide something you cannot infer.
";

fn final_answer_section(schema: &str) -> String {
    format!(
        "## Final answer\n\n\
         When you are done, reply with no tool calls and a single JSON object matching this shape \
         (camelCase keys, no commentary outside the JSON):\n\n```json\n{}\n```\n",
        schema
    )
}

fn context_section(brief: &RunBrief) -> String {
    let mut out = String::new();
    out.push_str("## Feature request\n\n");
    out.push_str(brief.request.trim());
    out.push_str("\n\n## Repository\n\n");
    out.push_str(&format!(
        "- **URL**: {}\n- **Target branch**: {}\n\n",
        brief.repo_url, brief.target_branch
    ));
    out.push_str("## Memories from earlier phases\n\n");
    out.push_str(&render_memories(&brief.memories));
    out.push_str("\n\n");
    out
}

fn json_block(value: &impl serde::Serialize) -> String {
    let body = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
    format!("```json\n{}\n```\n\n", body)
}

// ── Analysis ──────────────────────────────────────────────────────────

pub fn analysis_system() -> String {
    let mut prompt = String::from(
        "# Analysis\n\n\
         You are a senior engineer analysing a codebase before a feature is designed. \
         Map the systems the request touches, the architectural constraints any change must respect, \
         and the risks. Do not propose solutions yet.\n\n",
    );
    prompt.push_str(TOOL_GUIDANCE);
    prompt.push('\n');
    prompt.push_str(&final_answer_section(
        r#"{
  "affectedSystems": ["..."],
  "architecturalConstraints": ["..."],
  "risks": ["..."],
  "codebaseMap": [{"path": "src/...", "purpose": "...", "relevance": "..."}],
  "feasibilityAssessment": "..."
}"#,
    ));
    prompt
}

pub fn analysis_task(brief: &RunBrief) -> String {
    let mut prompt = context_section(brief);
    prompt.push_str("Analyse the repository for this request.\n");
    prompt
}

// ── Approaches ────────────────────────────────────────────────────────

pub fn approaches_system() -> String {
    let mut prompt = String::from(
        "# Approach generation\n\n\
         You design implementation approaches for a feature. Produce two or more genuinely different \
         approaches when the problem allows it. If only one sensible approach exists, say why in \
         `singleApproachJustification`. Validate assumptions against the code and record the evidence.\n\n",
    );
    prompt.push_str(TOOL_GUIDANCE);
    prompt.push('\n');
    prompt.push_str(&final_answer_section(
        r#"{
  "approaches": [{
    "id": "short-kebab-id",
    "title": "...",
    "summary": "...",
    "rationale": "...",
    "implementation": "step by step plan",
    "affectedFiles": ["src/..."],
    "tradeoffs": {"pros": ["..."], "cons": ["..."]},
    "assumptions": [{"claim": "...", "validated": true, "evidence": "..."}],
    "estimatedComplexity": "low | medium | high"
  }],
  "recommendation": "id of the recommended approach, with a sentence on why",
  "singleApproachJustification": "only when exactly one approach is given"
}"#,
    ));
    prompt
}

pub fn approaches_task(brief: &RunBrief, analysis: &AnalysisOutput) -> String {
    let mut prompt = context_section(brief);
    prompt.push_str("## Analysis\n\n");
    prompt.push_str(&json_block(analysis));
    prompt.push_str("Propose implementation approaches.\n");
    prompt
}

// ── Judging ───────────────────────────────────────────────────────────

pub fn judging_system() -> String {
    let mut prompt = String::from(
        "# Judging\n\n\
         You review one proposed implementation approach before any code is written. Check it against \
         the code: correctness, security, performance, maintainability, test strategy and fit with the \
         architectural constraints.\n\n\
         Record every problem with `record_finding`:\n\
         - **critical**: the approach is unsafe or cannot work as described\n\
         - **major**: a significant gap the implementation must address\n\
         - **minor**: a worthwhile improvement\n\n\
         You do not decide the verdict; it is derived from your findings.\n\n",
    );
    prompt.push_str(TOOL_GUIDANCE);
    prompt.push_str("- Use `record_finding` for each finding.\n\n");
    prompt.push_str(&final_answer_section(
        r#"{
  "selectedApproachId": "id of the approach you reviewed",
  "findings": [],
  "overallAssessment": "..."
}"#,
    ));
    prompt
}

pub fn judging_task(brief: &RunBrief, analysis: &AnalysisOutput, approach: &Approach) -> String {
    let mut prompt = context_section(brief);
    prompt.push_str("## Analysis\n\n");
    prompt.push_str(&json_block(analysis));
    prompt.push_str("## Approach under review\n\n");
    prompt.push_str(&json_block(approach));
    prompt.push_str(&format!("Review approach `{}`.\n", approach.id));
    prompt
}

// ── Implementation ────────────────────────────────────────────────────

pub fn coder_system() -> String {
    let mut prompt = String::from(
        "# Implementation\n\n\
         You implement an approved approach in the checked-out repository. The branch is already \
         prepared; do not switch branches, commit or push. Edit files with `write_file` (whole-file \
         contents) and run the project's checks with `run_command` before you finish. Your work is \
         accepted only when typecheck, test, lint and build all pass.\n\n",
    );
    prompt.push_str(TOOL_GUIDANCE);
    prompt.push_str("- Use `write_file` to create or replace files.\n\n");
    prompt.push_str(&final_answer_section(
        r#"{
  "summary": "what you changed and why",
  "conditionsAddressed": ["condition descriptions you addressed"]
}"#,
    ));
    prompt
}

/// What the previous attempt left behind, for retry prompts.
#[derive(Debug, Clone)]
pub struct PreviousAttempt {
    pub attempt: u32,
    pub touched_files: Vec<String>,
    pub summary: String,
    pub gate_failure: String,
}

pub fn coder_task(
    brief: &RunBrief,
    analysis: &AnalysisOutput,
    approach: &Approach,
    conditions: &[Condition],
    attempt: u32,
    previous: Option<&PreviousAttempt>,
) -> String {
    let mut prompt = context_section(brief);
    prompt.push_str("## Analysis\n\n");
    prompt.push_str(&json_block(analysis));
    prompt.push_str("## Approved approach\n\n");
    prompt.push_str(&json_block(approach));

    prompt.push_str("## Conditions from review\n\n");
    if conditions.is_empty() {
        prompt.push_str("None.\n\n");
    } else {
        for condition in conditions {
            prompt.push_str(&format!("- [{}] {}\n", condition.severity, condition.description));
        }
        prompt.push('\n');
    }

    if let Some(prev) = previous {
        prompt.push_str(&format!(
            "## Previous attempt ({} of this phase) failed\n\n\
             The branch has been reset to a clean state; none of the previous changes are present.\n\n",
            prev.attempt
        ));
        prompt.push_str("### Files it touched\n\n");
        if prev.touched_files.is_empty() {
            prompt.push_str("None.\n\n");
        } else {
            for path in &prev.touched_files {
                prompt.push_str(&format!("- {}\n", path));
            }
            prompt.push('\n');
        }
        prompt.push_str("### Its summary\n\n");
        prompt.push_str(prev.summary.trim());
        prompt.push_str("\n\n### Gate failure\n\n```\n");
        prompt.push_str(prev.gate_failure.trim_end());
        prompt.push_str("\n```\n\n");
    }

    prompt.push_str(&format!(
        "This is attempt {}. Implement the approach and make every gate pass.\n",
        attempt
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_common::{MemoryKind, MemoryRecord, Phase, Severity};

    fn brief() -> RunBrief {
        RunBrief {
            run_id: "r1".into(),
            request: "Add rate limiting".into(),
            repo_url: "https://github.com/acme/app".into(),
            target_branch: "main".into(),
            memories: vec![MemoryRecord::new(
                Phase::Analysis,
                MemoryKind::Constraint,
                "no new dependencies",
            )],
        }
    }

    #[test]
    fn test_task_prompts_carry_memories() {
        let prompt = analysis_task(&brief());
        assert!(prompt.contains("Add rate limiting"));
        assert!(prompt.contains("[analysis/constraint] no new dependencies"));
    }

    #[test]
    fn test_system_prompts_name_output_fields() {
        assert!(analysis_system().contains("feasibilityAssessment"));
        assert!(approaches_system().contains("singleApproachJustification"));
        assert!(judging_system().contains("record_finding"));
        assert!(coder_system().contains("conditionsAddressed"));
    }

    #[test]
    fn test_conditions_listed_with_severity() {
        let analysis = AnalysisOutput {
            affected_systems: vec![],
            architectural_constraints: vec![],
            risks: vec![],
            codebase_map: vec![],
            feasibility_assessment: "ok".into(),
        };
        let approach: Approach = serde_json::from_value(serde_json::json!({
            "id": "a", "title": "A", "summary": "s", "rationale": "r",
            "implementation": "i", "estimatedComplexity": "low"
        }))
        .unwrap();
        let conditions = vec![Condition {
            description: "tests: cover the limiter".into(),
            severity: Severity::Major,
        }];
        let prompt = coder_task(&brief(), &analysis, &approach, &conditions, 1, None);
        assert!(prompt.contains("- [major] tests: cover the limiter"));
        assert!(!prompt.contains("Previous attempt"));
    }
}
