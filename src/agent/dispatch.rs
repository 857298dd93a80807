use serde::{Deserialize, Serialize};
use shipwright_common::MemoryRecord;

use super::actions::{Action, EnvTool, parse_action};
use super::{AgentContext, AgentSpec, run_agent, subagent_system_prompt};
use crate::approval::{ApprovalOrigin, ApprovalOutcome, request_human_input};
use crate::environment::{relative_path, shell_quote};
use crate::errors::WorkflowError;
use crate::llm::{Message, ToolCall};
use crate::util::{truncate_head, truncate_tail};

const READ_LIMIT: usize = 20_000;
const SEARCH_LIMIT: usize = 10_000;
const COMMAND_LIMIT: usize = 8_000;
const SEARCH_MAX_LINES: usize = 200;

/// What goes back to the model for one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Route one tool call. Errors abort the loop; tool failures come back as
/// error-shaped outcomes.
pub(super) async fn dispatch(
    ctx: &AgentContext,
    spec: &AgentSpec,
    invocation_id: &str,
    key: &str,
    call: &ToolCall,
) -> Result<ToolOutcome, WorkflowError> {
    let Some(action) = parse_action(call, spec.caps)? else {
        return Ok(ToolOutcome::error(format!(
            "Tool '{}' is not available to this agent.",
            call.name
        )));
    };

    match action {
        Action::RecordMemory { kind, content } => {
            ctx.with_scratch(|s| s.memories.push(MemoryRecord::new(ctx.phase, kind, content)));
            Ok(ToolOutcome::ok("Memory recorded."))
        }
        Action::RecordFinding(finding) => {
            ctx.with_scratch(|s| s.findings.push(finding));
            Ok(ToolOutcome::ok("Finding recorded."))
        }
        Action::SpawnAgent { name, task } => {
            let child = AgentSpec {
                system_prompt: subagent_system_prompt(&name, ctx.phase),
                name,
                scope: format!("{}/spawn", key),
                input: vec![Message::user_text(task)],
                caps: spec.caps.for_child(spec.depth + 1 < ctx.agents.max_spawn_depth),
                max_steps: ctx.agents.subagent_max_steps,
                parent_id: Some(invocation_id.to_string()),
                depth: spec.depth + 1,
            };
            let run = run_agent(ctx, child).await?;
            if run.text.trim().is_empty() {
                return Ok(ToolOutcome::error("Sub-agent finished without an answer."));
            }
            Ok(ToolOutcome::ok(run.text))
        }
        Action::RequestFeedback(request) => {
            let origin = ApprovalOrigin {
                phase_result_id: Some(ctx.phase_result_id.clone()),
                tool_call_id: Some(call.id.clone()),
            };
            let outcome = request_human_input(
                &ctx.journal,
                &format!("{}/feedback", key),
                origin,
                request,
                ctx.approval_timeout,
            )
            .await?;
            match outcome {
                ApprovalOutcome::Responded { response, .. } => {
                    let body = serde_json::to_string(&response)
                        .map_err(|e| WorkflowError::Infrastructure(e.into()))?;
                    Ok(ToolOutcome::ok(body))
                }
                ApprovalOutcome::TimedOut { approval_id } => Err(WorkflowError::ApprovalTimedOut {
                    phase: ctx.phase,
                    approval_id,
                }),
            }
        }
        Action::Env(tool) => {
            ctx.journal
                .step(key, || async move { run_env_tool(ctx, tool).await })
                .await
        }
    }
}

async fn run_env_tool(ctx: &AgentContext, tool: EnvTool) -> Result<ToolOutcome, WorkflowError> {
    let env = ctx.env.as_ref();
    let outcome = match tool {
        EnvTool::ReadFile { path } => match env.read_file(&path).await {
            Ok(content) => ToolOutcome::ok(truncate_head(&content, READ_LIMIT)),
            Err(e) => ToolOutcome::error(format!("{:#}", e)),
        },
        EnvTool::ListFiles { path } => match env.list_files(&path).await {
            Ok(files) if files.is_empty() => ToolOutcome::ok("(no files)"),
            Ok(files) => ToolOutcome::ok(files.join("\n")),
            Err(e) => ToolOutcome::error(format!("{:#}", e)),
        },
        EnvTool::Search { pattern, path } => {
            if let Err(e) = regex::Regex::new(&pattern) {
                return Ok(ToolOutcome::error(format!("invalid search pattern: {}", e)));
            }
            let path = match relative_path(&path) {
                Ok(p) if p.as_os_str().is_empty() => ".".to_string(),
                Ok(p) => p.display().to_string(),
                Err(e) => return Ok(ToolOutcome::error(format!("{:#}", e))),
            };
            let command = format!(
                "grep -rnIE --exclude-dir=.git -e {} -- {} | head -n {}",
                shell_quote(&pattern),
                shell_quote(&path),
                SEARCH_MAX_LINES
            );
            let out = env.exec(&command, ctx.command_timeout).await?;
            if !out.stdout.trim().is_empty() {
                ToolOutcome::ok(truncate_head(&out.stdout, SEARCH_LIMIT))
            } else if !out.stderr.trim().is_empty() {
                ToolOutcome::error(out.stderr.trim().to_string())
            } else {
                ToolOutcome::ok("No matches.")
            }
        }
        EnvTool::RunCommand { command } => {
            let out = env.exec(&command, ctx.command_timeout).await?;
            let body = format!(
                "exit code: {}\n{}",
                out.exit_code,
                truncate_tail(&out.combined(), COMMAND_LIMIT)
            );
            if out.success() {
                ToolOutcome::ok(body)
            } else {
                ToolOutcome::error(body)
            }
        }
        EnvTool::WriteFile { path, content } => match env.write_file(&path, &content).await {
            Ok(()) => ToolOutcome::ok(format!("Wrote {} bytes to {}.", content.len(), path)),
            Err(e) => ToolOutcome::error(format!("{:#}", e)),
        },
    };
    Ok(outcome)
}
