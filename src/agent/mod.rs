//! Generic agent execution loop.
//!
//! One loop drives every LLM-backed agent: phase orchestrators, coders and
//! the sub-agents they spawn. Each model call is a journaled step, so a
//! resumed run replays earlier turns from the journal instead of calling
//! the model again. Tool calls from one turn are dispatched in order and
//! answered with a single grouped message of `tool_result` blocks.

pub mod actions;
mod dispatch;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use shipwright_common::{Finding, MemoryRecord, Phase};

use crate::config::AgentsSection;
use crate::durable::Journal;
use crate::environment::Environment;
use crate::errors::WorkflowError;
use crate::llm::{ContentBlock, FinishReason, LlmProvider, Message, ModelRequest, ModelResponse, Usage};
use crate::store::{InvocationCompletion, NewInvocation};

pub use actions::{Action, Capabilities, EnvTool};

/// Finish reason recorded when an agent runs out of steps.
pub const BUDGET_EXHAUSTED: &str = "step_budget_exhausted";

/// Side channel for pure actions. Rebuilt from scratch on every replay
/// because the model turns that produce it are replayed too.
#[derive(Debug, Clone, Default)]
pub struct PhaseScratch {
    pub memories: Vec<MemoryRecord>,
    pub findings: Vec<Finding>,
}

/// Everything an agent needs from the phase it runs in.
pub struct AgentContext {
    pub journal: Journal,
    pub llm: Arc<dyn LlmProvider>,
    pub env: Arc<dyn Environment>,
    pub phase: Phase,
    pub phase_result_id: String,
    pub agents: AgentsSection,
    pub approval_timeout: chrono::Duration,
    pub command_timeout: Duration,
    pub scratch: Arc<Mutex<PhaseScratch>>,
}

impl AgentContext {
    pub fn scratch(&self) -> PhaseScratch {
        self.scratch
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn with_scratch(&self, f: impl FnOnce(&mut PhaseScratch)) {
        match self.scratch.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub name: String,
    /// Journal key prefix. Must be unique within the run.
    pub scope: String,
    pub system_prompt: String,
    pub input: Vec<Message>,
    pub caps: Capabilities,
    pub max_steps: u32,
    pub parent_id: Option<String>,
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub invocation_id: String,
    pub text: String,
    pub iterations: u32,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Run `spec` to completion or until its step budget runs out.
pub fn run_agent<'a>(
    ctx: &'a AgentContext,
    spec: AgentSpec,
) -> BoxFuture<'a, Result<AgentRun, WorkflowError>> {
    Box::pin(async move {
        let mut spec = spec;
        if spec.depth >= ctx.agents.max_spawn_depth {
            spec.caps.spawn = false;
        }

        let invocation_id = start_invocation(ctx, &spec).await?;
        let tools = actions::tool_definitions(spec.caps);
        let mut messages = spec.input.clone();
        let mut usage = Usage::default();
        let mut audit = Vec::new();
        let mut text = String::new();
        let mut iterations = 0;

        let looped = async {
            for i in 0..spec.max_steps {
                iterations = i + 1;
                let request = ModelRequest {
                    system: spec.system_prompt.clone(),
                    messages: messages.clone(),
                    tools: tools.clone(),
                };
                let llm = ctx.llm.clone();
                let response: ModelResponse = ctx
                    .journal
                    .step(&format!("{}/iter-{}/model", spec.scope, i), move || async move {
                        llm.complete(&request).await.map_err(WorkflowError::from)
                    })
                    .await?;
                usage.add(response.usage);
                text = response.text();

                let calls = response.tool_calls();
                if calls.is_empty() {
                    return Ok(response.finish_reason.clone());
                }

                messages.push(Message::assistant(response.content.clone()));
                let mut results = Vec::with_capacity(calls.len());
                for (j, call) in calls.iter().enumerate() {
                    let key = format!("{}/iter-{}/call-{}", spec.scope, i, j);
                    let outcome = dispatch::dispatch(ctx, &spec, &invocation_id, &key, call).await?;
                    tracing::debug!(
                        run_id = %ctx.journal.run_id(),
                        agent = %spec.name,
                        tool = %call.name,
                        is_error = outcome.is_error,
                        "tool call dispatched"
                    );
                    audit.push(serde_json::json!({
                        "iteration": i,
                        "tool": call.name,
                        "tool_use_id": call.id,
                        "input": call.input,
                        "is_error": outcome.is_error,
                    }));
                    results.push(ContentBlock::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: outcome.content,
                        is_error: outcome.is_error,
                    });
                }
                messages.push(Message::tool_results(results));
            }
            Ok::<FinishReason, WorkflowError>(FinishReason::Other(BUDGET_EXHAUSTED.to_string()))
        }
        .await;

        let finish_reason = match looped {
            Ok(reason) => reason,
            Err(err) => {
                // Suspended and infrastructure-failed agents resume on a later
                // pass under the same invocation.
                if !matches!(err, WorkflowError::Suspended { .. } | WorkflowError::Infrastructure(_)) {
                    let done = InvocationCompletion {
                        finish_reason: format!("error:{}", err.class()),
                        output: err.to_string(),
                        usage: serde_json::to_value(usage).unwrap_or_default(),
                        steps: serde_json::Value::Array(audit),
                    };
                    if let Err(e) = complete_invocation(ctx, &invocation_id, done).await {
                        tracing::warn!(invocation_id = %invocation_id, error = %e, "could not close aborted invocation");
                    }
                    tracing::warn!(
                        run_id = %ctx.journal.run_id(),
                        agent = %spec.name,
                        class = err.class(),
                        "agent aborted"
                    );
                }
                return Err(err);
            }
        };

        let done = InvocationCompletion {
            finish_reason: finish_reason.as_str().to_string(),
            output: text.clone(),
            usage: serde_json::to_value(usage).unwrap_or_default(),
            steps: serde_json::Value::Array(audit),
        };
        complete_invocation(ctx, &invocation_id, done).await?;

        tracing::info!(
            run_id = %ctx.journal.run_id(),
            agent = %spec.name,
            iterations,
            finish_reason = finish_reason.as_str(),
            "agent finished"
        );
        Ok(AgentRun {
            invocation_id,
            text,
            iterations,
            finish_reason,
            usage,
        })
    })
}

async fn complete_invocation(
    ctx: &AgentContext,
    invocation_id: &str,
    done: InvocationCompletion,
) -> Result<(), WorkflowError> {
    let id = invocation_id.to_string();
    ctx.journal
        .db()
        .call(move |db| db.complete_invocation(&id, &done))
        .await?;
    Ok(())
}

async fn start_invocation(ctx: &AgentContext, spec: &AgentSpec) -> Result<String, WorkflowError> {
    let new = NewInvocation {
        id: String::new(),
        phase_result_id: ctx.phase_result_id.clone(),
        parent_id: spec.parent_id.clone(),
        name: spec.name.clone(),
        model: ctx.llm.model().to_string(),
        system_prompt: spec.system_prompt.clone(),
        input: serde_json::to_value(&spec.input).unwrap_or_default(),
    };
    let db = ctx.journal.db().clone();
    ctx.journal
        .step(&format!("{}/invocation", spec.scope), move || async move {
            let new = NewInvocation {
                id: uuid::Uuid::new_v4().to_string(),
                ..new
            };
            let row = db.call(move |db| db.create_invocation(&new)).await?;
            Ok(row.id)
        })
        .await
}

/// System prompt for spawned sub-agents.
pub fn subagent_system_prompt(name: &str, phase: Phase) -> String {
    format!(
        "You are '{name}', a focused sub-agent helping with the {phase} phase of a software change.\n\
         Investigate only the task you are given, using the repository tools. You cannot modify files.\n\
         Finish with a concise, factual answer: what you found, with file paths and line numbers where relevant."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEnvironment, ScriptedLlm, test_context, text_response, tool_response};
    use shipwright_common::{MemoryKind, Severity};

    fn spec(caps: Capabilities) -> AgentSpec {
        AgentSpec {
            name: "analysis".into(),
            scope: "analysis/agent".into(),
            system_prompt: "sys".into(),
            input: vec![Message::user_text("Analyze the repo")],
            caps,
            max_steps: 10,
            parent_id: None,
            depth: 0,
        }
    }

    #[tokio::test]
    async fn test_stops_on_end_turn_without_tools() {
        let llm = ScriptedLlm::new(vec![text_response("all done")]);
        let ctx = test_context(llm.clone(), FakeEnvironment::new(), Phase::Analysis).await;
        let run = run_agent(&ctx, spec(Capabilities::read_only())).await.unwrap();
        assert_eq!(run.text, "all done");
        assert_eq!(run.iterations, 1);
        assert_eq!(run.finish_reason, FinishReason::EndTurn);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_groups_tool_results_in_one_message() {
        let env = FakeEnvironment::new().with_file("README.md", "hello");
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![
                ("t1", "read_file", serde_json::json!({"path": "README.md"})),
                ("t2", "read_file", serde_json::json!({"path": "missing.md"})),
            ]),
            text_response("done"),
        ]);
        let ctx = test_context(llm.clone(), env, Phase::Analysis).await;
        run_agent(&ctx, spec(Capabilities::read_only())).await.unwrap();

        let second = llm.request(1);
        // user, assistant(tool_use x2), user(tool_result x2)
        assert_eq!(second.messages.len(), 3);
        let results = &second.messages[2].content;
        assert_eq!(results.len(), 2);
        match (&results[0], &results[1]) {
            (
                ContentBlock::ToolResult { tool_use_id: a, is_error: false, content, .. },
                ContentBlock::ToolResult { tool_use_id: b, is_error: true, .. },
            ) => {
                assert_eq!(a, "t1");
                assert_eq!(b, "t2");
                assert_eq!(content, "hello");
            }
            other => panic!("unexpected results {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_search_pattern_is_reported_not_run() {
        let env = FakeEnvironment::new();
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![("t1", "search", serde_json::json!({"pattern": "fn (unclosed"}))]),
            text_response("done"),
        ]);
        let ctx = test_context(llm.clone(), env.clone(), Phase::Analysis).await;
        run_agent(&ctx, spec(Capabilities::read_only())).await.unwrap();

        assert!(!env.commands().iter().any(|c| c.contains("grep")));
        match &llm.request(1).messages[2].content[0] {
            ContentBlock::ToolResult { is_error, content, .. } => {
                assert!(*is_error);
                assert!(content.contains("invalid search pattern"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_arguments_abort_loop() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![("t1", "read_file", serde_json::json!({"nope": 1}))]),
            text_response("unreachable"),
        ]);
        let ctx = test_context(llm.clone(), FakeEnvironment::new(), Phase::Analysis).await;
        let err = run_agent(&ctx, spec(Capabilities::read_only())).await.unwrap_err();
        assert!(matches!(err, WorkflowError::MalformedAction { .. }));
        assert_eq!(llm.calls(), 1);

        let invocations = ctx
            .journal
            .db()
            .call({
                let id = ctx.phase_result_id.clone();
                move |db| db.list_invocations(&id)
            })
            .await
            .unwrap();
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].completed_at.is_some());
        assert_eq!(invocations[0].finish_reason.as_deref(), Some("error:malformed_action"));
    }

    #[tokio::test]
    async fn test_infrastructure_error_leaves_invocation_open() {
        let llm = ScriptedLlm::new(vec![]);
        let ctx = test_context(llm, FakeEnvironment::new(), Phase::Analysis).await;
        let err = run_agent(&ctx, spec(Capabilities::read_only())).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Infrastructure(_)));

        let invocations = ctx
            .journal
            .db()
            .call({
                let id = ctx.phase_result_id.clone();
                move |db| db.list_invocations(&id)
            })
            .await
            .unwrap();
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].completed_at.is_none());
    }

    #[tokio::test]
    async fn test_replay_does_not_call_model_again() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![("t1", "run_command", serde_json::json!({"command": "ls"}))]),
            text_response("done"),
        ]);
        let env = FakeEnvironment::new();
        let ctx = test_context(llm.clone(), env.clone(), Phase::Analysis).await;
        run_agent(&ctx, spec(Capabilities::read_only())).await.unwrap();
        run_agent(&ctx, spec(Capabilities::read_only())).await.unwrap();
        assert_eq!(llm.calls(), 2);
        assert_eq!(env.commands(), vec!["ls".to_string()]);
    }

    #[tokio::test]
    async fn test_pure_actions_fill_scratch() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![
                ("t1", "record_memory", serde_json::json!({"kind": "constraint", "content": "no new deps"})),
                (
                    "t2",
                    "record_finding",
                    serde_json::json!({"criterion": "tests", "severity": "minor", "description": "thin"}),
                ),
            ]),
            text_response("done"),
        ]);
        let ctx = test_context(llm, FakeEnvironment::new(), Phase::Judging).await;
        run_agent(&ctx, spec(Capabilities::judge())).await.unwrap();
        let scratch = ctx.scratch();
        assert_eq!(scratch.memories.len(), 1);
        assert_eq!(scratch.memories[0].kind, MemoryKind::Constraint);
        assert_eq!(scratch.memories[0].phase, Phase::Judging);
        assert_eq!(scratch.findings[0].severity, Severity::Minor);
    }

    #[tokio::test]
    async fn test_spawned_agent_records_parent() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![(
                "t1",
                "spawn_agent",
                serde_json::json!({"name": "explorer", "task": "find the router"}),
            )]),
            text_response("router is in src/app.rs"),
            text_response("final"),
        ]);
        let ctx = test_context(llm.clone(), FakeEnvironment::new(), Phase::Analysis).await;
        let run = run_agent(&ctx, spec(Capabilities::read_only())).await.unwrap();
        assert_eq!(run.text, "final");

        let third = llm.request(2);
        match &third.messages[2].content[0] {
            ContentBlock::ToolResult { content, .. } => assert_eq!(content, "router is in src/app.rs"),
            other => panic!("unexpected {:?}", other),
        }

        let invocations = ctx
            .journal
            .db()
            .call({
                let id = ctx.phase_result_id.clone();
                move |db| db.list_invocations(&id)
            })
            .await
            .unwrap();
        assert_eq!(invocations.len(), 2);
        let child = invocations.iter().find(|i| i.name == "explorer").unwrap();
        assert_eq!(child.parent_id.as_deref(), Some(run.invocation_id.as_str()));
        assert!(child.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_reports_reason() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![("t1", "list_files", serde_json::json!({}))]),
            tool_response(vec![("t2", "list_files", serde_json::json!({}))]),
        ]);
        let ctx = test_context(llm, FakeEnvironment::new(), Phase::Analysis).await;
        let mut s = spec(Capabilities::read_only());
        s.max_steps = 2;
        let run = run_agent(&ctx, s).await.unwrap();
        assert_eq!(run.finish_reason, FinishReason::Other(BUDGET_EXHAUSTED.into()));
        assert_eq!(run.iterations, 2);
    }
}
