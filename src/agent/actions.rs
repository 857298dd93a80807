//! Tool-call parsing and tool definitions.
//!
//! Every tool call the model makes is parsed into one [`Action`] before it
//! is dispatched. Arguments that do not match the tool's shape are a
//! [`WorkflowError::MalformedAction`] and abort the loop.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use shipwright_common::{ApprovalRequestPayload, ChoiceOption, Finding, MemoryKind, Severity};

use crate::errors::WorkflowError;
use crate::llm::{ToolCall, ToolDefinition};

/// Which tools an agent is offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub write: bool,
    pub findings: bool,
    pub spawn: bool,
    pub feedback: bool,
}

impl Capabilities {
    pub fn read_only() -> Self {
        Self {
            write: false,
            findings: false,
            spawn: true,
            feedback: true,
        }
    }

    pub fn coder() -> Self {
        Self {
            write: true,
            ..Self::read_only()
        }
    }

    pub fn judge() -> Self {
        Self {
            findings: true,
            ..Self::read_only()
        }
    }

    /// What a spawned child may use: never write, never ask a human.
    pub fn for_child(&self, can_spawn: bool) -> Self {
        Self {
            write: false,
            findings: self.findings,
            spawn: can_spawn,
            feedback: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnvTool {
    ReadFile { path: String },
    ListFiles { path: String },
    Search { pattern: String, path: String },
    RunCommand { command: String },
    WriteFile { path: String, content: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SpawnAgent { name: String, task: String },
    RequestFeedback(ApprovalRequestPayload),
    RecordMemory { kind: MemoryKind, content: String },
    RecordFinding(Finding),
    Env(EnvTool),
}

#[derive(Deserialize)]
struct SpawnArgs {
    name: String,
    task: String,
}

#[derive(Deserialize)]
struct FeedbackOption {
    #[serde(default)]
    id: Option<String>,
    label: String,
}

#[derive(Deserialize)]
struct FeedbackArgs {
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    placeholder: Option<String>,
    #[serde(default)]
    options: Vec<FeedbackOption>,
}

#[derive(Deserialize)]
struct MemoryArgs {
    kind: String,
    content: String,
}

#[derive(Deserialize)]
struct FindingArgs {
    criterion: String,
    severity: String,
    description: String,
    #[serde(default)]
    recommendation: String,
}

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Deserialize)]
struct OptionalPathArgs {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct SearchArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct CommandArgs {
    command: String,
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

fn malformed(tool: &str, message: impl Into<String>) -> WorkflowError {
    WorkflowError::MalformedAction {
        tool: tool.to_string(),
        message: message.into(),
    }
}

fn args<T: DeserializeOwned>(call: &ToolCall) -> Result<T, WorkflowError> {
    serde_json::from_value(call.input.clone()).map_err(|e| malformed(&call.name, e.to_string()))
}

fn non_empty(tool: &str, field: &str, value: String) -> Result<String, WorkflowError> {
    if value.trim().is_empty() {
        return Err(malformed(tool, format!("'{}' must not be empty", field)));
    }
    Ok(value)
}

fn feedback_request(call: &ToolCall) -> Result<ApprovalRequestPayload, WorkflowError> {
    let a: FeedbackArgs = args(call)?;
    let text = |field: &str, v: Option<String>| {
        v.filter(|s| !s.trim().is_empty())
            .ok_or_else(|| malformed(&call.name, format!("'{}' is required for kind '{}'", field, a.kind)))
    };
    match a.kind.as_str() {
        "approval" => Ok(ApprovalRequestPayload::Approval {
            message: text("message", a.message.clone().or(a.prompt.clone()))?,
        }),
        "text" => Ok(ApprovalRequestPayload::Text {
            prompt: text("prompt", a.prompt.clone().or(a.message.clone()))?,
            placeholder: a.placeholder.clone(),
        }),
        "choice" => {
            let prompt = text("prompt", a.prompt.clone().or(a.message.clone()))?;
            let options: Vec<ChoiceOption> = a
                .options
                .iter()
                .enumerate()
                .map(|(i, o)| ChoiceOption {
                    id: o.id.clone().unwrap_or_else(|| format!("option-{}", i + 1)),
                    label: o.label.clone(),
                })
                .collect();
            let request = ApprovalRequestPayload::choice_or_approval(prompt, options);
            request.validate().map_err(|e| malformed(&call.name, e.to_string()))?;
            Ok(request)
        }
        other => Err(malformed(
            &call.name,
            format!("unknown kind '{}'; expected approval, text or choice", other),
        )),
    }
}

/// Parse a tool call. `Ok(None)` means the tool is not offered to this
/// agent; the model is told so and the loop continues.
pub fn parse_action(call: &ToolCall, caps: Capabilities) -> Result<Option<Action>, WorkflowError> {
    let name = call.name.as_str();
    let action = match name {
        "spawn_agent" if caps.spawn => {
            let a: SpawnArgs = args(call)?;
            Action::SpawnAgent {
                name: non_empty(name, "name", a.name)?,
                task: non_empty(name, "task", a.task)?,
            }
        }
        "request_feedback" if caps.feedback => Action::RequestFeedback(feedback_request(call)?),
        "record_memory" => {
            let a: MemoryArgs = args(call)?;
            let kind = a.kind.parse::<MemoryKind>().map_err(|e| malformed(name, e))?;
            Action::RecordMemory {
                kind,
                content: non_empty(name, "content", a.content)?,
            }
        }
        "record_finding" if caps.findings => {
            let a: FindingArgs = args(call)?;
            let severity = a.severity.parse::<Severity>().map_err(|e| malformed(name, e))?;
            Action::RecordFinding(Finding::new(
                non_empty(name, "criterion", a.criterion)?,
                severity,
                non_empty(name, "description", a.description)?,
                a.recommendation,
            ))
        }
        "read_file" => {
            let a: PathArgs = args(call)?;
            Action::Env(EnvTool::ReadFile { path: a.path })
        }
        "list_files" => {
            let a: OptionalPathArgs = args(call)?;
            Action::Env(EnvTool::ListFiles {
                path: a.path.unwrap_or_else(|| ".".to_string()),
            })
        }
        "search" => {
            let a: SearchArgs = args(call)?;
            Action::Env(EnvTool::Search {
                pattern: non_empty(name, "pattern", a.pattern)?,
                path: a.path.unwrap_or_else(|| ".".to_string()),
            })
        }
        "run_command" => {
            let a: CommandArgs = args(call)?;
            Action::Env(EnvTool::RunCommand {
                command: non_empty(name, "command", a.command)?,
            })
        }
        "write_file" if caps.write => {
            let a: WriteArgs = args(call)?;
            Action::Env(EnvTool::WriteFile {
                path: non_empty(name, "path", a.path)?,
                content: a.content,
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(action))
}

fn tool(name: &str, description: &str, schema: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: schema,
    }
}

/// Tool definitions offered for `caps`.
pub fn tool_definitions(caps: Capabilities) -> Vec<ToolDefinition> {
    let mut tools = vec![
        tool(
            "read_file",
            "Read a file from the repository. Paths are relative to the repository root.",
            json!({"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]}),
        ),
        tool(
            "list_files",
            "List files under a directory of the repository (recursive, .git excluded).",
            json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        ),
        tool(
            "search",
            "Search file contents with a regular expression. Returns matching lines with file and line number.",
            json!({"type": "object", "properties": {"pattern": {"type": "string"}, "path": {"type": "string"}}, "required": ["pattern"]}),
        ),
        tool(
            "run_command",
            "Run a shell command at the repository root and return its exit code and output.",
            json!({"type": "object", "properties": {"command": {"type": "string"}}, "required": ["command"]}),
        ),
        tool(
            "record_memory",
            "Record a note for later phases: an insight, failure, decision or constraint.",
            json!({"type": "object", "properties": {
                "kind": {"type": "string", "enum": ["insight", "failure", "decision", "constraint"]},
                "content": {"type": "string"}
            }, "required": ["kind", "content"]}),
        ),
    ];
    if caps.write {
        tools.push(tool(
            "write_file",
            "Create or overwrite a file in the repository with the given content.",
            json!({"type": "object", "properties": {"path": {"type": "string"}, "content": {"type": "string"}}, "required": ["path", "content"]}),
        ));
    }
    if caps.findings {
        tools.push(tool(
            "record_finding",
            "Record a judging finding against the selected approach.",
            json!({"type": "object", "properties": {
                "criterion": {"type": "string"},
                "severity": {"type": "string", "enum": ["critical", "major", "minor"]},
                "description": {"type": "string"},
                "recommendation": {"type": "string"}
            }, "required": ["criterion", "severity", "description"]}),
        ));
    }
    if caps.spawn {
        tools.push(tool(
            "spawn_agent",
            "Delegate a focused investigation to a sub-agent. Returns the sub-agent's final answer.",
            json!({"type": "object", "properties": {"name": {"type": "string"}, "task": {"type": "string"}}, "required": ["name", "task"]}),
        ));
    }
    if caps.feedback {
        tools.push(tool(
            "request_feedback",
            "Ask the human operator. kind=approval needs message; kind=text needs prompt; kind=choice needs prompt and at least two options.",
            json!({"type": "object", "properties": {
                "kind": {"type": "string", "enum": ["approval", "text", "choice"]},
                "message": {"type": "string"},
                "prompt": {"type": "string"},
                "placeholder": {"type": "string"},
                "options": {"type": "array", "items": {"type": "object", "properties": {"id": {"type": "string"}, "label": {"type": "string"}}, "required": ["label"]}}
            }, "required": ["kind"]}),
        ));
    }
    tools
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: name.into(),
            input,
        }
    }

    #[test]
    fn test_parse_env_tools() {
        let action = parse_action(&call("read_file", json!({"path": "src/main.rs"})), Capabilities::read_only())
            .unwrap()
            .unwrap();
        assert_eq!(action, Action::Env(EnvTool::ReadFile { path: "src/main.rs".into() }));

        let action = parse_action(&call("list_files", json!({})), Capabilities::read_only())
            .unwrap()
            .unwrap();
        assert_eq!(action, Action::Env(EnvTool::ListFiles { path: ".".into() }));
    }

    #[test]
    fn test_malformed_arguments_are_typed_errors() {
        let err = parse_action(&call("read_file", json!({"file": "x"})), Capabilities::read_only()).unwrap_err();
        assert!(matches!(err, WorkflowError::MalformedAction { ref tool, .. } if tool == "read_file"));

        let err = parse_action(
            &call("record_memory", json!({"kind": "gossip", "content": "x"})),
            Capabilities::read_only(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::MalformedAction { .. }));
    }

    #[test]
    fn test_write_requires_coder_capability() {
        let write = call("write_file", json!({"path": "a.txt", "content": "x"}));
        assert!(parse_action(&write, Capabilities::read_only()).unwrap().is_none());
        assert!(parse_action(&write, Capabilities::coder()).unwrap().is_some());
    }

    #[test]
    fn test_findings_only_for_judge() {
        let finding = call(
            "record_finding",
            json!({"criterion": "security", "severity": "Major", "description": "d"}),
        );
        assert!(parse_action(&finding, Capabilities::read_only()).unwrap().is_none());
        let Some(Action::RecordFinding(f)) = parse_action(&finding, Capabilities::judge()).unwrap() else {
            panic!("expected finding");
        };
        assert_eq!(f.severity, Severity::Major);
    }

    #[test]
    fn test_single_option_choice_becomes_approval() {
        let action = parse_action(
            &call(
                "request_feedback",
                json!({"kind": "choice", "prompt": "Which?", "options": [{"label": "Only one"}]}),
            ),
            Capabilities::read_only(),
        )
        .unwrap()
        .unwrap();
        let Action::RequestFeedback(ApprovalRequestPayload::Approval { message }) = action else {
            panic!("expected approval request");
        };
        assert!(message.contains("Only one"));
    }

    #[test]
    fn test_choice_options_get_ids() {
        let action = parse_action(
            &call(
                "request_feedback",
                json!({"kind": "choice", "prompt": "Which?", "options": [{"label": "A"}, {"label": "B"}]}),
            ),
            Capabilities::read_only(),
        )
        .unwrap()
        .unwrap();
        let Action::RequestFeedback(ApprovalRequestPayload::Choice { options, .. }) = action else {
            panic!("expected choice");
        };
        assert_eq!(options[1].id, "option-2");
    }

    #[test]
    fn test_children_never_write_or_ask() {
        let child = Capabilities::coder().for_child(false);
        assert!(!child.write && !child.feedback && !child.spawn);
        let names: Vec<String> = tool_definitions(child).into_iter().map(|t| t.name).collect();
        assert!(!names.contains(&"write_file".to_string()));
        assert!(names.contains(&"read_file".to_string()));
    }
}
