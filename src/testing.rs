//! Test doubles shared by unit tests across the crate.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use shipwright_common::Phase;

use crate::agent::{AgentContext, PhaseScratch};
use crate::codehost::{CodeHost, PullRequestRef};
use crate::config::{AgentsSection, EnvironmentKind, ShipwrightConfig};
use crate::durable::Journal;
use crate::environment::{CommandOutput, Environment, EnvironmentRef, Provisioner};
use crate::errors::LlmError;
use crate::llm::{ContentBlock, FinishReason, LlmProvider, ModelRequest, ModelResponse, Usage};
use crate::orchestrator::Engine;
use crate::store::{DbHandle, NewRun, Run, Store};

// ── LLM ───────────────────────────────────────────────────────────────

/// Returns canned responses in order and records every request.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<ModelResponse>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<ModelResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Append a response to the end of the script.
    pub fn push(&self, response: ModelResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn request(&self, i: usize) -> ModelRequest {
        self.requests.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::InvalidResponse("script exhausted".into()))
    }
}

pub fn text_response(text: &str) -> ModelResponse {
    ModelResponse {
        content: vec![ContentBlock::Text { text: text.into() }],
        finish_reason: FinishReason::EndTurn,
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

pub fn tool_response(calls: Vec<(&str, &str, serde_json::Value)>) -> ModelResponse {
    ModelResponse {
        content: calls
            .into_iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input,
            })
            .collect(),
        finish_reason: FinishReason::ToolUse,
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

// ── Environment ───────────────────────────────────────────────────────

pub fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

pub fn failed_output(stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

#[derive(Default)]
struct FakeState {
    files: BTreeMap<String, String>,
    commands: Vec<String>,
    scripts: Vec<(String, VecDeque<CommandOutput>)>,
}

/// In-memory environment. Clones share state, so a test can keep a handle
/// to inspect what the code under test did.
#[derive(Clone)]
pub struct FakeEnvironment {
    reference: EnvironmentRef,
    state: Arc<Mutex<FakeState>>,
}

impl FakeEnvironment {
    pub fn new() -> Self {
        Self {
            reference: EnvironmentRef {
                kind: EnvironmentKind::Local,
                id: "fake".into(),
                workdir: PathBuf::from("/fake"),
            },
            state: Arc::default(),
        }
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_string());
        self
    }

    /// Commands containing `pattern` answer with `outputs` in order; the
    /// last output repeats. Unscripted commands succeed with no output.
    pub fn with_command(self, pattern: &str, outputs: Vec<CommandOutput>) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .push((pattern.to_string(), outputs.into()));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).cloned()
    }
}

#[async_trait]
impl Environment for FakeEnvironment {
    fn reference(&self) -> &EnvironmentRef {
        &self.reference
    }

    async fn exec(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());
        let scripted = state
            .scripts
            .iter_mut()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .and_then(|(_, outputs)| {
                if outputs.len() > 1 {
                    outputs.pop_front()
                } else {
                    outputs.front().cloned()
                }
            });
        Ok(scripted.unwrap_or_else(|| ok_output("")))
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        match self.state.lock().unwrap().files.get(path) {
            Some(content) => Ok(content.clone()),
            None => bail!("No such file: {}", path),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = dir.trim_matches('/');
        let state = self.state.lock().unwrap();
        Ok(state
            .files
            .keys()
            .filter(|p| prefix.is_empty() || prefix == "." || p.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Hands out one shared [`FakeEnvironment`] and remembers releases.
#[derive(Clone)]
pub struct FakeProvisioner {
    pub env: FakeEnvironment,
    released: Arc<Mutex<Vec<EnvironmentRef>>>,
    provisioned: Arc<Mutex<u32>>,
}

impl FakeProvisioner {
    pub fn new(env: FakeEnvironment) -> Self {
        Self {
            env,
            released: Arc::default(),
            provisioned: Arc::default(),
        }
    }

    pub fn released(&self) -> bool {
        !self.released.lock().unwrap().is_empty()
    }

    pub fn provision_count(&self) -> u32 {
        *self.provisioned.lock().unwrap()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(&self, _run: &Run) -> Result<EnvironmentRef> {
        *self.provisioned.lock().unwrap() += 1;
        Ok(self.env.reference().clone())
    }

    async fn attach(&self, _reference: &EnvironmentRef) -> Result<Arc<dyn Environment>> {
        Ok(Arc::new(self.env.clone()))
    }

    async fn release(&self, reference: &EnvironmentRef) -> Result<()> {
        self.released.lock().unwrap().push(reference.clone());
        Ok(())
    }
}

// ── Code host ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingCodeHost {
    pub pushes: Mutex<Vec<String>>,
    pub pulls: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl CodeHost for RecordingCodeHost {
    async fn push_branch(&self, _env: &dyn Environment, _repo_url: &str, branch: &str) -> Result<()> {
        self.pushes.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn open_pull_request(
        &self,
        _repo_url: &str,
        head: &str,
        base: &str,
        title: &str,
        _body: &str,
    ) -> Result<PullRequestRef> {
        let mut pulls = self.pulls.lock().unwrap();
        pulls.push((title.to_string(), head.to_string(), base.to_string()));
        Ok(PullRequestRef {
            url: format!("https://github.com/acme/app/pull/{}", pulls.len()),
            number: pulls.len() as u64,
        })
    }
}

// ── Store and contexts ────────────────────────────────────────────────

pub fn new_run(id: &str) -> NewRun {
    NewRun {
        id: id.into(),
        request: "Add a health endpoint".into(),
        repo_url: "https://github.com/acme/app".into(),
        target_branch: "main".into(),
        runtime: "node".into(),
    }
}

/// In-memory store holding run `r1`.
pub fn test_db() -> DbHandle {
    let store = Store::new_in_memory().unwrap();
    store.create_run(&new_run("r1")).unwrap();
    DbHandle::new(store)
}

/// Agent context for run `r1` with a running phase result for `phase`.
pub async fn test_context(llm: Arc<ScriptedLlm>, env: FakeEnvironment, phase: Phase) -> AgentContext {
    let db = test_db();
    let result = db
        .call(move |db| db.create_phase_result("r1", phase))
        .await
        .unwrap();
    AgentContext {
        journal: Journal::new(db, "r1"),
        llm,
        env: Arc::new(env),
        phase,
        phase_result_id: result.id,
        agents: AgentsSection::default(),
        approval_timeout: chrono::Duration::days(14),
        command_timeout: Duration::from_secs(60),
        scratch: Arc::new(Mutex::new(PhaseScratch::default())),
    }
}

// ── Engine ────────────────────────────────────────────────────────────

/// An engine over fakes, with run `r1` created and a node repository whose
/// changes diff to one added file.
pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub llm: Arc<ScriptedLlm>,
    pub provisioner: FakeProvisioner,
    pub host: Arc<RecordingCodeHost>,
}

pub fn test_engine(script: Vec<ModelResponse>, config: ShipwrightConfig) -> TestEngine {
    let store = Store::new_in_memory().unwrap();
    store.create_run(&new_run("r1")).unwrap();
    let env = FakeEnvironment::new()
        .with_file("package.json", r#"{"scripts": {"test": "jest"}}"#)
        .with_command("--name-status", vec![ok_output("A\tsrc/health.ts\n")]);
    let provisioner = FakeProvisioner::new(env);
    let host = Arc::new(RecordingCodeHost::default());
    let llm = ScriptedLlm::new(script);
    let engine = Engine {
        db: DbHandle::new(store),
        config,
        llm: llm.clone(),
        provisioner: Arc::new(provisioner.clone()),
        code_host: host.clone(),
    };
    TestEngine {
        engine: Arc::new(engine),
        llm,
        provisioner,
        host,
    }
}
