//! The per-run workflow: phases in order with a human gate after each.
//!
//! The whole function is re-executed from the top on every pass. Phase
//! outcomes, gate outcomes and side effects are journaled, so a pass
//! replays everything already done and continues from the first step with
//! no recorded outcome.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shipwright_common::{
    AnalysisOutput, Approach, ApproachesOutput, ApprovalRequestPayload, ApprovalResponsePayload,
    ChoiceOption, ImplementationOutput, JudgingOutput, MemoryRecord, Phase, PrOutput, Validate,
    from_value,
};

use super::Engine;
use super::retry::{ImplementationPlan, implement};
use crate::agent::{AgentContext, PhaseScratch};
use crate::approval::{ApprovalOrigin, ApprovalOutcome, request_human_input};
use crate::durable::Journal;
use crate::environment::{Environment, EnvironmentRef};
use crate::errors::WorkflowError;
use crate::gates::GateRunner;
use crate::phases::{self, RunBrief};
use crate::store::{Run, phase_result_id};
use crate::util::slugify;

/// A workflow error and the phase it is attributed to.
#[derive(Debug)]
pub(crate) struct Failure {
    pub phase: Phase,
    pub error: WorkflowError,
}

trait At<T> {
    fn at(self, phase: Phase) -> Result<T, Failure>;
}

impl<T, E: Into<WorkflowError>> At<T> for Result<T, E> {
    fn at(self, phase: Phase) -> Result<T, Failure> {
        self.map_err(|e| Failure {
            phase,
            error: e.into(),
        })
    }
}

type Flow<T> = Result<T, Failure>;

/// A phase's validated output plus the memories it recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhaseRecord<T> {
    output: T,
    memories: Vec<MemoryRecord>,
}

pub(crate) struct Workflow<'e> {
    engine: &'e Engine,
    journal: Journal,
    run: Run,
    gates: GateRunner,
}

impl<'e> Workflow<'e> {
    pub(crate) fn new(engine: &'e Engine, run: Run) -> Self {
        Self {
            engine,
            journal: Journal::new(engine.db.clone(), run.id.clone()),
            gates: GateRunner::new(engine.config.gates.clone()),
            run,
        }
    }

    pub(crate) async fn execute(&self) -> Flow<PrOutput> {
        let env_ref = self.provision().await.at(Phase::Analysis)?;
        let env = self
            .engine
            .provisioner
            .attach(&env_ref)
            .await
            .at(Phase::Analysis)?;

        // Analysis
        let ctx = self.context(Phase::Analysis, &env).await?;
        let brief = self.brief().await.at(Phase::Analysis)?;
        let outcome = self
            .journal
            .step("analysis/outcome", || async {
                let output = phases::analysis::run(&ctx, &brief).await?;
                Ok(record(output, &ctx))
            })
            .await;
        let analysis: AnalysisOutput = self.finish(Phase::Analysis, outcome).await?;
        self.approve(
            Phase::Analysis,
            format!(
                "Analysis finished for \"{}\".\n\nFeasibility: {}\n\nProceed to approach generation?",
                self.run.request,
                analysis.feasibility_assessment
            ),
        )
        .await?;

        // Approaches
        let ctx = self.context(Phase::Approaches, &env).await?;
        let brief = self.brief().await.at(Phase::Approaches)?;
        let outcome = self
            .journal
            .step("approaches/outcome", || async {
                let output = phases::approaches::run(&ctx, &brief, &analysis).await?;
                Ok(record(output, &ctx))
            })
            .await;
        let approaches: ApproachesOutput = self.finish(Phase::Approaches, outcome).await?;
        let response = self
            .gate(Phase::Approaches, approaches_gate_request(&approaches))
            .await?;
        let approach = select_approach(&approaches, response).at(Phase::Approaches)?;
        tracing::info!(run_id = %self.run.id, approach = %approach.id, "approach selected");

        // Judging
        let ctx = self.context(Phase::Judging, &env).await?;
        let brief = self.brief().await.at(Phase::Judging)?;
        let outcome = self
            .journal
            .step("judging/outcome", || async {
                let output = phases::judging::run(&ctx, &brief, &analysis, &approach).await?;
                Ok(record(output, &ctx))
            })
            .await;
        let judging: JudgingOutput = self.finish(Phase::Judging, outcome).await?;
        self.approve(
            Phase::Judging,
            format!(
                "Judging verdict for \"{}\": {} with {} condition(s).\n\n{}\n\nBegin implementation?",
                approach.title,
                judging.overall_verdict,
                judging.conditions.len(),
                judging.overall_assessment
            ),
        )
        .await?;

        // Implementation
        let ctx = self.context(Phase::Implementation, &env).await?;
        let brief = self.brief().await.at(Phase::Implementation)?;
        let branch = branch_name(&self.run.id, &approach.title);
        let plan = ImplementationPlan {
            brief: &brief,
            analysis: &analysis,
            approach: &approach,
            conditions: &judging.conditions,
            branch: &branch,
        };
        let outcome = self
            .journal
            .step("implementation/outcome", || async {
                let output = implement(&ctx, &self.gates, &plan).await?;
                Ok(record(output, &ctx))
            })
            .await;
        let implementation: ImplementationOutput = self.finish(Phase::Implementation, outcome).await?;
        self.approve(
            Phase::Implementation,
            format!(
                "Implementation of \"{}\" passed every gate on branch {} after {} attempt(s), changing {} file(s).\n\nCreate the pull request?",
                approach.title,
                implementation.branch,
                implementation.total_coder_attempts,
                implementation.files_changed.len()
            ),
        )
        .await?;

        // Pull request
        self.pull_request(env.as_ref(), &approach, &judging, &implementation)
            .await
    }

    async fn provision(&self) -> Result<EnvironmentRef, WorkflowError> {
        let env_ref: EnvironmentRef = self
            .journal
            .step("environment/provision", || async {
                let env_ref = self.engine.provisioner.provision(&self.run).await?;
                tracing::info!(run_id = %self.run.id, env = %env_ref.id, "environment provisioned");
                Ok(env_ref)
            })
            .await?;
        let value = serde_json::to_value(&env_ref).map_err(anyhow::Error::from)?;
        let id = self.run.id.clone();
        self.engine
            .db
            .call(move |db| db.set_run_environment(&id, &value))
            .await?;
        Ok(env_ref)
    }

    /// Create the phase's result row and a fresh agent context for it.
    async fn context(&self, phase: Phase, env: &Arc<dyn Environment>) -> Flow<AgentContext> {
        let run_id = self.run.id.clone();
        let result = self
            .engine
            .db
            .call(move |db| db.create_phase_result(&run_id, phase))
            .await
            .at(phase)?;
        tracing::info!(run_id = %self.run.id, phase = %phase, "phase started");
        let config = &self.engine.config;
        Ok(AgentContext {
            journal: self.journal.clone(),
            llm: self.engine.llm.clone(),
            env: env.clone(),
            phase,
            phase_result_id: result.id,
            agents: config.agents.clone(),
            approval_timeout: config.approval.timeout(),
            command_timeout: config.gates.command_timeout(),
            scratch: Arc::new(Mutex::new(PhaseScratch::default())),
        })
    }

    /// The run's context as of now. Memories are re-read for every phase.
    async fn brief(&self) -> anyhow::Result<RunBrief> {
        let run_id = self.run.id.clone();
        let memories = self
            .engine
            .db
            .call(move |db| db.list_memories(&run_id))
            .await?;
        Ok(RunBrief {
            run_id: self.run.id.clone(),
            request: self.run.request.clone(),
            repo_url: self.run.repo_url.clone(),
            target_branch: self.run.target_branch.clone(),
            memories,
        })
    }

    /// Persist a phase's outcome: pass its result, advance the run, append
    /// its memories. On failure mark the result failed.
    async fn finish<T>(&self, phase: Phase, outcome: Result<PhaseRecord<T>, WorkflowError>) -> Flow<T>
    where
        T: Serialize + DeserializeOwned + Validate,
    {
        let record = match outcome {
            Ok(record) => record,
            Err(error) => return Err(self.phase_failed(phase, error).await),
        };
        let output = serde_json::to_value(&record.output)
            .map_err(anyhow::Error::from)
            .at(phase)?;
        // Replayed outcomes come from storage and are checked again.
        let checked: T = match from_value(output.clone()) {
            Ok(checked) => checked,
            Err(e) => {
                let error = WorkflowError::Integrity(format!("recorded {} output is invalid: {}", phase, e));
                return Err(self.phase_failed(phase, error).await);
            }
        };
        let (run_id, result_id, memories) = (
            self.run.id.clone(),
            phase_result_id(&self.run.id, phase),
            record.memories.clone(),
        );
        let next = phase.next();
        self.engine
            .db
            .call(move |db| {
                db.pass_phase_result(&result_id, &output)?;
                // A replayed phase finds the run already past it.
                let current = db.get_run(&run_id)?.map(|r| r.current_phase);
                if let (Some(next), Some(current)) = (next, current) {
                    if current.ordinal() < next.ordinal() {
                        db.advance_run(&run_id, phase, next)?;
                    }
                }
                db.append_memories(&run_id, phase, &memories)
            })
            .await
            .at(phase)?;
        tracing::info!(
            run_id = %self.run.id,
            phase = %phase,
            memories = record.memories.len(),
            "phase passed"
        );
        Ok(checked)
    }

    async fn phase_failed(&self, phase: Phase, error: WorkflowError) -> Failure {
        if !matches!(error, WorkflowError::Suspended { .. } | WorkflowError::Infrastructure(_)) {
            self.fail_result(phase, &error.describe(phase)).await;
        }
        Failure { phase, error }
    }

    async fn fail_result(&self, phase: Phase, reason: &str) {
        let (id, reason) = (phase_result_id(&self.run.id, phase), reason.to_string());
        if let Err(e) = self
            .engine
            .db
            .call(move |db| db.fail_phase_result(&id, &reason))
            .await
        {
            tracing::error!(run_id = %self.run.id, phase = %phase, error = %e, "failed to mark phase result failed");
        }
    }

    /// Fire the gate that follows `after`. A timeout fails that phase's
    /// result even though it had passed.
    async fn gate(&self, after: Phase, request: ApprovalRequestPayload) -> Flow<ApprovalResponsePayload> {
        let outcome = request_human_input(
            &self.journal,
            &format!("gate/{}", after),
            ApprovalOrigin::default(),
            request,
            self.engine.config.approval.timeout(),
        )
        .await
        .at(after)?;
        match outcome {
            ApprovalOutcome::Responded { response, .. } => Ok(response),
            ApprovalOutcome::TimedOut { approval_id } => {
                let error = WorkflowError::ApprovalTimedOut {
                    phase: after,
                    approval_id,
                };
                self.fail_result(after, &error.describe(after)).await;
                Err(Failure { phase: after, error })
            }
        }
    }

    async fn approve(&self, after: Phase, message: String) -> Flow<()> {
        let response = self
            .gate(after, ApprovalRequestPayload::Approval { message })
            .await?;
        require_approval(after, response).at(after)
    }

    async fn pull_request(
        &self,
        env: &dyn Environment,
        approach: &Approach,
        judging: &JudgingOutput,
        implementation: &ImplementationOutput,
    ) -> Flow<PrOutput> {
        let run_id = self.run.id.clone();
        self.engine
            .db
            .call(move |db| db.create_phase_result(&run_id, Phase::Pr))
            .await
            .at(Phase::Pr)?;

        let host = self.engine.code_host.as_ref();
        let outcome = self
            .journal
            .step("pr/outcome", || async {
                let title = approach.title.clone();
                let body = pr_body(&self.run, approach, judging, implementation);
                let branch = implementation.branch.as_str();
                self.journal
                    .step("pr/push", || async {
                        host.push_branch(env, &self.run.repo_url, branch).await?;
                        Ok(())
                    })
                    .await?;
                let pull = self
                    .journal
                    .step("pr/open", || async {
                        Ok(host
                            .open_pull_request(
                                &self.run.repo_url,
                                branch,
                                &self.run.target_branch,
                                &title,
                                &body,
                            )
                            .await?)
                    })
                    .await?;
                let output = PrOutput {
                    pr_url: pull.url,
                    pr_number: pull.number,
                    title,
                    body,
                };
                output
                    .validate()
                    .map_err(|e| WorkflowError::validation(Phase::Pr, e.to_string()))?;
                Ok(PhaseRecord {
                    output,
                    memories: Vec::new(),
                })
            })
            .await;

        let record = match outcome {
            Ok(record) => record,
            Err(error) => return Err(self.phase_failed(Phase::Pr, error).await),
        };
        let output = serde_json::to_value(&record.output)
            .map_err(anyhow::Error::from)
            .at(Phase::Pr)?;
        let (run_id, result_id, pr_url) = (
            self.run.id.clone(),
            phase_result_id(&self.run.id, Phase::Pr),
            record.output.pr_url.clone(),
        );
        self.engine
            .db
            .call(move |db| {
                db.pass_phase_result(&result_id, &output)?;
                db.complete_run(&run_id, &pr_url)
            })
            .await
            .at(Phase::Pr)?;
        tracing::info!(run_id = %self.run.id, pr_url = %record.output.pr_url, "run completed");
        Ok(record.output)
    }
}

fn record<T>(output: T, ctx: &AgentContext) -> PhaseRecord<T> {
    PhaseRecord {
        output,
        memories: ctx.scratch().memories,
    }
}

/// The gate after approaches: a choice among two or more approaches,
/// otherwise an approval of the only one.
pub fn approaches_gate_request(output: &ApproachesOutput) -> ApprovalRequestPayload {
    let options = output
        .approaches
        .iter()
        .map(|a| ChoiceOption {
            id: a.id.clone(),
            label: a.title.clone(),
        })
        .collect();
    ApprovalRequestPayload::choice_or_approval(
        format!("Which approach should be judged?\n\nRecommendation: {}", output.recommendation),
        options,
    )
}

/// Resolve the approaches gate to a concrete approach. An unknown selection
/// is an integrity error, never a fallback.
pub fn select_approach(
    output: &ApproachesOutput,
    response: ApprovalResponsePayload,
) -> Result<Approach, WorkflowError> {
    match response {
        ApprovalResponsePayload::Choice { selected_id } => {
            output.find(&selected_id).cloned().ok_or_else(|| {
                WorkflowError::Integrity(format!(
                    "selected approach '{}' is not one of the {} generated approaches",
                    selected_id,
                    output.approaches.len()
                ))
            })
        }
        ApprovalResponsePayload::Approval { .. } if output.approaches.len() != 1 => {
            Err(WorkflowError::Integrity(format!(
                "an approval cannot select among {} approaches",
                output.approaches.len()
            )))
        }
        approval @ ApprovalResponsePayload::Approval { .. } => {
            require_approval(Phase::Approaches, approval)?;
            output.approaches.first().cloned().ok_or_else(|| {
                WorkflowError::Integrity("approaches output is empty".to_string())
            })
        }
        other => Err(WorkflowError::Integrity(format!(
            "unexpected {} response at the approaches gate",
            other.kind()
        ))),
    }
}

fn require_approval(after: Phase, response: ApprovalResponsePayload) -> Result<(), WorkflowError> {
    match response {
        ApprovalResponsePayload::Approval { approved: true, .. } => Ok(()),
        ApprovalResponsePayload::Approval {
            approved: false,
            reason,
        } => Err(WorkflowError::Rejected {
            reason: match reason {
                Some(reason) if !reason.trim().is_empty() => {
                    format!("operator declined after {}: {}", after, reason.trim())
                }
                _ => format!("operator declined after {}", after),
            },
        }),
        other => Err(WorkflowError::Integrity(format!(
            "unexpected {} response at the {} gate",
            other.kind(),
            after
        ))),
    }
}

/// Deterministic branch name for a run.
pub fn branch_name(run_id: &str, title: &str) -> String {
    let short: String = run_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
    let slug = slugify(title, 40);
    if slug.is_empty() {
        format!("shipwright/{}", short)
    } else {
        format!("shipwright/{}-{}", short, slug)
    }
}

fn pr_body(
    run: &Run,
    approach: &Approach,
    judging: &JudgingOutput,
    implementation: &ImplementationOutput,
) -> String {
    let mut body = String::new();
    body.push_str("## Summary\n\n");
    body.push_str(approach.summary.trim());
    body.push_str("\n\n## Request\n\n");
    body.push_str(run.request.trim());
    body.push_str("\n\n## Files changed\n\n");
    for file in &implementation.files_changed {
        let change = format!("{:?}", file.change_type).to_lowercase();
        body.push_str(&format!("- `{}` ({})\n", file.path, change));
    }
    body.push_str("\n## Quality gates\n\n");
    for result in &implementation.gate_results {
        body.push_str(&format!(
            "- {}: {}\n",
            result.gate,
            if result.passed() { "passed" } else { "failed" }
        ));
    }
    if !judging.conditions.is_empty() {
        body.push_str("\n## Review conditions\n\n");
        for condition in &judging.conditions {
            let done = implementation
                .conditions_addressed
                .iter()
                .any(|c| c == &condition.description);
            body.push_str(&format!(
                "- [{}] [{}] {}\n",
                if done { "x" } else { " " },
                condition.severity,
                condition.description
            ));
        }
    }
    body.push_str(&format!(
        "\n---\nshipwright run `{}`, {} coder attempt(s).\n",
        run.id, implementation.total_coder_attempts
    ));
    body
}
