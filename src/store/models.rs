use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use shipwright_common::{
    ApprovalKind, ApprovalRequestPayload, ApprovalResponsePayload, MemoryRecord, Phase, PhaseStatus,
};

/// Canonical timestamp encoding. Fixed width and UTC so that string
/// comparison in SQL orders correctly.
pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn decode_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow::anyhow!("Invalid timestamp '{}': {}", raw, e))?
        .with_timezone(&Utc))
}

/// Inbound run trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRun {
    pub id: String,
    pub request: String,
    pub repo_url: String,
    pub target_branch: String,
    /// Execution-environment runtime flavor, e.g. `node` or `rust`.
    pub runtime: String,
}

/// One feature request's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub request: String,
    pub repo_url: String,
    pub target_branch: String,
    pub runtime: String,
    /// Opaque reference to the provisioned execution environment.
    pub environment: Option<serde_json::Value>,
    pub current_phase: Phase,
    pub failure_reason: Option<String>,
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn is_terminal(&self) -> bool {
        self.current_phase.is_terminal()
    }
}

/// Run plus everything hanging off it, for status views.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub memories: Vec<MemoryRecord>,
    pub phases: Vec<PhaseResult>,
    pub pending_approval: Option<ApprovalRequest>,
}

/// One execution record per (run, phase).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub id: String,
    pub run_id: String,
    pub phase: Phase,
    pub status: PhaseStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Deterministic phase result identity.
pub fn phase_result_id(run_id: &str, phase: Phase) -> String {
    format!("{}:{}", run_id, phase)
}

/// Fields known when an agent starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvocation {
    pub id: String,
    pub phase_result_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    pub input: serde_json::Value,
}

/// Fields written once when an agent stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationCompletion {
    pub finish_reason: String,
    pub output: String,
    pub usage: serde_json::Value,
    pub steps: serde_json::Value,
}

/// One LLM-driven execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub id: String,
    pub phase_result_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    pub input: serde_json::Value,
    pub finish_reason: Option<String>,
    pub output: Option<String>,
    pub usage: Option<serde_json::Value>,
    pub steps: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields known when an approval is emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApproval {
    pub id: String,
    pub run_id: String,
    pub phase_result_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub request: ApprovalRequestPayload,
    pub deadline: DateTime<Utc>,
}

/// Human-in-the-loop gate. The id is the correlation key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: String,
    pub phase_result_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub kind: ApprovalKind,
    pub request: ApprovalRequestPayload,
    pub response: Option<ApprovalResponsePayload>,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub deadline: DateTime<Utc>,
    pub timed_out: bool,
}

impl ApprovalRequest {
    pub fn is_pending(&self) -> bool {
        self.response.is_none() && !self.timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_as_strings() {
        let early = decode_ts("2026-01-02T03:04:05.000Z").unwrap();
        let late = early + chrono::Duration::days(20);
        assert!(encode_ts(early) < encode_ts(late));
        assert_eq!(decode_ts(&encode_ts(late)).unwrap(), late);
    }

    #[test]
    fn test_phase_result_id_is_deterministic() {
        assert_eq!(phase_result_id("r1", Phase::Judging), "r1:judging");
    }
}
