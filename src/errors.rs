//! Typed error hierarchy for shipwright.
//!
//! Three top-level enums cover the three surfaces:
//! - `WorkflowError`: anything a durable step or phase can end with,
//!   including the `Suspended` control-flow signal
//! - `ApprovalError`: rejected approval response submissions
//! - `LlmError`: model provider failures

use chrono::{DateTime, Utc};
use shipwright_common::{ApprovalKind, GateResult, Phase};
use thiserror::Error;

/// Errors (and the suspension signal) produced while executing a run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Not a failure. The run is parked until the approval resolves or
    /// its deadline passes.
    #[error("suspended awaiting approval {approval_id} (deadline {resume_at})")]
    Suspended {
        approval_id: String,
        resume_at: DateTime<Utc>,
    },

    #[error("{phase} output failed validation: {message}")]
    Validation { phase: Phase, message: String },

    #[error("model requested '{tool}' with malformed arguments: {message}")]
    MalformedAction { tool: String, message: String },

    #[error("approval {approval_id} for {phase} timed out")]
    ApprovalTimedOut { phase: Phase, approval_id: String },

    #[error("quality gates still failing after {attempts} attempts")]
    GatesExhausted {
        attempts: u32,
        gate_results: Vec<GateResult>,
    },

    #[error("approach rejected: {reason}")]
    Rejected { reason: String },

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn is_suspension(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }

    /// Short failure class shown to operators next to the phase name.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Suspended { .. } => "suspended",
            Self::Validation { .. } => "validation",
            Self::MalformedAction { .. } => "malformed_action",
            Self::ApprovalTimedOut { .. } => "timeout",
            Self::GatesExhausted { .. } => "gate_exhaustion",
            Self::Rejected { .. } => "rejection",
            Self::Integrity(_) => "integrity",
            Self::Infrastructure(_) => "infrastructure",
        }
    }

    /// Operator-facing failure description: phase, class and cause.
    pub fn describe(&self, phase: Phase) -> String {
        format!("{} failed ({}): {:#}", phase, self.class(), self)
    }

    pub fn validation(phase: Phase, message: impl Into<String>) -> Self {
        Self::Validation {
            phase,
            message: message.into(),
        }
    }
}

impl From<LlmError> for WorkflowError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Malformed { tool, message } => Self::MalformedAction { tool, message },
            other => Self::Infrastructure(anyhow::Error::new(other)),
        }
    }
}

/// Reasons an approval response submission is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("no approval request with id {0}")]
    NotFound(String),

    #[error("approval {0} already has a response")]
    AlreadyResolved(String),

    #[error("approval {0} timed out and can no longer be answered")]
    TimedOut(String),

    #[error("approval {id} expects a {expected} response, got {actual}")]
    KindMismatch {
        id: String,
        expected: ApprovalKind,
        actual: ApprovalKind,
    },

    #[error("invalid response for approval {id}: {message}")]
    InvalidResponse { id: String, message: String },
}

/// Model provider failures.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The model produced a tool call whose arguments do not parse.
    #[error("malformed tool call '{tool}': {message}")]
    Malformed { tool: String, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}
