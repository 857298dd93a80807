//! Human-approval suspend/resume protocol.
//!
//! A request goes through three journaled steps: allocate a correlation id,
//! emit the request row, then wait. Waiting never blocks. If no response
//! has arrived the workflow unwinds with [`WorkflowError::Suspended`] and
//! the scheduler re-runs it later, at which point the wait step checks the
//! row again. The resolved outcome is journaled so replays never re-ask.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shipwright_common::{ApprovalRequestPayload, ApprovalResponsePayload};

use crate::durable::Journal;
use crate::errors::{ApprovalError, WorkflowError};
use crate::store::{ApprovalRequest, DbHandle, NewApproval};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Responded {
        approval_id: String,
        response: ApprovalResponsePayload,
    },
    TimedOut {
        approval_id: String,
    },
}

/// Where a request came from. Gates fired between phases have neither.
#[derive(Debug, Clone, Default)]
pub struct ApprovalOrigin {
    pub phase_result_id: Option<String>,
    pub tool_call_id: Option<String>,
}

/// Ask a human and wait for the correlated answer.
///
/// `key` must be unique and stable for this request within the run.
pub async fn request_human_input(
    journal: &Journal,
    key: &str,
    origin: ApprovalOrigin,
    request: ApprovalRequestPayload,
    timeout: Duration,
) -> Result<ApprovalOutcome, WorkflowError> {
    let outcome_key = format!("{}/outcome", key);
    if let Some(outcome) = journal.lookup::<ApprovalOutcome>(&outcome_key).await? {
        return Ok(outcome);
    }

    request
        .validate()
        .map_err(|e| WorkflowError::Integrity(format!("approval request at {}: {}", key, e)))?;

    let approval_id: String = journal
        .step(&format!("{}/id", key), || async {
            Ok(uuid::Uuid::new_v4().to_string())
        })
        .await?;

    let deadline: DateTime<Utc> = journal
        .step(&format!("{}/emit", key), || {
            let new = NewApproval {
                id: approval_id.clone(),
                run_id: journal.run_id().to_string(),
                phase_result_id: origin.phase_result_id.clone(),
                tool_call_id: origin.tool_call_id.clone(),
                request: request.clone(),
                deadline: Utc::now() + timeout,
            };
            async move {
                let row = journal.db().call(move |db| db.create_approval(&new)).await?;
                tracing::info!(
                    run_id = %row.run_id,
                    approval_id = %row.id,
                    kind = %row.kind,
                    deadline = %row.deadline,
                    "approval requested"
                );
                Ok(row.deadline)
            }
        })
        .await?;

    let outcome = wait_for_response(journal.db(), &approval_id, deadline).await?;
    journal.record(&outcome_key, outcome).await
}

async fn wait_for_response(
    db: &DbHandle,
    approval_id: &str,
    deadline: DateTime<Utc>,
) -> Result<ApprovalOutcome, WorkflowError> {
    let id = approval_id.to_string();
    let row = db
        .call(move |db| db.get_approval(&id))
        .await?
        .ok_or_else(|| WorkflowError::Integrity(format!("approval {} vanished", approval_id)))?;

    if let Some(outcome) = resolved(&row)? {
        return Ok(outcome);
    }

    if Utc::now() >= deadline {
        let id = approval_id.to_string();
        let row = db.call(move |db| db.timeout_approval(&id)).await?;
        // A response may have landed between the read and the timeout.
        if let Some(outcome) = resolved(&row)? {
            return Ok(outcome);
        }
        return Ok(ApprovalOutcome::TimedOut {
            approval_id: approval_id.to_string(),
        });
    }

    tracing::debug!(approval_id, resume_at = %deadline, "suspending until approval resolves");
    Err(WorkflowError::Suspended {
        approval_id: approval_id.to_string(),
        resume_at: deadline,
    })
}

fn resolved(row: &ApprovalRequest) -> Result<Option<ApprovalOutcome>, WorkflowError> {
    if let Some(response) = &row.response {
        row.request.accepts(response).map_err(|e| {
            WorkflowError::Integrity(format!("stored response for {} is invalid: {}", row.id, e))
        })?;
        tracing::info!(approval_id = %row.id, "approval answered");
        return Ok(Some(ApprovalOutcome::Responded {
            approval_id: row.id.clone(),
            response: response.clone(),
        }));
    }
    if row.timed_out {
        tracing::warn!(approval_id = %row.id, "approval timed out");
        return Ok(Some(ApprovalOutcome::TimedOut {
            approval_id: row.id.clone(),
        }));
    }
    Ok(None)
}

/// Apply a human's response. The outer error is storage, the inner one is
/// why the response was refused.
pub async fn submit_response(
    db: &DbHandle,
    approval_id: &str,
    response: ApprovalResponsePayload,
) -> anyhow::Result<Result<ApprovalRequest, ApprovalError>> {
    let id = approval_id.to_string();
    db.call(move |db| db.respond_approval(&id, &response)).await
}
