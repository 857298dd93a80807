//! Durable step journal.
//!
//! A run is executed by re-running its workflow from the top. Every
//! nondeterministic or side-effecting step goes through [`Journal::step`]
//! under a deterministic key: the first execution records the outcome, every
//! later execution returns the recorded outcome without re-running the
//! closure. Errors are not recorded, so a failed or suspended step runs
//! again on the next pass.

use std::future::Future;

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::WorkflowError;
use crate::store::DbHandle;

#[derive(Clone)]
pub struct Journal {
    db: DbHandle,
    run_id: String,
}

impl Journal {
    pub fn new(db: DbHandle, run_id: impl Into<String>) -> Self {
        Self {
            db,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    /// Return the recorded outcome of `key`, or run `f` and record its result.
    pub async fn step<T, F, Fut>(&self, key: &str, f: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        if let Some(cached) = self.lookup::<T>(key).await? {
            tracing::trace!(run_id = %self.run_id, step = key, "replayed step");
            return Ok(cached);
        }
        let value = f().await?;
        self.record(key, value).await
    }

    /// Recorded outcome of `key`, if any.
    pub async fn lookup<T>(&self, key: &str) -> Result<Option<T>, WorkflowError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let run_id = self.run_id.clone();
        let step_key = key.to_string();
        let raw = self
            .db
            .call(move |db| db.get_step(&run_id, &step_key))
            .await?;
        raw.map(|raw| {
            serde_json::from_str(&raw)
                .with_context(|| format!("Journal entry '{}' has an unexpected shape", key))
        })
        .transpose()
        .map_err(WorkflowError::from)
    }

    /// Record `value` under `key`. If another execution got there first the
    /// stored value wins and is returned instead.
    pub async fn record<T>(&self, key: &str, value: T) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let encoded = serde_json::to_string(&value)
            .with_context(|| format!("Failed to encode journal entry '{}'", key))?;
        let run_id = self.run_id.clone();
        let step_key = key.to_string();
        let stored = self
            .db
            .call(move |db| db.record_step(&run_id, &step_key, &encoded))
            .await?;
        let value = serde_json::from_str(&stored)
            .with_context(|| format!("Journal entry '{}' has an unexpected shape", key))?;
        Ok(value)
    }
}
