// Job executor seam: the controller hands creation and termination intents
// to an executor and learns about finished runs through a completion channel.

use crate::errors::ExecutorError;
use crate::models::{RunId, RunState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, instrument};
use uuid::Uuid;

/// A request to start one Job for a CronJob fire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIntent {
    pub execution_id: Uuid,
    /// `namespace/name` of the owning CronJob
    pub cronjob: String,
    pub run_id: RunId,
    pub scheduled_time: DateTime<Utc>,
}

/// A run reported finished by the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCompletion {
    pub cronjob: String,
    pub run_id: RunId,
    pub state: RunState,
}

/// JobExecutor trait for the external Job creation/termination system
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Start a Job
    async fn create_job(&self, intent: &JobIntent) -> Result<(), ExecutorError>;

    /// Force-terminate a running Job
    async fn terminate_job(&self, cronjob: &str, run_id: &RunId) -> Result<(), ExecutorError>;
}

/// Executor that only logs intents and reports every created run as
/// succeeded. Used when no Job runtime is attached.
pub struct DryRunExecutor {
    completions: mpsc::UnboundedSender<RunCompletion>,
}

impl DryRunExecutor {
    pub fn new(completions: mpsc::UnboundedSender<RunCompletion>) -> Self {
        Self { completions }
    }
}

#[async_trait]
impl JobExecutor for DryRunExecutor {
    #[instrument(skip(self, intent), fields(cronjob = %intent.cronjob, run_id = %intent.run_id))]
    async fn create_job(&self, intent: &JobIntent) -> Result<(), ExecutorError> {
        info!(
            execution_id = %intent.execution_id,
            scheduled_time = %intent.scheduled_time,
            "Dry run: job created"
        );
        self.completions
            .send(RunCompletion {
                cronjob: intent.cronjob.clone(),
                run_id: intent.run_id.clone(),
                state: RunState::Succeeded,
            })
            .map_err(|e| ExecutorError::Unavailable(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn terminate_job(&self, cronjob: &str, run_id: &RunId) -> Result<(), ExecutorError> {
        info!("Dry run: job terminated");
        Ok(())
    }
}
