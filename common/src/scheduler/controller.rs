// CronJob control loop: ticks the trigger engine on a bounded poll interval
// and applies its decisions through a job executor.

use crate::models::{RunId, RunRecord, RunState, TriggerDecision};
use crate::scheduler::engine::{ScheduledCronJob, TriggerEngine};
use crate::scheduler::executor::{JobExecutor, JobIntent, RunCompletion};
use crate::scheduler::history::RunHistory;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How often to evaluate every CronJob (in seconds)
    pub poll_interval_seconds: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
        }
    }
}

/// Scheduler trait for the control loop
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Start the polling loop; returns after `stop`
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Stop the polling loop
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Evaluate every CronJob once at the current time
    async fn process_due_cronjobs(&self) -> Result<usize, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Default)]
struct CronJobRuns {
    watermark: Option<DateTime<Utc>>,
    history: RunHistory,
}

/// In-memory watermark and run history per CronJob.
/// The controller is the single writer.
#[derive(Debug, Default)]
pub struct RunStore {
    inner: Mutex<HashMap<String, CronJobRuns>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted watermark (or `initial` when nothing was processed yet)
    /// together with a copy of the run history
    pub async fn view(&self, key: &str, initial: DateTime<Utc>) -> (DateTime<Utc>, Vec<RunRecord>) {
        let inner = self.inner.lock().await;
        match inner.get(key) {
            Some(runs) => (
                runs.watermark.unwrap_or(initial),
                runs.history.records().to_vec(),
            ),
            None => (initial, Vec::new()),
        }
    }

    pub async fn watermark(&self, key: &str) -> Option<DateTime<Utc>> {
        self.inner.lock().await.get(key).and_then(|r| r.watermark)
    }

    pub async fn history(&self, key: &str) -> RunHistory {
        self.inner
            .lock()
            .await
            .get(key)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    pub async fn record_run(&self, key: &str, record: RunRecord) {
        self.inner
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .history
            .push(record);
    }

    pub async fn finish_run(&self, key: &str, run_id: &RunId, state: RunState) -> bool {
        match self.inner.lock().await.get_mut(key) {
            Some(runs) => runs.history.finish(run_id, state),
            None => false,
        }
    }

    pub async fn commit_watermark(&self, key: &str, watermark: DateTime<Utc>) {
        self.inner
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .watermark = Some(watermark);
    }

    /// Apply retention limits; returns (records removed, runs still running)
    pub async fn trim(&self, key: &str, successful_limit: usize, failed_limit: usize) -> (usize, usize) {
        match self.inner.lock().await.get_mut(key) {
            Some(runs) => (
                runs.history.trim(successful_limit, failed_limit),
                runs.history.running_ids().len(),
            ),
            None => (0, 0),
        }
    }
}

/// CronJob controller
pub struct CronController {
    config: ControllerConfig,
    engine: TriggerEngine,
    cronjobs: Arc<Vec<ScheduledCronJob>>,
    store: Arc<RunStore>,
    executor: Arc<dyn JobExecutor>,
    completions: Mutex<mpsc::UnboundedReceiver<RunCompletion>>,
    shutdown_tx: watch::Sender<bool>,
}

impl CronController {
    /// Create a new controller over an immutable CronJob snapshot
    pub fn new(
        config: ControllerConfig,
        engine: TriggerEngine,
        cronjobs: Vec<ScheduledCronJob>,
        executor: Arc<dyn JobExecutor>,
        completions: mpsc::UnboundedReceiver<RunCompletion>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        Self {
            config,
            engine,
            cronjobs: Arc::new(cronjobs),
            store: Arc::new(RunStore::new()),
            executor,
            completions: Mutex::new(completions),
            shutdown_tx,
        }
    }

    pub fn store(&self) -> Arc<RunStore> {
        self.store.clone()
    }

    /// Get a shutdown signal receiver; a stop requested before the
    /// receiver was created is still observed
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Evaluate every CronJob at `now` and apply the decisions.
    /// Returns the number of Jobs created.
    #[instrument(skip(self))]
    pub async fn process_due_cronjobs_at(&self, now: DateTime<Utc>) -> usize {
        let mut created = 0;
        for cronjob in self.cronjobs.iter() {
            if self.process_cronjob(cronjob, now).await {
                created += 1;
            }
        }
        created
    }

    /// Returns true when a Job was created
    #[instrument(skip(self, cronjob), fields(cronjob = %cronjob.key()))]
    async fn process_cronjob(&self, cronjob: &ScheduledCronJob, now: DateTime<Utc>) -> bool {
        let key = cronjob.key();
        let (watermark, records) = self.store.view(&key, cronjob.job.created_at).await;
        let evaluation = self.engine.evaluate(cronjob, now, watermark, &records);
        telemetry::record_trigger_decision(&key, evaluation.decision.kind());
        if evaluation.missed.is_some() {
            telemetry::record_missed_schedule(&key);
        }
        if evaluation.dropped_instants > 0 {
            telemetry::record_dropped_instants(&key, evaluation.dropped_instants);
        }

        let created = match &evaluation.decision {
            TriggerDecision::NoAction => {
                debug!(skip = ?evaluation.skip, "No job created");
                false
            }
            TriggerDecision::CreateJob { scheduled_time } => {
                self.create_run(cronjob, *scheduled_time, now).await
            }
            TriggerDecision::CreateJobAndTerminate {
                scheduled_time,
                prior_run_ids,
            } => {
                let mut all_terminated = true;
                for run_id in prior_run_ids {
                    match self.executor.terminate_job(&key, run_id).await {
                        Ok(()) => {
                            self.store.finish_run(&key, run_id, RunState::Failed).await;
                            info!(run_id = %run_id, "Replaced run terminated");
                        }
                        Err(e) => {
                            warn!(run_id = %run_id, error = %e, "Failed to terminate replaced run");
                            all_terminated = false;
                        }
                    }
                }
                // Never start the replacement next to a run that is still alive
                if all_terminated {
                    self.create_run(cronjob, *scheduled_time, now).await
                } else {
                    warn!(scheduled_time = %scheduled_time, "Replacement deferred to next tick");
                    false
                }
            }
        };

        // A failed creation or replacement leaves the watermark in place so the
        // next tick retries the instant while it is still within its deadline
        if created || !evaluation.decision.creates_job() {
            self.store.commit_watermark(&key, evaluation.watermark).await;
        }

        let spec = &cronjob.job.spec;
        let (trimmed, active) = self
            .store
            .trim(
                &key,
                spec.successful_jobs_history_limit,
                spec.failed_jobs_history_limit,
            )
            .await;
        if trimmed > 0 {
            debug!(trimmed, "Trimmed finished runs from history");
        }
        telemetry::update_active_runs(&key, active);

        created
    }

    async fn create_run(
        &self,
        cronjob: &ScheduledCronJob,
        scheduled_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let key = cronjob.key();
        let record = RunRecord::started(&cronjob.job.name, scheduled_time, now);
        let intent = JobIntent {
            execution_id: Uuid::new_v4(),
            cronjob: key.clone(),
            run_id: record.id.clone(),
            scheduled_time,
        };

        // Completions are handled on the same loop after this tick returns,
        // so recording after a successful create cannot miss one
        match self.executor.create_job(&intent).await {
            Ok(()) => {
                info!(run_id = %intent.run_id, execution_id = %intent.execution_id, "Job created");
                self.store.record_run(&key, record).await;
                true
            }
            Err(e) => {
                error!(run_id = %intent.run_id, error = %e, "Failed to create job");
                false
            }
        }
    }

    /// Apply a completion reported by the executor
    #[instrument(skip(self), fields(cronjob = %completion.cronjob, run_id = %completion.run_id))]
    pub async fn handle_completion(&self, completion: RunCompletion) {
        if self
            .store
            .finish_run(&completion.cronjob, &completion.run_id, completion.state)
            .await
        {
            info!(state = ?completion.state, "Run finished");
        } else {
            debug!("Completion for unknown or already finished run ignored");
        }
    }

    /// Apply every completion already queued, without waiting for more.
    /// Returns how many were applied. While `start` is running it owns the
    /// completion channel, so this returns 0 immediately.
    pub async fn process_pending_completions(&self) -> usize {
        let Ok(mut completions) = self.completions.try_lock() else {
            debug!("Completion channel owned by the running loop");
            return 0;
        };
        let mut applied = 0;
        while let Ok(completion) = completions.try_recv() {
            self.handle_completion(completion).await;
            applied += 1;
        }
        applied
    }
}

#[async_trait]
impl Scheduler for CronController {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            cronjobs = self.cronjobs.len(),
            "Starting CronJob controller"
        );

        let mut poll_interval = interval(Duration::from_secs(self.config.poll_interval_seconds));
        let mut shutdown_rx = self.shutdown_receiver();
        let mut completions = self.completions.lock().await;

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.process_due_cronjobs().await {
                        Ok(count) if count > 0 => info!(jobs_created = count, "Processed due CronJobs"),
                        Ok(_) => debug!("No jobs created this tick"),
                        Err(e) => error!(error = %e, "Error processing CronJobs"),
                    }
                }
                Some(completion) = completions.recv() => {
                    self.handle_completion(completion).await;
                }
                _ = async { let _ = shutdown_rx.wait_for(|stopped| *stopped).await; } => {
                    info!("Shutdown signal received, stopping controller");
                    break;
                }
            }
        }

        info!("CronJob controller stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Stopping CronJob controller");
        self.shutdown_tx.send_replace(true);
        Ok(())
    }

    async fn process_due_cronjobs(&self) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.process_due_cronjobs_at(Utc::now()).await)
    }
}
