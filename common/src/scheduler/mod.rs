// CronJob trigger engine and the control loop that drives it

pub mod controller;
pub mod engine;
pub mod executor;
pub mod history;

pub use controller::{ControllerConfig, CronController, RunStore, Scheduler};
pub use engine::{Evaluation, ScheduledCronJob, SkipReason, TriggerEngine, TriggerEngineConfig};
pub use executor::{DryRunExecutor, JobExecutor, JobIntent, RunCompletion};
pub use history::RunHistory;
