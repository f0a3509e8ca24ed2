// Common library shared by the scheduler and API binaries: the CronJob
// trigger engine, the authorization evaluator and their ambient plumbing

pub mod config;
pub mod errors;
pub mod loader;
pub mod models;
pub mod rbac;
pub mod schedule;
pub mod scheduler;
pub mod telemetry;
