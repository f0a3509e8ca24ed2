// Manifest loading: CronJob definitions and policy snapshots are read from
// files whose format (TOML, YAML, JSON) follows the file extension

use crate::errors::{LoadError, ScheduleError};
use crate::models::{Binding, CronJob, Role};
use crate::rbac::{BuildReport, PolicySnapshot};
use crate::scheduler::ScheduledCronJob;
use config::{Config, File};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Deserialize)]
struct CronJobManifest {
    #[serde(default)]
    cronjobs: Vec<CronJob>,
}

#[derive(Debug, Deserialize)]
struct PolicyManifest {
    #[serde(default)]
    roles: Vec<Role>,
    #[serde(default)]
    bindings: Vec<Binding>,
}

/// CronJobs that passed validation plus the ones that were rejected
#[derive(Debug, Default)]
pub struct LoadedCronJobs {
    pub cronjobs: Vec<ScheduledCronJob>,
    /// (`namespace/name`, reason) for each rejected CronJob
    pub rejected: Vec<(String, ScheduleError)>,
}

fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let display = path.display().to_string();
    let config = Config::builder()
        .add_source(File::from(path))
        .build()
        .map_err(|e| LoadError::Read {
            path: display.clone(),
            reason: e.to_string(),
        })?;
    config.try_deserialize().map_err(|e| LoadError::Deserialize {
        path: display,
        reason: e.to_string(),
    })
}

/// Validate CronJobs one by one; an invalid one is logged and skipped
pub fn validate_cronjobs(cronjobs: Vec<CronJob>) -> LoadedCronJobs {
    let mut loaded = LoadedCronJobs::default();
    for job in cronjobs {
        let key = job.key();
        match ScheduledCronJob::new(job) {
            Ok(scheduled) => loaded.cronjobs.push(scheduled),
            Err(e) => {
                error!(cronjob = %key, error = %e, "Rejecting invalid CronJob");
                loaded.rejected.push((key, e));
            }
        }
    }
    loaded
}

/// Load and validate the CronJob manifest at `path`
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_cronjobs<P: AsRef<Path>>(path: P) -> Result<LoadedCronJobs, LoadError> {
    let manifest: CronJobManifest = read_manifest(path.as_ref())?;
    let loaded = validate_cronjobs(manifest.cronjobs);
    info!(
        cronjobs = loaded.cronjobs.len(),
        rejected = loaded.rejected.len(),
        "CronJob manifest loaded"
    );
    Ok(loaded)
}

/// Load roles and bindings at `path` into a policy snapshot
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_policy<P: AsRef<Path>>(path: P) -> Result<(PolicySnapshot, BuildReport), LoadError> {
    let manifest: PolicyManifest = read_manifest(path.as_ref())?;
    let (snapshot, report) = PolicySnapshot::build(manifest.roles, manifest.bindings);

    for warning in &report.warnings {
        warn!(%warning, "Policy warning");
    }
    for rejected in &report.rejected {
        error!(error = %rejected, "Policy entry rejected");
    }
    info!(
        roles = snapshot.role_count(),
        bindings = snapshot.binding_count(),
        warnings = report.warnings.len(),
        rejected = report.rejected.len(),
        "Policy snapshot loaded"
    );
    Ok((snapshot, report))
}
