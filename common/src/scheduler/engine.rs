// Trigger engine: decides, per CronJob and per tick, whether a Job is created
// and what happens to runs that are still active.
//
// Evaluation is a pure function of the CronJob, the current time, the
// last-processed watermark and the run history. It performs no I/O.

use crate::errors::{MissedSchedule, ScheduleError};
use crate::models::{ConcurrencyPolicy, CronJob, CronJobState, RunId, RunRecord, TriggerDecision};
use crate::schedule::Schedule;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

/// Configuration for the trigger engine
#[derive(Debug, Clone)]
pub struct TriggerEngineConfig {
    /// Instants enumerated per window before the window counts as
    /// "too many missed start times"
    pub max_tracked_instants: usize,
}

impl Default for TriggerEngineConfig {
    fn default() -> Self {
        Self {
            max_tracked_instants: 100,
        }
    }
}

/// A CronJob whose schedule and time zone have been validated at load time
#[derive(Debug, Clone)]
pub struct ScheduledCronJob {
    pub job: CronJob,
    pub schedule: Schedule,
}

impl ScheduledCronJob {
    /// Validate the CronJob; errors are fatal to this CronJob only
    pub fn new(job: CronJob) -> Result<Self, ScheduleError> {
        if job.name.is_empty() {
            return Err(ScheduleError::InvalidConfiguration(
                "CronJob name cannot be empty".to_string(),
            ));
        }
        if let Some(deadline) = job.spec.starting_deadline_seconds {
            if deadline < 0 {
                return Err(ScheduleError::InvalidConfiguration(format!(
                    "starting_deadline_seconds must not be negative, got {}",
                    deadline
                )));
            }
            if Duration::try_seconds(deadline).is_none() {
                return Err(ScheduleError::InvalidConfiguration(format!(
                    "starting_deadline_seconds is too large, got {}",
                    deadline
                )));
            }
        }
        let schedule = Schedule::new(&job.spec.schedule, job.spec.time_zone.as_deref())?;
        Ok(Self { job, schedule })
    }

    pub fn key(&self) -> String {
        self.job.key()
    }
}

/// Why an evaluation produced no Job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Suspended,
    NothingDue,
    DeadlineExceeded,
    AlreadyScheduled,
    ConcurrencyForbidden,
}

/// Result of one trigger evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: TriggerDecision,
    /// State after the decision is applied
    pub state: CronJobState,
    /// Watermark to persist for the next tick
    pub watermark: DateTime<Utc>,
    pub skip: Option<SkipReason>,
    pub missed: Option<MissedSchedule>,
    /// Earlier instants of the window that were dropped
    pub dropped_instants: usize,
    /// First instant after `now`, for requeueing
    pub next_fire: Option<DateTime<Utc>>,
}

/// Stateless trigger engine
#[derive(Debug, Clone, Default)]
pub struct TriggerEngine {
    config: TriggerEngineConfig,
}

impl TriggerEngine {
    pub fn new(config: TriggerEngineConfig) -> Self {
        Self { config }
    }

    /// Evaluate one CronJob over the window `(watermark, now]`.
    ///
    /// Only the latest instant of the window may fire. Re-invoking with an
    /// overlapping window never fires the same instant twice because the run
    /// history already holds a record for it.
    #[instrument(skip(self, cronjob, runs), fields(cronjob = %cronjob.key()))]
    pub fn evaluate(
        &self,
        cronjob: &ScheduledCronJob,
        now: DateTime<Utc>,
        watermark: DateTime<Utc>,
        runs: &[RunRecord],
    ) -> Evaluation {
        let spec = &cronjob.job.spec;
        let running: BTreeSet<RunId> = runs
            .iter()
            .filter(|r| r.is_running())
            .map(|r| r.id.clone())
            .collect();
        let next_watermark = watermark.max(now);
        let next_fire = cronjob.schedule.next_after(now);

        let no_action = |skip: SkipReason, running: BTreeSet<RunId>| Evaluation {
            decision: TriggerDecision::NoAction,
            state: state_of(running),
            watermark: next_watermark,
            skip: Some(skip),
            missed: None,
            dropped_instants: 0,
            next_fire,
        };

        if spec.suspend {
            debug!("CronJob is suspended, no instants evaluated");
            let mut evaluation = no_action(SkipReason::Suspended, running);
            evaluation.state = CronJobState::Suspended;
            return evaluation;
        }

        let instants =
            cronjob
                .schedule
                .instants_between(watermark, now, self.config.max_tracked_instants + 1);

        let latest = match instants.last() {
            Some(latest) => *latest,
            None => {
                debug!("No scheduled instant in window");
                return no_action(SkipReason::NothingDue, running);
            }
        };

        let dropped_instants = instants.len() - 1;
        if instants.len() > self.config.max_tracked_instants {
            warn!(
                latest = %latest,
                "Too many missed start times; set or decrease starting_deadline_seconds or check clock skew"
            );
        }
        if dropped_instants > 0 {
            debug!(dropped_instants, latest = %latest, "Dropping earlier missed instants");
        }

        if let Some(deadline_seconds) = spec.starting_deadline_seconds {
            // A deadline beyond the representable range can never be exceeded
            let exceeded = Duration::try_seconds(deadline_seconds)
                .map_or(false, |deadline| now - latest > deadline);
            if exceeded {
                let missed = MissedSchedule {
                    cronjob: cronjob.key(),
                    scheduled_time: latest,
                    evaluated_at: now,
                    deadline_seconds,
                };
                warn!(%missed, "Missed starting deadline, skipping instant");
                let mut evaluation = no_action(SkipReason::DeadlineExceeded, running);
                evaluation.missed = Some(missed);
                evaluation.dropped_instants = dropped_instants;
                return evaluation;
            }
        }

        if runs.iter().any(|r| r.scheduled_time == latest) {
            debug!(scheduled_time = %latest, "Instant already has a run, not firing again");
            let mut evaluation = no_action(SkipReason::AlreadyScheduled, running);
            evaluation.dropped_instants = dropped_instants;
            return evaluation;
        }

        let new_run = RunId::for_schedule(&cronjob.job.name, latest);
        let (decision, state) = if running.is_empty() {
            let mut after = running;
            after.insert(new_run);
            (TriggerDecision::CreateJob { scheduled_time: latest }, state_of(after))
        } else {
            match spec.concurrency_policy {
                ConcurrencyPolicy::Allow => {
                    let mut after = running;
                    after.insert(new_run);
                    (TriggerDecision::CreateJob { scheduled_time: latest }, state_of(after))
                }
                ConcurrencyPolicy::Forbid => {
                    info!(
                        active_runs = running.len(),
                        scheduled_time = %latest,
                        "Concurrency policy forbids a new run while one is active, skipping"
                    );
                    let mut evaluation = no_action(SkipReason::ConcurrencyForbidden, running);
                    evaluation.dropped_instants = dropped_instants;
                    return evaluation;
                }
                ConcurrencyPolicy::Replace => {
                    let prior_run_ids: Vec<RunId> = running.into_iter().collect();
                    let mut after = BTreeSet::new();
                    after.insert(new_run);
                    (
                        TriggerDecision::CreateJobAndTerminate {
                            scheduled_time: latest,
                            prior_run_ids,
                        },
                        state_of(after),
                    )
                }
            }
        };

        info!(
            decision = decision.kind(),
            scheduled_time = %latest,
            policy = %spec.concurrency_policy,
            "Schedule fired"
        );

        Evaluation {
            decision,
            state,
            watermark: next_watermark,
            skip: None,
            missed: None,
            dropped_instants,
            next_fire,
        }
    }
}

fn state_of(running: BTreeSet<RunId>) -> CronJobState {
    if running.is_empty() {
        CronJobState::Idle
    } else {
        CronJobState::Running(running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunState, ScheduleSpec};
    use chrono::TimeZone;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn cronjob(schedule: &str, policy: ConcurrencyPolicy) -> ScheduledCronJob {
        let mut spec = ScheduleSpec::new(schedule);
        spec.concurrency_policy = policy;
        ScheduledCronJob::new(CronJob {
            name: "report".to_string(),
            namespace: "default".to_string(),
            created_at: utc(0, 0),
            spec,
        })
        .unwrap()
    }

    fn running(at: DateTime<Utc>) -> RunRecord {
        RunRecord::started("report", at, at)
    }

    #[test]
    fn test_engine_config_default() {
        assert_eq!(TriggerEngineConfig::default().max_tracked_instants, 100);
    }

    #[test]
    fn test_negative_deadline_rejected() {
        let mut job = cronjob("0 * * * *", ConcurrencyPolicy::Allow).job;
        job.spec.starting_deadline_seconds = Some(-1);
        assert!(matches!(
            ScheduledCronJob::new(job),
            Err(ScheduleError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_oversized_deadline_rejected() {
        let mut job = cronjob("0 * * * *", ConcurrencyPolicy::Allow).job;
        job.spec.starting_deadline_seconds = Some(i64::MAX);
        assert!(matches!(
            ScheduledCronJob::new(job),
            Err(ScheduleError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_oversized_deadline_never_misses() {
        let engine = TriggerEngine::default();
        let mut job = cronjob("0 * * * *", ConcurrencyPolicy::Allow);
        job.job.spec.starting_deadline_seconds = Some(i64::MAX);
        let eval = engine.evaluate(&job, utc(13, 2), utc(10, 0), &[]);
        assert_eq!(eval.decision.scheduled_time(), Some(utc(13, 0)));
        assert!(eval.missed.is_none());
    }

    #[test]
    fn test_single_instant_creates_job() {
        let engine = TriggerEngine::default();
        let job = cronjob("0 * * * *", ConcurrencyPolicy::Allow);
        let eval = engine.evaluate(&job, utc(10, 0), utc(9, 30), &[]);
        assert_eq!(
            eval.decision,
            TriggerDecision::CreateJob {
                scheduled_time: utc(10, 0)
            }
        );
        assert_eq!(eval.watermark, utc(10, 0));
        assert_eq!(eval.next_fire, Some(utc(11, 0)));
        let expected: BTreeSet<RunId> = [RunId::for_schedule("report", utc(10, 0))].into();
        assert_eq!(eval.state, CronJobState::Running(expected));
    }

    #[test]
    fn test_nothing_due() {
        let engine = TriggerEngine::default();
        let job = cronjob("0 * * * *", ConcurrencyPolicy::Allow);
        let eval = engine.evaluate(&job, utc(10, 30), utc(10, 0), &[]);
        assert_eq!(eval.decision, TriggerDecision::NoAction);
        assert_eq!(eval.skip, Some(SkipReason::NothingDue));
        assert_eq!(eval.state, CronJobState::Idle);
        assert_eq!(eval.watermark, utc(10, 30));
    }

    #[test]
    fn test_only_latest_missed_instant_fires() {
        let engine = TriggerEngine::default();
        let job = cronjob("0 * * * *", ConcurrencyPolicy::Allow);
        let eval = engine.evaluate(&job, utc(13, 0), utc(10, 0), &[]);
        assert_eq!(eval.decision.scheduled_time(), Some(utc(13, 0)));
        assert_eq!(eval.dropped_instants, 2);
    }

    #[test]
    fn test_deadline_exceeded_is_missed() {
        let engine = TriggerEngine::default();
        let mut job = cronjob("0 * * * *", ConcurrencyPolicy::Allow);
        job.job.spec.starting_deadline_seconds = Some(60);
        let eval = engine.evaluate(&job, utc(13, 2), utc(10, 0), &[]);
        assert_eq!(eval.decision, TriggerDecision::NoAction);
        assert_eq!(eval.skip, Some(SkipReason::DeadlineExceeded));
        let missed = eval.missed.unwrap();
        assert_eq!(missed.scheduled_time, utc(13, 0));
        assert_eq!(missed.deadline_seconds, 60);
    }

    #[test]
    fn test_deadline_boundary_is_inclusive() {
        let engine = TriggerEngine::default();
        let mut job = cronjob("0 * * * *", ConcurrencyPolicy::Allow);
        job.job.spec.starting_deadline_seconds = Some(60);
        let eval = engine.evaluate(&job, utc(13, 1), utc(12, 30), &[]);
        assert_eq!(eval.decision.scheduled_time(), Some(utc(13, 0)));
    }

    #[test]
    fn test_suspended_never_fires_and_advances_watermark() {
        let engine = TriggerEngine::default();
        let mut job = cronjob("* * * * *", ConcurrencyPolicy::Allow);
        job.job.spec.suspend = true;
        let eval = engine.evaluate(&job, utc(12, 0), utc(10, 0), &[]);
        assert_eq!(eval.decision, TriggerDecision::NoAction);
        assert_eq!(eval.state, CronJobState::Suspended);
        assert_eq!(eval.watermark, utc(12, 0));
    }

    #[test]
    fn test_allow_runs_concurrently() {
        let engine = TriggerEngine::default();
        let job = cronjob("0 * * * *", ConcurrencyPolicy::Allow);
        let runs = vec![running(utc(9, 0))];
        let eval = engine.evaluate(&job, utc(10, 0), utc(9, 0), &runs);
        assert!(matches!(eval.decision, TriggerDecision::CreateJob { .. }));
        match eval.state {
            CronJobState::Running(ids) => assert_eq!(ids.len(), 2),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_forbid_skips_while_running() {
        let engine = TriggerEngine::default();
        let job = cronjob("0 * * * *", ConcurrencyPolicy::Forbid);
        let runs = vec![running(utc(9, 0))];
        let eval = engine.evaluate(&job, utc(10, 0), utc(9, 0), &runs);
        assert_eq!(eval.decision, TriggerDecision::NoAction);
        assert_eq!(eval.skip, Some(SkipReason::ConcurrencyForbidden));
        // The skipped instant is not retried on the next tick
        assert_eq!(eval.watermark, utc(10, 0));
    }

    #[test]
    fn test_forbid_fires_once_previous_run_finished() {
        let engine = TriggerEngine::default();
        let job = cronjob("0 * * * *", ConcurrencyPolicy::Forbid);
        let mut done = running(utc(9, 0));
        done.state = RunState::Succeeded;
        let eval = engine.evaluate(&job, utc(10, 0), utc(9, 0), &[done]);
        assert!(matches!(eval.decision, TriggerDecision::CreateJob { .. }));
    }

    #[test]
    fn test_replace_terminates_prior_run() {
        let engine = TriggerEngine::default();
        let job = cronjob("0 * * * *", ConcurrencyPolicy::Replace);
        let prior = running(utc(9, 0));
        let eval = engine.evaluate(&job, utc(10, 0), utc(9, 0), &[prior.clone()]);
        assert_eq!(
            eval.decision,
            TriggerDecision::CreateJobAndTerminate {
                scheduled_time: utc(10, 0),
                prior_run_ids: vec![prior.id],
            }
        );
        match eval.state {
            CronJobState::Running(ids) => {
                assert_eq!(ids.len(), 1);
                assert!(ids.contains(&RunId::for_schedule("report", utc(10, 0))));
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_reinvocation_does_not_double_fire() {
        let engine = TriggerEngine::default();
        let job = cronjob("0 * * * *", ConcurrencyPolicy::Allow);
        let first = engine.evaluate(&job, utc(10, 0), utc(9, 30), &[]);
        let scheduled = first.decision.scheduled_time().unwrap();
        let runs = vec![running(scheduled)];
        // Same window again, as if the watermark had not been persisted
        let second = engine.evaluate(&job, utc(10, 0), utc(9, 30), &runs);
        assert_eq!(second.decision, TriggerDecision::NoAction);
        assert_eq!(second.skip, Some(SkipReason::AlreadyScheduled));
    }

    #[test]
    fn test_clock_moving_backwards_keeps_watermark() {
        let engine = TriggerEngine::default();
        let job = cronjob("0 * * * *", ConcurrencyPolicy::Allow);
        let eval = engine.evaluate(&job, utc(9, 0), utc(10, 0), &[]);
        assert_eq!(eval.decision, TriggerDecision::NoAction);
        assert_eq!(eval.watermark, utc(10, 0));
    }
}
