// Property-based tests for the CronJob trigger engine
// Feature: cronjob-controller

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::models::{
    ConcurrencyPolicy, CronJob, CronJobState, RunRecord, ScheduleSpec, TriggerDecision,
};
use common::scheduler::{ScheduledCronJob, SkipReason, TriggerEngine};
use proptest::prelude::*;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn schedules() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "* * * * *",
        "*/15 * * * *",
        "30 2 * * *",
        "0 9-17 * * 1-5",
        "0 0 1,15 * *",
        "0 12 * * 0",
        "@hourly",
    ])
}

fn time_zones() -> impl Strategy<Value = Option<&'static str>> {
    prop::sample::select(vec![
        None,
        Some("America/New_York"),
        Some("Asia/Ho_Chi_Minh"),
        Some("Europe/Berlin"),
    ])
}

/// (watermark, now) with now at or after the watermark
fn windows() -> impl Strategy<Value = (DateTime<Utc>, DateTime<Utc>)> {
    (0i64..60 * 24 * 40, 0i64..60 * 24 * 5).prop_map(|(start, length)| {
        let watermark = base_time() + Duration::minutes(start);
        (watermark, watermark + Duration::minutes(length))
    })
}

fn cronjob(
    schedule: &str,
    time_zone: Option<&str>,
    policy: ConcurrencyPolicy,
    deadline: Option<i64>,
) -> ScheduledCronJob {
    let mut spec = ScheduleSpec::new(schedule);
    spec.time_zone = time_zone.map(str::to_string);
    spec.concurrency_policy = policy;
    spec.starting_deadline_seconds = deadline;
    ScheduledCronJob::new(CronJob {
        name: "job".to_string(),
        namespace: "default".to_string(),
        created_at: base_time(),
        spec,
    })
    .unwrap()
}

proptest! {
    /// **Feature: cronjob-controller, Property 1: Only the latest instant of a window fires**
    ///
    /// *For any* schedule and window without a deadline, the engine creates
    /// exactly one Job at the latest instant in (watermark, now], or none
    /// when the window holds no instant.
    #[test]
    fn property_latest_instant_fires(
        schedule in schedules(),
        time_zone in time_zones(),
        (watermark, now) in windows(),
    ) {
        let job = cronjob(schedule, time_zone, ConcurrencyPolicy::Allow, None);
        let evaluation = TriggerEngine::default().evaluate(&job, now, watermark, &[]);

        match job.schedule.latest_between(watermark, now) {
            Some(latest) => {
                prop_assert_eq!(
                    evaluation.decision,
                    TriggerDecision::CreateJob { scheduled_time: latest }
                );
                let in_window = job.schedule.instants_between(watermark, now, 101).len();
                prop_assert_eq!(evaluation.dropped_instants, in_window - 1);
            }
            None => {
                prop_assert_eq!(evaluation.decision, TriggerDecision::NoAction);
                prop_assert_eq!(evaluation.skip, Some(SkipReason::NothingDue));
            }
        }
    }

    /// **Feature: cronjob-controller, Property 2: The watermark never moves backwards**
    #[test]
    fn property_watermark_monotonic(
        schedule in schedules(),
        (watermark, now) in windows(),
        clock_skew in 0i64..600,
    ) {
        let job = cronjob(schedule, None, ConcurrencyPolicy::Allow, None);
        let engine = TriggerEngine::default();

        let evaluation = engine.evaluate(&job, now, watermark, &[]);
        prop_assert!(evaluation.watermark >= watermark);
        prop_assert!(evaluation.watermark >= now);

        // A clock that moved backwards keeps the previous watermark
        let behind = watermark - Duration::minutes(clock_skew);
        let evaluation = engine.evaluate(&job, behind, watermark, &[]);
        prop_assert_eq!(evaluation.watermark, watermark);
        prop_assert_eq!(evaluation.decision, TriggerDecision::NoAction);
    }

    /// **Feature: cronjob-controller, Property 3: Re-evaluating a fired window is idempotent**
    #[test]
    fn property_reevaluation_does_not_double_fire(
        schedule in schedules(),
        time_zone in time_zones(),
        (watermark, now) in windows(),
    ) {
        let job = cronjob(schedule, time_zone, ConcurrencyPolicy::Allow, None);
        let engine = TriggerEngine::default();
        let first = engine.evaluate(&job, now, watermark, &[]);

        if let Some(scheduled_time) = first.decision.scheduled_time() {
            let runs = vec![RunRecord::started("job", scheduled_time, now)];
            let second = engine.evaluate(&job, now, watermark, &runs);
            prop_assert_eq!(second.decision, TriggerDecision::NoAction);
            prop_assert_eq!(second.skip, Some(SkipReason::AlreadyScheduled));

            let advanced = engine.evaluate(&job, now, first.watermark, &runs);
            prop_assert!(!advanced.decision.creates_job());
        }
    }

    /// **Feature: cronjob-controller, Property 4: Missed deadlines skip the instant**
    ///
    /// *For any* deadline, an instant that is later than the deadline yields
    /// NoAction with a missed-schedule record; otherwise it fires.
    #[test]
    fn property_deadline_enforced(
        schedule in schedules(),
        (watermark, now) in windows(),
        deadline in 0i64..7200,
    ) {
        let job = cronjob(schedule, None, ConcurrencyPolicy::Allow, Some(deadline));
        let evaluation = TriggerEngine::default().evaluate(&job, now, watermark, &[]);

        if let Some(latest) = job.schedule.latest_between(watermark, now) {
            if now - latest > Duration::seconds(deadline) {
                prop_assert_eq!(evaluation.decision, TriggerDecision::NoAction);
                prop_assert_eq!(evaluation.skip, Some(SkipReason::DeadlineExceeded));
                let missed = evaluation.missed.unwrap();
                prop_assert_eq!(missed.scheduled_time, latest);
                prop_assert_eq!(missed.deadline_seconds, deadline);
            } else {
                prop_assert_eq!(evaluation.decision.scheduled_time(), Some(latest));
                prop_assert!(evaluation.missed.is_none());
            }
        }
    }

    /// **Feature: cronjob-controller, Property 5: Forbid never creates while a run is active**
    #[test]
    fn property_forbid_blocks_while_running(
        schedule in schedules(),
        (watermark, now) in windows(),
        active in 1usize..4,
    ) {
        let job = cronjob(schedule, None, ConcurrencyPolicy::Forbid, None);
        let runs: Vec<RunRecord> = (0..active)
            .map(|i| {
                let t = watermark - Duration::hours(i as i64 + 1);
                RunRecord::started("job", t, t)
            })
            .collect();
        let evaluation = TriggerEngine::default().evaluate(&job, now, watermark, &runs);

        prop_assert!(!evaluation.decision.creates_job());
        prop_assert!(matches!(evaluation.state, CronJobState::Running(ref ids) if ids.len() == active));
    }

    /// **Feature: cronjob-controller, Property 6: Replace terminates every active run**
    #[test]
    fn property_replace_terminates_all_active(
        schedule in schedules(),
        (watermark, now) in windows(),
        active in 1usize..4,
    ) {
        let job = cronjob(schedule, None, ConcurrencyPolicy::Replace, None);
        let runs: Vec<RunRecord> = (0..active)
            .map(|i| {
                let t = watermark - Duration::hours(i as i64 + 1);
                RunRecord::started("job", t, t)
            })
            .collect();
        let evaluation = TriggerEngine::default().evaluate(&job, now, watermark, &runs);

        match evaluation.decision {
            TriggerDecision::CreateJobAndTerminate { prior_run_ids, .. } => {
                prop_assert_eq!(prior_run_ids.len(), active);
                for run in &runs {
                    prop_assert!(prior_run_ids.contains(&run.id));
                }
                prop_assert!(matches!(evaluation.state, CronJobState::Running(ref ids) if ids.len() == 1));
            }
            TriggerDecision::NoAction => {
                prop_assert!(job.schedule.latest_between(watermark, now).is_none());
            }
            TriggerDecision::CreateJob { .. } => {
                prop_assert!(false, "Replace with active runs must terminate them");
            }
        }
    }

    /// **Feature: cronjob-controller, Property 7: Suspended CronJobs never fire**
    #[test]
    fn property_suspended_never_fires(
        schedule in schedules(),
        (watermark, now) in windows(),
    ) {
        let mut job = cronjob(schedule, None, ConcurrencyPolicy::Allow, None);
        job.job.spec.suspend = true;
        let evaluation = TriggerEngine::default().evaluate(&job, now, watermark, &[]);
        prop_assert_eq!(evaluation.decision, TriggerDecision::NoAction);
        prop_assert_eq!(evaluation.state, CronJobState::Suspended);
    }

    /// **Feature: cronjob-controller, Property 8: next_after agrees with window enumeration**
    #[test]
    fn property_next_after_is_first_instant(
        schedule in schedules(),
        time_zone in time_zones(),
        (after, _) in windows(),
    ) {
        let job = cronjob(schedule, time_zone, ConcurrencyPolicy::Allow, None);
        let next = job.schedule.next_after(after).unwrap();
        prop_assert!(next > after);
        prop_assert_eq!(job.schedule.instants_between(after, next, 1000).first().copied(), Some(next));
    }
}
