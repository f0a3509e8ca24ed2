// Run history of a single CronJob

use crate::models::{RunId, RunRecord, RunState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Append-only run history; insertion order is chronological
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunHistory {
    records: Vec<RunRecord>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<RunRecord>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: RunRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ids of every run still running
    pub fn running_ids(&self) -> BTreeSet<RunId> {
        self.records
            .iter()
            .filter(|r| r.is_running())
            .map(|r| r.id.clone())
            .collect()
    }

    /// Record the outcome of a run. Returns false for unknown or already
    /// finished runs.
    pub fn finish(&mut self, id: &RunId, state: RunState) -> bool {
        match self
            .records
            .iter_mut()
            .find(|r| &r.id == id && r.is_running())
        {
            Some(record) => {
                record.state = state;
                true
            }
            None => false,
        }
    }

    /// Drop the oldest finished runs beyond each retention limit.
    /// Running records are never trimmed.
    pub fn trim(&mut self, successful_limit: usize, failed_limit: usize) -> usize {
        let mut successful_seen = 0;
        let mut failed_seen = 0;
        let mut keep = vec![true; self.records.len()];

        for (index, record) in self.records.iter().enumerate().rev() {
            match record.state {
                RunState::Running => {}
                RunState::Succeeded => {
                    successful_seen += 1;
                    keep[index] = successful_seen <= successful_limit;
                }
                RunState::Failed => {
                    failed_seen += 1;
                    keep[index] = failed_seen <= failed_limit;
                }
            }
        }

        let before = self.records.len();
        let mut flags = keep.into_iter();
        self.records.retain(|_| flags.next().unwrap_or(true));
        before - self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn history_with(states: &[RunState]) -> RunHistory {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut history = RunHistory::new();
        for (i, state) in states.iter().enumerate() {
            let t = base + Duration::minutes(i as i64);
            let mut record = RunRecord::started("job", t, t);
            record.state = *state;
            history.push(record);
        }
        history
    }

    #[test]
    fn test_running_ids() {
        let history = history_with(&[RunState::Succeeded, RunState::Running, RunState::Running]);
        assert_eq!(history.running_ids().len(), 2);
    }

    #[test]
    fn test_finish_marks_run_once() {
        let mut history = history_with(&[RunState::Running]);
        let id = history.records()[0].id.clone();
        assert!(history.finish(&id, RunState::Failed));
        assert!(!history.finish(&id, RunState::Succeeded));
        assert_eq!(history.records()[0].state, RunState::Failed);
    }

    #[test]
    fn test_trim_keeps_newest_within_limits() {
        use RunState::*;
        let mut history = history_with(&[
            Succeeded, Failed, Succeeded, Running, Failed, Succeeded, Succeeded,
        ]);
        let removed = history.trim(2, 1);
        assert_eq!(removed, 3);
        let states: Vec<RunState> = history.records().iter().map(|r| r.state).collect();
        assert_eq!(states, vec![Running, Failed, Succeeded, Succeeded]);
    }

    #[test]
    fn test_trim_never_drops_running() {
        let mut history = history_with(&[RunState::Running, RunState::Running]);
        assert_eq!(history.trim(0, 0), 0);
        assert_eq!(history.len(), 2);
    }
}
