// Error handling framework for the trigger engine, the policy evaluator and
// the manifest loader. Every error is scoped to the entity that caused it.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Schedule-related errors, raised when a CronJob is loaded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Invalid time zone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),
}

/// Policy errors, raised while building a policy snapshot.
/// Each one rejects a single role or binding, never the whole snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Cluster binding '{binding}' cannot reference namespaced role '{role}'")]
    InvalidBindingScope { binding: String, role: String },

    #[error("Duplicate role '{name}' in scope {scope}")]
    DuplicateRole { name: String, scope: String },
}

/// Manifest loading errors
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read manifest {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to deserialize manifest {path}: {reason}")]
    Deserialize { path: String, reason: String },
}

/// Job executor errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Failed to create job {0}: {1}")]
    CreateFailed(String, String),

    #[error("Failed to terminate job {0}: {1}")]
    TerminateFailed(String, String),

    #[error("Executor unavailable: {0}")]
    Unavailable(String),
}

/// A scheduled instant that was not started because its starting deadline
/// had already passed. Non-fatal: the instant is recorded and skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissedSchedule {
    pub cronjob: String,
    pub scheduled_time: DateTime<Utc>,
    pub evaluated_at: DateTime<Utc>,
    pub deadline_seconds: i64,
}

impl std::fmt::Display for MissedSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Missed schedule for {} at {}: {}s late, deadline {}s",
            self.cronjob,
            self.scheduled_time.to_rfc3339(),
            (self.evaluated_at - self.scheduled_time).num_seconds(),
            self.deadline_seconds
        )
    }
}

/// Non-fatal findings from policy snapshot construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyWarning {
    /// A binding points at a role that does not exist; it grants nothing
    DanglingReference { binding: String, role: String },
}

impl std::fmt::Display for PolicyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyWarning::DanglingReference { binding, role } => {
                write!(f, "Binding '{}' references missing role '{}'", binding, role)
            }
        }
    }
}

/// API response error type for HTTP responses
#[derive(Debug, serde::Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        ApiError::new("SCHEDULE_ERROR", err.to_string())
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        ApiError::new("POLICY_ERROR", err.to_string())
    }
}

impl From<LoadError> for ApiError {
    fn from(err: LoadError) -> Self {
        ApiError::new("LOAD_ERROR", err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::new("VALIDATION_ERROR", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidSchedule {
            expression: "* * * *".to_string(),
            reason: "expected 5 fields".to_string(),
        };
        assert!(err.to_string().contains("Invalid schedule"));
        assert!(err.to_string().contains("expected 5 fields"));
    }

    #[test]
    fn test_policy_error_display() {
        let err = PolicyError::InvalidBindingScope {
            binding: "admins".to_string(),
            role: "pod-reader".to_string(),
        };
        assert!(err.to_string().contains("admins"));
        assert!(err.to_string().contains("pod-reader"));
    }

    #[test]
    fn test_missed_schedule_display() {
        let scheduled = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let missed = MissedSchedule {
            cronjob: "backup".to_string(),
            scheduled_time: scheduled,
            evaluated_at: scheduled + chrono::Duration::seconds(120),
            deadline_seconds: 60,
        };
        assert!(missed.to_string().contains("120s late"));
    }

    #[test]
    fn test_policy_error_to_api_error() {
        let err = PolicyError::DuplicateRole {
            name: "view".to_string(),
            scope: "cluster".to_string(),
        };
        let api_err: ApiError = err.into();
        assert_eq!(api_err.code, "POLICY_ERROR");
    }

    #[test]
    fn test_api_error_with_details() {
        let err = ApiError::new("TEST_ERROR", "Test message")
            .with_details(serde_json::json!({"field": "value"}));
        assert!(err.details.is_some());
    }
}
