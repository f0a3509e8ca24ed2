use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// CronJob Models
// ============================================================================

fn default_namespace() -> String {
    "default".to_string()
}

fn default_successful_jobs_history_limit() -> usize {
    3
}

fn default_failed_jobs_history_limit() -> usize {
    1
}

/// ConcurrencyPolicy governs what happens when a schedule fires while a
/// previous run is still active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConcurrencyPolicy {
    #[default]
    Allow,
    Forbid,
    Replace,
}

impl fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyPolicy::Allow => write!(f, "Allow"),
            ConcurrencyPolicy::Forbid => write!(f, "Forbid"),
            ConcurrencyPolicy::Replace => write!(f, "Replace"),
        }
    }
}

/// ScheduleSpec is the timing part of a CronJob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Five-field cron expression or one of the `@` aliases
    pub schedule: String,
    /// IANA time zone the schedule is evaluated in; UTC when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    /// Maximum lateness, in seconds, at which a missed instant may still start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default = "default_successful_jobs_history_limit")]
    pub successful_jobs_history_limit: usize,
    #[serde(default = "default_failed_jobs_history_limit")]
    pub failed_jobs_history_limit: usize,
}

impl ScheduleSpec {
    /// Spec with defaults for everything except the cron expression
    pub fn new(schedule: impl Into<String>) -> Self {
        Self {
            schedule: schedule.into(),
            time_zone: None,
            starting_deadline_seconds: None,
            concurrency_policy: ConcurrencyPolicy::default(),
            suspend: false,
            successful_jobs_history_limit: default_successful_jobs_history_limit(),
            failed_jobs_history_limit: default_failed_jobs_history_limit(),
        }
    }
}

/// CronJob produces Jobs on a timed schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJob {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Initial watermark when no run has been processed yet
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub spec: ScheduleSpec,
}

impl CronJob {
    /// Namespaced key used for logging and for the run store
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

// ============================================================================
// Run Models
// ============================================================================

/// RunId names one triggered Job
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Deterministic Job name for a CronJob fire: the same scheduled instant
    /// always yields the same id.
    pub fn for_schedule(cronjob: &str, scheduled_time: DateTime<Utc>) -> Self {
        RunId(format!("{}-{}", cronjob, scheduled_time.timestamp() / 60))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// RunState is the completion state of a triggered Job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, RunState::Running)
    }
}

/// RunRecord is one entry of a CronJob's run history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub scheduled_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub state: RunState,
}

impl RunRecord {
    /// A freshly created run for a CronJob fire
    pub fn started(cronjob: &str, scheduled_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: RunId::for_schedule(cronjob, scheduled_time),
            scheduled_time,
            started_at: Some(now),
            state: RunState::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }
}

/// TriggerDecision is the output of one trigger evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TriggerDecision {
    NoAction,
    CreateJob {
        scheduled_time: DateTime<Utc>,
    },
    /// Start a new run and force-terminate the runs it replaces
    CreateJobAndTerminate {
        scheduled_time: DateTime<Utc>,
        prior_run_ids: Vec<RunId>,
    },
}

impl TriggerDecision {
    pub fn scheduled_time(&self) -> Option<DateTime<Utc>> {
        match self {
            TriggerDecision::NoAction => None,
            TriggerDecision::CreateJob { scheduled_time }
            | TriggerDecision::CreateJobAndTerminate { scheduled_time, .. } => {
                Some(*scheduled_time)
            }
        }
    }

    pub fn creates_job(&self) -> bool {
        !matches!(self, TriggerDecision::NoAction)
    }

    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerDecision::NoAction => "no_action",
            TriggerDecision::CreateJob { .. } => "create_job",
            TriggerDecision::CreateJobAndTerminate { .. } => "create_job_and_terminate",
        }
    }
}

/// CronJobState is the per-CronJob state machine position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "runs", rename_all = "snake_case")]
pub enum CronJobState {
    Idle,
    Running(BTreeSet<RunId>),
    Suspended,
}

// ============================================================================
// Authorization Models
// ============================================================================

/// Subject is an identity being authorized or named in a binding
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Subject {
    User {
        name: String,
    },
    Group {
        name: String,
    },
    /// Workload identity; in a namespaced binding an empty namespace means
    /// the binding's own namespace
    ServiceIdentity {
        #[serde(default)]
        namespace: String,
        name: String,
    },
}

impl Subject {
    pub fn user(name: impl Into<String>) -> Self {
        Subject::User { name: name.into() }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Subject::Group { name: name.into() }
    }

    pub fn service_identity(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Subject::ServiceIdentity {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::User { name } => write!(f, "user:{}", name),
            Subject::Group { name } => write!(f, "group:{}", name),
            Subject::ServiceIdentity { namespace, name } => {
                write!(f, "serviceidentity:{}:{}", namespace, name)
            }
        }
    }
}

fn default_api_groups() -> Vec<String> {
    vec![String::new()]
}

/// PolicyRule grants the cross product of its sets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyRule {
    Resource {
        /// Defaults to the core group ("")
        #[serde(default = "default_api_groups")]
        api_groups: Vec<String>,
        resources: Vec<String>,
        /// Empty means every name of the resource type
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        resource_names: Vec<String>,
        verbs: Vec<String>,
    },
    NonResource {
        non_resource_urls: Vec<String>,
        verbs: Vec<String>,
    },
}

impl PolicyRule {
    pub fn resource(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> Self {
        PolicyRule::Resource {
            api_groups: to_strings(api_groups),
            resources: to_strings(resources),
            resource_names: Vec::new(),
            verbs: to_strings(verbs),
        }
    }

    pub fn non_resource(urls: &[&str], verbs: &[&str]) -> Self {
        PolicyRule::NonResource {
            non_resource_urls: to_strings(urls),
            verbs: to_strings(verbs),
        }
    }

    /// Restrict a resource rule to specific object names
    pub fn with_resource_names(self, names: &[&str]) -> Self {
        match self {
            PolicyRule::Resource {
                api_groups,
                resources,
                verbs,
                ..
            } => PolicyRule::Resource {
                api_groups,
                resources,
                resource_names: to_strings(names),
                verbs,
            },
            other => other,
        }
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// RoleScope tags roles and bindings as namespaced or cluster-wide
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleScope {
    Namespaced(String),
    Cluster,
}

impl RoleScope {
    pub fn namespace(&self) -> Option<&str> {
        match self {
            RoleScope::Namespaced(ns) => Some(ns),
            RoleScope::Cluster => None,
        }
    }
}

impl fmt::Display for RoleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleScope::Namespaced(ns) => write!(f, "namespace/{}", ns),
            RoleScope::Cluster => write!(f, "cluster"),
        }
    }
}

/// Role is a named set of permission grants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub scope: RoleScope,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// RoleRef names the role a binding grants
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RoleRef {
    /// A namespaced role living in the binding's namespace
    Role { name: String },
    ClusterRole { name: String },
}

impl RoleRef {
    pub fn name(&self) -> &str {
        match self {
            RoleRef::Role { name } | RoleRef::ClusterRole { name } => name,
        }
    }
}

impl fmt::Display for RoleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleRef::Role { name } => write!(f, "Role/{}", name),
            RoleRef::ClusterRole { name } => write!(f, "ClusterRole/{}", name),
        }
    }
}

/// Binding associates subjects with one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub scope: RoleScope,
    pub role_ref: RoleRef,
    #[serde(default)]
    pub subjects: Vec<Subject>,
}

/// UserInfo is the requesting identity with its externally resolved groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub subject: Subject,
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl UserInfo {
    pub fn new(subject: Subject) -> Self {
        Self {
            subject,
            groups: BTreeSet::new(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }
}

/// RequestAttributes describe the action being authorized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestAttributes {
    Resource {
        verb: String,
        #[serde(default)]
        api_group: String,
        resource: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subresource: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// None for cluster-scoped resources
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
    NonResource {
        verb: String,
        path: String,
    },
}

impl RequestAttributes {
    pub fn resource(
        verb: &str,
        api_group: &str,
        resource: &str,
        name: Option<&str>,
        namespace: Option<&str>,
    ) -> Self {
        RequestAttributes::Resource {
            verb: verb.to_string(),
            api_group: api_group.to_string(),
            resource: resource.to_string(),
            subresource: None,
            name: name.map(str::to_string),
            namespace: namespace.map(str::to_string),
        }
    }

    pub fn non_resource(verb: &str, path: &str) -> Self {
        RequestAttributes::NonResource {
            verb: verb.to_string(),
            path: path.to_string(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            RequestAttributes::Resource { namespace, .. } => namespace.as_deref(),
            RequestAttributes::NonResource { .. } => None,
        }
    }
}

/// Grant identifies which binding, role and rule allowed a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub binding: String,
    pub binding_scope: RoleScope,
    pub role_ref: RoleRef,
    pub rule: PolicyRule,
}

/// AuthorizationDecision is Allow (with the matching grant) or Deny
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AuthorizationDecision {
    Allow { grant: Grant },
    Deny { reason: String },
}

impl AuthorizationDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthorizationDecision::Allow { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuthorizationDecision::Allow { .. } => "allow",
            AuthorizationDecision::Deny { .. } => "deny",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_id_is_deterministic() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(RunId::for_schedule("backup", t), RunId::for_schedule("backup", t));
        assert_eq!(
            RunId::for_schedule("backup", t).as_str(),
            format!("backup-{}", t.timestamp() / 60)
        );
    }

    #[test]
    fn test_schedule_spec_defaults_from_json() {
        let spec: ScheduleSpec = serde_json::from_str(r#"{"schedule": "*/5 * * * *"}"#).unwrap();
        assert_eq!(spec.concurrency_policy, ConcurrencyPolicy::Allow);
        assert!(!spec.suspend);
        assert_eq!(spec.successful_jobs_history_limit, 3);
        assert_eq!(spec.failed_jobs_history_limit, 1);
        assert_eq!(spec, ScheduleSpec::new("*/5 * * * *"));
    }

    #[test]
    fn test_policy_rule_untagged_forms() {
        let rule: PolicyRule =
            serde_json::from_str(r#"{"resources": ["pods"], "verbs": ["get"]}"#).unwrap();
        assert_eq!(rule, PolicyRule::resource(&[""], &["pods"], &["get"]));

        let rule: PolicyRule =
            serde_json::from_str(r#"{"non_resource_urls": ["/healthz"], "verbs": ["get"]}"#)
                .unwrap();
        assert_eq!(rule, PolicyRule::non_resource(&["/healthz"], &["get"]));
    }

    #[test]
    fn test_subject_tagged_form() {
        let subject: Subject =
            serde_json::from_str(r#"{"kind": "ServiceIdentity", "namespace": "ci", "name": "bot"}"#)
                .unwrap();
        assert_eq!(subject, Subject::service_identity("ci", "bot"));
        assert_ne!(Subject::user("ops"), Subject::group("ops"));
    }

    #[test]
    fn test_role_scope_forms() {
        let scope: RoleScope = serde_json::from_str(r#"{"namespaced": "dev"}"#).unwrap();
        assert_eq!(scope.namespace(), Some("dev"));
        let scope: RoleScope = serde_json::from_str(r#""cluster""#).unwrap();
        assert_eq!(scope, RoleScope::Cluster);
    }

    #[test]
    fn test_trigger_decision_accessors() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(TriggerDecision::NoAction.scheduled_time(), None);
        let decision = TriggerDecision::CreateJobAndTerminate {
            scheduled_time: t,
            prior_run_ids: vec![RunId("old".to_string())],
        };
        assert_eq!(decision.scheduled_time(), Some(t));
        assert!(decision.creates_job());
        assert_eq!(decision.kind(), "create_job_and_terminate");
    }
}
