//! Domain entities and value objects.
use crate::errors::RepositoryError;
use crate::json::Validate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Timestamp text formats accepted when parsing a time column, tried in order.
/// Index 0 is also the format written on encode.
const TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.9fZ",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%:z",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse an RFC3339-nanosecond timestamp, falling back through historical formats.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in TIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }
    Err(RepositoryError::Validation(format!(
        "unrecognized timestamp format: {raw}"
    )))
}

/// Render a timestamp in the canonical on-disk format (RFC3339, nanosecond precision).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Workflow / task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    Pending,
    Waiting,
    Paused,
    Running,
    Success,
    Failed,
    Canceled,
    TimedOut,
}

impl StatusType {
    pub const ALL: [StatusType; 8] = [
        StatusType::Pending,
        StatusType::Waiting,
        StatusType::Paused,
        StatusType::Running,
        StatusType::Success,
        StatusType::Failed,
        StatusType::Canceled,
        StatusType::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusType::Pending => "pending",
            StatusType::Waiting => "waiting",
            StatusType::Paused => "paused",
            StatusType::Running => "running",
            StatusType::Success => "success",
            StatusType::Failed => "failed",
            StatusType::Canceled => "canceled",
            StatusType::TimedOut => "timed_out",
        }
    }

    /// Running-like set = {running, pending, waiting}.
    pub fn is_running_like(&self) -> bool {
        matches!(self, StatusType::Running | StatusType::Pending | StatusType::Waiting)
    }

    /// Failing-like set = {failed, timed_out, canceled}.
    pub fn is_failing_like(&self) -> bool {
        matches!(self, StatusType::Failed | StatusType::TimedOut | StatusType::Canceled)
    }

    /// Terminal set = {success, failed, canceled, timed_out}.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatusType::Success | StatusType::Failed | StatusType::Canceled | StatusType::TimedOut
        )
    }
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusType {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StatusType::Pending),
            "waiting" => Ok(StatusType::Waiting),
            "paused" => Ok(StatusType::Paused),
            "running" => Ok(StatusType::Running),
            "success" => Ok(StatusType::Success),
            "failed" => Ok(StatusType::Failed),
            "canceled" => Ok(StatusType::Canceled),
            "timed_out" => Ok(StatusType::TimedOut),
            other => Err(RepositoryError::Validation(format!("unknown status: {other}"))),
        }
    }
}

/// Component kind for a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Task,
    Agent,
    Tool,
}

impl ComponentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Task => "task",
            ComponentType::Agent => "agent",
            ComponentType::Tool => "tool",
        }
    }
}

impl FromStr for ComponentType {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(ComponentType::Task),
            "agent" => Ok(ComponentType::Agent),
            "tool" => Ok(ComponentType::Tool),
            other => Err(RepositoryError::Validation(format!("unknown component: {other}"))),
        }
    }
}

/// Execution strategy for a task. Open-ended: the engine may introduce new
/// variants, so unrecognized strings round-trip through `Other` rather than
/// failing to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionType {
    Basic,
    Parallel,
    Other(String),
}

impl ExecutionType {
    pub fn as_str(&self) -> &str {
        match self {
            ExecutionType::Basic => "basic",
            ExecutionType::Parallel => "parallel",
            ExecutionType::Other(s) => s.as_str(),
        }
    }
}

impl FromStr for ExecutionType {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "basic" => ExecutionType::Basic,
            "parallel" => ExecutionType::Parallel,
            other => ExecutionType::Other(other.to_string()),
        })
    }
}

impl Serialize for ExecutionType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExecutionType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ExecutionType::from_str(&s).expect("FromStr<ExecutionType> is infallible"))
    }
}

/// One provider/model token-accounting entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

impl UsageEntry {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            prompt_tokens,
            completion_tokens,
            total_tokens: None,
        }
    }

    /// Effective total, computed from prompt+completion when not recorded explicitly.
    pub fn effective_total(&self) -> u64 {
        self.total_tokens.unwrap_or(self.prompt_tokens + self.completion_tokens)
    }

    fn key(&self) -> (&str, &str) {
        (self.provider.as_str(), self.model.as_str())
    }
}

/// An ordered sequence of per-(provider, model) token-accounting entries with an
/// associative merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary(pub Vec<UsageEntry>);

impl UsageSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(entry: UsageEntry) -> Self {
        Self(vec![entry])
    }

    /// Deterministic ordering by (provider, model), used before persisting so that
    /// two summaries with the same multiset of entries compare equal.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| a.key().cmp(&b.key()));
    }

    /// Merge `other` into `self`, combining entries that share a (provider, model)
    /// key by summing their token counts. Associative: `merge_all(a); merge_all(b)`
    /// is equivalent to a single `merge_all` over `a` concatenated with `b`.
    pub fn merge_all(&mut self, other: &UsageSummary) {
        for incoming in &other.0 {
            if let Some(existing) = self
                .0
                .iter_mut()
                .find(|e| e.provider == incoming.provider && e.model == incoming.model)
            {
                existing.prompt_tokens += incoming.prompt_tokens;
                existing.completion_tokens += incoming.completion_tokens;
                existing.total_tokens = Some(existing.prompt_tokens + existing.completion_tokens);
            } else {
                self.0.push(incoming.clone());
            }
        }
        self.sort();
    }
}

impl Validate for UsageSummary {
    fn validate(&self) -> Result<(), RepositoryError> {
        // The DB-level CHECK only requires `json_type(usage) = 'array'`, which is
        // guaranteed by this type's serde representation (a JSON array); per-entry
        // validation is limited to rejecting entries with an empty provider/model.
        for entry in &self.0 {
            if entry.provider.trim().is_empty() || entry.model.trim().is_empty() {
                return Err(RepositoryError::Validation(
                    "usage entry missing provider/model".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Runtime state of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_exec_id: String,
    pub workflow_id: String,
    pub status: StatusType,
    pub usage: Option<UsageSummary>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(workflow_exec_id: impl Into<String>, workflow_id: impl Into<String>, status: StatusType) -> Self {
        let now = Utc::now();
        Self {
            workflow_exec_id: workflow_exec_id.into(),
            workflow_id: workflow_id.into(),
            status,
            usage: None,
            input: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Runtime state of one task execution within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_exec_id: String,
    pub component: ComponentType,
    pub status: StatusType,
    pub task_id: String,
    pub workflow_exec_id: String,
    pub workflow_id: String,
    pub execution_type: ExecutionType,
    pub usage: Option<UsageSummary>,
    pub agent_id: Option<String>,
    pub tool_id: Option<String>,
    pub action_id: Option<String>,
    pub parent_state_id: Option<String>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_exec_id: impl Into<String>,
        component: ComponentType,
        status: StatusType,
        task_id: impl Into<String>,
        workflow_exec_id: impl Into<String>,
        workflow_id: impl Into<String>,
        execution_type: ExecutionType,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_exec_id: task_exec_id.into(),
            component,
            status,
            task_id: task_id.into(),
            workflow_exec_id: workflow_exec_id.into(),
            workflow_id: workflow_id.into(),
            execution_type,
            usage: None,
            agent_id: None,
            tool_id: None,
            action_id: None,
            parent_state_id: None,
            input: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_state_id.is_none()
    }
}

/// Aggregate progress over a set of child task states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub status_counts: HashMap<String, u64>,
}

impl ProgressInfo {
    pub fn from_counts(status_counts: HashMap<String, u64>) -> Self {
        Self { status_counts }
    }

    fn count(&self, status: StatusType) -> u64 {
        *self.status_counts.get(status.as_str()).unwrap_or(&0)
    }

    pub fn success_count(&self) -> u64 {
        self.count(StatusType::Success)
    }

    pub fn failed_count(&self) -> u64 {
        self.count(StatusType::Failed)
    }

    pub fn canceled_count(&self) -> u64 {
        self.count(StatusType::Canceled)
    }

    pub fn timed_out_count(&self) -> u64 {
        self.count(StatusType::TimedOut)
    }

    pub fn pending_count(&self) -> u64 {
        self.count(StatusType::Pending)
    }

    pub fn running_count(&self) -> u64 {
        self.count(StatusType::Running) + self.count(StatusType::Waiting) + self.count(StatusType::Paused)
    }

    pub fn terminal_count(&self) -> u64 {
        self.success_count() + self.failed_count() + self.canceled_count() + self.timed_out_count()
    }

    pub fn total_children(&self) -> u64 {
        self.status_counts.values().sum()
    }

    pub fn completion_rate(&self) -> f64 {
        let total = self.total_children();
        if total == 0 {
            0.0
        } else {
            self.success_count() as f64 / total as f64
        }
    }

    pub fn failure_rate(&self) -> f64 {
        let total = self.total_children();
        if total == 0 {
            0.0
        } else {
            (self.failed_count() + self.timed_out_count()) as f64 / total as f64
        }
    }
}

/// A platform user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
        }
    }
}

impl FromStr for UserRole {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "user" => Ok(UserRole::User),
            other => Err(RepositoryError::Validation(format!("unknown role: {other}"))),
        }
    }
}

/// An API key belonging to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
    pub prefix: String,
    #[serde(with = "hex_bytes")]
    pub fingerprint: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_set_membership() {
        assert!(StatusType::Running.is_running_like());
        assert!(StatusType::Pending.is_running_like());
        assert!(!StatusType::Success.is_running_like());

        assert!(StatusType::Failed.is_failing_like());
        assert!(StatusType::TimedOut.is_failing_like());
        assert!(StatusType::Canceled.is_failing_like());
        assert!(!StatusType::Success.is_failing_like());

        assert!(StatusType::Success.is_terminal());
        assert!(StatusType::Failed.is_terminal());
        assert!(!StatusType::Running.is_terminal());
    }

    #[test]
    fn usage_merge_is_associative_per_key() {
        let mut total = UsageSummary::single(UsageEntry::new("openai", "gpt-4", 5, 5));
        total.merge_all(&UsageSummary::single(UsageEntry::new("openai", "gpt-4", 1, 1)));
        total.merge_all(&UsageSummary::single(UsageEntry::new("openai", "gpt-4", 1, 1)));
        total.merge_all(&UsageSummary::single(UsageEntry::new("openai", "gpt-4", 1, 1)));
        assert_eq!(total.0.len(), 1);
        assert_eq!(total.0[0].effective_total(), 16);
    }

    #[test]
    fn merge_empty_is_noop() {
        let mut total = UsageSummary::single(UsageEntry::new("openai", "gpt-4", 5, 5));
        let before = total.clone();
        total.merge_all(&UsageSummary::new());
        assert_eq!(total, before);
    }

    #[test]
    fn timestamp_round_trip() {
        let now = Utc::now();
        let rendered = format_timestamp(&now);
        let parsed = parse_timestamp(&rendered).unwrap();
        assert_eq!(parsed.timestamp_nanos_opt(), now.timestamp_nanos_opt());
    }

    #[test]
    fn progress_info_derives_rates() {
        let mut counts = HashMap::new();
        counts.insert("success".to_string(), 3);
        counts.insert("failed".to_string(), 1);
        counts.insert("running".to_string(), 1);
        let progress = ProgressInfo::from_counts(counts);
        assert_eq!(progress.total_children(), 5);
        assert_eq!(progress.terminal_count(), 4);
        assert_eq!(progress.running_count(), 1);
        assert!((progress.completion_rate() - 0.6).abs() < 1e-9);
        assert!((progress.failure_rate() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn progress_info_zero_total_rates_are_zero() {
        let progress = ProgressInfo::default();
        assert_eq!(progress.completion_rate(), 0.0);
        assert_eq!(progress.failure_rate(), 0.0);
    }
}
