//! Type definitions for sync definitions, runs, results and leases.
//!
//! Covers the definition configuration (request, recurrence), mutable run
//! state, immutable run records, the latest-result read model and the
//! admin request bodies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// ── Enums ────────────────────────────────────────────────────────────

/// Recurrence frequency of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Hourly,
    Daily,
    TwiceDaily,
    FourTimesDaily,
    /// Cron expression + timezone.
    Custom,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "HOURLY",
            Self::Daily => "DAILY",
            Self::TwiceDaily => "TWICE_DAILY",
            Self::FourTimesDaily => "FOUR_TIMES_DAILY",
            Self::Custom => "CUSTOM",
        }
    }
}

/// Status of the most recent run, and of each run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

/// Failure classification surfaced on run records and the definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network trouble or a non-2xx answer; retried at the next due time.
    Transient,
    /// The definition itself is broken (path, script, cron).
    Configuration,
    /// Transform ran out of time, fuel or output space.
    ResourceExceeded,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Configuration => "configuration",
            Self::ResourceExceeded => "resource_exceeded",
        }
    }
}

/// How a run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Dispatched by the scheduler tick.
    Scheduled,
    /// Triggered via the admin API.
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

/// Error returned when a stored enum label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! impl_from_str {
    ($ty:ty, $kind:literal, [$($variant:ident),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == <$ty>::$variant.as_str() {
                        return Ok(<$ty>::$variant);
                    }
                )+
                Err(UnknownVariant { kind: $kind, value: s.to_string() })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_from_str!(Frequency, "frequency", [Hourly, Daily, TwiceDaily, FourTimesDaily, Custom]);
impl_from_str!(RunStatus, "run status", [Pending, Running, Success, Failed]);
impl_from_str!(ErrorKind, "error kind", [Transient, Configuration, ResourceExceeded]);
impl_from_str!(TriggerKind, "trigger", [Scheduled, Manual]);

// ── Definition configuration ─────────────────────────────────────────

/// Outbound HTTP request of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Header name → value, sent in insertion order.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// JSON body, sent for non-GET requests.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: IndexMap::new(),
            body: None,
        }
    }
}

/// Recurrence of a definition. `frequency`, `cron_expression` and
/// `timezone` are validated together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// IANA timezone name. Fixed frequencies default to UTC.
    #[serde(default)]
    pub timezone: Option<String>,
}

impl Recurrence {
    pub fn fixed(frequency: Frequency) -> Self {
        Self {
            frequency,
            cron_expression: None,
            timezone: None,
        }
    }

    pub fn custom(cron_expression: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            frequency: Frequency::Custom,
            cron_expression: Some(cron_expression.into()),
            timezone: Some(timezone.into()),
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// Timezone name used for wall-clock arithmetic.
    pub fn timezone_name(&self) -> &str {
        self.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE)
    }
}

pub const DEFAULT_TIMEZONE: &str = "UTC";

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

/// A stored synchronization definition with its mutable run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDefinition {
    pub id: Uuid,
    pub tool_id: String,
    pub name: Option<String>,
    pub request: RequestSpec,
    /// Dot/index path into the response; absent means the whole payload.
    pub extract_path: Option<String>,
    /// Transform script; absent means identity.
    pub transform_script: Option<String>,
    pub recurrence: Recurrence,
    pub is_active: bool,

    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_status: RunStatus,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub run_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    /// Sequence number of the most recently started run.
    pub run_seq: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncDefinition {
    /// Build a fresh definition from a create request. It is due immediately.
    pub fn from_create(req: CreateSyncDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool_id: req.tool_id,
            name: req.name,
            request: req.request,
            extract_path: non_blank(req.extract_path),
            transform_script: non_blank(req.transform_script),
            recurrence: req.recurrence,
            is_active: req.is_active,
            last_run_at: None,
            next_run_at: Some(now),
            last_status: RunStatus::Pending,
            last_error: None,
            last_error_kind: None,
            run_count: 0,
            success_count: 0,
            fail_count: 0,
            run_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial configuration update. Run state is never touched.
    pub fn apply_update(&mut self, req: UpdateSyncDefinition, now: DateTime<Utc>) {
        if let Some(tool_id) = req.tool_id {
            self.tool_id = tool_id;
        }
        if let Some(name) = req.name {
            self.name = name;
        }
        if let Some(request) = req.request {
            self.request = request;
        }
        if let Some(path) = req.extract_path {
            self.extract_path = non_blank(path);
        }
        if let Some(script) = req.transform_script {
            self.transform_script = non_blank(script);
        }
        if let Some(recurrence) = req.recurrence {
            self.recurrence = recurrence;
        }
        if let Some(active) = req.is_active {
            self.is_active = active;
        }
        self.updated_at = now;
    }

    /// Due = active and `next_run_at` unset or reached.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run_at.map_or(true, |next| next <= now)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

// ── Runs and results ─────────────────────────────────────────────────

/// Immutable log entry for one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub run_seq: u64,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Leading bytes of the serialized payload.
    pub payload_sample: Option<String>,
}

/// Last successfully transformed payload of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSnapshot {
    pub definition_id: Uuid,
    pub payload: serde_json::Value,
    pub produced_at: DateTime<Utc>,
    pub run_seq: u64,
}

/// Read model served to tool consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestResult {
    pub definition_id: Uuid,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub stale: bool,
}

/// Single-flight reservation for one definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub definition_id: Uuid,
    pub holder: String,
    pub run_seq: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Everything the recorder writes at the end of a run.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Transformed payload; only set on success.
    pub payload: Option<serde_json::Value>,
    pub payload_sample: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl RunCompletion {
    pub fn into_record(self, id: Uuid, definition_id: Uuid, run_seq: u64) -> RunRecord {
        RunRecord {
            id,
            definition_id,
            run_seq,
            trigger: self.trigger,
            started_at: self.started_at,
            finished_at: self.finished_at,
            status: self.status,
            error: self.error,
            error_kind: self.error_kind,
            payload_sample: self.payload_sample,
        }
    }
}

/// What happened to a completion handed to the recorder.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordDisposition {
    Recorded(RunRecord),
    /// The definition no longer exists; nothing was written.
    Dropped(RunRecord),
}

/// Result of asking for a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(RunRecord),
    /// Another run holds the lease; nothing was recorded.
    AlreadyRunning,
    /// The definition was deleted while the run was in flight.
    Discarded(RunRecord),
}

impl RunOutcome {
    pub fn record(&self) -> Option<&RunRecord> {
        match self {
            Self::Completed(r) | Self::Discarded(r) => Some(r),
            Self::AlreadyRunning => None,
        }
    }
}

// ── Request bodies ───────────────────────────────────────────────────

/// Request body for creating a definition.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSyncDefinition {
    pub tool_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub request: RequestSpec,
    #[serde(default)]
    pub extract_path: Option<String>,
    #[serde(default)]
    pub transform_script: Option<String>,
    pub recurrence: Recurrence,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Request body for updating a definition. Absent fields are left alone;
/// nullable fields may be cleared with an explicit `null`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSyncDefinition {
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub name: Option<Option<String>>,
    #[serde(default)]
    pub request: Option<RequestSpec>,
    #[serde(default, deserialize_with = "double_option")]
    pub extract_path: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub transform_script: Option<Option<String>>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

fn double_option<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

// ── Tests ────────────────────────────────────────────────────────────
