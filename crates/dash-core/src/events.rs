use crate::{Build, BuildStatus, LogCounts, LogEntry, Stage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("unknown event kind: {0}")]
    UnknownKind(String),
    #[error("invalid {kind} payload: {message}")]
    InvalidPayload { kind: String, message: String },
}

/// Event as it arrives on the wire, before the kind is resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Every event kind the engine understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProducerEvent {
    BuildStarted(BuildStarted),
    BuildStage(BuildStageUpdate),
    BuildCompleted(BuildCompleted),
    BuildsSnapshot(BuildsSnapshot),
    Logs(LogDelivery),
    SummaryChanged(RefreshSignal),
    ProblemsChanged(RefreshSignal),
    ProjectsChanged(RefreshSignal),
}

impl ProducerEvent {
    pub const KINDS: [&'static str; 8] = [
        "build_started",
        "build_stage",
        "build_completed",
        "builds_snapshot",
        "logs",
        "summary_changed",
        "problems_changed",
        "projects_changed",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            ProducerEvent::BuildStarted(_) => "build_started",
            ProducerEvent::BuildStage(_) => "build_stage",
            ProducerEvent::BuildCompleted(_) => "build_completed",
            ProducerEvent::BuildsSnapshot(_) => "builds_snapshot",
            ProducerEvent::Logs(_) => "logs",
            ProducerEvent::SummaryChanged(_) => "summary_changed",
            ProducerEvent::ProblemsChanged(_) => "problems_changed",
            ProducerEvent::ProjectsChanged(_) => "projects_changed",
        }
    }

    /// Resolve a raw event. Unknown kinds are reported separately from bad
    /// payloads so the caller can ignore them quietly.
    pub fn from_raw(raw: RawEvent) -> Result<Self, EventError> {
        if !Self::KINDS.contains(&raw.event.as_str()) {
            return Err(EventError::UnknownKind(raw.event));
        }
        let kind = raw.event.clone();
        let data = if raw.data.is_null() {
            Value::Object(Map::new())
        } else {
            raw.data
        };
        let mut tagged = Map::new();
        tagged.insert("event".to_string(), Value::String(raw.event));
        tagged.insert("data".to_string(), data);
        serde_json::from_value(Value::Object(tagged)).map_err(|err| EventError::InvalidPayload {
            kind,
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildStarted {
    pub build_id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub project_root: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub total_stages: Option<u32>,
}

/// Progress on one stage. `stages`, when present, is the producer's full
/// live list; `stage` alone updates the entry at `index`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildStageUpdate {
    pub build_id: String,
    pub index: usize,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub stages: Option<Vec<Stage>>,
    #[serde(default)]
    pub elapsed_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildCompleted {
    pub build_id: String,
    #[serde(default)]
    pub return_code: i32,
    /// Explicit terminal status (e.g. cancelled); derived from the return
    /// code when absent.
    #[serde(default)]
    pub status: Option<BuildStatus>,
    #[serde(default)]
    pub warnings: u32,
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub elapsed_seconds: Option<f64>,
    #[serde(default)]
    pub stages: Option<Vec<Stage>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Full build list, sent by the producer when the builds channel is
/// (re)subscribed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildsSnapshot {
    #[serde(default)]
    pub builds: Vec<Build>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    #[default]
    Incremental,
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogDelivery {
    #[serde(default)]
    pub mode: LogMode,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub has_more: Option<bool>,
    #[serde(default)]
    pub counts: Option<LogCounts>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSignal {
    #[serde(default)]
    pub project_root: Option<String>,
}
