pub mod diff;
pub mod events;
pub mod state;
pub mod translate;
pub mod wire;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    #[default]
    Queued,
    Building,
    Success,
    Warning,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Building => "building",
            BuildStatus::Success => "success",
            BuildStatus::Warning => "warning",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success
                | BuildStatus::Warning
                | BuildStatus::Failed
                | BuildStatus::Cancelled
        )
    }

    /// Terminal status for a finished build process.
    pub fn from_return_code(return_code: i32, warnings: u32) -> Self {
        if return_code != 0 {
            BuildStatus::Failed
        } else if warnings > 0 {
            BuildStatus::Warning
        } else {
            BuildStatus::Success
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "queued" => Ok(BuildStatus::Queued),
            "building" | "running" => Ok(BuildStatus::Building),
            "success" => Ok(BuildStatus::Success),
            "warning" => Ok(BuildStatus::Warning),
            "failed" => Ok(BuildStatus::Failed),
            "cancelled" | "canceled" => Ok(BuildStatus::Cancelled),
            other => Err(format!("Unknown build status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Success,
    Warning,
    Failed,
    Error,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Success => "success",
            StageStatus::Warning => "warning",
            StageStatus::Failed => "failed",
            StageStatus::Error => "error",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Alert,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Alert => "ALERT",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_uppercase();
        match normalized.as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "ALERT" | "CRITICAL" => Ok(LogLevel::Alert),
            other => Err(format!("Unknown log level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub stage_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub elapsed_seconds: f64,
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default)]
    pub infos: u32,
    #[serde(default)]
    pub warnings: u32,
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub alerts: u32,
}

/// Upper bound on stage positions accepted from the producer.
pub const MAX_STAGES: usize = 1024;

/// Ordered stages of one build.
///
/// Unchanged stages keep identity: updates replace only the `Arc`s whose
/// contents actually changed, so consumers can memoize on `Arc::ptr_eq`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct StageList(Vec<Arc<Stage>>);

impl StageList {
    pub fn from_stages(stages: Vec<Stage>) -> Self {
        Self(stages.into_iter().map(Arc::new).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Stage>> {
        self.0.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Stage>> {
        self.0.iter()
    }

    /// Replace the stage at `index` unless it is already equal. Gaps before
    /// an index past the end are filled with pending placeholders; indices at
    /// or beyond `MAX_STAGES` are ignored. Returns true when a new value was
    /// stored.
    pub fn set(&mut self, index: usize, stage: Stage) -> bool {
        if index >= MAX_STAGES {
            return false;
        }
        if index >= self.0.len() {
            self.0.resize_with(index, || Arc::new(Stage::default()));
            self.0.push(Arc::new(stage));
            return true;
        }
        let slot = &mut self.0[index];
        if **slot == stage {
            return false;
        }
        *slot = Arc::new(stage);
        true
    }

    /// Reconcile against an authoritative list: index-by-index when the
    /// lengths match, wholesale replacement otherwise.
    pub fn reconcile(&mut self, incoming: Vec<Stage>) -> bool {
        if incoming.len() != self.0.len() {
            *self = Self::from_stages(incoming);
            return true;
        }
        let mut changed = false;
        for (index, stage) in incoming.into_iter().enumerate() {
            changed |= self.set(index, stage);
        }
        changed
    }

    /// Promote still-pending stages before `index` to success.
    pub fn promote_pending_before(&mut self, index: usize) -> bool {
        let mut changed = false;
        for slot in self.0.iter_mut().take(index) {
            if slot.status == StageStatus::Pending {
                let mut promoted = (**slot).clone();
                promoted.status = StageStatus::Success;
                *slot = Arc::new(promoted);
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub build_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub project_root: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub status: BuildStatus,
    #[serde(default)]
    pub elapsed_seconds: f64,
    #[serde(default)]
    pub warnings: u32,
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub return_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub stages: StageList,
    #[serde(default)]
    pub total_stages: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub filename: String,
    pub lineno: u32,
    pub function: String,
    #[serde(default)]
    pub code_line: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Traceback {
    pub exc_type: String,
    pub exc_message: String,
    #[serde(default)]
    pub frames: Vec<StackFrame>,
}

/// One log line. Never mutated once appended to the canonical sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub timestamp: String,
    pub level: LogLevel,
    #[serde(default)]
    pub logger_name: String,
    #[serde(default)]
    pub stage: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Traceback>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LogCounts {
    #[serde(rename = "DEBUG", default)]
    pub debug: u64,
    #[serde(rename = "INFO", default)]
    pub info: u64,
    #[serde(rename = "WARNING", default)]
    pub warning: u64,
    #[serde(rename = "ERROR", default)]
    pub error: u64,
    #[serde(rename = "ALERT", default)]
    pub alert: u64,
}

impl LogCounts {
    pub fn record(&mut self, level: LogLevel) {
        let slot = match level {
            LogLevel::Debug => &mut self.debug,
            LogLevel::Info => &mut self.info,
            LogLevel::Warning => &mut self.warning,
            LogLevel::Error => &mut self.error,
            LogLevel::Alert => &mut self.alert,
        };
        *slot += 1;
    }

    pub fn tally<'a>(entries: impl IntoIterator<Item = &'a LogEntry>) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            counts.record(entry.level);
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    #[serde(default)]
    pub build_id: Option<String>,
    #[serde(default = "default_log_levels")]
    pub levels: Vec<LogLevel>,
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub after_id: Option<u64>,
    #[serde(default = "default_log_count")]
    pub count: u32,
}

fn default_log_levels() -> Vec<LogLevel> {
    vec![
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Alert,
    ]
}

fn default_log_count() -> u32 {
    1000
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            build_id: None,
            levels: default_log_levels(),
            search: String::new(),
            stage: None,
            after_id: None,
            count: default_log_count(),
        }
    }
}

impl LogFilter {
    /// Flip one level in or out, keeping severity order.
    pub fn toggle_level(&mut self, level: LogLevel) {
        if let Some(pos) = self.levels.iter().position(|l| *l == level) {
            self.levels.remove(pos);
        } else {
            self.levels.push(level);
            self.levels.sort();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub root: String,
    pub name: String,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub message: String,
    pub level: LogLevel,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub column: Option<u32>,
    #[serde(default)]
    pub build_id: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connected: bool,
    pub producer_url: String,
    #[serde(default)]
    pub producer_version: Option<String>,
    #[serde(default)]
    pub reconnect_attempts: u32,
    /// RFC 3339 time the current producer connection opened.
    #[serde(default)]
    pub connected_since: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, status: StageStatus) -> Stage {
        Stage {
            name: name.to_string(),
            status,
            ..Stage::default()
        }
    }

    #[test]
    fn build_status_from_return_code() {
        assert_eq!(BuildStatus::from_return_code(1, 0), BuildStatus::Failed);
        assert_eq!(BuildStatus::from_return_code(0, 3), BuildStatus::Warning);
        assert_eq!(BuildStatus::from_return_code(0, 0), BuildStatus::Success);
        assert!(BuildStatus::Cancelled.is_terminal());
        assert!(!BuildStatus::Building.is_terminal());
    }

    #[test]
    fn log_level_parses_aliases() {
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!(" critical ".parse::<LogLevel>(), Ok(LogLevel::Alert));
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn stage_list_set_keeps_identity_for_equal_values() {
        let mut stages = StageList::from_stages(vec![stage("a", StageStatus::Pending)]);
        let before = Arc::clone(stages.get(0).expect("stage"));
        assert!(!stages.set(0, stage("a", StageStatus::Pending)));
        assert!(Arc::ptr_eq(&before, stages.get(0).expect("stage")));
        assert!(stages.set(0, stage("a", StageStatus::Running)));
        assert!(!Arc::ptr_eq(&before, stages.get(0).expect("stage")));
    }

    #[test]
    fn stage_list_reconcile_replaces_on_length_change() {
        let mut stages = StageList::from_stages(vec![stage("a", StageStatus::Pending)]);
        let changed = stages.reconcile(vec![
            stage("a", StageStatus::Success),
            stage("b", StageStatus::Running),
        ]);
        assert!(changed);
        assert_eq!(stages.len(), 2);
        assert_eq!(stages.get(1).expect("stage").status, StageStatus::Running);
    }

    #[test]
    fn stage_list_set_past_end_pads_with_pending() {
        let mut stages = StageList::default();
        assert!(stages.set(2, stage("layout", StageStatus::Running)));
        assert_eq!(stages.len(), 3);
        assert_eq!(stages.get(0).expect("stage").status, StageStatus::Pending);
        assert_eq!(stages.get(2).expect("stage").name, "layout");

        assert!(stages.set(0, stage("compile", StageStatus::Success)));
        assert_eq!(stages.get(2).expect("stage").name, "layout");
        assert!(!stages.set(MAX_STAGES, stage("bogus", StageStatus::Running)));
        assert_eq!(stages.len(), 3);
    }

    #[test]
    fn log_filter_toggle_keeps_order() {
        let mut filter = LogFilter::default();
        filter.toggle_level(LogLevel::Info);
        assert!(!filter.levels.contains(&LogLevel::Info));
        filter.toggle_level(LogLevel::Debug);
        filter.toggle_level(LogLevel::Info);
        assert_eq!(filter.levels, LogLevel::ALL.to_vec());
    }

    #[test]
    fn log_counts_serialize_with_level_keys() {
        let mut counts = LogCounts::default();
        counts.record(LogLevel::Error);
        counts.record(LogLevel::Error);
        let value = serde_json::to_value(counts).expect("serialize");
        assert_eq!(value["ERROR"], 2);
        assert_eq!(value["INFO"], 0);
    }
}
