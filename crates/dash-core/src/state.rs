use crate::{Build, ConnectionInfo, LogCounts, LogEntry, LogFilter, Problem, Project};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Top-level field of the canonical state. Names match the keys clients see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Projects,
    IsLoadingProjects,
    ProjectsError,
    SelectedProjectRoot,
    SelectedTargetNames,
    Builds,
    LogEntries,
    LogCounts,
    LogTotal,
    LogHasMore,
    LogFilter,
    BuildSummary,
    Problems,
    IsLoadingProblems,
    InstallingPackages,
    Connection,
}

impl Field {
    pub const ALL: [Field; 16] = [
        Field::Projects,
        Field::IsLoadingProjects,
        Field::ProjectsError,
        Field::SelectedProjectRoot,
        Field::SelectedTargetNames,
        Field::Builds,
        Field::LogEntries,
        Field::LogCounts,
        Field::LogTotal,
        Field::LogHasMore,
        Field::LogFilter,
        Field::BuildSummary,
        Field::Problems,
        Field::IsLoadingProblems,
        Field::InstallingPackages,
        Field::Connection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Projects => "projects",
            Field::IsLoadingProjects => "isLoadingProjects",
            Field::ProjectsError => "projectsError",
            Field::SelectedProjectRoot => "selectedProjectRoot",
            Field::SelectedTargetNames => "selectedTargetNames",
            Field::Builds => "builds",
            Field::LogEntries => "logEntries",
            Field::LogCounts => "logCounts",
            Field::LogTotal => "logTotal",
            Field::LogHasMore => "logHasMore",
            Field::LogFilter => "logFilter",
            Field::BuildSummary => "buildSummary",
            Field::Problems => "problems",
            Field::IsLoadingProblems => "isLoadingProblems",
            Field::InstallingPackages => "installingPackages",
            Field::Connection => "connection",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only log sequence.
///
/// Within one epoch every earlier view is a prefix of every later one; a full
/// replacement starts a new epoch. A client shadow may hold only the tail of
/// the sequence while the head is still owed by a backfill; `len()` always
/// counts the owed head so positions line up with the canonical sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogSequence {
    epoch: u64,
    pending_head: usize,
    entries: Vec<Arc<LogEntry>>,
    ids: HashSet<u64>,
}

impl LogSequence {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.pending_head + self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries at the head not yet delivered.
    pub fn pending_head(&self) -> usize {
        self.pending_head
    }

    /// Entries actually held, oldest first.
    pub fn entries(&self) -> &[Arc<LogEntry>] {
        &self.entries
    }

    /// Whether a held entry carries this producer row id.
    pub fn contains_id(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    pub(crate) fn push(&mut self, entry: LogEntry) {
        if let Some(id) = entry.id {
            self.ids.insert(id);
        }
        self.entries.push(Arc::new(entry));
    }

    pub(crate) fn replace(&mut self, entries: Vec<LogEntry>) {
        self.epoch += 1;
        self.pending_head = 0;
        self.entries = entries.into_iter().map(Arc::new).collect();
        self.ids = collect_ids(&self.entries);
    }

    /// Held entries from absolute position `from` onward.
    pub fn suffix_from(&self, from: usize) -> &[Arc<LogEntry>] {
        let start = from.saturating_sub(self.pending_head).min(self.entries.len());
        &self.entries[start..]
    }

    /// The most recent `limit` entries, with the rest recorded as owed.
    pub fn tail(&self, limit: usize) -> LogSequence {
        let keep = self.entries.len().min(limit);
        let skip = self.entries.len() - keep;
        let entries = self.entries[skip..].to_vec();
        LogSequence {
            epoch: self.epoch,
            pending_head: self.pending_head + skip,
            ids: collect_ids(&entries),
            entries,
        }
    }

    /// Advance to `current`: extend within the same epoch, adopt it wholesale
    /// otherwise. An owed head stays owed.
    pub fn advance_to(&mut self, current: &LogSequence) {
        if current.epoch != self.epoch || current.len() < self.len() {
            *self = current.clone();
            return;
        }
        let suffix = current.suffix_from(self.len());
        self.ids.extend(suffix.iter().filter_map(|e| e.id));
        self.entries.extend(suffix.iter().cloned());
    }

    /// Prepend the owed head. Returns false when `head` does not cover it.
    pub fn fill_head(&mut self, head: &[Arc<LogEntry>]) -> bool {
        if head.len() != self.pending_head {
            return false;
        }
        let mut entries = Vec::with_capacity(head.len() + self.entries.len());
        entries.extend(head.iter().cloned());
        entries.append(&mut self.entries);
        self.ids.extend(head.iter().filter_map(|e| e.id));
        self.entries = entries;
        self.pending_head = 0;
        true
    }
}

fn collect_ids(entries: &[Arc<LogEntry>]) -> HashSet<u64> {
    entries.iter().filter_map(|e| e.id).collect()
}

/// Canonical application state.
///
/// Fields are private to this crate: the only mutators are the event
/// translators and the local-action methods below, each of which reports the
/// fields it dirtied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppState {
    pub(crate) projects: Vec<Project>,
    pub(crate) is_loading_projects: bool,
    pub(crate) projects_error: Option<String>,
    pub(crate) selected_project_root: Option<String>,
    pub(crate) selected_target_names: Vec<String>,
    pub(crate) builds: Vec<Build>,
    pub(crate) logs: LogSequence,
    pub(crate) log_counts: LogCounts,
    pub(crate) log_total: Option<u64>,
    pub(crate) log_has_more: bool,
    pub(crate) log_filter: LogFilter,
    pub(crate) build_summary: Option<Value>,
    pub(crate) problems: Vec<Problem>,
    pub(crate) is_loading_problems: bool,
    pub(crate) installing_packages: Vec<String>,
    pub(crate) connection: ConnectionInfo,
}

/// Full-state message body plus the shadow that matches exactly what it holds.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub data: Map<String, Value>,
    pub truncated: bool,
    pub shadow: AppState,
}

impl AppState {
    pub fn new(producer_url: &str) -> Self {
        Self {
            connection: ConnectionInfo {
                producer_url: producer_url.to_string(),
                ..ConnectionInfo::default()
            },
            ..Self::default()
        }
    }

    pub fn builds(&self) -> &[Build] {
        &self.builds
    }

    pub fn build(&self, build_id: &str) -> Option<&Build> {
        self.builds.iter().find(|b| b.build_id == build_id)
    }

    pub fn logs(&self) -> &LogSequence {
        &self.logs
    }

    pub fn log_counts(&self) -> LogCounts {
        self.log_counts
    }

    pub fn log_filter(&self) -> &LogFilter {
        &self.log_filter
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn selected_project_root(&self) -> Option<&str> {
        self.selected_project_root.as_deref()
    }

    pub fn selected_target_names(&self) -> &[String] {
        &self.selected_target_names
    }

    pub fn problems(&self) -> &[Problem] {
        &self.problems
    }

    pub fn installing_packages(&self) -> &[String] {
        &self.installing_packages
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn field_value(&self, field: Field) -> Value {
        let value = match field {
            Field::Projects => serde_json::to_value(&self.projects),
            Field::IsLoadingProjects => Ok(Value::Bool(self.is_loading_projects)),
            Field::ProjectsError => serde_json::to_value(&self.projects_error),
            Field::SelectedProjectRoot => serde_json::to_value(&self.selected_project_root),
            Field::SelectedTargetNames => serde_json::to_value(&self.selected_target_names),
            Field::Builds => serde_json::to_value(&self.builds),
            Field::LogEntries => serde_json::to_value(self.logs.entries()),
            Field::LogCounts => serde_json::to_value(self.log_counts),
            Field::LogTotal => serde_json::to_value(self.log_total),
            Field::LogHasMore => Ok(Value::Bool(self.log_has_more)),
            Field::LogFilter => serde_json::to_value(&self.log_filter),
            Field::BuildSummary => serde_json::to_value(&self.build_summary),
            Field::Problems => serde_json::to_value(&self.problems),
            Field::IsLoadingProblems => Ok(Value::Bool(self.is_loading_problems)),
            Field::InstallingPackages => serde_json::to_value(&self.installing_packages),
            Field::Connection => serde_json::to_value(&self.connection),
        };
        value.unwrap_or(Value::Null)
    }

    /// Structural equality of one field. Logs compare by epoch and length.
    pub fn field_eq(&self, other: &AppState, field: Field) -> bool {
        match field {
            Field::Projects => self.projects == other.projects,
            Field::IsLoadingProjects => self.is_loading_projects == other.is_loading_projects,
            Field::ProjectsError => self.projects_error == other.projects_error,
            Field::SelectedProjectRoot => {
                self.selected_project_root == other.selected_project_root
            }
            Field::SelectedTargetNames => {
                self.selected_target_names == other.selected_target_names
            }
            Field::Builds => self.builds == other.builds,
            Field::LogEntries => {
                self.logs.epoch() == other.logs.epoch() && self.logs.len() == other.logs.len()
            }
            Field::LogCounts => self.log_counts == other.log_counts,
            Field::LogTotal => self.log_total == other.log_total,
            Field::LogHasMore => self.log_has_more == other.log_has_more,
            Field::LogFilter => self.log_filter == other.log_filter,
            Field::BuildSummary => self.build_summary == other.build_summary,
            Field::Problems => self.problems == other.problems,
            Field::IsLoadingProblems => self.is_loading_problems == other.is_loading_problems,
            Field::InstallingPackages => self.installing_packages == other.installing_packages,
            Field::Connection => self.connection == other.connection,
        }
    }

    /// Copy one field from `current` into this (shadow) state.
    pub fn adopt_field(&mut self, current: &AppState, field: Field) {
        match field {
            Field::Projects => self.projects = current.projects.clone(),
            Field::IsLoadingProjects => self.is_loading_projects = current.is_loading_projects,
            Field::ProjectsError => self.projects_error = current.projects_error.clone(),
            Field::SelectedProjectRoot => {
                self.selected_project_root = current.selected_project_root.clone()
            }
            Field::SelectedTargetNames => {
                self.selected_target_names = current.selected_target_names.clone()
            }
            Field::Builds => self.builds = current.builds.clone(),
            Field::LogEntries => self.logs.advance_to(&current.logs),
            Field::LogCounts => self.log_counts = current.log_counts,
            Field::LogTotal => self.log_total = current.log_total,
            Field::LogHasMore => self.log_has_more = current.log_has_more,
            Field::LogFilter => self.log_filter = current.log_filter.clone(),
            Field::BuildSummary => self.build_summary = current.build_summary.clone(),
            Field::Problems => self.problems = current.problems.clone(),
            Field::IsLoadingProblems => self.is_loading_problems = current.is_loading_problems,
            Field::InstallingPackages => {
                self.installing_packages = current.installing_packages.clone()
            }
            Field::Connection => self.connection = current.connection.clone(),
        }
    }

    /// Full snapshot with the log sequence cut to its most recent `log_limit`
    /// entries.
    pub fn snapshot(&self, log_limit: usize) -> Snapshot {
        let mut shadow = self.clone();
        shadow.logs = self.logs.tail(log_limit);
        let mut data = Map::new();
        for field in Field::ALL {
            data.insert(field.as_str().to_string(), shadow.field_value(field));
        }
        Snapshot {
            data,
            truncated: shadow.logs.pending_head() > 0,
            shadow,
        }
    }

    /// Head entries a truncated shadow is still owed, if it is on the current
    /// epoch.
    pub fn backfill_for(&self, shadow: &AppState) -> Option<&[Arc<LogEntry>]> {
        let owed = shadow.logs.pending_head();
        if owed == 0 || shadow.logs.epoch() != self.logs.epoch() {
            return None;
        }
        self.logs.entries().get(..owed)
    }

    /// Deliver a backfilled head into this (shadow) state.
    pub fn fill_log_head(&mut self, head: &[Arc<LogEntry>]) -> bool {
        self.logs.fill_head(head)
    }

    pub fn select_project(&mut self, project_root: Option<String>) -> Vec<Field> {
        if self.selected_project_root == project_root {
            return Vec::new();
        }
        self.selected_project_root = project_root;
        let mut dirty = vec![Field::SelectedProjectRoot];
        if !self.selected_target_names.is_empty() {
            self.selected_target_names.clear();
            dirty.push(Field::SelectedTargetNames);
        }
        dirty
    }

    pub fn toggle_target(&mut self, target: &str) -> Vec<Field> {
        if let Some(pos) = self.selected_target_names.iter().position(|t| t == target) {
            self.selected_target_names.remove(pos);
        } else {
            self.selected_target_names.push(target.to_string());
        }
        vec![Field::SelectedTargetNames]
    }

    pub fn set_log_filter(&mut self, filter: LogFilter) -> Vec<Field> {
        if self.log_filter == filter {
            return Vec::new();
        }
        self.log_filter = filter;
        vec![Field::LogFilter]
    }

    pub fn set_projects_loading(&mut self, loading: bool) -> Vec<Field> {
        if self.is_loading_projects == loading {
            return Vec::new();
        }
        self.is_loading_projects = loading;
        vec![Field::IsLoadingProjects]
    }

    pub fn set_projects(&mut self, result: Result<Vec<Project>, String>) -> Vec<Field> {
        let mut dirty = self.set_projects_loading(false);
        match result {
            Ok(projects) => {
                if self.projects != projects {
                    self.projects = projects;
                    dirty.push(Field::Projects);
                }
                if self.projects_error.take().is_some() {
                    dirty.push(Field::ProjectsError);
                }
            }
            Err(message) => {
                self.projects_error = Some(message);
                dirty.push(Field::ProjectsError);
            }
        }
        dirty
    }

    pub fn set_problems_loading(&mut self, loading: bool) -> Vec<Field> {
        if self.is_loading_problems == loading {
            return Vec::new();
        }
        self.is_loading_problems = loading;
        vec![Field::IsLoadingProblems]
    }

    pub fn set_problems(&mut self, problems: Vec<Problem>) -> Vec<Field> {
        let mut dirty = self.set_problems_loading(false);
        if self.problems != problems {
            self.problems = problems;
            dirty.push(Field::Problems);
        }
        dirty
    }

    pub fn set_build_summary(&mut self, summary: Value) -> Vec<Field> {
        if self.build_summary.as_ref() == Some(&summary) {
            return Vec::new();
        }
        self.build_summary = Some(summary);
        vec![Field::BuildSummary]
    }

    pub fn mark_installing(&mut self, identifier: &str) -> Vec<Field> {
        if self.installing_packages.iter().any(|p| p == identifier) {
            return Vec::new();
        }
        self.installing_packages.push(identifier.to_string());
        vec![Field::InstallingPackages]
    }

    pub fn clear_installing(&mut self, identifier: &str) -> Vec<Field> {
        let before = self.installing_packages.len();
        self.installing_packages.retain(|p| p != identifier);
        if self.installing_packages.len() == before {
            return Vec::new();
        }
        vec![Field::InstallingPackages]
    }

    pub fn update_connection(&mut self, update: impl FnOnce(&mut ConnectionInfo)) -> Vec<Field> {
        let before = self.connection.clone();
        update(&mut self.connection);
        if self.connection == before {
            return Vec::new();
        }
        vec![Field::Connection]
    }
}
