use crate::upstream::UpstreamError;
use dash_core::state::{AppState, Field};
use dash_core::translate::Followup;
use dash_core::wire::ActionRequest;
use dash_core::{LogFilter, LogLevel, Problem, Project};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("unknown action: {0}")]
    Unknown(String),
    #[error("{action}: missing parameter '{param}'")]
    MissingParam {
        action: &'static str,
        param: &'static str,
    },
    #[error("{action}: invalid parameter '{param}': {message}")]
    InvalidParam {
        action: &'static str,
        param: &'static str,
        message: String,
    },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Partial log filter. Empty strings clear `buildId` and `stage`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPatch {
    #[serde(default)]
    pub build_id: Option<String>,
    #[serde(default)]
    pub levels: Option<Vec<LogLevel>>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
}

impl FilterPatch {
    fn apply(self, filter: &mut LogFilter) {
        if let Some(build_id) = self.build_id {
            filter.build_id = non_empty(build_id);
        }
        if let Some(mut levels) = self.levels {
            levels.sort();
            levels.dedup();
            filter.levels = levels;
        }
        if let Some(search) = self.search {
            filter.search = search;
        }
        if let Some(stage) = self.stage {
            filter.stage = non_empty(stage);
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.trim().is_empty()).then_some(value)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SelectProject {
        project_root: Option<String>,
    },
    ToggleTarget {
        target: String,
    },
    SetLogFilter(FilterPatch),
    ToggleLogLevel {
        level: LogLevel,
    },
    SetLogSearchQuery {
        query: String,
    },
    RefreshProjects,
    RefreshProblems,
    Build {
        project_root: String,
        targets: Vec<String>,
    },
    CancelBuild {
        build_id: String,
    },
    InstallPackage {
        project_root: String,
        identifier: String,
        version: Option<String>,
    },
}

impl Action {
    pub fn parse(request: &ActionRequest) -> Result<Self, ActionError> {
        match request.action.as_str() {
            "selectProject" => Ok(Action::SelectProject {
                project_root: request
                    .str_param("projectRoot")
                    .map(str::to_string)
                    .and_then(non_empty),
            }),
            "toggleTarget" => Ok(Action::ToggleTarget {
                target: required(request, "toggleTarget", "target")?,
            }),
            "setLogFilter" => {
                let params = match &request.params {
                    Value::Null => json!({}),
                    other => other.clone(),
                };
                serde_json::from_value(params)
                    .map(Action::SetLogFilter)
                    .map_err(|err| ActionError::InvalidParam {
                        action: "setLogFilter",
                        param: "params",
                        message: err.to_string(),
                    })
            }
            "toggleLogLevel" => {
                let raw = required(request, "toggleLogLevel", "level")?;
                let level = raw
                    .parse::<LogLevel>()
                    .map_err(|message| ActionError::InvalidParam {
                        action: "toggleLogLevel",
                        param: "level",
                        message,
                    })?;
                Ok(Action::ToggleLogLevel { level })
            }
            "setLogSearchQuery" => Ok(Action::SetLogSearchQuery {
                query: request.str_param("query").unwrap_or_default().to_string(),
            }),
            "refreshProjects" => Ok(Action::RefreshProjects),
            "refreshProblems" => Ok(Action::RefreshProblems),
            "build" => Ok(Action::Build {
                project_root: required(request, "build", "projectRoot")?,
                targets: string_list(request.params.get("targets")),
            }),
            "cancelBuild" => Ok(Action::CancelBuild {
                build_id: required(request, "cancelBuild", "buildId")?,
            }),
            "installPackage" => Ok(Action::InstallPackage {
                project_root: required(request, "installPackage", "projectRoot")?,
                identifier: required(request, "installPackage", "identifier")?,
                version: request.str_param("version").map(str::to_string),
            }),
            other => Err(ActionError::Unknown(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::SelectProject { .. } => "selectProject",
            Action::ToggleTarget { .. } => "toggleTarget",
            Action::SetLogFilter(_) => "setLogFilter",
            Action::ToggleLogLevel { .. } => "toggleLogLevel",
            Action::SetLogSearchQuery { .. } => "setLogSearchQuery",
            Action::RefreshProjects => "refreshProjects",
            Action::RefreshProblems => "refreshProblems",
            Action::Build { .. } => "build",
            Action::CancelBuild { .. } => "cancelBuild",
            Action::InstallPackage { .. } => "installPackage",
        }
    }
}

fn required(
    request: &ActionRequest,
    action: &'static str,
    param: &'static str,
) -> Result<String, ActionError> {
    request
        .str_param(param)
        .map(str::to_string)
        .and_then(non_empty)
        .ok_or(ActionError::MissingParam { action, param })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// How a producer answer is folded back into state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Projects,
    Problems,
    Summary,
    Install { identifier: String },
    Acknowledge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub method: &'static str,
    pub params: Value,
    pub completion: Completion,
}

/// Result of running an action against the state.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub dirty: Vec<Field>,
    /// The log filter changed and the producer subscription must follow.
    pub refilter: bool,
    pub remote: Option<RemoteCall>,
}

impl Plan {
    fn local(dirty: Vec<Field>) -> Self {
        Self {
            dirty,
            refilter: false,
            remote: None,
        }
    }

    fn filter(dirty: Vec<Field>) -> Self {
        Self {
            refilter: !dirty.is_empty(),
            dirty,
            remote: None,
        }
    }

    fn remote(dirty: Vec<Field>, call: RemoteCall) -> Self {
        Self {
            dirty,
            refilter: false,
            remote: Some(call),
        }
    }
}

/// Apply the local part of `action` and describe any producer call it needs.
pub fn plan(action: Action, state: &mut AppState, workspace: &[String]) -> Plan {
    match action {
        Action::SelectProject { project_root } => Plan::local(state.select_project(project_root)),
        Action::ToggleTarget { target } => Plan::local(state.toggle_target(&target)),
        Action::SetLogFilter(patch) => {
            let mut filter = state.log_filter().clone();
            patch.apply(&mut filter);
            Plan::filter(refilter(state, filter))
        }
        Action::ToggleLogLevel { level } => {
            let mut filter = state.log_filter().clone();
            filter.toggle_level(level);
            Plan::filter(refilter(state, filter))
        }
        Action::SetLogSearchQuery { query } => {
            let mut filter = state.log_filter().clone();
            filter.search = query;
            Plan::filter(refilter(state, filter))
        }
        Action::RefreshProjects => Plan::remote(
            state.set_projects_loading(true),
            discover_projects(workspace),
        ),
        Action::RefreshProblems => Plan::remote(
            state.set_problems_loading(true),
            get_problems(state.selected_project_root()),
        ),
        Action::Build {
            project_root,
            targets,
        } => {
            let targets = if targets.is_empty() {
                state.selected_target_names().to_vec()
            } else {
                targets
            };
            Plan::remote(
                Vec::new(),
                RemoteCall {
                    method: "start_build",
                    params: json!({"projectRoot": project_root, "targets": targets}),
                    completion: Completion::Acknowledge,
                },
            )
        }
        Action::CancelBuild { build_id } => Plan::remote(
            Vec::new(),
            RemoteCall {
                method: "cancel_build",
                params: json!({"buildId": build_id}),
                completion: Completion::Acknowledge,
            },
        ),
        Action::InstallPackage {
            project_root,
            identifier,
            version,
        } => Plan::remote(
            state.mark_installing(&identifier),
            RemoteCall {
                method: "install_package",
                params: json!({
                    "projectRoot": project_root,
                    "identifier": identifier,
                    "version": version,
                }),
                completion: Completion::Install { identifier },
            },
        ),
    }
}

// A new query restarts pagination.
fn refilter(state: &mut AppState, mut filter: LogFilter) -> Vec<Field> {
    filter.after_id = None;
    state.set_log_filter(filter)
}

fn discover_projects(workspace: &[String]) -> RemoteCall {
    RemoteCall {
        method: "discover_projects",
        params: json!({"paths": workspace}),
        completion: Completion::Projects,
    }
}

fn get_problems(project_root: Option<&str>) -> RemoteCall {
    RemoteCall {
        method: "get_problems",
        params: json!({"projectRoot": project_root}),
        completion: Completion::Problems,
    }
}

/// Producer call for a translator follow-up, with its local part applied.
pub fn followup(followup: Followup, state: &mut AppState, workspace: &[String]) -> Plan {
    match followup {
        Followup::FetchSummary { project_root } => {
            let project_root =
                project_root.or_else(|| state.selected_project_root().map(str::to_string));
            Plan::remote(
                Vec::new(),
                RemoteCall {
                    method: "get_summary",
                    params: json!({"projectRoot": project_root}),
                    completion: Completion::Summary,
                },
            )
        }
        Followup::FetchProblems => Plan::remote(
            state.set_problems_loading(true),
            get_problems(state.selected_project_root()),
        ),
        Followup::DiscoverProjects => Plan::remote(
            state.set_projects_loading(true),
            discover_projects(workspace),
        ),
    }
}

/// Fold a producer answer into state. Returns the dirtied fields.
pub fn complete(
    completion: &Completion,
    result: &Result<Value, UpstreamError>,
    state: &mut AppState,
) -> Vec<Field> {
    match completion {
        Completion::Projects => {
            let parsed = match result {
                Ok(value) => list_from::<Project>(value, "projects"),
                Err(err) => Err(err.to_string()),
            };
            state.set_projects(parsed)
        }
        Completion::Problems => match result.as_ref().map(|v| list_from::<Problem>(v, "problems")) {
            Ok(Ok(problems)) => state.set_problems(problems),
            _ => state.set_problems_loading(false),
        },
        Completion::Summary => match result {
            Ok(summary) if !summary.is_null() => state.set_build_summary(summary.clone()),
            _ => Vec::new(),
        },
        Completion::Install { identifier } => state.clear_installing(identifier),
        Completion::Acknowledge => Vec::new(),
    }
}

/// Accept either a bare list or an object carrying the list under `key`.
fn list_from<T: serde::de::DeserializeOwned>(value: &Value, key: &str) -> Result<Vec<T>, String> {
    let list = value.get(key).unwrap_or(value);
    serde_json::from_value(list.clone()).map_err(|err| format!("invalid {key} payload: {err}"))
}
