//! Event translators: map one producer event onto the canonical state and
//! report which fields changed.

use crate::events::{
    BuildCompleted, BuildStageUpdate, BuildStarted, BuildsSnapshot, LogDelivery, LogMode,
    ProducerEvent, RefreshSignal,
};
use crate::state::{AppState, Field, LogSequence};
use crate::{Build, BuildStatus, LogCounts, LogEntry, Stage, StageList};
use std::collections::{HashMap, HashSet};

/// Work an event asks for beyond the state change itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    FetchSummary { project_root: Option<String> },
    FetchProblems,
    DiscoverProjects,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Translation {
    pub dirty: Vec<Field>,
    pub followups: Vec<Followup>,
}

impl Translation {
    fn mark(&mut self, field: Field) {
        if !self.dirty.contains(&field) {
            self.dirty.push(field);
        }
    }

    fn mark_all(&mut self, fields: Vec<Field>) {
        for field in fields {
            self.mark(field);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.followups.is_empty()
    }
}

pub fn apply(state: &mut AppState, event: ProducerEvent) -> Translation {
    match event {
        ProducerEvent::BuildStarted(event) => build_started(state, event),
        ProducerEvent::BuildStage(event) => build_stage(state, event),
        ProducerEvent::BuildCompleted(event) => build_completed(state, event),
        ProducerEvent::BuildsSnapshot(event) => builds_snapshot(state, event),
        ProducerEvent::Logs(event) => deliver_logs(state, event),
        ProducerEvent::SummaryChanged(signal) => summary_changed(signal),
        ProducerEvent::ProblemsChanged(_) => problems_changed(state),
        ProducerEvent::ProjectsChanged(_) => projects_changed(state),
    }
}

// A restart under an existing id supersedes the old run in its slot.
fn build_started(state: &mut AppState, event: BuildStarted) -> Translation {
    let build = Build {
        build_id: event.build_id,
        name: event.name,
        display_name: event.display_name,
        project_root: event.project_root,
        target: event.target,
        status: BuildStatus::Building,
        started_at: event.started_at,
        stages: StageList::from_stages(event.stages),
        total_stages: event.total_stages,
        ..Build::default()
    };
    match state.builds.iter_mut().find(|b| b.build_id == build.build_id) {
        Some(existing) => *existing = build,
        None => state.builds.push(build),
    }
    let mut out = Translation::default();
    out.mark(Field::Builds);
    out
}

fn build_slot(state: &mut AppState, build_id: &str) -> usize {
    if let Some(pos) = state.builds.iter().position(|b| b.build_id == build_id) {
        return pos;
    }
    // Missed the start event (e.g. across a reconnect).
    state.builds.push(Build {
        build_id: build_id.to_string(),
        name: build_id.to_string(),
        status: BuildStatus::Building,
        ..Build::default()
    });
    state.builds.len() - 1
}

fn build_stage(state: &mut AppState, event: BuildStageUpdate) -> Translation {
    let before = state.builds.len();
    let slot = build_slot(state, &event.build_id);
    let build = &mut state.builds[slot];
    let mut changed = slot >= before;

    if let Some(stages) = event.stages {
        changed |= build.stages.reconcile(stages);
    }
    if let Some(stage) = event.stage {
        changed |= build.stages.set(event.index, stage);
    }
    let reached_end = build
        .stages
        .get(event.index)
        .is_some_and(|stage| stage.status.is_finished());
    if reached_end {
        changed |= build.stages.promote_pending_before(event.index);
    }
    if build.status == BuildStatus::Queued {
        build.status = BuildStatus::Building;
        changed = true;
    }
    if let Some(elapsed) = event.elapsed_seconds {
        if build.elapsed_seconds != elapsed {
            build.elapsed_seconds = elapsed;
            changed = true;
        }
    }

    let mut out = Translation::default();
    if changed {
        out.mark(Field::Builds);
    }
    out
}

fn build_completed(state: &mut AppState, event: BuildCompleted) -> Translation {
    let slot = build_slot(state, &event.build_id);
    let build = &mut state.builds[slot];

    build.status = event
        .status
        .filter(BuildStatus::is_terminal)
        .unwrap_or_else(|| BuildStatus::from_return_code(event.return_code, event.warnings));
    build.return_code = Some(event.return_code);
    build.warnings = event.warnings;
    build.errors = event.errors;
    build.error = event.error;
    if let Some(elapsed) = event.elapsed_seconds {
        build.elapsed_seconds = elapsed;
    }
    // Authoritative final list wins; otherwise keep what the stage events built.
    if let Some(stages) = event.stages {
        build.stages.reconcile(stages);
    }

    let mut out = Translation::default();
    out.mark(Field::Builds);
    out
}

fn builds_snapshot(state: &mut AppState, event: BuildsSnapshot) -> Translation {
    let mut previous: HashMap<String, Build> = state
        .builds
        .iter()
        .map(|b| (b.build_id.clone(), b.clone()))
        .collect();
    let merged: Vec<Build> = event
        .builds
        .into_iter()
        .map(|incoming| match previous.remove(&incoming.build_id) {
            Some(existing) => merge_build(existing, incoming),
            None => incoming,
        })
        .collect();

    let mut out = Translation::default();
    if merged != state.builds {
        state.builds = merged;
        out.mark(Field::Builds);
    }
    out
}

fn merge_build(existing: Build, incoming: Build) -> Build {
    let mut stages = existing.stages;
    let incoming_stages: Vec<Stage> = incoming.stages.iter().map(|s| (**s).clone()).collect();
    stages.reconcile(incoming_stages);
    Build { stages, ..incoming }
}

fn deliver_logs(state: &mut AppState, delivery: LogDelivery) -> Translation {
    let mut out = Translation::default();
    let counts_before = state.log_counts;

    match delivery.mode {
        LogMode::Replace => {
            state.log_counts = delivery
                .counts
                .unwrap_or_else(|| LogCounts::tally(&delivery.entries));
            state.logs.replace(delivery.entries);
            out.mark(Field::LogEntries);
        }
        LogMode::Incremental => {
            let fresh = unseen_entries(&state.logs, delivery.entries);
            if !fresh.is_empty() {
                out.mark(Field::LogEntries);
            }
            for entry in fresh {
                state.log_counts.record(entry.level);
                state.logs.push(entry);
            }
            if let Some(counts) = delivery.counts {
                state.log_counts = counts;
            }
        }
    }
    if state.log_counts != counts_before {
        out.mark(Field::LogCounts);
    }

    let total = Some(delivery.total.unwrap_or(state.logs.len() as u64));
    if state.log_total != total {
        state.log_total = total;
        out.mark(Field::LogTotal);
    }
    if let Some(has_more) = delivery.has_more {
        if state.log_has_more != has_more {
            state.log_has_more = has_more;
            out.mark(Field::LogHasMore);
        }
    }
    out
}

type TextKey<'a> = (&'a str, &'a str, Option<&'a str>, &'a str);

fn text_key(entry: &LogEntry) -> TextKey<'_> {
    (
        entry.timestamp.as_str(),
        entry.message.as_str(),
        entry.stage.as_deref(),
        entry.logger_name.as_str(),
    )
}

/// Drop incoming entries already held.
///
/// Producer row ids are authoritative when present and checked against the
/// whole sequence and the batch itself. Entries without one match on
/// timestamp, message, stage and logger together, within a window that
/// reaches back to the last held copy of the first such incoming entry.
fn unseen_entries(existing: &LogSequence, incoming: Vec<LogEntry>) -> Vec<LogEntry> {
    let held = existing.entries();
    let mut start = held.len() - held.len().min(incoming.len());
    if let Some(first) = incoming.iter().find(|e| e.id.is_none()) {
        let key = text_key(first);
        if let Some(pos) = held
            .iter()
            .rposition(|e| e.id.is_none() && text_key(e) == key)
        {
            start = start.min(pos);
        }
    }
    let texts: HashSet<TextKey<'_>> = held[start..]
        .iter()
        .filter(|e| e.id.is_none())
        .map(|e| text_key(e))
        .collect();

    let mut batch_ids = HashSet::new();
    incoming
        .into_iter()
        .filter(|entry| match entry.id {
            Some(id) => !existing.contains_id(id) && batch_ids.insert(id),
            None => !texts.contains(&text_key(entry)),
        })
        .collect()
}

fn summary_changed(signal: RefreshSignal) -> Translation {
    Translation {
        dirty: Vec::new(),
        followups: vec![Followup::FetchSummary {
            project_root: signal.project_root,
        }],
    }
}

fn problems_changed(state: &mut AppState) -> Translation {
    let mut out = Translation::default();
    out.mark_all(state.set_problems_loading(true));
    out.followups.push(Followup::FetchProblems);
    out
}

fn projects_changed(state: &mut AppState) -> Translation {
    let mut out = Translation::default();
    out.mark_all(state.set_projects_loading(true));
    out.followups.push(Followup::DiscoverProjects);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LogLevel, StageStatus};
    use std::sync::Arc;

    fn stage(name: &str, status: StageStatus) -> Stage {
        Stage {
            name: name.to_string(),
            stage_id: name.to_string(),
            status,
            ..Stage::default()
        }
    }

    fn started(state: &mut AppState, build_id: &str, stages: Vec<Stage>) -> Translation {
        apply(
            state,
            ProducerEvent::BuildStarted(BuildStarted {
                build_id: build_id.to_string(),
                name: "default".to_string(),
                display_name: None,
                project_root: Some("/ws/demo".to_string()),
                target: Some("default".to_string()),
                started_at: Some(1_700_000_000.0),
                stages,
                total_stages: Some(3),
            }),
        )
    }

    fn log(id: Option<u64>, ts: &str, message: &str) -> LogEntry {
        LogEntry {
            id,
            timestamp: ts.to_string(),
            level: LogLevel::Info,
            logger_name: "atopile".to_string(),
            stage: Some("compile".to_string()),
            message: message.to_string(),
            build_id: Some("b-1".to_string()),
            traceback: None,
        }
    }

    fn incremental(entries: Vec<LogEntry>) -> ProducerEvent {
        ProducerEvent::Logs(LogDelivery {
            mode: LogMode::Incremental,
            entries,
            total: None,
            has_more: None,
            counts: None,
        })
    }

    #[test]
    fn build_started_creates_running_build() {
        let mut state = AppState::default();
        let out = started(&mut state, "b-1", Vec::new());
        assert_eq!(out.dirty, vec![Field::Builds]);
        assert_eq!(state.builds().len(), 1);
        assert_eq!(state.builds()[0].status, BuildStatus::Building);
    }

    #[test]
    fn restart_with_same_id_supersedes_in_place() {
        let mut state = AppState::default();
        started(&mut state, "b-1", Vec::new());
        started(&mut state, "b-2", Vec::new());
        apply(
            &mut state,
            ProducerEvent::BuildCompleted(BuildCompleted {
                build_id: "b-1".to_string(),
                return_code: 1,
                status: None,
                warnings: 0,
                errors: 1,
                elapsed_seconds: Some(3.5),
                stages: None,
                error: Some("boom".to_string()),
            }),
        );
        started(&mut state, "b-1", vec![stage("init", StageStatus::Pending)]);

        assert_eq!(state.builds().len(), 2);
        assert_eq!(state.builds()[0].build_id, "b-1");
        assert_eq!(state.builds()[0].status, BuildStatus::Building);
        assert_eq!(state.builds()[0].error, None);
        assert_eq!(state.builds()[0].stages.len(), 1);
    }

    #[test]
    fn stage_update_preserves_identity_of_untouched_stages() {
        let mut state = AppState::default();
        started(
            &mut state,
            "b-1",
            vec![
                stage("a", StageStatus::Pending),
                stage("b", StageStatus::Pending),
                stage("c", StageStatus::Pending),
            ],
        );
        let before: Vec<Arc<Stage>> = state.builds()[0].stages.iter().cloned().collect();

        let out = apply(
            &mut state,
            ProducerEvent::BuildStage(BuildStageUpdate {
                build_id: "b-1".to_string(),
                index: 1,
                stage: None,
                stages: Some(vec![
                    stage("a", StageStatus::Pending),
                    stage("b", StageStatus::Running),
                    stage("c", StageStatus::Pending),
                ]),
                elapsed_seconds: None,
            }),
        );
        assert_eq!(out.dirty, vec![Field::Builds]);

        let after = &state.builds()[0].stages;
        assert!(Arc::ptr_eq(&before[0], after.get(0).expect("a")));
        assert!(Arc::ptr_eq(&before[2], after.get(2).expect("c")));
        let b = after.get(1).expect("b");
        assert!(!Arc::ptr_eq(&before[1], b));
        assert_eq!(b.status, StageStatus::Running);
    }

    #[test]
    fn stage_update_with_new_length_replaces_list() {
        let mut state = AppState::default();
        started(&mut state, "b-1", vec![stage("a", StageStatus::Pending)]);
        apply(
            &mut state,
            ProducerEvent::BuildStage(BuildStageUpdate {
                build_id: "b-1".to_string(),
                index: 0,
                stage: None,
                stages: Some(vec![
                    stage("a", StageStatus::Running),
                    stage("b", StageStatus::Pending),
                ]),
                elapsed_seconds: Some(0.4),
            }),
        );
        let build = state.build("b-1").expect("build");
        assert_eq!(build.stages.len(), 2);
        assert_eq!(build.elapsed_seconds, 0.4);
    }

    #[test]
    fn finished_stage_promotes_earlier_pending_stages() {
        let mut state = AppState::default();
        started(
            &mut state,
            "b-1",
            vec![
                stage("a", StageStatus::Pending),
                stage("b", StageStatus::Running),
                stage("c", StageStatus::Pending),
                stage("d", StageStatus::Pending),
            ],
        );
        apply(
            &mut state,
            ProducerEvent::BuildStage(BuildStageUpdate {
                build_id: "b-1".to_string(),
                index: 2,
                stage: Some(stage("c", StageStatus::Success)),
                stages: None,
                elapsed_seconds: None,
            }),
        );
        let statuses: Vec<StageStatus> = state.builds()[0]
            .stages
            .iter()
            .map(|s| s.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                StageStatus::Success,
                StageStatus::Running,
                StageStatus::Success,
                StageStatus::Pending,
            ]
        );
    }

    #[test]
    fn stage_event_for_unknown_build_creates_it() {
        let mut state = AppState::default();
        let out = apply(
            &mut state,
            ProducerEvent::BuildStage(BuildStageUpdate {
                build_id: "late".to_string(),
                index: 0,
                stage: Some(stage("init", StageStatus::Running)),
                stages: None,
                elapsed_seconds: None,
            }),
        );
        assert_eq!(out.dirty, vec![Field::Builds]);
        assert_eq!(state.build("late").map(|b| b.stages.len()), Some(1));
    }

    #[test]
    fn stage_events_out_of_order_keep_their_positions() {
        let mut state = AppState::default();
        let update = |index: usize, name: &str, status: StageStatus| {
            ProducerEvent::BuildStage(BuildStageUpdate {
                build_id: "late".to_string(),
                index,
                stage: Some(stage(name, status)),
                stages: None,
                elapsed_seconds: None,
            })
        };
        apply(&mut state, update(2, "layout", StageStatus::Success));
        apply(&mut state, update(0, "compile", StageStatus::Success));

        let stages = &state.build("late").expect("build").stages;
        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["compile", "", "layout"]);
        // The finished stage at index 2 promoted the gap before it.
        assert_eq!(stages.get(1).map(|s| s.status), Some(StageStatus::Success));
    }

    #[test]
    fn completion_prefers_authoritative_stages() {
        let mut state = AppState::default();
        started(&mut state, "b-1", vec![stage("a", StageStatus::Running)]);
        apply(
            &mut state,
            ProducerEvent::BuildCompleted(BuildCompleted {
                build_id: "b-1".to_string(),
                return_code: 0,
                status: None,
                warnings: 2,
                errors: 0,
                elapsed_seconds: Some(9.0),
                stages: Some(vec![
                    stage("a", StageStatus::Success),
                    stage("b", StageStatus::Warning),
                ]),
                error: None,
            }),
        );
        let build = state.build("b-1").expect("build");
        assert_eq!(build.status, BuildStatus::Warning);
        assert_eq!(build.stages.len(), 2);
    }

    #[test]
    fn completion_without_stages_keeps_live_list() {
        let mut state = AppState::default();
        started(&mut state, "b-1", vec![stage("a", StageStatus::Success)]);
        let live = Arc::clone(state.builds()[0].stages.get(0).expect("a"));
        apply(
            &mut state,
            ProducerEvent::BuildCompleted(BuildCompleted {
                build_id: "b-1".to_string(),
                return_code: 0,
                status: Some(BuildStatus::Cancelled),
                warnings: 0,
                errors: 0,
                elapsed_seconds: None,
                stages: None,
                error: None,
            }),
        );
        let build = state.build("b-1").expect("build");
        assert_eq!(build.status, BuildStatus::Cancelled);
        assert!(Arc::ptr_eq(&live, build.stages.get(0).expect("a")));
    }

    #[test]
    fn builds_snapshot_keeps_stage_identity_for_known_builds() {
        let mut state = AppState::default();
        started(&mut state, "b-1", vec![stage("a", StageStatus::Success)]);
        let live = Arc::clone(state.builds()[0].stages.get(0).expect("a"));
        let mut incoming = state.builds()[0].clone();
        incoming.elapsed_seconds = 12.0;
        let out = apply(
            &mut state,
            ProducerEvent::BuildsSnapshot(BuildsSnapshot {
                builds: vec![incoming],
            }),
        );
        assert_eq!(out.dirty, vec![Field::Builds]);
        assert_eq!(state.builds()[0].elapsed_seconds, 12.0);
        assert!(Arc::ptr_eq(&live, state.builds()[0].stages.get(0).expect("a")));

        let unchanged = state.builds().to_vec();
        let out = apply(
            &mut state,
            ProducerEvent::BuildsSnapshot(BuildsSnapshot { builds: unchanged }),
        );
        assert!(out.dirty.is_empty());
    }

    #[test]
    fn incremental_logs_skip_tail_duplicates() {
        let mut state = AppState::default();
        apply(
            &mut state,
            incremental(vec![
                log(Some(1), "t1", "one"),
                log(Some(2), "t2", "two"),
            ]),
        );
        let out = apply(
            &mut state,
            incremental(vec![
                log(Some(2), "t2", "two"),
                log(Some(3), "t3", "three"),
            ]),
        );
        assert_eq!(
            out.dirty,
            vec![Field::LogEntries, Field::LogCounts, Field::LogTotal]
        );
        assert_eq!(state.logs().len(), 3);
        assert_eq!(state.log_counts().info, 3);
    }

    #[test]
    fn entries_without_ids_match_on_text_key() {
        let mut state = AppState::default();
        apply(&mut state, incremental(vec![log(None, "t1", "same")]));
        let mut other_stage = log(None, "t1", "same");
        other_stage.stage = Some("picker".to_string());
        apply(
            &mut state,
            incremental(vec![log(None, "t1", "same"), other_stage]),
        );
        assert_eq!(state.logs().len(), 2);
    }

    #[test]
    fn duplicate_only_delivery_marks_nothing() {
        let mut state = AppState::default();
        apply(&mut state, incremental(vec![log(Some(1), "t1", "one")]));
        let out = apply(&mut state, incremental(vec![log(Some(1), "t1", "one")]));
        assert!(out.dirty.is_empty());
    }

    #[test]
    fn redelivered_middle_range_is_not_appended_again() {
        let mut state = AppState::default();
        apply(
            &mut state,
            incremental((1..=10).map(|i| log(Some(i), &format!("t{i}"), "line")).collect()),
        );
        apply(
            &mut state,
            incremental(
                [4, 5, 6, 11, 11]
                    .into_iter()
                    .map(|i| log(Some(i), &format!("t{i}"), "line"))
                    .collect(),
            ),
        );
        let ids: Vec<Option<u64>> = state.logs().entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, (1..=11).map(Some).collect::<Vec<_>>());
        assert_eq!(state.log_counts().info, 11);
    }

    #[test]
    fn redelivered_middle_range_without_ids_is_not_appended_again() {
        let mut state = AppState::default();
        apply(
            &mut state,
            incremental((1..=10).map(|i| log(None, &format!("t{i}"), &format!("m{i}"))).collect()),
        );
        apply(
            &mut state,
            incremental(vec![
                log(None, "t3", "m3"),
                log(None, "t4", "m4"),
                log(None, "t11", "m11"),
            ]),
        );
        let messages: Vec<&str> = state
            .logs()
            .entries()
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(messages.len(), 11);
        assert_eq!(messages.last(), Some(&"m11"));
    }

    #[test]
    fn replacement_forgets_previous_ids() {
        let mut state = AppState::default();
        apply(&mut state, incremental(vec![log(Some(1), "t1", "one")]));
        apply(
            &mut state,
            ProducerEvent::Logs(LogDelivery {
                mode: LogMode::Replace,
                entries: vec![log(Some(7), "t7", "seven")],
                total: None,
                has_more: None,
                counts: None,
            }),
        );
        assert!(!state.logs().contains_id(1));
        apply(&mut state, incremental(vec![log(Some(1), "t1", "one")]));
        assert_eq!(state.logs().len(), 2);
    }

    #[test]
    fn replace_resets_sequence_and_counts() {
        let mut state = AppState::default();
        apply(
            &mut state,
            incremental((1..=4).map(|i| log(Some(i), "t", &format!("m{i}"))).collect()),
        );
        let epoch = state.logs().epoch();
        let mut warning = log(Some(10), "t10", "filtered");
        warning.level = LogLevel::Warning;
        let out = apply(
            &mut state,
            ProducerEvent::Logs(LogDelivery {
                mode: LogMode::Replace,
                entries: vec![warning],
                total: Some(40),
                has_more: Some(true),
                counts: None,
            }),
        );
        assert_eq!(state.logs().epoch(), epoch + 1);
        assert_eq!(state.logs().len(), 1);
        assert_eq!(state.log_counts().warning, 1);
        assert_eq!(state.log_counts().info, 0);
        assert!(out.dirty.contains(&Field::LogHasMore));
        assert!(out.dirty.contains(&Field::LogTotal));
    }

    #[test]
    fn refresh_signals_request_followups() {
        let mut state = AppState::default();
        let out = apply(
            &mut state,
            ProducerEvent::ProblemsChanged(RefreshSignal::default()),
        );
        assert_eq!(out.dirty, vec![Field::IsLoadingProblems]);
        assert_eq!(out.followups, vec![Followup::FetchProblems]);

        let out = apply(
            &mut state,
            ProducerEvent::SummaryChanged(RefreshSignal {
                project_root: Some("/ws/demo".to_string()),
            }),
        );
        assert!(out.dirty.is_empty());
        assert_eq!(
            out.followups,
            vec![Followup::FetchSummary {
                project_root: Some("/ws/demo".to_string())
            }]
        );
    }
}
