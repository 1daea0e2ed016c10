use crate::actions::{self, Action, ActionError, Completion, Plan, RemoteCall};
use crate::scheduler::Scheduler;
use crate::upstream::{log_subscription, BridgeEvent, UpstreamError, UpstreamHandle};
use chrono::Utc;
use dash_core::diff;
use dash_core::state::AppState;
use dash_core::translate;
use dash_core::wire::{
    encode_frame, ActionRequest, ActionResult, BackfillPayload, ClientMsg, OrderedFields,
    ServerMsg, StatePayload, UpdatePayload, MAX_OUTBOUND_FRAME_BYTES,
};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub producer_url: String,
    pub workspace: Vec<String>,
    pub debounce: Duration,
    pub snapshot_log_limit: usize,
    pub backfill_delay: Duration,
}

/// Client that asked for an action and is owed an `action_result`.
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub conn_id: String,
    pub action: String,
    pub request_id: Option<String>,
}

#[derive(Debug)]
pub enum EngineCommand {
    ClientConnected {
        conn_id: String,
        sender: mpsc::Sender<String>,
    },
    ClientDisconnected {
        conn_id: String,
        reason: &'static str,
    },
    ClientMessage {
        conn_id: String,
        message: ClientMsg,
    },
    Upstream(BridgeEvent),
    RemoteDone {
        origin: Option<Origin>,
        method: &'static str,
        completion: Completion,
        result: Result<Value, UpstreamError>,
    },
    BackfillDue {
        conn_id: String,
        epoch: u64,
    },
}

struct ClientSlot {
    sender: mpsc::Sender<String>,
    shadow: AppState,
}

/// Owns the canonical state and every client shadow.
///
/// All mutation happens inside `handle` and `flush`, both synchronous; the
/// only suspension points are in `run` between commands. Producer calls are
/// spawned and come back as `RemoteDone`.
pub struct Engine {
    config: EngineConfig,
    state: AppState,
    clients: HashMap<String, ClientSlot>,
    scheduler: Scheduler,
    upstream: UpstreamHandle,
    loopback: mpsc::Sender<EngineCommand>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        upstream: UpstreamHandle,
        loopback: mpsc::Sender<EngineCommand>,
    ) -> Self {
        Self {
            state: AppState::new(&config.producer_url),
            scheduler: Scheduler::new(config.debounce),
            clients: HashMap::new(),
            config,
            upstream,
            loopback,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        info!(event = "engine_start", debounce_ms = self.config.debounce.as_millis() as u64);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = self.scheduler.due() => {
                    self.flush();
                }
            }
        }
        info!(event = "engine_stop");
    }

    pub fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::ClientConnected { conn_id, sender } => {
                self.clients.insert(
                    conn_id.clone(),
                    ClientSlot {
                        sender,
                        shadow: AppState::default(),
                    },
                );
                info!(event = "client_registered", conn_id = %conn_id, clients = self.clients.len());
                self.send_snapshot(&conn_id);
            }
            EngineCommand::ClientDisconnected { conn_id, reason } => {
                if self.clients.remove(&conn_id).is_some() {
                    info!(event = "client_removed", conn_id = %conn_id, reason = reason);
                }
            }
            EngineCommand::ClientMessage { conn_id, message } => match message {
                ClientMsg::Ready => self.send_snapshot(&conn_id),
                ClientMsg::Action(request) => self.on_action(conn_id, request),
                ClientMsg::Perf(note) => {
                    info!(
                        event = "client_perf",
                        conn_id = %conn_id,
                        name = %note.name,
                        duration_ms = note.duration_ms.unwrap_or_default()
                    );
                }
            },
            EngineCommand::Upstream(event) => self.on_upstream(event),
            EngineCommand::RemoteDone {
                origin,
                method,
                completion,
                result,
            } => {
                if let Err(err) = &result {
                    warn!(event = "producer_request_failed", method = method, error = %err);
                }
                let dirty = actions::complete(&completion, &result, &mut self.state);
                self.scheduler.mark(dirty);
                if let Some(origin) = origin {
                    self.reply(&origin, result.map_err(ActionError::from));
                }
            }
            EngineCommand::BackfillDue { conn_id, epoch } => self.send_backfill(&conn_id, epoch),
        }
    }

    fn on_upstream(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Connected => {
                let since = Utc::now().to_rfc3339();
                let dirty = self.state.update_connection(|connection| {
                    connection.connected = true;
                    connection.reconnect_attempts = 0;
                    connection.connected_since = Some(since);
                });
                self.scheduler.mark(dirty);
                // Fresh producer: reload everything it owns.
                for followup in [
                    translate::Followup::DiscoverProjects,
                    translate::Followup::FetchProblems,
                    translate::Followup::FetchSummary { project_root: None },
                ] {
                    let plan = actions::followup(followup, &mut self.state, &self.config.workspace);
                    self.apply_plan(plan, None);
                }
            }
            BridgeEvent::Hello { version } => {
                info!(event = "producer_hello", version = ?version);
                let dirty = self
                    .state
                    .update_connection(|connection| connection.producer_version = version);
                self.scheduler.mark(dirty);
            }
            BridgeEvent::Disconnected { attempts } => {
                let dirty = self.state.update_connection(|connection| {
                    connection.connected = false;
                    connection.reconnect_attempts = attempts;
                    connection.connected_since = None;
                });
                self.scheduler.mark(dirty);
            }
            BridgeEvent::Event(event) => {
                let kind = event.kind();
                let translation = translate::apply(&mut self.state, event);
                debug!(
                    event = "producer_event",
                    kind = kind,
                    dirty = translation.dirty.len(),
                    followups = translation.followups.len()
                );
                self.scheduler.mark(translation.dirty);
                for followup in translation.followups {
                    let plan = actions::followup(followup, &mut self.state, &self.config.workspace);
                    self.apply_plan(plan, None);
                }
            }
        }
    }

    fn on_action(&mut self, conn_id: String, request: ActionRequest) {
        let action = match Action::parse(&request) {
            Ok(action) => action,
            Err(ActionError::Unknown(name)) => {
                warn!(event = "action_unknown", conn_id = %conn_id, action = %name);
                return;
            }
            Err(err) => {
                warn!(event = "action_invalid", conn_id = %conn_id, error = %err);
                let origin = Origin {
                    conn_id,
                    action: request.action,
                    request_id: request.request_id,
                };
                self.reply(&origin, Err(err));
                return;
            }
        };
        debug!(event = "action", conn_id = %conn_id, action = action.name());
        let origin = Origin {
            conn_id,
            action: action.name().to_string(),
            request_id: request.request_id,
        };
        let plan = actions::plan(action, &mut self.state, &self.config.workspace);
        self.apply_plan(plan, Some(origin));
    }

    fn apply_plan(&mut self, plan: Plan, origin: Option<Origin>) {
        self.scheduler.mark(plan.dirty);
        if plan.refilter {
            self.upstream
                .update_filter(log_subscription(self.state.log_filter()));
        }
        match plan.remote {
            Some(call) => self.spawn_remote(call, origin),
            None => {
                if let Some(origin) = origin {
                    self.reply(&origin, Ok(Value::Null));
                }
            }
        }
    }

    fn spawn_remote(&self, call: RemoteCall, origin: Option<Origin>) {
        let upstream = self.upstream.clone();
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let result = upstream.request(call.method, call.params).await;
            let _ = loopback
                .send(EngineCommand::RemoteDone {
                    origin,
                    method: call.method,
                    completion: call.completion,
                    result,
                })
                .await;
        });
    }

    fn reply(&mut self, origin: &Origin, result: Result<Value, ActionError>) {
        let (ok, error, result) = match result {
            Ok(value) => (true, None, (!value.is_null()).then_some(value)),
            Err(err) => (false, Some(err.to_string()), None),
        };
        let message = ServerMsg::ActionResult(ActionResult {
            action: origin.action.clone(),
            request_id: origin.request_id.clone(),
            ok,
            error,
            result,
        });
        let Some(slot) = self.clients.get(&origin.conn_id) else {
            return;
        };
        if !deliver(&origin.conn_id, &slot.sender, &message) {
            self.drop_client(&origin.conn_id, "send_error");
        }
    }

    fn send_snapshot(&mut self, conn_id: &str) {
        let snapshot = self.state.snapshot(self.config.snapshot_log_limit);
        let Some(slot) = self.clients.get_mut(conn_id) else {
            return;
        };
        let held = snapshot.shadow.logs().entries().len();
        let message = ServerMsg::State(StatePayload {
            data: snapshot.data,
            logs_truncated: snapshot.truncated,
        });
        if !deliver(conn_id, &slot.sender, &message) {
            self.drop_client(conn_id, "snapshot_error");
            return;
        }
        slot.shadow = snapshot.shadow;
        let epoch = slot.shadow.logs().epoch();
        info!(
            event = "snapshot_sent",
            conn_id = %conn_id,
            log_entries = held,
            truncated = snapshot.truncated
        );
        if snapshot.truncated {
            self.schedule_backfill(conn_id.to_string(), epoch);
        }
    }

    fn schedule_backfill(&self, conn_id: String, epoch: u64) {
        let loopback = self.loopback.clone();
        let delay = self.config.backfill_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = loopback
                .send(EngineCommand::BackfillDue { conn_id, epoch })
                .await;
        });
    }

    /// Send the head a truncated snapshot withheld. Skipped when the client is
    /// gone, already whole, or the sequence was replaced in the meantime (the
    /// next flush carries a full replacement instead).
    fn send_backfill(&mut self, conn_id: &str, epoch: u64) {
        let Some(slot) = self.clients.get_mut(conn_id) else {
            return;
        };
        if slot.shadow.logs().epoch() != epoch {
            return;
        }
        let Some(head) = self.state.backfill_for(&slot.shadow) else {
            return;
        };
        let head = head.to_vec();
        let message = ServerMsg::LogsBackfill(BackfillPayload {
            epoch,
            entries: head.clone(),
        });
        if !deliver(conn_id, &slot.sender, &message) {
            self.drop_client(conn_id, "send_error");
            return;
        }
        slot.shadow.fill_log_head(&head);
        debug!(event = "backfill_sent", conn_id = %conn_id, entries = head.len());
    }

    /// Diff every dirty field against every shadow and send one update per
    /// client that has something new. Returns the number of updates sent.
    pub fn flush(&mut self) -> usize {
        let fields = self.scheduler.begin_flush();
        let mut sent = 0;
        let mut failed = Vec::new();

        for (conn_id, slot) in self.clients.iter_mut() {
            let mut data = OrderedFields::default();
            let mut changed = Vec::new();
            for field in &fields {
                if let Some(change) = diff::compare(*field, &self.state, &slot.shadow) {
                    data.push(change.key(), change.into_value());
                    changed.push(*field);
                }
            }
            if data.is_empty() {
                continue;
            }
            if !deliver(conn_id, &slot.sender, &ServerMsg::Update(UpdatePayload { data })) {
                failed.push(conn_id.clone());
                continue;
            }
            for field in changed {
                slot.shadow.adopt_field(&self.state, field);
            }
            sent += 1;
        }

        self.scheduler.finish_flush();
        for conn_id in failed {
            self.drop_client(&conn_id, "send_error");
        }
        debug!(event = "flush", fields = fields.len(), updates = sent);
        sent
    }

    fn drop_client(&mut self, conn_id: &str, reason: &'static str) {
        if self.clients.remove(conn_id).is_some() {
            warn!(event = "client_dropped", conn_id = %conn_id, reason = reason);
        }
    }
}

fn deliver(conn_id: &str, sender: &mpsc::Sender<String>, message: &ServerMsg) -> bool {
    let text = match encode_frame(message, MAX_OUTBOUND_FRAME_BYTES) {
        Ok(text) => text,
        Err(err) => {
            warn!(event = "encode_error", conn_id = %conn_id, error = %err);
            return false;
        }
    };
    match sender.try_send(text) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(event = "slow_consumer", conn_id = %conn_id);
            false
        }
    }
}
