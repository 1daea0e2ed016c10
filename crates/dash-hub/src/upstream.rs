use crate::engine::EngineCommand;
use dash_core::events::{EventError, ProducerEvent};
use dash_core::wire::{
    decode_frame, encode_frame, Channel, Subscription, UpstreamInbound, UpstreamOutbound,
    UpstreamRequest, UpstreamResponse, MAX_OUTBOUND_FRAME_BYTES, MAX_PRODUCER_FRAME_BYTES,
};
use dash_core::LogFilter;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

const COMMAND_QUEUE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("not connected to producer")]
    NotConnected,
    #[error("producer connection dropped")]
    Disconnected,
    #[error("producer did not answer within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Rejected(String),
    #[error("upstream bridge stopped")]
    Closed,
}

/// Lifecycle and traffic the bridge reports to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Connected,
    Hello { version: Option<String> },
    Disconnected { attempts: u32 },
    Event(ProducerEvent),
}

#[derive(Debug)]
pub enum BridgeCommand {
    UpdateFilter(Subscription),
    Request {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value, UpstreamError>>,
    },
}

/// Cheap handle the engine and action tasks use to reach the bridge.
#[derive(Clone, Debug)]
pub struct UpstreamHandle {
    commands: mpsc::Sender<BridgeCommand>,
    request_timeout: Duration,
}

impl UpstreamHandle {
    pub fn channel(request_timeout: Duration) -> (Self, mpsc::Receiver<BridgeCommand>) {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        (
            Self {
                commands,
                request_timeout,
            },
            rx,
        )
    }

    pub fn update_filter(&self, subscription: Subscription) {
        let command = BridgeCommand::UpdateFilter(subscription);
        if let Err(err) = self.commands.try_send(command) {
            warn!(event = "bridge_command_dropped", error = %err);
        }
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(BridgeCommand::Request {
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| UpstreamError::Closed)?;
        match tokio::time::timeout(self.request_timeout, answer).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpstreamError::Closed),
            Err(_) => Err(UpstreamError::Timeout(self.request_timeout)),
        }
    }
}

pub fn log_subscription(filter: &LogFilter) -> Subscription {
    Subscription {
        channel: Channel::Logs,
        filter: serde_json::to_value(filter).unwrap_or(Value::Null),
    }
}

/// Channels the engine always wants, with the logs channel on `filter`.
pub fn initial_subscriptions(filter: &LogFilter) -> Vec<Subscription> {
    Channel::ALL
        .iter()
        .map(|channel| match channel {
            Channel::Logs => log_subscription(filter),
            other => Subscription {
                channel: *other,
                filter: Value::Null,
            },
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection state machine, free of I/O.
///
/// Holds the active subscriptions (one per channel) and at most one pending
/// reconnect deadline. Filter changes are only released while connected;
/// otherwise they are dropped since `on_open` re-sends the full set.
#[derive(Debug)]
pub struct BridgeCore {
    link: LinkState,
    subscriptions: Vec<Subscription>,
    reconnect_delay: Duration,
    reconnect_at: Option<Instant>,
    attempts: u32,
}

impl BridgeCore {
    pub fn new(subscriptions: Vec<Subscription>, reconnect_delay: Duration) -> Self {
        let mut core = Self {
            link: LinkState::Disconnected,
            subscriptions: Vec::new(),
            reconnect_delay,
            reconnect_at: None,
            attempts: 0,
        };
        for subscription in subscriptions {
            core.store(subscription);
        }
        core.begin_connect();
        core
    }

    #[cfg(test)]
    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn is_connected(&self) -> bool {
        self.link == LinkState::Connected
    }

    #[cfg(test)]
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Connection attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[cfg(test)]
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn begin_connect(&mut self) -> u32 {
        self.link = LinkState::Connecting;
        self.reconnect_at = None;
        self.attempts += 1;
        self.attempts
    }

    /// The connection opened: every active subscription goes out again.
    pub fn on_open(&mut self) -> Vec<UpstreamOutbound> {
        self.link = LinkState::Connected;
        self.reconnect_at = None;
        self.attempts = 0;
        self.subscriptions
            .iter()
            .cloned()
            .map(UpstreamOutbound::Subscribe)
            .collect()
    }

    /// Close or error. Arms the reconnect deadline unless one is already set.
    pub fn on_close(&mut self, now: Instant) -> Instant {
        self.link = LinkState::Disconnected;
        *self.reconnect_at.get_or_insert(now + self.reconnect_delay)
    }

    /// Replace the channel's filter; the change only goes out while connected.
    pub fn update_filter(&mut self, subscription: Subscription) -> Option<UpstreamOutbound> {
        self.store(subscription.clone());
        self.is_connected()
            .then_some(UpstreamOutbound::UpdateFilter(subscription))
    }

    fn store(&mut self, subscription: Subscription) {
        match self
            .subscriptions
            .iter_mut()
            .find(|s| s.channel == subscription.channel)
        {
            Some(existing) => *existing = subscription,
            None => self.subscriptions.push(subscription),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Reconnect,
    Stop,
}

type Reply = oneshot::Sender<Result<Value, UpstreamError>>;

/// Drives `BridgeCore` over a real producer socket.
pub struct Bridge {
    url: Url,
    core: BridgeCore,
    commands: mpsc::Receiver<BridgeCommand>,
    engine: mpsc::Sender<EngineCommand>,
    pending: HashMap<String, Reply>,
}

impl Bridge {
    pub fn new(
        url: Url,
        subscriptions: Vec<Subscription>,
        reconnect_delay: Duration,
        commands: mpsc::Receiver<BridgeCommand>,
        engine: mpsc::Sender<EngineCommand>,
    ) -> Self {
        Self {
            url,
            core: BridgeCore::new(subscriptions, reconnect_delay),
            commands,
            engine,
            pending: HashMap::new(),
        }
    }

    /// Runs until the engine goes away or every command handle is dropped.
    pub async fn run(mut self) {
        loop {
            debug!(
                event = "producer_connecting",
                url = %self.url,
                attempt = self.core.attempts()
            );
            match connect_async(self.url.clone()).await {
                Ok((ws, _)) => {
                    info!(event = "producer_connected", url = %self.url);
                    if self.serve(ws).await == Flow::Stop {
                        return;
                    }
                }
                Err(err) => {
                    warn!(
                        event = "producer_connect_error",
                        url = %self.url,
                        attempt = self.core.attempts(),
                        error = %err
                    );
                }
            }

            let due = self.core.on_close(Instant::now());
            self.fail_pending(UpstreamError::Disconnected);
            let attempts = self.core.attempts();
            if !self.notify(BridgeEvent::Disconnected { attempts }).await {
                return;
            }
            if self.wait_for_reconnect(due).await == Flow::Stop {
                return;
            }
            self.core.begin_connect();
        }
    }

    async fn serve<S>(&mut self, ws: S) -> Flow
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        for message in self.core.on_open() {
            if let Err(err) = send_outbound(&mut sink, &message).await {
                warn!(event = "producer_write_error", error = %err);
                return Flow::Reconnect;
            }
        }
        if !self.notify(BridgeEvent::Connected).await {
            return Flow::Stop;
        }

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !self.on_text(&text).await {
                            return Flow::Stop;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(event = "producer_closed", url = %self.url);
                        return Flow::Reconnect;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "producer_read_error", error = %err);
                        return Flow::Reconnect;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(message) = self.accept(command) {
                            if let Err(err) = send_outbound(&mut sink, &message).await {
                                warn!(event = "producer_write_error", error = %err);
                                return Flow::Reconnect;
                            }
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        return Flow::Stop;
                    }
                },
            }
        }
    }

    async fn wait_for_reconnect(&mut self, due: Instant) -> Flow {
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(due) => return Flow::Reconnect,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        // Not connected: subscriptions are stored, requests fail.
                        let _ = self.accept(command);
                    }
                    None => return Flow::Stop,
                },
            }
        }
    }

    fn accept(&mut self, command: BridgeCommand) -> Option<UpstreamOutbound> {
        match command {
            BridgeCommand::UpdateFilter(subscription) => self.core.update_filter(subscription),
            BridgeCommand::Request {
                method,
                params,
                reply,
            } => {
                if !self.core.is_connected() {
                    let _ = reply.send(Err(UpstreamError::NotConnected));
                    return None;
                }
                self.pending.retain(|_, waiting| !waiting.is_closed());
                let request_id = uuid::Uuid::new_v4().to_string();
                debug!(event = "producer_request", request_id = %request_id, method = %method);
                self.pending.insert(request_id.clone(), reply);
                Some(UpstreamOutbound::Request(UpstreamRequest {
                    request_id,
                    method,
                    params,
                }))
            }
        }
    }

    async fn on_text(&mut self, text: &str) -> bool {
        let inbound = match decode_frame::<UpstreamInbound>(text, MAX_PRODUCER_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "producer_message_invalid", error = %err);
                return true;
            }
        };
        match inbound {
            UpstreamInbound::Hello(hello) => {
                self.notify(BridgeEvent::Hello {
                    version: hello.version,
                })
                .await
            }
            UpstreamInbound::Response(response) => {
                self.resolve(response);
                true
            }
            UpstreamInbound::Event(raw) => match ProducerEvent::from_raw(raw) {
                Ok(event) => self.notify(BridgeEvent::Event(event)).await,
                Err(EventError::UnknownKind(kind)) => {
                    debug!(event = "producer_event_ignored", kind = %kind);
                    true
                }
                Err(err) => {
                    warn!(event = "producer_event_invalid", error = %err);
                    true
                }
            },
        }
    }

    fn resolve(&mut self, response: UpstreamResponse) {
        let Some(reply) = self.pending.remove(&response.request_id) else {
            debug!(event = "producer_response_unmatched", request_id = %response.request_id);
            return;
        };
        let result = if response.ok {
            Ok(response.result)
        } else {
            Err(UpstreamError::Rejected(
                response
                    .error
                    .unwrap_or_else(|| "request failed".to_string()),
            ))
        };
        let _ = reply.send(result);
    }

    fn fail_pending(&mut self, error: UpstreamError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(error.clone()));
        }
    }

    fn notify(&self, event: BridgeEvent) -> impl Future<Output = bool> {
        let engine = self.engine.clone();
        async move { engine.send(EngineCommand::Upstream(event)).await.is_ok() }
    }
}

async fn send_outbound<S>(sink: &mut S, message: &UpstreamOutbound) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    match encode_frame(message, MAX_OUTBOUND_FRAME_BYTES) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(err) => {
            warn!(event = "producer_encode_error", error = %err);
            Ok(())
        }
    }
}
