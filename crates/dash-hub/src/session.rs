use crate::engine::EngineCommand;
use axum::extract::ws::{Message, WebSocket};
use dash_core::wire::{decode_frame, ClientMsg, MAX_FRAME_BYTES};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Interval;
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 256;

/// Shared by every WebSocket session: the way into the engine plus the
/// per-socket timing knobs.
pub struct Hub {
    engine: mpsc::Sender<EngineCommand>,
    conn_counter: AtomicU64,
    ping_interval: Duration,
    write_timeout: Duration,
}

impl Hub {
    pub fn new(
        engine: mpsc::Sender<EngineCommand>,
        ping_interval: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            conn_counter: AtomicU64::new(0),
            ping_interval,
            write_timeout,
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn handle_socket(&self, socket: WebSocket, remote: SocketAddr) {
        let conn_id = self.next_conn_id();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

        let write_timeout = self.write_timeout;
        let mut ticker = ping_ticker(self.ping_interval);
        let writer_id = conn_id.clone();
        let mut write_task = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    text = rx.recv() => match text {
                        Some(text) => Message::Text(text),
                        None => break,
                    },
                    _ = next_ping(&mut ticker) => Message::Ping(Vec::new()),
                };
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(event = "write_error", conn_id = %writer_id, error = %err);
                        return;
                    }
                    Err(_) => {
                        warn!(event = "write_timeout", conn_id = %writer_id);
                        return;
                    }
                }
            }
            let _ = tokio::time::timeout(write_timeout, ws_sender.close()).await;
        });

        info!(event = "client_connected", conn_id = %conn_id, remote = %remote);
        let registered = self
            .engine
            .send(EngineCommand::ClientConnected {
                conn_id: conn_id.clone(),
                sender: tx,
            })
            .await;
        if registered.is_err() {
            warn!(event = "engine_gone", conn_id = %conn_id);
            write_task.abort();
            return;
        }

        let mut writer_done = false;
        let reason = loop {
            let frame = tokio::select! {
                frame = ws_receiver.next() => frame,
                _ = &mut write_task => {
                    writer_done = true;
                    break "write_closed";
                }
            };
            let msg = match frame {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => {
                    warn!(event = "read_error", conn_id = %conn_id, error = %err);
                    break "read_error";
                }
                None => break "disconnect",
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(event = "message_invalid", conn_id = %conn_id, error = "binary frame is not utf-8");
                        continue;
                    }
                },
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %conn_id);
                    break "disconnect";
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            let message = match decode_frame::<ClientMsg>(&text, MAX_FRAME_BYTES) {
                Ok(message) => message,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %conn_id, size = text.len(), error = %err);
                    continue;
                }
            };
            debug!(event = "message_received", conn_id = %conn_id);
            let forwarded = self
                .engine
                .send(EngineCommand::ClientMessage {
                    conn_id: conn_id.clone(),
                    message,
                })
                .await;
            if forwarded.is_err() {
                break "engine_gone";
            }
        };

        let _ = self
            .engine
            .send(EngineCommand::ClientDisconnected {
                conn_id: conn_id.clone(),
                reason,
            })
            .await;
        if !writer_done {
            // The engine dropping its sender ends the writer; give it a bounded
            // moment to flush a close frame.
            if tokio::time::timeout(write_timeout, &mut write_task).await.is_err() {
                write_task.abort();
            }
        }
        info!(event = "client_disconnected", conn_id = %conn_id, reason = reason);
    }
}

fn ping_ticker(interval: Duration) -> Option<Interval> {
    if interval.is_zero() {
        return None;
    }
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_ping(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
