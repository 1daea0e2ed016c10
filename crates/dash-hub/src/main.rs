mod actions;
mod engine;
mod scheduler;
mod session;
mod upstream;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use dash_core::LogFilter;
use engine::{Engine, EngineConfig};
use session::Hub;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use upstream::{initial_subscriptions, Bridge, UpstreamHandle};
use url::Url;

const ENGINE_QUEUE: usize = 1024;
const DEFAULT_ADDR: &str = "127.0.0.1:8501";
const DEFAULT_PRODUCER_URL: &str = "ws://127.0.0.1:8502/ws";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    producer_url: String,
    workspace: Vec<String>,
    debug: bool,
    log_dir: String,
    debounce: Duration,
    reconnect_delay: Duration,
    snapshot_log_limit: usize,
    backfill_delay: Duration,
    ping_interval: Duration,
    write_timeout: Duration,
    request_timeout: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "dash-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    producer_url: String,
    #[arg(long)]
    workspace: Vec<String>,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = 16)]
    debounce_ms: u64,
    #[arg(long, default_value_t = 2000)]
    reconnect_ms: u64,
    #[arg(long, default_value_t = 500)]
    snapshot_log_limit: usize,
    #[arg(long, default_value_t = 50)]
    backfill_delay_ms: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        return;
    }
    let producer = match Url::parse(&config.producer_url) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_producer_url", error = %err, url = %config.producer_url);
            return;
        }
    };

    let hub = start_services(&config, producer);
    let app = router(hub);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        producer = %config.producer_url,
        workspace = ?config.workspace
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }
}

/// Spawn the engine and the producer bridge; the returned hub feeds client
/// sessions into the engine.
fn start_services(config: &Config, producer: Url) -> Arc<Hub> {
    let (engine_tx, engine_rx) = mpsc::channel(ENGINE_QUEUE);
    let (upstream, bridge_rx) = UpstreamHandle::channel(config.request_timeout);

    let engine = Engine::new(
        EngineConfig {
            producer_url: config.producer_url.clone(),
            workspace: config.workspace.clone(),
            debounce: config.debounce,
            snapshot_log_limit: config.snapshot_log_limit,
            backfill_delay: config.backfill_delay,
        },
        upstream,
        engine_tx.clone(),
    );
    tokio::spawn(engine.run(engine_rx));

    let bridge = Bridge::new(
        producer,
        initial_subscriptions(&LogFilter::default()),
        config.reconnect_delay,
        bridge_rx,
        engine_tx.clone(),
    );
    tokio::spawn(bridge.run());

    Arc::new(Hub::new(
        engine_tx,
        config.ping_interval,
        config.write_timeout,
    ))
}

fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_setting(&args.addr, "DASH_HUB_ADDR", DEFAULT_ADDR),
        producer_url: resolve_setting(&args.producer_url, "DASH_PRODUCER_URL", DEFAULT_PRODUCER_URL),
        workspace: resolve_workspace(&args.workspace),
        debug: args.debug || env_true("DASH_HUB_DEBUG"),
        log_dir: resolve_setting(&args.log_dir, "DASH_LOG_DIR", ".dash/logs"),
        debounce: Duration::from_millis(args.debounce_ms),
        reconnect_delay: Duration::from_millis(args.reconnect_ms),
        snapshot_log_limit: args.snapshot_log_limit,
        backfill_delay: Duration::from_millis(args.backfill_delay_ms),
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        request_timeout: Duration::from_secs(args.request_timeout),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("DASH_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Fans each formatted line out to stdout and the optional log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("dash-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Flag, then environment, then default.
fn resolve_setting(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn resolve_workspace(flags: &[String]) -> Vec<String> {
    let from_flags = non_empty_roots(flags.iter().map(String::as_str));
    if !from_flags.is_empty() {
        return from_flags;
    }
    if let Ok(value) = std::env::var("DASH_WORKSPACE") {
        let from_env = non_empty_roots(value.split(':'));
        if !from_env.is_empty() {
            return from_env;
        }
    }
    std::env::current_dir()
        .map(|dir| vec![dir.to_string_lossy().into_owned()])
        .unwrap_or_else(|_| vec![".".to_string()])
}

fn non_empty_roots<'a>(roots: impl Iterator<Item = &'a str>) -> Vec<String> {
    roots
        .map(str::trim)
        .filter(|root| !root.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dash_core::wire::{decode_frame, UpstreamOutbound, MAX_OUTBOUND_FRAME_BYTES};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

    type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config(producer_url: String) -> Config {
        Config {
            addr: "127.0.0.1:0".to_string(),
            producer_url,
            workspace: vec!["/ws".to_string()],
            debug: false,
            log_dir: String::new(),
            debounce: Duration::from_millis(16),
            reconnect_delay: Duration::from_millis(50),
            snapshot_log_limit: 500,
            backfill_delay: Duration::from_millis(50),
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }

    async fn serve_hub(config: &Config) -> SocketAddr {
        let producer = Url::parse(&config.producer_url).expect("producer url");
        let app = router(start_services(config, producer));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind hub");
        let addr = listener.local_addr().expect("hub addr");
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });
        addr
    }

    async fn next_server_msg(client: &mut ClientSocket, kind: &str) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("frame in time");
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = decode_frame(&text, MAX_OUTBOUND_FRAME_BYTES).expect("json");
                    if value["type"] == kind {
                        return value;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("client socket ended: {other:?}"),
            }
        }
    }

    #[test]
    fn workspace_roots_skip_blanks() {
        let roots = resolve_workspace(&["/a".to_string(), " ".to_string(), "/b".to_string()]);
        assert_eq!(roots, vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(resolve_setting(" ", "DASH_TEST_UNSET_KEY", "fallback"), "fallback");
        assert_eq!(resolve_setting("flag", "DASH_TEST_UNSET_KEY", "fallback"), "flag");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn health_endpoint_answers_ok() {
        // Nothing listens on the producer port; the hub still serves.
        let addr = serve_hub(&test_config("ws://127.0.0.1:9/ws".to_string())).await;
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("request");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("response");
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("ok"), "{response}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn producer_events_reach_clients_as_updates() {
        let producer_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind producer");
        let producer_url = format!(
            "ws://{}/ws",
            producer_listener.local_addr().expect("producer addr")
        );
        let hub_addr = serve_hub(&test_config(producer_url)).await;

        let (stream, _) = producer_listener.accept().await.expect("accept bridge");
        let mut producer = accept_async(stream).await.expect("producer handshake");
        let mut subscribed = 0;
        while subscribed < 4 {
            let Some(Ok(Message::Text(text))) = producer.next().await else {
                panic!("bridge socket ended")
            };
            if let Ok(UpstreamOutbound::Subscribe(_)) =
                decode_frame::<UpstreamOutbound>(&text, MAX_OUTBOUND_FRAME_BYTES)
            {
                subscribed += 1;
            }
        }

        let (mut client, _) = connect_async(format!("ws://{hub_addr}/ws"))
            .await
            .expect("client connect");
        let state = next_server_msg(&mut client, "state").await;
        assert_eq!(state["data"]["builds"], json!([]));

        // Garbage is dropped without closing the session.
        client
            .send(Message::Text("{not json".to_string()))
            .await
            .expect("send garbage");

        producer
            .send(Message::Text(
                json!({
                    "type": "event",
                    "event": "build_started",
                    "data": {"buildId": "b-1", "name": "default", "projectRoot": "/ws/demo"}
                })
                .to_string(),
            ))
            .await
            .expect("producer event");

        let update = loop {
            let update = next_server_msg(&mut client, "update").await;
            if update["data"].get("builds").is_some() {
                break update;
            }
        };
        assert_eq!(update["data"]["builds"][0]["buildId"], "b-1");
        assert_eq!(update["data"]["builds"][0]["status"], "building");

        client
            .send(Message::Text(
                json!({"type": "action", "action": "toggleTarget", "params": {"target": "usb"}, "requestId": "r-1"})
                    .to_string(),
            ))
            .await
            .expect("send action");
        let reply = next_server_msg(&mut client, "action_result").await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["requestId"], "r-1");
        let update = loop {
            let update = next_server_msg(&mut client, "update").await;
            if update["data"].get("selectedTargetNames").is_some() {
                break update;
            }
        };
        assert_eq!(update["data"]["selectedTargetNames"], json!(["usb"]));

        client
            .send(Message::Text(json!({"type": "ready"}).to_string()))
            .await
            .expect("send ready");
        let resync = next_server_msg(&mut client, "state").await;
        assert_eq!(resync["data"]["selectedTargetNames"], json!(["usb"]));
        assert_eq!(resync["data"]["builds"][0]["buildId"], "b-1");
    }
}
