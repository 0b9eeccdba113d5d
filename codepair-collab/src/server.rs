//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── SessionManager ── SessionStore (memory | RocksDB)
//!            ├── connection task ───┤        │
//! Client B ──┘   (reader + writer)  │        ├── PresenceTracker
//!                    │              │        └── ChannelManager ── SessionChannel (per session)
//!                    ▼              │                                   │
//!              MessageRouter ───────┘                     ┌─────────────┼─────────────┐
//!                                                         ▼             ▼             ▼
//!                                                     Client A      Client B      Client C
//! ```
//!
//! Each connection runs one task that reads frames in order and a writer
//! task that drains the connection's bounded outbound queue. A heartbeat
//! interval closes connections that stay silent longer than
//! `heartbeat_timeout`.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ChannelManager, Outbound};
use crate::error::{CollabError, Result};
use crate::lifecycle::{LifecycleConfig, SessionManager};
use crate::model::Permission;
use crate::presence::PresenceTracker;
use crate::protocol::Frame;
use crate::router::{Connection, MessageRouter};
use crate::storage::{MemoryStore, RetryPolicy, RocksStore, SessionStore, StoreConfig, StoreError};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (`HOST:PORT`)
    pub bind_addr: String,
    /// `DURABLE_STORE_URL`; `None` keeps sessions in memory only
    pub store_url: Option<String>,
    /// Public URL of the web app, informational
    pub public_app_url: Option<String>,
    /// How often each connection checks its heartbeat
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is dropped
    pub heartbeat_timeout: Duration,
    /// Delay before an empty session is deleted
    pub session_grace: Duration,
    /// Inactivity after which a peer is reported idle
    pub idle_after: Duration,
    /// Chat history kept per session
    pub max_chat_messages: usize,
    /// Largest inbound frame accepted, in bytes
    pub max_message_bytes: usize,
    /// Outbound frames buffered per connection before drops start
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4000".to_string(),
            store_url: None,
            public_app_url: None,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            session_grace: Duration::from_secs(300),
            idle_after: Duration::from_secs(120),
            max_chat_messages: 200,
            max_message_bytes: 1024 * 1024,
            outbound_queue: 256,
        }
    }
}

impl ServerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup. Unset keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = non_empty("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse("PORT", non_empty("PORT"))?.unwrap_or(4000);
        config.bind_addr = format!("{host}:{port}");

        config.store_url = non_empty("DURABLE_STORE_URL");
        config.public_app_url = non_empty("PUBLIC_APP_URL");

        if let Some(secs) = parse::<u64>("HEARTBEAT_TIMEOUT_SECS", non_empty("HEARTBEAT_TIMEOUT_SECS"))? {
            if secs == 0 {
                return Err(invalid("HEARTBEAT_TIMEOUT_SECS", "0", "must be positive"));
            }
            config.heartbeat_timeout = Duration::from_secs(secs);
            config.heartbeat_interval = config.heartbeat_interval.min(config.heartbeat_timeout);
        }
        if let Some(secs) = parse::<u64>("SESSION_GRACE_SECS", non_empty("SESSION_GRACE_SECS"))? {
            config.session_grace = Duration::from_secs(secs);
        }
        if let Some(n) = parse::<usize>("MAX_CHAT_MESSAGES", non_empty("MAX_CHAT_MESSAGES"))? {
            config.max_chat_messages = n;
        }
        if let Some(n) = parse::<usize>("MAX_MESSAGE_BYTES", non_empty("MAX_MESSAGE_BYTES"))? {
            config.max_message_bytes = n;
        }

        Ok(config)
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            empty_session_grace: self.session_grace,
            idle_after: self.idle_after,
            default_permission: Permission::Edit,
            max_chat_messages: self.max_chat_messages,
            read_retry: RetryPolicy::default(),
        }
    }

    /// Open the configured backend.
    pub fn open_store(&self) -> Result<Arc<dyn SessionStore>, StoreError> {
        match &self.store_url {
            Some(url) => {
                let store = RocksStore::open(StoreConfig::from_url(url))?;
                log::info!("Durable session store at {}", store.path().display());
                Ok(Arc::new(store))
            }
            None => {
                log::warn!("DURABLE_STORE_URL not set: sessions are kept in memory and lost on restart");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }
}

fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(name: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| v.trim().parse::<T>().map_err(|e| invalid(name, &v, e.to_string())))
        .transpose()
}

// ───────────────────────────────────────────────────────────────────
// Server
// ───────────────────────────────────────────────────────────────────

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    router: Arc<MessageRouter>,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    /// Create a server over `store` with fresh presence and fan-out state.
    pub fn new(config: ServerConfig, store: Arc<dyn SessionStore>) -> Self {
        let manager = SessionManager::new(
            store,
            Arc::new(PresenceTracker::new()),
            Arc::new(ChannelManager::new()),
            config.lifecycle(),
        );
        Self::with_manager(config, Arc::new(manager))
    }

    /// Create a server around an existing lifecycle manager.
    pub fn with_manager(config: ServerConfig, manager: Arc<SessionManager>) -> Self {
        Self {
            config,
            router: Arc::new(MessageRouter::new(manager)),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        self.router.manager()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind, recover stored sessions and start accepting connections.
    pub async fn start(&self) -> Result<ServerHandle, Box<dyn std::error::Error + Send + Sync>> {
        let recovered = self.manager().start().await?;
        if recovered > 0 {
            log::info!("{recovered} stored session(s) awaiting their members");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Collaboration server listening on ws://{local_addr}");
        if let Some(url) = &self.config.public_app_url {
            log::info!("Public app URL: {url}");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = self.router.clone();
        let config = self.config.clone();
        let stats = self.stats.clone();

        let accept_task = tokio::spawn(accept_loop(listener, router, config, stats, shutdown_rx));

        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            accept_task,
            router: self.router.clone(),
            stats: self.stats.clone(),
        })
    }
}

/// Running server. Dropping it without `stop` also closes every connection.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    router: Arc<MessageRouter>,
    stats: Arc<AtomicServerStats>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        self.router.manager()
    }

    /// Stop accepting, close every connection and cancel cleanup timers.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.accept_task.await {
            log::error!("Accept loop ended abnormally: {e}");
        }
        self.router.manager().stop().await;
        log::info!("Collaboration server on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<MessageRouter>,
    config: ServerConfig,
    stats: Arc<AtomicServerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let router = router.clone();
                        let config = config.clone();
                        let stats = stats.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, router, config, stats, shutdown).await {
                                log::warn!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("Accept failed: {e}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: Arc<MessageRouter>,
    config: ServerConfig,
    stats: Arc<AtomicServerStats>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    stats.total_connections.fetch_add(1, Ordering::Relaxed);
    stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(config.outbound_queue);
    let mut writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_sender.send(Message::text(text.as_str().to_owned())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut conn = Connection::new(out_tx);
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        record(&stats, text.len());
                        if text.len() > config.max_message_bytes {
                            conn.reply(oversized(text.len(), config.max_message_bytes)).await;
                            continue;
                        }
                        router.route_text(&mut conn, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        record(&stats, data.len());
                        if data.len() > config.max_message_bytes {
                            conn.reply(oversized(data.len(), config.max_message_bytes)).await;
                            continue;
                        }
                        match Frame::decode_bytes(&data) {
                            Ok(frame) => router.route(&mut conn, frame).await,
                            Err(e) => conn.reply(Frame::from_error(&e)).await,
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed: {addr}");
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        log::debug!("WebSocket error from {addr}: {e}");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() >= config.heartbeat_timeout {
                    log::info!("Heartbeat timeout for {addr} after {:?}", config.heartbeat_timeout);
                    break;
                }
                if conn.is_evicted().await {
                    log::info!("Closing {addr}: missed frames on a full outbound queue");
                    break;
                }
                if conn.check_idle(config.idle_after) {
                    log::debug!("Connection {} from {addr} is idle", conn.id);
                }
            }

            _ = shutdown.changed() => {
                log::debug!("Server shutting down, closing {addr}");
                break;
            }
        }
    }

    router.disconnect(&mut conn).await;
    drop(conn);
    if tokio::time::timeout(Duration::from_secs(2), &mut writer).await.is_err() {
        writer.abort();
    }

    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    Ok(())
}

fn record(stats: &AtomicServerStats, bytes: usize) {
    stats.frames_received.fetch_add(1, Ordering::Relaxed);
    stats.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
}

fn oversized(len: usize, max: usize) -> Frame {
    Frame::from_error(&CollabError::invalid_frame(format!(
        "frame of {len} bytes exceeds the {max} byte limit"
    )))
}
