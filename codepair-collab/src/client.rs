//! WebSocket client façade for applications embedding the editor.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Session control (create, join, leave, permissions, versions)
//! - Code, language, cursor, selection and chat updates
//! - A reactive `ClientState` kept in sync with server frames
//! - An offline queue replayed after the session is re-joined
//!
//! ```text
//!  app ──► CollabClient::send_* ──► offline? ──yes──► OfflineQueue (code coalesced,
//!                │                    │                cursor/selection dropped)
//!                │                    no
//!                ▼                    ▼
//!         ClientState ◄── reader ◄── WebSocket ◄── writer ◄── outgoing channel
//!                │                                    ▲
//!                └──► ClientEvent stream              └── ping every heartbeat_interval
//! ```

use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::error::{CollabError, ErrorKind, Result};
use crate::model::{
    now_millis, ChatMessage, CursorPosition, NewSession, Participant, Permission,
    SelectionRange, Session, SessionId, UserId, UserProfile,
};
use crate::protocol::{
    ChatPayload, CodeUpdate, CreateSessionPayload, Frame, FrameBody, JoinSessionPayload,
    LanguageChange, PermissionChange, SaveVersionPayload,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

// ───────────────────────────────────────────────────────────────────
// Configuration and events
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// First reconnect delay; doubles on every failed attempt
    pub reconnect_initial: Duration,
    /// Upper bound of the reconnect delay
    pub reconnect_max: Duration,
    /// Give up after this many consecutive failures (0 = never)
    pub max_reconnect_attempts: u32,
    /// Interval of client pings
    pub heartbeat_interval: Duration,
    /// Silence from the server after which the socket is treated as dead.
    /// Must exceed `heartbeat_interval` since every ping earns a pong.
    pub heartbeat_timeout: Duration,
    /// Frames kept while offline
    pub offline_queue_capacity: usize,
    /// Buffered events before new ones are dropped
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            offline_queue_capacity: 1000,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_initial
            .checked_mul(factor)
            .unwrap_or(self.reconnect_max)
            .min(self.reconnect_max)
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    /// Any frame received from the server (heartbeat replies excluded)
    Frame(Frame),
    Error { kind: ErrorKind, message: String },
}

// ───────────────────────────────────────────────────────────────────
// Reactive state
// ───────────────────────────────────────────────────────────────────

/// Local mirror of the session as seen by this client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientState {
    pub session: Option<Session>,
    pub current_user: Option<Participant>,
    pub users: HashMap<UserId, Participant>,
    pub cursors: HashMap<UserId, CursorPosition>,
    pub selections: HashMap<UserId, SelectionRange>,
    pub messages: Vec<ChatMessage>,
    pub is_connected: bool,
    pub error: Option<String>,
}

impl ClientState {
    /// Fold one server frame into the state.
    pub fn apply(&mut self, frame: &Frame) {
        match &frame.body {
            FrameBody::SessionCreated(snapshot) | FrameBody::SessionJoined(snapshot) => {
                self.session = Some(snapshot.session.clone());
                self.current_user = Some(snapshot.you.clone());
                self.users = snapshot
                    .users
                    .iter()
                    .map(|u| (u.id.clone(), u.clone()))
                    .collect();
                self.cursors = snapshot.cursors.clone();
                self.selections = snapshot.selections.clone();
                self.messages = snapshot.messages.clone();
                self.error = None;
            }
            FrameBody::SessionLeft(_) => self.clear_session(),
            FrameBody::UserJoined(p) | FrameBody::UserUpdated(p) => {
                if self.is_me(&p.user.id) {
                    self.current_user = Some(p.user.clone());
                }
                self.users.insert(p.user.id.clone(), p.user.clone());
            }
            FrameBody::UserLeft(p) => {
                self.users.remove(&p.user_id);
                self.cursors.remove(&p.user_id);
                self.selections.remove(&p.user_id);
            }
            FrameBody::CodeUpdated(update) => {
                if let Some(session) = &mut self.session {
                    session.code = update.code.clone();
                    session.updated_at = frame.timestamp.max(session.updated_at);
                }
            }
            FrameBody::LanguageChanged(change) => {
                if let Some(session) = &mut self.session {
                    session.language = change.language.clone();
                }
            }
            FrameBody::CursorUpdated(position) => {
                if let Some(user_id) = &frame.user_id {
                    self.cursors.insert(user_id.clone(), *position);
                }
            }
            FrameBody::SelectionUpdated(range) => {
                if let Some(user_id) = &frame.user_id {
                    self.selections.insert(user_id.clone(), *range);
                }
            }
            FrameBody::ChatMessage(chat) => self.messages.push(chat_from_payload(chat.clone())),
            FrameBody::PermissionChanged(change) => {
                if let Some(user) = self.users.get_mut(&change.user_id) {
                    user.permission = change.permission;
                }
                if let Some(me) = &mut self.current_user {
                    if me.id == change.user_id {
                        me.permission = change.permission;
                    }
                }
                if let Some(session) = &mut self.session {
                    if let Some(member) = session.members.iter_mut().find(|m| m.id == change.user_id) {
                        member.permission = change.permission;
                    }
                }
            }
            FrameBody::Error(e) => self.error = Some(format!("{}: {}", e.kind, e.message)),
            FrameBody::SessionList(_)
            | FrameBody::VersionSaved(_)
            | FrameBody::Pong
            | FrameBody::Ping
            | FrameBody::Offer(_)
            | FrameBody::Answer(_)
            | FrameBody::IceCandidate(_)
            | FrameBody::CreateSession(_)
            | FrameBody::JoinSession(_)
            | FrameBody::LeaveSession
            | FrameBody::DeleteSession
            | FrameBody::ListSessions
            | FrameBody::SaveVersion(_) => {}
        }
    }

    pub fn can_edit(&self) -> bool {
        self.current_user
            .as_ref()
            .is_some_and(|u| u.permission.can_edit())
    }

    fn is_me(&self, user_id: &str) -> bool {
        self.current_user.as_ref().is_some_and(|u| u.id == user_id)
    }

    fn clear_session(&mut self) {
        self.session = None;
        self.current_user = None;
        self.users.clear();
        self.cursors.clear();
        self.selections.clear();
        self.messages.clear();
    }
}

fn chat_from_payload(chat: ChatPayload) -> ChatMessage {
    ChatMessage {
        id: chat.id.unwrap_or_else(Uuid::new_v4),
        user_id: chat.user_id.unwrap_or_default(),
        user_name: chat.user_name.unwrap_or_default(),
        body: chat.body,
        kind: chat.kind,
        audio_url: chat.audio_url,
        timestamp: chat.timestamp.unwrap_or_else(now_millis),
    }
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// Frames produced while disconnected, replayed after the re-join.
///
/// Successive code (and language) updates coalesce to the latest value.
pub struct OfflineQueue {
    queue: VecDeque<FrameBody>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Whether a frame of this kind survives being offline.
    pub fn accepts(body: &FrameBody) -> bool {
        matches!(
            body,
            FrameBody::CodeUpdated(_)
                | FrameBody::LanguageChanged(_)
                | FrameBody::ChatMessage(_)
                | FrameBody::SaveVersion(_)
        )
    }

    /// Queue a frame. Returns false when the frame kind is not queued or the
    /// queue is full.
    pub fn enqueue(&mut self, body: FrameBody) -> bool {
        if !Self::accepts(&body) {
            return false;
        }

        let superseded = |queued: &FrameBody| {
            matches!(
                (queued, &body),
                (FrameBody::CodeUpdated(_), FrameBody::CodeUpdated(_))
                    | (FrameBody::LanguageChanged(_), FrameBody::LanguageChanged(_))
            )
        };
        if let Some(i) = self.queue.iter().position(superseded) {
            self.queue.remove(i);
        }

        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(body);
        true
    }

    pub fn drain(&mut self) -> Vec<FrameBody> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

struct Shared {
    profile: UserProfile,
    config: ClientConfig,
    state: RwLock<ClientState>,
    connection: RwLock<ConnectionState>,
    /// Writer of the live connection; `None` while offline
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
    offline: Mutex<OfflineQueue>,
    /// Session to (re-)join after a reconnect
    session_id: RwLock<Option<SessionId>>,
    event_tx: mpsc::Sender<ClientEvent>,
    closing: AtomicBool,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        if self.event_tx.try_send(event).is_err() {
            log::trace!("Client event dropped (receiver full or gone)");
        }
    }

    async fn set_connection(&self, state: ConnectionState) {
        *self.connection.write().await = state;
        self.state.write().await.is_connected = state == ConnectionState::Connected;
    }

    /// Send now, queue while offline, or drop (cursor/selection).
    /// Returns whether the frame was sent or queued.
    async fn send_or_queue(&self, body: FrameBody) -> Result<bool> {
        let mut offline = self.offline.lock().await;
        let outgoing = self.outgoing.lock().await.clone();
        match outgoing {
            Some(tx) => {
                drop(offline);
                let text = Frame::new(body).encode()?;
                tx.send(text)
                    .await
                    .map_err(|_| CollabError::Transport("connection closed".into()))?;
                Ok(true)
            }
            None => Ok(offline.enqueue(body)),
        }
    }

    /// Send now or fail with a transport error.
    async fn send_now(&self, body: FrameBody) -> Result<()> {
        let tx = self
            .outgoing
            .lock()
            .await
            .clone()
            .ok_or_else(|| CollabError::Transport("not connected".into()))?;
        let text = Frame::new(body).encode()?;
        tx.send(text)
            .await
            .map_err(|_| CollabError::Transport("connection closed".into()))
    }

    async fn handle_frame(&self, frame: Frame) {
        match &frame.body {
            FrameBody::SessionCreated(snapshot) | FrameBody::SessionJoined(snapshot) => {
                *self.session_id.write().await = Some(snapshot.session.id);
            }
            FrameBody::SessionLeft(_) => {
                *self.session_id.write().await = None;
            }
            FrameBody::Error(e) => self.emit(ClientEvent::Error {
                kind: e.kind,
                message: e.message.clone(),
            }),
            _ => {}
        }

        self.state.write().await.apply(&frame);
        if frame.body != FrameBody::Pong {
            self.emit(ClientEvent::Frame(frame));
        }
    }

    /// Wire up a fresh socket: writer task with heartbeat, re-join, replay.
    async fn establish(&self, ws: WsStream) -> Result<(WsReader, JoinHandle<()>)> {
        let (mut ws_writer, ws_reader) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        let heartbeat = self.config.heartbeat_interval;

        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(heartbeat);
            ping.tick().await;
            loop {
                tokio::select! {
                    next = out_rx.recv() => match next {
                        Some(text) => {
                            if ws_writer.send(Message::text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = ping.tick() => {
                        let Ok(text) = Frame::new(FrameBody::Ping).encode() else { continue };
                        if ws_writer.send(Message::text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_writer.close().await;
        });

        // Hold the offline queue so nothing overtakes the re-join and replay
        let mut offline = self.offline.lock().await;
        if let Some(session_id) = *self.session_id.read().await {
            let join = FrameBody::JoinSession(JoinSessionPayload {
                session_id,
                user: self.profile.clone(),
                permission: None,
            });
            out_tx
                .send(Frame::new(join).encode()?)
                .await
                .map_err(|_| CollabError::Transport("connection closed".into()))?;
        }
        let replay = offline.drain();
        if !replay.is_empty() {
            log::info!("Replaying {} queued frame(s)", replay.len());
        }
        for body in replay {
            out_tx
                .send(Frame::new(body).encode()?)
                .await
                .map_err(|_| CollabError::Transport("connection closed".into()))?;
        }
        *self.outgoing.lock().await = Some(out_tx);
        drop(offline);

        self.set_connection(ConnectionState::Connected).await;
        self.emit(ClientEvent::Connected);
        Ok((ws_reader, writer))
    }

    /// Read until the socket closes or the server goes silent.
    async fn read_until_closed(&self, mut reader: WsReader) {
        let silence = self.config.heartbeat_timeout;
        loop {
            let msg = match tokio::time::timeout(silence, reader.next()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(_) => {
                    log::warn!("No frame from server for {silence:?}, dropping connection");
                    break;
                }
            };
            match msg {
                Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                    Ok(frame) => self.handle_frame(frame).await,
                    Err(e) => log::warn!("Undecodable frame from server: {e}"),
                },
                Ok(Message::Binary(data)) => match Frame::decode_bytes(&data) {
                    Ok(frame) => self.handle_frame(frame).await,
                    Err(e) => log::warn!("Undecodable frame from server: {e}"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    async fn go_offline(&self) {
        *self.outgoing.lock().await = None;
        self.set_connection(ConnectionState::Disconnected).await;
        self.emit(ClientEvent::Disconnected);
    }
}

/// The collaboration client.
pub struct CollabClient {
    server_url: String,
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    supervisor: Option<JoinHandle<()>>,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>, profile: UserProfile, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let offline = OfflineQueue::new(config.offline_queue_capacity);
        Self {
            server_url: server_url.into(),
            shared: Arc::new(Shared {
                profile,
                config,
                state: RwLock::new(ClientState::default()),
                connection: RwLock::new(ConnectionState::Disconnected),
                outgoing: Mutex::new(None),
                offline: Mutex::new(offline),
                session_id: RwLock::new(None),
                event_tx,
                closing: AtomicBool::new(false),
            }),
            event_rx: Some(event_rx),
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn profile(&self) -> &UserProfile {
        &self.shared.profile
    }

    /// Connect, optionally joining `session_id` right away.
    ///
    /// The first attempt's failure is returned; later connection losses are
    /// handled by the background supervisor.
    pub async fn connect(&mut self, session_id: Option<SessionId>) -> Result<()> {
        if let Some(id) = session_id {
            *self.shared.session_id.write().await = Some(id);
        }
        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.set_connection(ConnectionState::Connecting).await;

        let ws = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.shared.set_connection(ConnectionState::Disconnected).await;
                return Err(e.into());
            }
        };
        let (reader, writer) = self.shared.establish(ws).await?;
        log::info!("Connected to {}", self.server_url);

        let shared = self.shared.clone();
        let url = self.server_url.clone();
        self.supervisor = Some(tokio::spawn(supervise(shared, url, reader, writer)));
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    /// Snapshot of the reactive state.
    pub async fn state(&self) -> ClientState {
        self.shared.state.read().await.clone()
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        *self.shared.session_id.read().await
    }

    pub async fn can_user_edit(&self) -> bool {
        self.shared.state.read().await.can_edit()
    }

    // ─── Session control ──────────────────────────────────────────────

    pub async fn create_session(&self, options: NewSession) -> Result<()> {
        self.shared
            .send_now(FrameBody::CreateSession(CreateSessionPayload {
                user: self.shared.profile.clone(),
                options,
            }))
            .await
    }

    /// Join a session now, or on the next reconnect when offline.
    pub async fn join_session(&self, session_id: SessionId) -> Result<()> {
        *self.shared.session_id.write().await = Some(session_id);
        if !self.is_connected().await {
            return Ok(());
        }
        self.shared
            .send_now(FrameBody::JoinSession(JoinSessionPayload {
                session_id,
                user: self.shared.profile.clone(),
                permission: None,
            }))
            .await
    }

    pub async fn leave_session(&self) -> Result<()> {
        *self.shared.session_id.write().await = None;
        self.shared.offline.lock().await.clear();
        self.shared.state.write().await.clear_session();
        if self.is_connected().await {
            self.shared.send_now(FrameBody::LeaveSession).await?;
        }
        Ok(())
    }

    pub async fn delete_session(&self) -> Result<()> {
        self.shared.send_now(FrameBody::DeleteSession).await
    }

    pub async fn list_sessions(&self) -> Result<()> {
        self.shared.send_now(FrameBody::ListSessions).await
    }

    pub async fn set_permission(&self, user_id: impl Into<UserId>, permission: Permission) -> Result<()> {
        self.shared
            .send_now(FrameBody::PermissionChanged(PermissionChange {
                user_id: user_id.into(),
                permission,
            }))
            .await
    }

    // ─── Collaboration ────────────────────────────────────────────────

    /// Replace the shared buffer. Applied locally first; queued while
    /// offline with only the latest value kept.
    pub async fn send_code_update(&self, code: impl Into<String>) -> Result<bool> {
        let code = code.into();
        if let Some(session) = &mut self.shared.state.write().await.session {
            session.code = code.clone();
        }
        self.shared
            .send_or_queue(FrameBody::CodeUpdated(CodeUpdate { code }))
            .await
    }

    pub async fn update_language(&self, language: impl Into<String>) -> Result<bool> {
        let language = language.into();
        if let Some(session) = &mut self.shared.state.write().await.session {
            session.language = language.clone();
        }
        self.shared
            .send_or_queue(FrameBody::LanguageChanged(LanguageChange { language }))
            .await
    }

    /// Dropped while offline.
    pub async fn send_cursor(&self, position: CursorPosition) -> Result<bool> {
        self.shared.send_or_queue(FrameBody::CursorUpdated(position)).await
    }

    /// Dropped while offline.
    pub async fn send_selection(&self, range: SelectionRange) -> Result<bool> {
        self.shared.send_or_queue(FrameBody::SelectionUpdated(range)).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<bool> {
        self.shared
            .send_or_queue(FrameBody::ChatMessage(ChatPayload::text(text)))
            .await
    }

    pub async fn save_version(&self, description: Option<String>) -> Result<bool> {
        self.shared
            .send_or_queue(FrameBody::SaveVersion(SaveVersionPayload { description }))
            .await
    }

    /// Relay an offer, answer or ICE candidate.
    pub async fn send_signal(&self, body: FrameBody) -> Result<()> {
        match body {
            FrameBody::Offer(_) | FrameBody::Answer(_) | FrameBody::IceCandidate(_) => {
                self.shared.send_now(body).await
            }
            other => Err(CollabError::invalid_frame(format!(
                "{} is not a signaling frame",
                other.type_name()
            ))),
        }
    }

    pub async fn queued(&self) -> usize {
        self.shared.offline.lock().await.len()
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        *self.shared.outgoing.lock().await = None;
        if let Some(supervisor) = self.supervisor.take() {
            let mut supervisor = supervisor;
            if tokio::time::timeout(Duration::from_secs(2), &mut supervisor).await.is_err() {
                supervisor.abort();
            }
        }
        self.shared.set_connection(ConnectionState::Disconnected).await;
        log::info!("Disconnected from {}", self.server_url);
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

/// Own the live connection and reconnect it with exponential backoff.
async fn supervise(shared: Arc<Shared>, url: String, reader: WsReader, writer: JoinHandle<()>) {
    let mut live = Some((reader, writer));

    while let Some((reader, writer)) = live.take() {
        tokio::select! {
            _ = shared.read_until_closed(reader) => {}
            _ = wait_closing(&shared) => {}
        }
        shared.go_offline().await;
        // Writer ends once `outgoing` is dropped unless stuck on a dead socket
        let mut writer = writer;
        if tokio::time::timeout(Duration::from_secs(1), &mut writer).await.is_err() {
            log::debug!("Client writer did not stop in time, aborting");
            writer.abort();
        }
        if shared.closing.load(Ordering::SeqCst) {
            return;
        }

        let mut attempt = 0u32;
        while live.is_none() {
            attempt += 1;
            let max = shared.config.max_reconnect_attempts;
            if max > 0 && attempt > max {
                log::error!("Giving up on {url} after {max} reconnect attempts");
                shared.emit(ClientEvent::Error {
                    kind: ErrorKind::TransportError,
                    message: format!("reconnect failed after {max} attempts"),
                });
                return;
            }

            shared.set_connection(ConnectionState::Reconnecting).await;
            shared.emit(ClientEvent::Reconnecting { attempt });
            tokio::time::sleep(shared.config.backoff(attempt)).await;
            if shared.closing.load(Ordering::SeqCst) {
                return;
            }

            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _)) => match shared.establish(ws).await {
                    Ok(next) => {
                        log::info!("Reconnected to {url} (attempt {attempt})");
                        live = Some(next);
                    }
                    Err(e) => log::warn!("Reconnect handshake failed: {e}"),
                },
                Err(e) => log::debug!("Reconnect attempt {attempt} to {url} failed: {e}"),
            }
        }
    }
}

async fn wait_closing(shared: &Shared) {
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    while !shared.closing.load(Ordering::SeqCst) {
        tick.tick().await;
    }
}
