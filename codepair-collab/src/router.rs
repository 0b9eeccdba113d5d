//! Inbound frame dispatch.
//!
//! ```text
//! text frame ──► Frame::decode ──► MessageRouter::route(conn, frame)
//!                    │ err              │
//!                    ▼                  ├─ session control ──► SessionManager
//!               error frame             ├─ code / language ──► store (edit lock) ──► fan-out
//!               (InvalidFrame)          ├─ cursor / selection ► PresenceTracker ──► fan-out if changed
//!                                       ├─ chat ─────────────► store ──► fan-out incl. sender
//!                                       ├─ signaling ────────► SignalingRelay
//!                                       └─ ping ─────────────► pong
//! ```
//!
//! Handler errors and panics become an `error` frame addressed to the
//! offending connection; the connection itself stays open.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::broadcast::{ConnectionId, Outbound, SessionChannel};
use crate::error::{CollabError, ErrorKind, Result};
use crate::lifecycle::{Attachment, PeerState, SessionManager};
use crate::model::{ChatKind, ChatMessage, Participant, SessionId, UserId, VersionSnapshot};
use crate::protocol::{
    ChatPayload, CodeUpdate, Frame, FrameBody, LanguageChange, SessionLeftPayload,
    SessionListPayload, SessionSummary,
};
use crate::signaling::SignalingRelay;
use crate::storage::read_with_retry;

/// Session a connection is attached to.
pub struct Attached {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub channel: Arc<SessionChannel>,
}

/// Server-side state of one WebSocket connection.
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    state: PeerState,
    attached: Option<Attached>,
    last_activity: Instant,
}

impl Connection {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            tx,
            state: PeerState::Connecting,
            attached: None,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn attached(&self) -> Option<&Attached> {
        self.attached.as_ref()
    }

    /// Whether the session channel dropped this connection for lagging.
    pub async fn is_evicted(&self) -> bool {
        match &self.attached {
            Some(a) => !a.channel.is_subscribed(&self.id).await,
            None => false,
        }
    }

    /// Queue a frame for this connection only.
    pub async fn reply(&self, frame: Frame) {
        match frame.encode() {
            Ok(text) => {
                // Closed means the writer is gone; the reader notices shortly
                let _ = self.tx.send(Arc::new(text)).await;
            }
            Err(e) => log::error!("Connection {}: reply encode failed: {}", self.id, e),
        }
    }

    fn attach(&mut self, attachment: &Attachment) {
        self.attached = Some(Attached {
            session_id: attachment.session_id,
            user_id: attachment.user.id.clone(),
            channel: attachment.channel.clone(),
        });
        if let Err(e) = self.state.transition(PeerState::Joined) {
            log::error!("Connection {}: {}", self.id, e);
        }
    }

    fn detach(&mut self) -> Option<Attached> {
        let attached = self.attached.take();
        if self.state.in_session() {
            self.state = PeerState::Left;
        }
        attached
    }

    fn require(&self) -> Result<&Attached> {
        self.attached
            .as_ref()
            .ok_or_else(|| CollabError::NotFound("active session (join one first)".into()))
    }

    /// Record inbound traffic. Heartbeats keep the transport alive but do
    /// not count as activity.
    fn touch(&mut self, activity: bool) {
        if !activity {
            return;
        }
        self.last_activity = Instant::now();
        if matches!(self.state, PeerState::Joined | PeerState::Idle) {
            self.state = PeerState::Active;
        }
    }

    /// Demote to `Idle` after `idle_after` without activity. Returns true
    /// on the transition.
    pub fn check_idle(&mut self, idle_after: Duration) -> bool {
        if self.state == PeerState::Active && self.last_activity.elapsed() >= idle_after {
            self.state = PeerState::Idle;
            return true;
        }
        false
    }
}

/// Owned view of the sender's membership for one dispatch.
struct Member {
    session_id: SessionId,
    user_id: UserId,
    channel: Arc<SessionChannel>,
    user: Participant,
}

pub struct MessageRouter {
    manager: Arc<SessionManager>,
    relay: SignalingRelay,
}

impl MessageRouter {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            relay: SignalingRelay::new(),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Decode and route one text frame.
    pub async fn route_text(&self, conn: &mut Connection, text: &str) {
        match Frame::decode(text) {
            Ok(frame) => self.route(conn, frame).await,
            Err(e) => {
                log::debug!("Connection {}: {}", conn.id, e);
                conn.reply(Frame::from_error(&e)).await;
            }
        }
    }

    /// Route a decoded frame. Never fails: errors and panics are reported
    /// back to the sender as `error` frames.
    pub async fn route(&self, conn: &mut Connection, frame: Frame) {
        let type_name = frame.type_name();
        conn.touch(frame.body.is_activity());
        log::trace!("Connection {}: <- {}", conn.id, type_name);

        let outcome = AssertUnwindSafe(self.dispatch(conn, frame)).catch_unwind().await;
        let err = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                log::error!("Connection {}: handler for {} panicked: {}", conn.id, type_name, reason);
                CollabError::Internal(format!("handler for {type_name} failed"))
            }
        };

        match err.kind() {
            ErrorKind::StoreError | ErrorKind::Internal => {
                log::warn!("Connection {}: {} failed: {}", conn.id, type_name, err)
            }
            _ => log::debug!("Connection {}: {} rejected: {}", conn.id, type_name, err),
        }
        let mut reply = Frame::from_error(&err);
        if let Some(a) = conn.attached() {
            reply = reply.in_session(a.session_id);
        }
        conn.reply(reply).await;
    }

    /// Transport loss or heartbeat timeout.
    pub async fn disconnect(&self, conn: &mut Connection) {
        if let Some(a) = conn.detach() {
            self.manager.disconnect(conn.id, a.session_id, &a.user_id).await;
        } else if conn.state == PeerState::Connecting {
            conn.state = PeerState::Left;
        }
    }

    async fn dispatch(&self, conn: &mut Connection, frame: Frame) -> Result<()> {
        match frame.body {
            FrameBody::Ping => {
                conn.reply(Frame::new(FrameBody::Pong)).await;
                Ok(())
            }

            // ─── Session control ─────────────────────────────────────
            FrameBody::CreateSession(p) => {
                self.leave_current(conn).await;
                let attachment = self
                    .manager
                    .create(conn.id, conn.tx.clone(), &p.user, p.options)
                    .await?;
                conn.attach(&attachment);
                conn.reply(
                    Frame::new(FrameBody::SessionCreated(Box::new(attachment.snapshot)))
                        .from_user(attachment.user.id)
                        .in_session(attachment.session_id),
                )
                .await;
                Ok(())
            }
            FrameBody::JoinSession(p) => {
                self.leave_current(conn).await;
                let attachment = self
                    .manager
                    .join(conn.id, conn.tx.clone(), p.session_id, &p.user, p.permission)
                    .await?;
                conn.attach(&attachment);
                conn.reply(
                    Frame::new(FrameBody::SessionJoined(Box::new(attachment.snapshot)))
                        .from_user(attachment.user.id)
                        .in_session(attachment.session_id),
                )
                .await;
                Ok(())
            }
            FrameBody::LeaveSession => {
                let session_id = conn.require()?.session_id;
                self.leave_current(conn).await;
                conn.reply(
                    Frame::new(FrameBody::SessionLeft(SessionLeftPayload {
                        session_id,
                        reason: "left".into(),
                    }))
                    .in_session(session_id),
                )
                .await;
                Ok(())
            }
            FrameBody::DeleteSession => {
                let (session_id, user_id) = {
                    let a = conn.require()?;
                    (a.session_id, a.user_id.clone())
                };
                self.manager.delete(session_id, &user_id).await?;
                conn.detach();
                Ok(())
            }
            FrameBody::ListSessions => {
                let store = self.manager.store();
                let sessions = read_with_retry(self.manager.config().read_retry, || {
                    store.list_public_sessions()
                })
                .await?;
                conn.reply(Frame::new(FrameBody::SessionList(SessionListPayload {
                    sessions: sessions.iter().map(SessionSummary::from).collect(),
                })))
                .await;
                Ok(())
            }

            // ─── Collaboration ───────────────────────────────────────
            FrameBody::CodeUpdated(update) => self.handle_code(conn, update).await,
            FrameBody::LanguageChanged(change) => self.handle_language(conn, change).await,
            FrameBody::CursorUpdated(position) => {
                let a = self.member(conn).await?;
                if self
                    .manager
                    .presence()
                    .set_cursor(a.session_id, &a.user_id, position)
                    .await?
                {
                    let out = Frame::new(FrameBody::CursorUpdated(position))
                        .from_user(a.user_id.clone())
                        .in_session(a.session_id);
                    a.channel.broadcast(&out, Some(conn.id)).await?;
                }
                Ok(())
            }
            FrameBody::SelectionUpdated(range) => {
                let a = self.member(conn).await?;
                if self
                    .manager
                    .presence()
                    .set_selection(a.session_id, &a.user_id, range)
                    .await?
                {
                    let out = Frame::new(FrameBody::SelectionUpdated(range))
                        .from_user(a.user_id.clone())
                        .in_session(a.session_id);
                    a.channel.broadcast(&out, Some(conn.id)).await?;
                }
                Ok(())
            }
            FrameBody::ChatMessage(chat) => self.handle_chat(conn, chat).await,
            FrameBody::PermissionChanged(change) => {
                let a = self.member(conn).await?;
                self.manager
                    .set_permission(a.session_id, &a.user_id, &change.user_id, change.permission)
                    .await?;
                Ok(())
            }
            FrameBody::SaveVersion(p) => {
                let a = self.member(conn).await?;
                if !a.user.permission.can_edit() {
                    return Err(CollabError::forbidden("view-only users cannot save versions"));
                }
                let store = self.manager.store();
                let session =
                    read_with_retry(self.manager.config().read_retry, || store.get_session(a.session_id))
                        .await?;
                let snapshot = VersionSnapshot::of(&session, &a.user, p.description);
                store.save_version(snapshot.clone()).await?;
                let out = Frame::new(FrameBody::VersionSaved(snapshot))
                    .from_user(a.user_id.clone())
                    .in_session(a.session_id);
                a.channel.broadcast(&out, None).await?;
                Ok(())
            }

            // ─── Signaling ───────────────────────────────────────────
            body @ (FrameBody::Offer(_) | FrameBody::Answer(_) | FrameBody::IceCandidate(_)) => {
                let a = self.member(conn).await?;
                self.relay
                    .relay(&a.channel, a.session_id, (conn.id, &a.user_id), body)
                    .await?;
                Ok(())
            }

            // ─── Server → client only ────────────────────────────────
            body @ (FrameBody::SessionList(_)
            | FrameBody::SessionCreated(_)
            | FrameBody::SessionJoined(_)
            | FrameBody::SessionLeft(_)
            | FrameBody::UserJoined(_)
            | FrameBody::UserLeft(_)
            | FrameBody::UserUpdated(_)
            | FrameBody::VersionSaved(_)
            | FrameBody::Error(_)
            | FrameBody::Pong) => Err(CollabError::invalid_frame(format!(
                "'{}' is sent by the server only",
                body.type_name()
            ))),
        }
    }

    /// The attached session and the sender's current presence record.
    ///
    /// A connection whose presence entry vanished (session deleted) is
    /// detached here.
    async fn member(&self, conn: &mut Connection) -> Result<Member> {
        let (session_id, user_id, channel) = {
            let a = conn.require()?;
            (a.session_id, a.user_id.clone(), a.channel.clone())
        };
        match self.manager.presence().user(session_id, &user_id).await {
            Some(user) => Ok(Member {
                session_id,
                user_id,
                channel,
                user,
            }),
            None => {
                conn.detach();
                Err(CollabError::SessionNotFound(session_id))
            }
        }
    }

    async fn leave_current(&self, conn: &mut Connection) {
        if let Some(a) = conn.detach() {
            self.manager.leave(conn.id, a.session_id, &a.user_id).await;
        }
    }

    async fn handle_code(&self, conn: &mut Connection, update: CodeUpdate) -> Result<()> {
        let a = self.member(conn).await?;
        if !a.user.permission.can_edit() {
            return Err(CollabError::forbidden("view-only users cannot edit the code"));
        }

        let _edit = a.channel.lock_edits().await;
        self.manager
            .store()
            .update_code(a.session_id, update.code.clone())
            .await?;
        let out = Frame::new(FrameBody::CodeUpdated(update))
            .from_user(a.user_id.clone())
            .in_session(a.session_id);
        a.channel.broadcast(&out, Some(conn.id)).await?;
        Ok(())
    }

    async fn handle_language(&self, conn: &mut Connection, change: LanguageChange) -> Result<()> {
        let a = self.member(conn).await?;
        if !a.user.permission.can_edit() {
            return Err(CollabError::forbidden("view-only users cannot change the language"));
        }
        if change.language.trim().is_empty() {
            return Err(CollabError::invalid_frame("language must not be empty"));
        }

        let _edit = a.channel.lock_edits().await;
        self.manager
            .store()
            .update_language(a.session_id, change.language.clone())
            .await?;
        let out = Frame::new(FrameBody::LanguageChanged(change))
            .from_user(a.user_id.clone())
            .in_session(a.session_id);
        a.channel.broadcast(&out, Some(conn.id)).await?;
        Ok(())
    }

    async fn handle_chat(&self, conn: &mut Connection, chat: ChatPayload) -> Result<()> {
        let a = self.member(conn).await?;
        match chat.kind {
            ChatKind::System => {
                return Err(CollabError::invalid_frame("clients cannot send system messages"))
            }
            ChatKind::Voice if chat.audio_url.is_none() => {
                return Err(CollabError::invalid_frame("voice messages need an audioUrl"))
            }
            ChatKind::Text if chat.body.trim().is_empty() => {
                return Err(CollabError::invalid_frame("empty chat message"))
            }
            _ => {}
        }

        let mut message = ChatMessage::text(&a.user, chat.body);
        message.kind = chat.kind;
        message.audio_url = chat.audio_url;

        self.manager
            .store()
            .append_message(a.session_id, message.clone(), self.manager.config().max_chat_messages)
            .await?;
        let out = Frame::new(FrameBody::ChatMessage(message.into()))
            .from_user(a.user_id.clone())
            .in_session(a.session_id);
        a.channel.broadcast(&out, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChannelManager;
    use crate::lifecycle::LifecycleConfig;
    use crate::model::{CursorPosition, NewSession, Permission, UserProfile};
    use crate::presence::PresenceTracker;
    use crate::protocol::{CreateSessionPayload, JoinSessionPayload};
    use crate::storage::{MemoryStore, SessionStore};

    struct Peer {
        conn: Connection,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Peer {
        fn new() -> Self {
            Self::with_capacity(64)
        }

        fn with_capacity(capacity: usize) -> Self {
            let (tx, rx) = mpsc::channel(capacity);
            Self {
                conn: Connection::new(tx),
                rx,
            }
        }

        fn drain(&mut self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Ok(text) = self.rx.try_recv() {
                frames.push(Frame::decode(&text).unwrap());
            }
            frames
        }

        fn error_kinds(&mut self) -> Vec<ErrorKind> {
            self.drain()
                .into_iter()
                .filter_map(|f| match f.body {
                    FrameBody::Error(e) => Some(e.kind),
                    _ => None,
                })
                .collect()
        }
    }

    fn router() -> MessageRouter {
        let manager = SessionManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(PresenceTracker::new()),
            Arc::new(ChannelManager::new()),
            LifecycleConfig::default(),
        );
        MessageRouter::new(Arc::new(manager))
    }

    async fn create(router: &MessageRouter, peer: &mut Peer, user: &str) -> SessionId {
        router
            .route(
                &mut peer.conn,
                Frame::new(FrameBody::CreateSession(CreateSessionPayload {
                    user: UserProfile::new(user, user),
                    options: NewSession::named("demo"),
                })),
            )
            .await;
        peer.drain();
        peer.conn.attached().unwrap().session_id
    }

    async fn join(router: &MessageRouter, peer: &mut Peer, sid: SessionId, user: &str, perm: Option<Permission>) {
        router
            .route(
                &mut peer.conn,
                Frame::new(FrameBody::JoinSession(JoinSessionPayload {
                    session_id: sid,
                    user: UserProfile::new(user, user),
                    permission: perm,
                })),
            )
            .await;
    }

    fn code(text: &str) -> Frame {
        Frame::new(FrameBody::CodeUpdated(CodeUpdate { code: text.into() }))
    }

    #[tokio::test]
    async fn test_ping_pong_without_session() {
        let r = router();
        let mut p = Peer::new();
        r.route(&mut p.conn, Frame::new(FrameBody::Ping)).await;
        assert_eq!(p.drain()[0].body, FrameBody::Pong);
        assert_eq!(p.conn.state(), PeerState::Connecting);
    }

    #[tokio::test]
    async fn test_create_replies_with_snapshot() {
        let r = router();
        let mut p = Peer::new();
        r.route(
            &mut p.conn,
            Frame::new(FrameBody::CreateSession(CreateSessionPayload {
                user: UserProfile::new("alice", "Alice"),
                options: NewSession::named("demo"),
            })),
        )
        .await;
        let frames = p.drain();
        assert_eq!(frames.len(), 1);
        match &frames[0].body {
            FrameBody::SessionCreated(s) => assert_eq!(s.you.permission, Permission::Admin),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.conn.state(), PeerState::Joined);
    }

    #[tokio::test]
    async fn test_code_update_fans_out_without_echo() {
        let r = router();
        let mut a = Peer::new();
        let mut b = Peer::new();
        let sid = create(&r, &mut a, "alice").await;
        join(&r, &mut b, sid, "bob", None).await;
        b.drain();
        a.drain();

        r.route(&mut a.conn, code("x=1")).await;
        assert!(a.drain().is_empty());
        let got = b.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, FrameBody::CodeUpdated(CodeUpdate { code: "x=1".into() }));
        assert_eq!(got[0].user_id.as_deref(), Some("alice"));
        assert_eq!(a.conn.state(), PeerState::Active);

        let stored = r.manager().store().get_session(sid).await.unwrap();
        assert_eq!(stored.code, "x=1");
    }

    #[tokio::test]
    async fn test_lagging_peer_evicted_on_code_update() {
        let r = router();
        let mut a = Peer::new();
        let mut b = Peer::with_capacity(1);
        let sid = create(&r, &mut a, "alice").await;
        // session-joined fills bob's only slot
        join(&r, &mut b, sid, "bob", None).await;
        assert!(!b.conn.is_evicted().await);

        r.route(&mut a.conn, Frame::new(FrameBody::CursorUpdated(CursorPosition::new(1, 1)))).await;
        assert!(!b.conn.is_evicted().await);

        r.route(&mut a.conn, code("x=1")).await;
        assert!(b.conn.is_evicted().await);
        assert!(!a.conn.is_evicted().await);
    }

    #[tokio::test]
    async fn test_view_user_cannot_edit() {
        let r = router();
        let mut a = Peer::new();
        let mut v = Peer::new();
        let sid = create(&r, &mut a, "alice").await;
        r.route(&mut a.conn, code("original")).await;
        join(&r, &mut v, sid, "vic", Some(Permission::View)).await;
        v.drain();
        a.drain();

        r.route(&mut v.conn, code("hacked")).await;
        assert_eq!(v.error_kinds(), vec![ErrorKind::Forbidden]);
        assert!(a.drain().is_empty());
        assert_eq!(r.manager().store().get_session(sid).await.unwrap().code, "original");
    }

    #[tokio::test]
    async fn test_permission_downgrade_then_rejected() {
        let r = router();
        let mut a = Peer::new();
        let mut b = Peer::new();
        let sid = create(&r, &mut a, "alice").await;
        join(&r, &mut b, sid, "bob", None).await;

        r.route(&mut b.conn, code("by bob")).await;
        b.drain();

        r.route(
            &mut a.conn,
            Frame::new(FrameBody::PermissionChanged(crate::protocol::PermissionChange {
                user_id: "bob".into(),
                permission: Permission::View,
            })),
        )
        .await;
        assert!(b
            .drain()
            .iter()
            .any(|f| matches!(f.body, FrameBody::PermissionChanged(_))));

        r.route(&mut b.conn, code("again")).await;
        assert_eq!(b.error_kinds(), vec![ErrorKind::Forbidden]);
        assert_eq!(r.manager().store().get_session(sid).await.unwrap().code, "by bob");
    }

    #[tokio::test]
    async fn test_identical_cursor_not_rebroadcast() {
        let r = router();
        let mut a = Peer::new();
        let mut b = Peer::new();
        let sid = create(&r, &mut a, "alice").await;
        join(&r, &mut b, sid, "bob", None).await;
        a.drain();

        let cursor = Frame::new(FrameBody::CursorUpdated(CursorPosition::new(2, 5)));
        r.route(&mut b.conn, cursor.clone()).await;
        r.route(&mut b.conn, cursor).await;
        assert_eq!(a.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_chat_includes_sender() {
        let r = router();
        let mut a = Peer::new();
        let mut b = Peer::new();
        let sid = create(&r, &mut a, "alice").await;
        join(&r, &mut b, sid, "bob", None).await;
        a.drain();
        b.drain();

        r.route(
            &mut a.conn,
            Frame::new(FrameBody::ChatMessage(ChatPayload::text("hello"))),
        )
        .await;
        for peer in [&mut a, &mut b] {
            let frames = peer.drain();
            match &frames[0].body {
                FrameBody::ChatMessage(m) => {
                    assert_eq!(m.body, "hello");
                    assert_eq!(m.user_name.as_deref(), Some("alice"));
                    assert!(m.id.is_some());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(r.manager().store().messages(sid).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_frames_before_join_not_found() {
        let r = router();
        let mut p = Peer::new();
        r.route(&mut p.conn, code("x")).await;
        r.route(&mut p.conn, Frame::new(FrameBody::LeaveSession)).await;
        assert_eq!(p.error_kinds(), vec![ErrorKind::NotFound, ErrorKind::NotFound]);
    }

    #[tokio::test]
    async fn test_server_only_and_unknown_frames() {
        let r = router();
        let mut p = Peer::new();
        r.route(&mut p.conn, Frame::new(FrameBody::Pong)).await;
        r.route_text(&mut p.conn, r#"{"type":"explode"}"#).await;
        r.route_text(&mut p.conn, "not json at all").await;
        assert_eq!(
            p.error_kinds(),
            vec![ErrorKind::InvalidFrame, ErrorKind::InvalidFrame, ErrorKind::InvalidFrame]
        );

        // Still usable afterwards
        r.route(&mut p.conn, Frame::new(FrameBody::Ping)).await;
        assert_eq!(p.drain()[0].body, FrameBody::Pong);
    }

    #[tokio::test]
    async fn test_leave_then_other_frames_rejected() {
        let r = router();
        let mut a = Peer::new();
        let mut b = Peer::new();
        let sid = create(&r, &mut a, "alice").await;
        join(&r, &mut b, sid, "bob", None).await;
        a.drain();

        r.route(&mut b.conn, Frame::new(FrameBody::LeaveSession)).await;
        assert!(matches!(b.drain()[1].body, FrameBody::SessionLeft(_)));
        assert_eq!(b.conn.state(), PeerState::Left);
        assert!(matches!(a.drain()[0].body, FrameBody::UserLeft(_)));

        let session = r.manager().store().get_session(sid).await.unwrap();
        assert!(session.member("bob").is_none());
    }

    #[tokio::test]
    async fn test_delete_detaches_everyone() {
        let r = router();
        let mut a = Peer::new();
        let mut b = Peer::new();
        let sid = create(&r, &mut a, "alice").await;
        join(&r, &mut b, sid, "bob", None).await;
        b.drain();

        r.route(&mut a.conn, Frame::new(FrameBody::DeleteSession)).await;
        assert!(a.conn.attached().is_none());
        assert!(matches!(b.drain()[0].body, FrameBody::SessionLeft(_)));

        // Bob's connection notices on its next frame
        r.route(&mut b.conn, code("late")).await;
        assert_eq!(b.error_kinds(), vec![ErrorKind::NotFound]);
        assert!(b.conn.attached().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_marks_inactive_and_clears_cursor() {
        let r = router();
        let mut a = Peer::new();
        let mut b = Peer::new();
        let sid = create(&r, &mut a, "alice").await;
        join(&r, &mut b, sid, "bob", None).await;
        r.route(&mut b.conn, Frame::new(FrameBody::CursorUpdated(CursorPosition::new(1, 1)))).await;
        a.drain();

        r.disconnect(&mut b.conn).await;
        assert!(matches!(a.drain()[0].body, FrameBody::UserLeft(_)));
        assert!(r.manager().presence().cursor(sid, "bob").await.is_none());
        let session = r.manager().store().get_session(sid).await.unwrap();
        assert!(!session.member("bob").unwrap().active);
    }

    #[tokio::test]
    async fn test_idle_transition() {
        let r = router();
        let mut a = Peer::new();
        create(&r, &mut a, "alice").await;
        r.route(&mut a.conn, code("x")).await;
        assert_eq!(a.conn.state(), PeerState::Active);
        assert!(a.conn.check_idle(Duration::ZERO));
        assert_eq!(a.conn.state(), PeerState::Idle);

        // Heartbeats do not wake an idle peer
        r.route(&mut a.conn, Frame::new(FrameBody::Ping)).await;
        assert_eq!(a.conn.state(), PeerState::Idle);
        r.route(&mut a.conn, code("y")).await;
        assert_eq!(a.conn.state(), PeerState::Active);
    }
}
