//! Session lifecycle: create, join, leave, permission changes, deletion and
//! grace-period cleanup of empty sessions.
//!
//! ## Connection states
//!
//! ```text
//!              join ok            first frame
//! Connecting ──────────► Joined ─────────────► Active ◄──┐
//!     │                    │                     │       │ any frame
//!     │                    │                     ▼       │
//!     │                    │                   Idle ─────┘
//!     │                    │                     │
//!     └────────────────────┴─────────────────────┴──► Left ──► Joined (re-join)
//!          leave / disconnect / heartbeat timeout
//! ```
//!
//! ## Membership
//!
//! - explicit leave purges the member record
//! - disconnect marks it inactive so a reconnect keeps its permission
//! - a session with no active member is deleted after `empty_session_grace`
//!   unless someone joins first

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::broadcast::{ChannelManager, ConnectionId, Outbound, SessionChannel};
use crate::error::{CollabError, Result};
use crate::model::{NewSession, Participant, Permission, Session, SessionId, UserProfile};
use crate::presence::PresenceTracker;
use crate::protocol::{
    Frame, FrameBody, PermissionChange, SessionLeftPayload, SessionSnapshot, UserLeftPayload,
    UserPayload,
};
use crate::storage::{read_with_retry, RetryPolicy, SessionStore};

// ───────────────────────────────────────────────────────────────────
// Peer state machine
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Joined,
    Active,
    Idle,
    Left,
}

impl PeerState {
    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Connecting, Joined)
                | (Joined, Active)
                | (Active, Idle)
                | (Idle, Active)
                | (Connecting, Left)
                | (Joined, Left)
                | (Active, Left)
                | (Idle, Left)
                | (Left, Joined)
        )
    }

    /// Move to `next`, rejecting transitions the diagram does not allow.
    pub fn transition(&mut self, next: PeerState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(CollabError::Internal(format!(
                "illegal peer transition {self:?} -> {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }

    /// Attached to a session and allowed to send session frames.
    pub fn in_session(self) -> bool {
        matches!(self, PeerState::Joined | PeerState::Active | PeerState::Idle)
    }
}

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Delay before a session with no active member is deleted
    pub empty_session_grace: Duration,
    /// Inactivity after which an active peer is reported idle
    pub idle_after: Duration,
    /// Permission of a new non-owner member that requests none
    pub default_permission: Permission,
    /// Chat history kept per session
    pub max_chat_messages: usize,
    pub read_retry: RetryPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            empty_session_grace: Duration::from_secs(300),
            idle_after: Duration::from_secs(120),
            default_permission: Permission::Edit,
            max_chat_messages: 200,
            read_retry: RetryPolicy::default(),
        }
    }
}

/// Result of attaching a connection to a session.
pub struct Attachment {
    pub session_id: SessionId,
    pub user: Participant,
    pub channel: Arc<SessionChannel>,
    pub snapshot: SessionSnapshot,
}

struct PendingCleanup {
    generation: u64,
    handle: JoinHandle<()>,
}

type CleanupMap = Arc<Mutex<HashMap<SessionId, PendingCleanup>>>;

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    presence: Arc<PresenceTracker>,
    channels: Arc<ChannelManager>,
    config: LifecycleConfig,
    cleanups: CleanupMap,
    generation: AtomicU64,
    running: AtomicBool,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        presence: Arc<PresenceTracker>,
        channels: Arc<ChannelManager>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            presence,
            channels,
            config,
            cleanups: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Start the manager.
    ///
    /// Sessions found in the store belong to a previous process: none of
    /// their members is connected any more, so they are all marked inactive
    /// and every session gets a cleanup timer. Returns the number recovered.
    pub async fn start(&self) -> Result<usize> {
        self.running.store(true, Ordering::SeqCst);

        let sessions = read_with_retry(self.config.read_retry, || self.store.list_sessions()).await?;
        for session in &sessions {
            for member in session.active_members() {
                let mut member = member.clone();
                member.active = false;
                if let Err(e) = self.store.update_member(session.id, member).await {
                    log::warn!("Recovery: could not deactivate member in {}: {}", session.id, e);
                }
            }
            self.schedule_cleanup(session.id).await;
        }

        if !sessions.is_empty() {
            log::info!("Recovered {} session(s) from the store", sessions.len());
        }
        Ok(sessions.len())
    }

    /// Stop the manager, cancelling every pending cleanup timer.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut cleanups = self.cleanups.lock().await;
        for (_, pending) in cleanups.drain() {
            pending.handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn load(&self, session_id: SessionId) -> Result<Session> {
        read_with_retry(self.config.read_retry, || self.store.get_session(session_id)).await
    }

    // ─── Create / join ────────────────────────────────────────────────

    /// Create a session and attach its owner as `admin`.
    pub async fn create(
        &self,
        conn: ConnectionId,
        tx: mpsc::Sender<Outbound>,
        owner: &UserProfile,
        options: NewSession,
    ) -> Result<Attachment> {
        if options.max_users == Some(0) {
            return Err(CollabError::invalid_frame("maxUsers must be at least 1"));
        }
        let session = self.store.create_session(&owner.id, options).await?;
        log::info!("Session {} '{}' created by {}", session.id, session.name, owner.id);

        match self.join(conn, tx, session.id, owner, None).await {
            Ok(attachment) => Ok(attachment),
            Err(e) => {
                // A memberless session is never scheduled for cleanup
                if let Err(del) = self.store.delete_session(session.id).await {
                    log::warn!("Session {}: rollback after failed create: {}", session.id, del);
                }
                Err(e)
            }
        }
    }

    /// Attach a connection to an existing session.
    pub async fn join(
        &self,
        conn: ConnectionId,
        tx: mpsc::Sender<Outbound>,
        session_id: SessionId,
        profile: &UserProfile,
        requested: Option<Permission>,
    ) -> Result<Attachment> {
        let session = self.load(session_id).await?;
        let existing = session.member(&profile.id).cloned();

        let permission = if session.is_owner(&profile.id) {
            Permission::Admin
        } else if requested == Some(Permission::Admin) {
            return Err(CollabError::InvalidPermission(
                "only the owner holds admin on join".into(),
            ));
        } else if let Some(member) = &existing {
            member.permission
        } else {
            requested.unwrap_or(self.config.default_permission)
        };

        let mut participant = Participant::from_profile(profile, permission);
        if let Some(member) = &existing {
            participant.joined_at = member.joined_at;
        }

        let session = self.store.add_member(session_id, participant.clone()).await?;
        self.cancel_cleanup(session_id).await;

        self.presence.register_user(session_id, participant.clone()).await;
        let (channel, other_tabs) = self
            .channels
            .attach(session_id, conn, participant.id.clone(), tx)
            .await;

        if other_tabs == 0 {
            let joined = Frame::new(FrameBody::UserJoined(UserPayload {
                user: participant.clone(),
            }))
            .from_user(participant.id.clone())
            .in_session(session_id);
            channel.broadcast(&joined, Some(conn)).await?;
        }

        let presence = self.presence.get_presence(session_id).await;
        let messages = read_with_retry(self.config.read_retry, || self.store.messages(session_id))
            .await
            .unwrap_or_else(|e| {
                log::warn!("Session {}: chat history unavailable: {}", session_id, e);
                Vec::new()
            });

        let mut users: Vec<Participant> = presence.users.into_values().collect();
        users.sort_by_key(|u| u.joined_at);

        log::info!(
            "{} joined session {} as {:?} ({} present)",
            participant.id,
            session_id,
            participant.permission,
            users.len()
        );

        Ok(Attachment {
            session_id,
            user: participant.clone(),
            channel,
            snapshot: SessionSnapshot {
                session,
                you: participant,
                users,
                cursors: presence.cursors,
                selections: presence.selections,
                messages,
            },
        })
    }

    // ─── Leave / disconnect ───────────────────────────────────────────

    /// Explicit leave: the member record is purged.
    pub async fn leave(&self, conn: ConnectionId, session_id: SessionId, user_id: &str) {
        self.detach(conn, session_id, user_id, true).await;
    }

    /// Transport loss or heartbeat timeout: the member is marked inactive.
    pub async fn disconnect(&self, conn: ConnectionId, session_id: SessionId, user_id: &str) {
        self.detach(conn, session_id, user_id, false).await;
    }

    async fn detach(&self, conn: ConnectionId, session_id: SessionId, user_id: &str, purge: bool) {
        let channel = self.channels.get(&session_id).await;
        let remaining = match &channel {
            Some(channel) => {
                channel.unsubscribe(&conn).await;
                channel.connections_of(user_id).await
            }
            None => 0,
        };

        // Another tab of the same user is still attached
        if remaining > 0 {
            log::debug!("{} closed one of {} connections to {}", user_id, remaining + 1, session_id);
            return;
        }

        let cleared = self.presence.clear_user(session_id, user_id).await;

        let membership = if purge {
            self.store.remove_member(session_id, user_id).await
        } else {
            self.mark_inactive(session_id, user_id).await
        };

        let session = match membership {
            Ok(session) => Some(session),
            Err(CollabError::SessionNotFound(_)) => None,
            Err(e) => {
                log::warn!("Session {}: membership update for {} failed: {}", session_id, user_id, e);
                None
            }
        };

        if let Some(channel) = &channel {
            let name = cleared
                .map(|p| p.name)
                .or_else(|| session.as_ref().and_then(|s| s.member(user_id)).map(|m| m.name.clone()))
                .unwrap_or_else(|| user_id.to_string());
            let left = Frame::new(FrameBody::UserLeft(UserLeftPayload {
                user_id: user_id.to_string(),
                name,
            }))
            .from_user(user_id)
            .in_session(session_id);
            if let Err(e) = channel.broadcast(&left, None).await {
                log::warn!("Session {}: user-left fan-out failed: {}", session_id, e);
            }
        }
        self.channels.remove_if_empty(&session_id).await;

        log::info!(
            "{} {} session {}",
            user_id,
            if purge { "left" } else { "disconnected from" },
            session_id
        );

        if let Some(session) = session {
            if session.active_count() == 0 {
                self.schedule_cleanup(session_id).await;
            }
        }
    }

    async fn mark_inactive(&self, session_id: SessionId, user_id: &str) -> Result<Session> {
        let session = self.load(session_id).await?;
        match session.member(user_id) {
            Some(member) if member.active => {
                let mut member = member.clone();
                member.active = false;
                self.store.update_member(session_id, member).await
            }
            _ => Ok(session),
        }
    }

    // ─── Permissions / deletion ───────────────────────────────────────

    /// Change a member's permission. Only admins may do this and the
    /// owner's own permission is fixed.
    pub async fn set_permission(
        &self,
        session_id: SessionId,
        actor_id: &str,
        target_id: &str,
        permission: Permission,
    ) -> Result<Participant> {
        let session = self.load(session_id).await?;
        let actor = session
            .member(actor_id)
            .ok_or_else(|| CollabError::NotFound(format!("user {actor_id}")))?;
        if !actor.permission.is_admin() {
            return Err(CollabError::forbidden("only admins can change permissions"));
        }
        if session.is_owner(target_id) {
            return Err(CollabError::forbidden("the owner's permission cannot be changed"));
        }

        let mut target = session
            .member(target_id)
            .cloned()
            .ok_or_else(|| CollabError::NotFound(format!("user {target_id}")))?;
        target.permission = permission;
        self.store.update_member(session_id, target.clone()).await?;

        // Offline members have no presence entry
        if let Err(e) = self.presence.update_user(session_id, target.clone()).await {
            log::debug!("Presence not updated for {}: {}", target_id, e);
        }

        if let Some(channel) = self.channels.get(&session_id).await {
            let changed = Frame::new(FrameBody::PermissionChanged(PermissionChange {
                user_id: target_id.to_string(),
                permission,
            }))
            .from_user(actor_id)
            .in_session(session_id);
            channel.broadcast(&changed, None).await?;
        }

        log::info!("{} set {} to {:?} in {}", actor_id, target_id, permission, session_id);
        Ok(target)
    }

    /// Owner-only deletion. Every attached connection receives
    /// `session-left`.
    pub async fn delete(&self, session_id: SessionId, actor_id: &str) -> Result<()> {
        let session = self.load(session_id).await?;
        if !session.is_owner(actor_id) {
            return Err(CollabError::forbidden("only the owner can delete a session"));
        }

        if let Some(channel) = self.channels.remove(&session_id).await {
            let left = Frame::new(FrameBody::SessionLeft(SessionLeftPayload {
                session_id,
                reason: "deleted".into(),
            }))
            .from_user(actor_id)
            .in_session(session_id);
            channel.broadcast(&left, None).await?;
        }
        self.cancel_cleanup(session_id).await;
        self.presence.clear_session(session_id).await;
        self.store.delete_session(session_id).await?;

        log::info!("Session {} deleted by {}", session_id, actor_id);
        Ok(())
    }

    // ─── Grace-period cleanup ─────────────────────────────────────────

    /// Arm (or re-arm) the deletion timer of an empty session.
    pub async fn schedule_cleanup(&self, session_id: SessionId) {
        if !self.is_running() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let grace = self.config.empty_session_grace;
        let store = self.store.clone();
        let presence = self.presence.clone();
        let channels = self.channels.clone();
        let cleanups = self.cleanups.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            match store.get_session(session_id).await {
                Ok(session) if session.active_count() == 0 => {
                    channels.remove(&session_id).await;
                    presence.clear_session(session_id).await;
                    match store.delete_session(session_id).await {
                        Ok(()) => log::info!("Session {} deleted after {:?} empty", session_id, grace),
                        Err(e) => log::warn!("Session {} cleanup failed: {}", session_id, e),
                    }
                }
                Ok(_) => log::debug!("Session {} repopulated, cleanup skipped", session_id),
                Err(CollabError::SessionNotFound(_)) => {}
                Err(e) => log::warn!("Session {} cleanup lookup failed: {}", session_id, e),
            }

            let mut cleanups = cleanups.lock().await;
            if cleanups.get(&session_id).map(|p| p.generation) == Some(generation) {
                cleanups.remove(&session_id);
            }
        });

        let previous = self
            .cleanups
            .lock()
            .await
            .insert(session_id, PendingCleanup { generation, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        log::debug!("Session {} empty, deletion in {:?}", session_id, grace);
    }

    /// Cancel a pending deletion. Returns whether one was pending.
    pub async fn cancel_cleanup(&self, session_id: SessionId) -> bool {
        match self.cleanups.lock().await.remove(&session_id) {
            Some(pending) => {
                pending.handle.abort();
                log::debug!("Session {} cleanup cancelled", session_id);
                true
            }
            None => false,
        }
    }

    pub async fn pending_cleanups(&self) -> usize {
        self.cleanups.lock().await.len()
    }
}
