//! Presence tracking: who is connected, where their cursor is, what they
//! have selected.
//!
//! ## Architecture
//!
//! ```text
//! cursor-updated frame
//!       │
//!       ▼
//! MessageRouter ──► PresenceTracker::set_cursor()
//!                        │  (false when unchanged)
//!                        ▼
//!                  SessionPresence { users, cursors, selections }
//!                        │
//!                        ▼   changed?
//!                  SessionChannel::broadcast(except sender)
//! ```
//!
//! Presence is ephemeral and never persisted. Every cursor and selection
//! entry belongs to a user registered in the same session; `clear_user`
//! removes all three together.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{CollabError, Result};
use crate::model::{CursorPosition, Participant, SelectionRange, SessionId, UserId};

// ───────────────────────────────────────────────────────────────────
// Per-session state
// ───────────────────────────────────────────────────────────────────

/// Snapshot of one session's presence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub users: HashMap<UserId, Participant>,
    pub cursors: HashMap<UserId, CursorPosition>,
    pub selections: HashMap<UserId, SelectionRange>,
}

impl Presence {
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn require(&self, user_id: &str) -> Result<()> {
        if self.users.contains_key(user_id) {
            Ok(())
        } else {
            Err(CollabError::NotFound(format!("user {user_id} in presence")))
        }
    }

    fn remove(&mut self, user_id: &str) -> Option<Participant> {
        self.cursors.remove(user_id);
        self.selections.remove(user_id);
        self.users.remove(user_id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Registry of connected users, cursors and selections for all sessions.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    sessions: RwLock<HashMap<SessionId, Presence>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a user in a session.
    pub async fn register_user(&self, session_id: SessionId, user: Participant) {
        log::debug!("Presence: {} registered in {}", user.id, session_id);
        self.sessions
            .write()
            .await
            .entry(session_id)
            .or_default()
            .users
            .insert(user.id.clone(), user);
    }

    /// Replace the stored profile of a registered user (e.g. after a
    /// permission change).
    pub async fn update_user(&self, session_id: SessionId, user: Participant) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let presence = sessions
            .get_mut(&session_id)
            .ok_or(CollabError::SessionNotFound(session_id))?;
        presence.require(&user.id)?;
        presence.users.insert(user.id.clone(), user);
        Ok(())
    }

    /// Record a cursor. Returns `false` when the position is unchanged.
    pub async fn set_cursor(
        &self,
        session_id: SessionId,
        user_id: &str,
        position: CursorPosition,
    ) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let presence = sessions
            .get_mut(&session_id)
            .ok_or(CollabError::SessionNotFound(session_id))?;
        presence.require(user_id)?;

        let previous = presence.cursors.insert(user_id.to_string(), position);
        Ok(previous != Some(position))
    }

    /// Record a selection. Returns `false` when the range is unchanged.
    pub async fn set_selection(
        &self,
        session_id: SessionId,
        user_id: &str,
        range: SelectionRange,
    ) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let presence = sessions
            .get_mut(&session_id)
            .ok_or(CollabError::SessionNotFound(session_id))?;
        presence.require(user_id)?;

        let previous = presence.selections.insert(user_id.to_string(), range);
        Ok(previous != Some(range))
    }

    /// Remove every trace of a user. A no-op when the session or the user
    /// is already gone. Empty sessions are dropped.
    pub async fn clear_user(&self, session_id: SessionId, user_id: &str) -> Option<Participant> {
        let mut sessions = self.sessions.write().await;
        let presence = sessions.get_mut(&session_id)?;
        let removed = presence.remove(user_id);
        if presence.users.is_empty() {
            sessions.remove(&session_id);
        }
        if removed.is_some() {
            log::debug!("Presence: {} cleared from {}", user_id, session_id);
        }
        removed
    }

    /// Snapshot of a session's presence (empty when unknown).
    pub async fn get_presence(&self, session_id: SessionId) -> Presence {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn user(&self, session_id: SessionId, user_id: &str) -> Option<Participant> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .and_then(|p| p.users.get(user_id).cloned())
    }

    pub async fn cursor(&self, session_id: SessionId, user_id: &str) -> Option<CursorPosition> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .and_then(|p| p.cursors.get(user_id).copied())
    }

    /// Drop a whole session (deletion, teardown).
    pub async fn clear_session(&self, session_id: SessionId) {
        self.sessions.write().await.remove(&session_id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
