//! In-process session store.
//!
//! Everything lives in a `RwLock<HashMap>` and disappears with the process.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use super::SessionStore;
use crate::error::{CollabError, Result};
use crate::model::{ChatMessage, NewSession, Participant, Session, SessionId, Visibility, VersionSnapshot};

#[derive(Debug)]
struct Entry {
    session: Session,
    messages: VecDeque<ChatMessage>,
    versions: Vec<VersionSnapshot>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<SessionId, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions currently held.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn mutate<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Entry) -> Result<T>,
    ) -> Result<T> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(CollabError::SessionNotFound(id))?;
        f(entry)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, owner_id: &str, options: NewSession) -> Result<Session> {
        let session = Session::new(owner_id, options);
        self.entries.write().await.insert(
            session.id,
            Entry {
                session: session.clone(),
                messages: VecDeque::new(),
                versions: Vec::new(),
            },
        );
        Ok(session)
    }

    async fn get_session(&self, id: SessionId) -> Result<Session> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|e| e.session.clone())
            .ok_or(CollabError::SessionNotFound(id))
    }

    async fn update_code(&self, id: SessionId, code: String) -> Result<()> {
        self.mutate(id, |e| {
            e.session.set_code(code);
            Ok(())
        })
        .await
    }

    async fn update_language(&self, id: SessionId, language: String) -> Result<()> {
        self.mutate(id, |e| {
            e.session.set_language(language);
            Ok(())
        })
        .await
    }

    async fn add_member(&self, id: SessionId, participant: Participant) -> Result<Session> {
        self.mutate(id, |e| {
            e.session.upsert_member(participant)?;
            Ok(e.session.clone())
        })
        .await
    }

    async fn update_member(&self, id: SessionId, participant: Participant) -> Result<Session> {
        self.mutate(id, |e| {
            e.session.replace_member(participant)?;
            Ok(e.session.clone())
        })
        .await
    }

    async fn remove_member(&self, id: SessionId, user_id: &str) -> Result<Session> {
        self.mutate(id, |e| {
            e.session.remove_member(user_id);
            Ok(e.session.clone())
        })
        .await
    }

    async fn delete_session(&self, id: SessionId) -> Result<()> {
        self.entries
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(CollabError::SessionNotFound(id))
    }

    async fn list_public_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.session.visibility == Visibility::Public)
            .map(|e| e.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .map(|e| e.session.clone())
            .collect())
    }

    async fn append_message(&self, id: SessionId, message: ChatMessage, cap: usize) -> Result<()> {
        self.mutate(id, |e| {
            e.messages.push_back(message);
            while e.messages.len() > cap {
                e.messages.pop_front();
            }
            e.session.touch();
            Ok(())
        })
        .await
    }

    async fn messages(&self, id: SessionId) -> Result<Vec<ChatMessage>> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|e| e.messages.iter().cloned().collect())
            .ok_or(CollabError::SessionNotFound(id))
    }

    async fn save_version(&self, snapshot: VersionSnapshot) -> Result<()> {
        self.mutate(snapshot.session_id, |e| {
            e.versions.push(snapshot);
            e.session.touch();
            Ok(())
        })
        .await
    }

    async fn versions(&self, id: SessionId) -> Result<Vec<VersionSnapshot>> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|e| e.versions.clone())
            .ok_or(CollabError::SessionNotFound(id))
    }

    fn is_durable(&self) -> bool {
        false
    }
}
