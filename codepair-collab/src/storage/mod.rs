//! Session storage.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐                 ┌────────────────────────────┐
//! │ SessionManager │ ──┐             │ MemoryStore                │
//! └────────────────┘   │  dyn        │ (process memory, lost on   │
//!                      ├─ Session ──►│  restart)                  │
//! ┌────────────────┐   │  Store      ├────────────────────────────┤
//! │ MessageRouter  │ ──┘             │ RocksStore                 │
//! └────────────────┘                 │ CF "sessions": records     │
//!                                    │ CF "messages": chat log    │
//!                                    │ CF "versions": snapshots   │
//!                                    └────────────────────────────┘
//! ```
//!
//! The backend is chosen once at startup. Writes complete before the call
//! returns; there is no write-behind buffer in either implementation.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::error::{CollabError, Result};
use crate::model::{ChatMessage, NewSession, Participant, Session, SessionId, VersionSnapshot};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Backend failures (RocksDB, encoding, compression).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Keyed storage of sessions, membership, chat history and versions.
///
/// Unknown session ids yield `CollabError::SessionNotFound`; every mutating
/// call bumps the session's `updated_at`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, owner_id: &str, options: NewSession) -> Result<Session>;

    async fn get_session(&self, id: SessionId) -> Result<Session>;

    async fn update_code(&self, id: SessionId, code: String) -> Result<()>;

    async fn update_language(&self, id: SessionId, language: String) -> Result<()>;

    /// Add a member, or reactivate/replace the record with the same user id.
    async fn add_member(&self, id: SessionId, participant: Participant) -> Result<Session>;

    /// Replace an existing member record (permission, active flag).
    async fn update_member(&self, id: SessionId, participant: Participant) -> Result<Session>;

    async fn remove_member(&self, id: SessionId, user_id: &str) -> Result<Session>;

    /// Delete the session together with its chat history and versions.
    async fn delete_session(&self, id: SessionId) -> Result<()>;

    async fn list_public_sessions(&self) -> Result<Vec<Session>>;

    async fn list_sessions(&self) -> Result<Vec<Session>>;

    /// Append a chat message, dropping the oldest entries beyond `cap`.
    async fn append_message(&self, id: SessionId, message: ChatMessage, cap: usize) -> Result<()>;

    async fn messages(&self, id: SessionId) -> Result<Vec<ChatMessage>>;

    async fn save_version(&self, snapshot: VersionSnapshot) -> Result<()>;

    async fn versions(&self, id: SessionId) -> Result<Vec<VersionSnapshot>>;

    /// Whether writes survive a process restart.
    fn is_durable(&self) -> bool;
}

/// Retry policy for store reads.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

/// Run a store read, retrying backend failures with exponential backoff.
///
/// Only `CollabError::Store` is retried; `SessionNotFound` and friends are
/// answers, not failures, and return immediately.
pub async fn read_with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0;
    loop {
        match op().await {
            Err(CollabError::Store(e)) if attempt < policy.attempts => {
                attempt += 1;
                log::warn!("Store read failed (attempt {attempt}/{}): {e}", policy.attempts);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_read_retry_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let value = read_with_retry(fast_policy(), move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Database("flaky".into()).into())
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_read_retry_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = read_with_retry(fast_policy(), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Database("down".into()).into())
            }
        })
        .await;

        assert!(matches!(result, Err(CollabError::Store(_))));
        // First try plus three retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_read_retry_does_not_retry_not_found() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = read_with_retry(fast_policy(), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(CollabError::SessionNotFound(uuid::Uuid::nil()))
            }
        })
        .await;

        assert!(matches!(result, Err(CollabError::SessionNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
