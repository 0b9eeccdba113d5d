//! Per-session fan-out with backpressure.
//!
//! Each connection owns a bounded outbound queue drained by its writer
//! task. A session channel holds the sending half of every attached
//! connection's queue and encodes a frame once before handing the same
//! `Arc<String>` to each of them. A full queue drops a cursor or selection
//! frame for that connection only. Any other frame that does not fit evicts
//! the connection, since it would otherwise keep a stale buffer.
//!
//! ```text
//!               ┌──────────────── SessionChannel ────────────────┐
//! broadcast() ─►│ encode once → try_send ─► conn A queue (bounded)│─► writer A
//!               │                        ─► conn B queue (bounded)│─► writer B
//!               │                        ─► conn C queue (full) ✗ │  dropped++ / evicted
//!               └─────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{SessionId, UserId};
use crate::protocol::Frame;

/// Identifies one WebSocket connection (a user may have several).
pub type ConnectionId = Uuid;

/// Pre-encoded JSON frame queued for a connection's writer.
pub type Outbound = Arc<String>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub connections_evicted: u64,
    pub connections: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    connections_evicted: AtomicU64,
}

struct Subscriber {
    user_id: UserId,
    tx: mpsc::Sender<Outbound>,
}

/// Fan-out group for a single session.
pub struct SessionChannel {
    session_id: SessionId,
    subscribers: RwLock<HashMap<ConnectionId, Subscriber>>,
    /// Held across store write + broadcast of an edit so that fan-out order
    /// equals apply order.
    edit_lock: Mutex<()>,
    stats: AtomicBroadcastStats,
}

impl SessionChannel {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            subscribers: RwLock::new(HashMap::new()),
            edit_lock: Mutex::new(()),
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Attach a connection's outbound queue.
    pub async fn subscribe(&self, conn: ConnectionId, user_id: impl Into<UserId>, tx: mpsc::Sender<Outbound>) {
        self.subscribers.write().await.insert(
            conn,
            Subscriber {
                user_id: user_id.into(),
                tx,
            },
        );
    }

    /// Detach a connection. Returns its user id if it was attached.
    pub async fn unsubscribe(&self, conn: &ConnectionId) -> Option<UserId> {
        self.subscribers.write().await.remove(conn).map(|s| s.user_id)
    }

    pub async fn lock_edits(&self) -> MutexGuard<'_, ()> {
        self.edit_lock.lock().await
    }

    /// Send to every attached connection except `except`.
    ///
    /// Returns the number of queues that accepted the frame.
    pub async fn broadcast(&self, frame: &Frame, except: Option<ConnectionId>) -> Result<usize> {
        let encoded: Outbound = Arc::new(frame.encode()?);
        let (delivered, lagging) = {
            let subscribers = self.subscribers.read().await;
            self.fan_out(
                subscribers.iter().filter(|(conn, _)| Some(**conn) != except),
                &encoded,
                frame.body.is_ephemeral(),
            )
        };
        self.evict(lagging).await;
        log::trace!(
            "Session {}: {} fanned out to {} connection(s)",
            self.session_id,
            frame.type_name(),
            delivered
        );
        Ok(delivered)
    }

    /// Send to every connection of one user. Returns the number reached.
    pub async fn send_to_user(&self, user_id: &str, frame: &Frame) -> Result<usize> {
        let encoded: Outbound = Arc::new(frame.encode()?);
        let (delivered, lagging) = {
            let subscribers = self.subscribers.read().await;
            self.fan_out(
                subscribers.iter().filter(|(_, sub)| sub.user_id == user_id),
                &encoded,
                frame.body.is_ephemeral(),
            )
        };
        self.evict(lagging).await;
        Ok(delivered)
    }

    /// Offer `encoded` to each target. A full queue drops an ephemeral frame;
    /// for any other frame the connection is returned as lagging.
    fn fan_out<'a>(
        &self,
        targets: impl Iterator<Item = (&'a ConnectionId, &'a Subscriber)>,
        encoded: &Outbound,
        ephemeral: bool,
    ) -> (usize, Vec<ConnectionId>) {
        let mut delivered = 0;
        let mut lagging = Vec::new();
        for (conn, sub) in targets {
            match sub.tx.try_send(encoded.clone()) {
                Ok(()) => {
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    if ephemeral {
                        log::debug!(
                            "Session {}: outbound queue full for {} ({}), frame dropped",
                            self.session_id,
                            sub.user_id,
                            conn
                        );
                    } else {
                        log::warn!(
                            "Session {}: outbound queue full for {} ({}), evicting",
                            self.session_id,
                            sub.user_id,
                            conn
                        );
                        lagging.push(*conn);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Writer already gone; the connection task detaches itself
                }
            }
        }
        (delivered, lagging)
    }

    /// Unsubscribe connections that missed a frame they cannot do without.
    /// Their server task notices and closes them so the client re-joins.
    async fn evict(&self, lagging: Vec<ConnectionId>) {
        if lagging.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write().await;
        for conn in lagging {
            if subscribers.remove(&conn).is_some() {
                self.stats.connections_evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub async fn is_subscribed(&self, conn: &ConnectionId) -> bool {
        self.subscribers.read().await.contains_key(conn)
    }

    pub async fn connection_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Number of distinct connections held by `user_id`.
    pub async fn connections_of(&self, user_id: &str) -> usize {
        self.subscribers
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .count()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            connections_evicted: self.stats.connections_evicted.load(Ordering::Relaxed),
            connections: self.connection_count().await,
        }
    }
}

/// Maps session ids to their fan-out channels.
#[derive(Default)]
pub struct ChannelManager {
    channels: RwLock<HashMap<SessionId, Arc<SessionChannel>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to the session's channel, creating it if needed.
    ///
    /// Runs under the map's write lock so `remove_if_empty` cannot drop the
    /// channel between lookup and subscribe. Returns the channel and the
    /// number of connections `user_id` held before this one.
    pub async fn attach(
        &self,
        session_id: SessionId,
        conn: ConnectionId,
        user_id: impl Into<UserId>,
        tx: mpsc::Sender<Outbound>,
    ) -> (Arc<SessionChannel>, usize) {
        let user_id = user_id.into();
        let mut channels = self.channels.write().await;
        let channel = channels
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionChannel::new(session_id)))
            .clone();
        let previous = channel.connections_of(&user_id).await;
        channel.subscribe(conn, user_id, tx).await;
        (channel, previous)
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<Arc<SessionChannel>> {
        self.channels.read().await.get(session_id).cloned()
    }

    /// Remove the channel if no connection is attached.
    pub async fn remove_if_empty(&self, session_id: &SessionId) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(session_id) {
            if channel.connection_count().await == 0 {
                channels.remove(session_id);
                return true;
            }
        }
        false
    }

    pub async fn remove(&self, session_id: &SessionId) -> Option<Arc<SessionChannel>> {
        self.channels.write().await.remove(session_id)
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
