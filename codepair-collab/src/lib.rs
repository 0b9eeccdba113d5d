//! # codepair-collab: Real-time collaborative code editing core
//!
//! Session lifecycle, presence, chat and WebRTC signaling over WebSockets,
//! with a pluggable durable store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄────────────────► │ CollabServer │
//! │ (per user)   │    JSON frames     │ (central)    │
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ MessageRouter │
//!                                    └───────┬───────┘
//!                      ┌─────────────────────┼─────────────────────┐
//!                      ▼                     ▼                     ▼
//!              ┌───────────────┐    ┌────────────────┐    ┌────────────────┐
//!              │SessionManager │    │PresenceTracker │    │ SessionChannel │
//!              │ (lifecycle)   │    │ (cursors)      │    │ (fan-out)      │
//!              └───────┬───────┘    └────────────────┘    └────────────────┘
//!                      ▼
//!              ┌───────────────┐
//!              │ SessionStore  │  MemoryStore | RocksStore
//!              └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Sessions, participants, permissions, chat, versions
//! - [`protocol`]: JSON wire frames
//! - [`broadcast`]: Per-session fan-out with backpressure
//! - [`presence`]: Live users, cursors and selections
//! - [`lifecycle`]: Create/join/leave, permissions, empty-session cleanup
//! - [`router`]: Per-connection frame dispatch
//! - [`signaling`]: Offer/answer/ICE relay
//! - [`server`]: WebSocket server and configuration
//! - [`client`]: WebSocket client with reconnect and offline queue
//! - [`storage`]: Session store trait, in-memory and RocksDB backends

pub mod broadcast;
pub mod client;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod server;
pub mod signaling;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, ChannelManager, ConnectionId, SessionChannel};
pub use client::{
    ClientConfig, ClientEvent, ClientState, CollabClient, ConnectionState, OfflineQueue,
};
pub use error::{CollabError, ErrorKind, Result};
pub use lifecycle::{LifecycleConfig, PeerState, SessionManager};
pub use model::{
    ChatKind, ChatMessage, CursorPosition, NewSession, Participant, Permission, SelectionRange,
    Session, SessionId, UserId, UserProfile, VersionSnapshot, Visibility,
};
pub use presence::{Presence, PresenceTracker};
pub use protocol::{Frame, FrameBody};
pub use router::{Connection, MessageRouter};
pub use server::{CollabServer, ConfigError, ServerConfig, ServerHandle, ServerStats};
pub use signaling::SignalingRelay;
pub use storage::{MemoryStore, RocksStore, SessionStore, StoreConfig, StoreError};
