//! Error taxonomy shared by the store, router and client.
//!
//! Handler-local errors never tear down a connection: the router turns them
//! into an `error` frame addressed to the offending connection only.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::StoreError;

/// Wire-visible error kind carried in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    CapacityExceeded,
    InvalidPermission,
    InvalidFrame,
    TransportError,
    StoreError,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::CapacityExceeded => "CapacityExceeded",
            ErrorKind::InvalidPermission => "InvalidPermission",
            ErrorKind::InvalidFrame => "InvalidFrame",
            ErrorKind::TransportError => "TransportError",
            ErrorKind::StoreError => "StoreError",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Errors produced by the collaboration core.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("session {session_id} is full ({max_users} users)")]
    CapacityExceeded { session_id: Uuid, max_users: usize },

    #[error("invalid permission: {0}")]
    InvalidPermission(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CollabError {
    /// The kind reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollabError::SessionNotFound(_) | CollabError::NotFound(_) => ErrorKind::NotFound,
            CollabError::Forbidden(_) => ErrorKind::Forbidden,
            CollabError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            CollabError::InvalidPermission(_) => ErrorKind::InvalidPermission,
            CollabError::InvalidFrame(_) => ErrorKind::InvalidFrame,
            CollabError::Transport(_) => ErrorKind::TransportError,
            CollabError::Store(_) => ErrorKind::StoreError,
            CollabError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        CollabError::Forbidden(msg.into())
    }

    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        CollabError::InvalidFrame(msg.into())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CollabError::Transport(e.to_string())
    }
}

pub type Result<T, E = CollabError> = std::result::Result<T, E>;
