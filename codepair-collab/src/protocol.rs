//! JSON wire protocol.
//!
//! Every WebSocket text frame carries one envelope:
//! ```text
//! {
//!   "type":      "code-updated",          kebab-case frame type
//!   "payload":   { "code": "x = 1" },     omitted for payload-less frames
//!   "timestamp": 1718000000000,           ms since Unix epoch
//!   "userId":    "alice",                 stamped by the server on fan-out
//!   "sessionId": "6f1c…"                  stamped by the server on fan-out
//! }
//! ```
//!
//! `FrameBody` is the single tagged enum for every frame type; dispatch is
//! an exhaustive `match` over it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{CollabError, ErrorKind, Result};
use crate::model::{
    now_millis, ChatKind, ChatMessage, CursorPosition, NewSession, Participant, Permission,
    SelectionRange, Session, SessionId, UserId, UserProfile, VersionSnapshot, Visibility,
};

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionPayload {
    pub user: UserProfile,
    #[serde(flatten)]
    pub options: NewSession,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionPayload {
    pub session_id: SessionId,
    pub user: UserProfile,
    #[serde(default)]
    pub permission: Option<Permission>,
}

/// Listing entry; the code buffer is left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub owner_id: UserId,
    pub language: String,
    pub visibility: Visibility,
    pub active_users: usize,
    pub max_users: Option<usize>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            name: s.name.clone(),
            owner_id: s.owner_id.clone(),
            language: s.language.clone(),
            visibility: s.visibility,
            active_users: s.active_count(),
            max_users: s.max_users,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionListPayload {
    pub sessions: Vec<SessionSummary>,
}

/// Everything a freshly attached connection needs to render the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session: Session,
    /// The joining user's own membership record
    pub you: Participant,
    /// Users currently present
    pub users: Vec<Participant>,
    pub cursors: HashMap<UserId, CursorPosition>,
    pub selections: HashMap<UserId, SelectionRange>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLeftPayload {
    pub session_id: SessionId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub user: Participant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftPayload {
    pub user_id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUpdate {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageChange {
    pub language: String,
}

/// Chat in either direction. Clients fill only `body`, `kind` and
/// `audioUrl`; the server assigns the rest before fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    #[serde(default)]
    pub id: Option<uuid::Uuid>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub user_name: Option<String>,
    pub body: String,
    #[serde(default)]
    pub kind: ChatKind,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

impl ChatPayload {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            id: None,
            user_id: None,
            user_name: None,
            body: body.into(),
            kind: ChatKind::Text,
            audio_url: None,
            timestamp: None,
        }
    }
}

impl From<ChatMessage> for ChatPayload {
    fn from(m: ChatMessage) -> Self {
        Self {
            id: Some(m.id),
            user_id: Some(m.user_id),
            user_name: Some(m.user_name),
            body: m.body,
            kind: m.kind,
            audio_url: m.audio_url,
            timestamp: Some(m.timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionChange {
    pub user_id: UserId,
    pub permission: Permission,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveVersionPayload {
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

/// WebRTC signaling payload. `data` is relayed untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(default)]
    pub target: Option<UserId>,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ───────────────────────────────────────────────────────────────────
// Frame body
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum FrameBody {
    // Session control (client → server)
    CreateSession(CreateSessionPayload),
    JoinSession(JoinSessionPayload),
    LeaveSession,
    DeleteSession,
    ListSessions,

    // Session control (server → client)
    SessionList(SessionListPayload),
    SessionCreated(Box<SessionSnapshot>),
    SessionJoined(Box<SessionSnapshot>),
    SessionLeft(SessionLeftPayload),
    UserJoined(UserPayload),
    UserLeft(UserLeftPayload),
    UserUpdated(UserPayload),

    // Collaboration (both directions)
    CodeUpdated(CodeUpdate),
    LanguageChanged(LanguageChange),
    CursorUpdated(CursorPosition),
    SelectionUpdated(SelectionRange),
    ChatMessage(ChatPayload),
    PermissionChanged(PermissionChange),

    // Versions
    SaveVersion(SaveVersionPayload),
    VersionSaved(VersionSnapshot),

    Error(ErrorPayload),
    Ping,
    Pong,

    // WebRTC signaling
    Offer(SignalPayload),
    Answer(SignalPayload),
    IceCandidate(SignalPayload),
}

/// Every recognized `type` string, and whether it carries no payload.
const FRAME_TYPES: &[(&str, bool)] = &[
    ("create-session", false),
    ("join-session", false),
    ("leave-session", true),
    ("delete-session", true),
    ("list-sessions", true),
    ("session-list", false),
    ("session-created", false),
    ("session-joined", false),
    ("session-left", false),
    ("user-joined", false),
    ("user-left", false),
    ("user-updated", false),
    ("code-updated", false),
    ("language-changed", false),
    ("cursor-updated", false),
    ("selection-updated", false),
    ("chat-message", false),
    ("permission-changed", false),
    ("save-version", false),
    ("version-saved", false),
    ("error", false),
    ("ping", true),
    ("pong", true),
    ("offer", false),
    ("answer", false),
    ("ice-candidate", false),
];

impl FrameBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            FrameBody::CreateSession(_) => "create-session",
            FrameBody::JoinSession(_) => "join-session",
            FrameBody::LeaveSession => "leave-session",
            FrameBody::DeleteSession => "delete-session",
            FrameBody::ListSessions => "list-sessions",
            FrameBody::SessionList(_) => "session-list",
            FrameBody::SessionCreated(_) => "session-created",
            FrameBody::SessionJoined(_) => "session-joined",
            FrameBody::SessionLeft(_) => "session-left",
            FrameBody::UserJoined(_) => "user-joined",
            FrameBody::UserLeft(_) => "user-left",
            FrameBody::UserUpdated(_) => "user-updated",
            FrameBody::CodeUpdated(_) => "code-updated",
            FrameBody::LanguageChanged(_) => "language-changed",
            FrameBody::CursorUpdated(_) => "cursor-updated",
            FrameBody::SelectionUpdated(_) => "selection-updated",
            FrameBody::ChatMessage(_) => "chat-message",
            FrameBody::PermissionChanged(_) => "permission-changed",
            FrameBody::SaveVersion(_) => "save-version",
            FrameBody::VersionSaved(_) => "version-saved",
            FrameBody::Error(_) => "error",
            FrameBody::Ping => "ping",
            FrameBody::Pong => "pong",
            FrameBody::Offer(_) => "offer",
            FrameBody::Answer(_) => "answer",
            FrameBody::IceCandidate(_) => "ice-candidate",
        }
    }

    /// Frames a server emits but never accepts from a client.
    pub fn is_server_only(&self) -> bool {
        matches!(
            self,
            FrameBody::SessionList(_)
                | FrameBody::SessionCreated(_)
                | FrameBody::SessionJoined(_)
                | FrameBody::SessionLeft(_)
                | FrameBody::UserJoined(_)
                | FrameBody::UserLeft(_)
                | FrameBody::UserUpdated(_)
                | FrameBody::VersionSaved(_)
                | FrameBody::Error(_)
                | FrameBody::Pong
        )
    }

    /// Frames that count as user activity (everything except heartbeats).
    pub fn is_activity(&self) -> bool {
        !matches!(self, FrameBody::Ping | FrameBody::Pong)
    }

    /// Frames a lagging peer may miss: the next one supersedes them.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, FrameBody::CursorUpdated(_) | FrameBody::SelectionUpdated(_))
    }
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub body: FrameBody,
    pub timestamp: u64,
    pub user_id: Option<UserId>,
    pub session_id: Option<SessionId>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    timestamp: u64,
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    session_id: Option<SessionId>,
}

impl Frame {
    pub fn new(body: FrameBody) -> Self {
        Self {
            body,
            timestamp: now_millis(),
            user_id: None,
            session_id: None,
        }
    }

    pub fn from_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn in_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(FrameBody::Error(ErrorPayload {
            kind,
            message: message.into(),
        }))
    }

    pub fn from_error(err: &CollabError) -> Self {
        Self::error(err.kind(), err.to_string())
    }

    pub fn type_name(&self) -> &'static str {
        self.body.type_name()
    }

    /// Serialize to the JSON envelope.
    pub fn encode(&self) -> Result<String> {
        let tagged = serde_json::to_value(&self.body)
            .map_err(|e| CollabError::Internal(format!("frame encode: {e}")))?;
        let payload = tagged.get("payload").cloned().unwrap_or(serde_json::Value::Null);
        let raw = RawFrame {
            kind: self.body.type_name().to_string(),
            payload,
            timestamp: self.timestamp,
            user_id: self.user_id.clone(),
            session_id: self.session_id,
        };
        serde_json::to_string(&raw).map_err(|e| CollabError::Internal(format!("frame encode: {e}")))
    }

    /// Parse a JSON envelope.
    ///
    /// Malformed JSON, unknown types and payloads of the wrong shape all
    /// yield `InvalidFrame`.
    pub fn decode(text: &str) -> Result<Self> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|e| CollabError::invalid_frame(format!("malformed frame: {e}")))?;

        let unit = FRAME_TYPES
            .iter()
            .find(|(name, _)| *name == raw.kind)
            .map(|(_, unit)| *unit)
            .ok_or_else(|| CollabError::invalid_frame(format!("unknown frame type '{}'", raw.kind)))?;

        let mut tagged = serde_json::Map::new();
        tagged.insert("type".into(), serde_json::Value::String(raw.kind.clone()));
        if !unit {
            tagged.insert("payload".into(), raw.payload);
        }
        let body: FrameBody = serde_json::from_value(serde_json::Value::Object(tagged))
            .map_err(|e| CollabError::invalid_frame(format!("bad '{}' payload: {e}", raw.kind)))?;

        Ok(Self {
            body,
            timestamp: raw.timestamp,
            user_id: raw.user_id,
            session_id: raw.session_id,
        })
    }

    /// Binary WebSocket frames carry the same UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CollabError::invalid_frame(format!("frame is not UTF-8: {e}")))?;
        Self::decode(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_bodies() -> Vec<FrameBody> {
        let session = Session::new("alice", NewSession::named("demo"));
        let alice = Participant::from_profile(&UserProfile::new("alice", "Alice"), Permission::Admin);
        let snapshot = SessionSnapshot {
            session: session.clone(),
            you: alice.clone(),
            users: vec![alice.clone()],
            cursors: HashMap::new(),
            selections: HashMap::new(),
            messages: Vec::new(),
        };
        let signal = SignalPayload {
            target: Some("bob".into()),
            data: json!({"sdp": "v=0"}),
        };
        vec![
            FrameBody::CreateSession(CreateSessionPayload {
                user: UserProfile::new("alice", "Alice"),
                options: NewSession::named("demo"),
            }),
            FrameBody::JoinSession(JoinSessionPayload {
                session_id: session.id,
                user: UserProfile::new("bob", "Bob"),
                permission: None,
            }),
            FrameBody::LeaveSession,
            FrameBody::DeleteSession,
            FrameBody::ListSessions,
            FrameBody::SessionList(SessionListPayload {
                sessions: vec![SessionSummary::from(&session)],
            }),
            FrameBody::SessionCreated(Box::new(snapshot.clone())),
            FrameBody::SessionJoined(Box::new(snapshot)),
            FrameBody::SessionLeft(SessionLeftPayload {
                session_id: session.id,
                reason: "deleted".into(),
            }),
            FrameBody::UserJoined(UserPayload { user: alice.clone() }),
            FrameBody::UserLeft(UserLeftPayload {
                user_id: "alice".into(),
                name: "Alice".into(),
            }),
            FrameBody::UserUpdated(UserPayload { user: alice.clone() }),
            FrameBody::CodeUpdated(CodeUpdate { code: "x".into() }),
            FrameBody::LanguageChanged(LanguageChange { language: "rust".into() }),
            FrameBody::CursorUpdated(CursorPosition::new(1, 2)),
            FrameBody::SelectionUpdated(SelectionRange::new(
                CursorPosition::new(0, 0),
                CursorPosition::new(0, 3),
            )),
            FrameBody::ChatMessage(ChatPayload::text("hi")),
            FrameBody::PermissionChanged(PermissionChange {
                user_id: "bob".into(),
                permission: Permission::View,
            }),
            FrameBody::SaveVersion(SaveVersionPayload::default()),
            FrameBody::VersionSaved(VersionSnapshot::of(&session, &alice, None)),
            FrameBody::Error(ErrorPayload {
                kind: ErrorKind::Forbidden,
                message: "no".into(),
            }),
            FrameBody::Ping,
            FrameBody::Pong,
            FrameBody::Offer(signal.clone()),
            FrameBody::Answer(signal.clone()),
            FrameBody::IceCandidate(signal),
        ]
    }

    #[test]
    fn test_every_frame_type_is_known() {
        let bodies = all_bodies();
        assert_eq!(bodies.len(), FRAME_TYPES.len());
        for body in bodies {
            let name = body.type_name();
            assert!(FRAME_TYPES.iter().any(|(n, _)| *n == name), "{name} missing");
            let frame = Frame::new(body.clone());
            let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
            assert_eq!(decoded.body, body, "{name}");
        }
    }

    #[test]
    fn test_envelope_shape() {
        let frame = Frame::new(FrameBody::CodeUpdated(CodeUpdate { code: "x = 1".into() }))
            .from_user("alice")
            .in_session(uuid::Uuid::nil());
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "code-updated");
        assert_eq!(value["payload"]["code"], "x = 1");
        assert_eq!(value["userId"], "alice");
        assert_eq!(value["sessionId"], "00000000-0000-0000-0000-000000000000");
        assert!(value["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_decode_minimal_client_frames() {
        let frame = Frame::decode(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame.body, FrameBody::Ping);

        // Payload on a payload-less frame is ignored
        let frame = Frame::decode(r#"{"type":"leave-session","payload":{}}"#).unwrap();
        assert_eq!(frame.body, FrameBody::LeaveSession);

        let frame = Frame::decode(r#"{"type":"cursor-updated","payload":{"line":4,"column":2}}"#).unwrap();
        assert_eq!(frame.body, FrameBody::CursorUpdated(CursorPosition::new(4, 2)));

        let frame = Frame::decode(r#"{"type":"chat-message","payload":{"body":"hello"}}"#).unwrap();
        match frame.body {
            FrameBody::ChatMessage(chat) => {
                assert_eq!(chat.body, "hello");
                assert_eq!(chat.kind, ChatKind::Text);
                assert!(chat.id.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_create_session_flattened_options() {
        let text = r#"{"type":"create-session","payload":{
            "user":{"id":"u1","name":"Ann"},
            "name":"demo","code":"x=1","language":"javascript","maxUsers":3}}"#;
        match Frame::decode(text).unwrap().body {
            FrameBody::CreateSession(p) => {
                assert_eq!(p.user.id, "u1");
                assert_eq!(p.options.code.as_deref(), Some("x=1"));
                assert_eq!(p.options.max_users, Some(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_invalid_frame() {
        let err = Frame::decode(r#"{"type":"launch-missiles","payload":{}}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFrame);
        assert!(err.to_string().contains("launch-missiles"));
    }

    #[test]
    fn test_malformed_json_is_invalid_frame() {
        assert_eq!(Frame::decode("{not json").unwrap_err().kind(), ErrorKind::InvalidFrame);
        assert_eq!(Frame::decode(r#"{"payload":{}}"#).unwrap_err().kind(), ErrorKind::InvalidFrame);
    }

    #[test]
    fn test_wrong_payload_shape_is_invalid_frame() {
        let err = Frame::decode(r#"{"type":"code-updated","payload":{"code":42}}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFrame);

        let err = Frame::decode(
            r#"{"type":"permission-changed","payload":{"userId":"b","permission":"root"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFrame);
    }

    #[test]
    fn test_decode_bytes() {
        let frame = Frame::decode_bytes(br#"{"type":"pong"}"#).unwrap();
        assert_eq!(frame.body, FrameBody::Pong);
        assert!(Frame::decode_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_server_only_classification() {
        assert!(FrameBody::Pong.is_server_only());
        assert!(FrameBody::UserLeft(UserLeftPayload {
            user_id: "a".into(),
            name: "A".into()
        })
        .is_server_only());
        assert!(!FrameBody::CodeUpdated(CodeUpdate { code: String::new() }).is_server_only());
        assert!(!FrameBody::Ping.is_activity());
        assert!(FrameBody::LeaveSession.is_activity());
    }

    #[test]
    fn test_only_cursor_frames_are_ephemeral() {
        assert!(FrameBody::CursorUpdated(CursorPosition::new(1, 2)).is_ephemeral());
        assert!(!FrameBody::CodeUpdated(CodeUpdate { code: "x".into() }).is_ephemeral());
        assert!(!FrameBody::LanguageChanged(LanguageChange { language: "rust".into() }).is_ephemeral());
    }

    #[test]
    fn test_error_frame_from_collab_error() {
        let frame = Frame::from_error(&CollabError::forbidden("view-only users cannot edit"));
        match frame.body {
            FrameBody::Error(p) => {
                assert_eq!(p.kind, ErrorKind::Forbidden);
                assert!(p.message.contains("view-only"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
