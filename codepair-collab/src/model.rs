//! Session, participant, chat and version records.
//!
//! These types travel both over the wire (JSON) and into the durable store
//! (bincode), so fields are never conditionally skipped during serialization.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::{CollabError, Result};

pub type SessionId = Uuid;
pub type UserId = String;

pub const DEFAULT_LANGUAGE: &str = "plaintext";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Access level of a participant. Ordered: `View < Edit < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    View,
    Edit,
    Admin,
}

impl Permission {
    pub fn can_edit(self) -> bool {
        self >= Permission::Edit
    }

    pub fn is_admin(self) -> bool {
        self == Permission::Admin
    }
}

impl Default for Permission {
    fn default() -> Self {
        Permission::Edit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// Identity supplied by the caller at connect time. Not authenticated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
            email: None,
        }
    }
}

/// A user's membership record inside one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: UserId,
    pub name: String,
    pub avatar: Option<String>,
    pub email: Option<String>,
    /// `#rrggbb`, stable for a given user id
    pub color: String,
    pub permission: Permission,
    pub joined_at: u64,
    pub active: bool,
}

impl Participant {
    pub fn from_profile(profile: &UserProfile, permission: Permission) -> Self {
        Self {
            id: profile.id.clone(),
            name: profile.name.clone(),
            avatar: profile.avatar.clone(),
            email: profile.email.clone(),
            color: color_for(&profile.id),
            permission,
            joined_at: now_millis(),
            active: true,
        }
    }
}

/// Options for creating a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewSession {
    pub name: String,
    pub code: Option<String>,
    pub language: Option<String>,
    pub visibility: Option<Visibility>,
    pub max_users: Option<usize>,
}

impl NewSession {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub owner_id: UserId,
    pub code: String,
    pub language: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub members: Vec<Participant>,
    pub visibility: Visibility,
    pub max_users: Option<usize>,
}

impl Session {
    pub fn new(owner_id: impl Into<String>, options: NewSession) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            name: options.name,
            owner_id: owner_id.into(),
            code: options.code.unwrap_or_default(),
            language: options
                .language
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            created_at: now,
            updated_at: now,
            members: Vec::new(),
            visibility: options.visibility.unwrap_or_default(),
            max_users: options.max_users,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at);
    }

    pub fn member(&self, user_id: &str) -> Option<&Participant> {
        self.members.iter().find(|m| m.id == user_id)
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    pub fn active_members(&self) -> impl Iterator<Item = &Participant> {
        self.members.iter().filter(|m| m.active)
    }

    pub fn active_count(&self) -> usize {
        self.active_members().count()
    }

    /// Insert a member, or replace the record with the same id.
    ///
    /// Fails with `CapacityExceeded` when an additional active member would
    /// exceed `max_users`.
    pub fn upsert_member(&mut self, participant: Participant) -> Result<()> {
        let existing = self.members.iter().position(|m| m.id == participant.id);
        let already_active = existing.is_some_and(|i| self.members[i].active);

        if participant.active && !already_active {
            if let Some(max) = self.max_users {
                if self.active_count() + 1 > max {
                    return Err(CollabError::CapacityExceeded {
                        session_id: self.id,
                        max_users: max,
                    });
                }
            }
        }

        match existing {
            Some(i) => self.members[i] = participant,
            None => self.members.push(participant),
        }
        self.touch();
        Ok(())
    }

    /// Replace an existing member record. Fails if the user is not a member.
    pub fn replace_member(&mut self, participant: Participant) -> Result<()> {
        let slot = self
            .members
            .iter_mut()
            .find(|m| m.id == participant.id)
            .ok_or_else(|| CollabError::NotFound(format!("user {}", participant.id)))?;
        *slot = participant;
        self.touch();
        Ok(())
    }

    pub fn remove_member(&mut self, user_id: &str) -> Option<Participant> {
        let idx = self.members.iter().position(|m| m.id == user_id)?;
        let removed = self.members.remove(idx);
        self.touch();
        Some(removed)
    }

    pub fn set_code(&mut self, code: String) {
        self.code = code;
        self.touch();
    }

    pub fn set_language(&mut self, language: String) {
        self.language = language;
        self.touch();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    #[default]
    Text,
    System,
    Voice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub user_id: UserId,
    pub user_name: String,
    pub body: String,
    pub kind: ChatKind,
    /// Reference to a stored voice note when `kind == Voice`
    pub audio_url: Option<String>,
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn text(author: &Participant, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: author.id.clone(),
            user_name: author.name.clone(),
            body: body.into(),
            kind: ChatKind::Text,
            audio_url: None,
            timestamp: now_millis(),
        }
    }

    pub fn system(body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: "system".to_string(),
            user_name: "System".to_string(),
            body: body.into(),
            kind: ChatKind::System,
            audio_url: None,
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    pub id: Uuid,
    pub session_id: SessionId,
    pub code: String,
    pub language: String,
    pub author_id: UserId,
    pub author_name: String,
    pub timestamp: u64,
    pub description: Option<String>,
}

impl VersionSnapshot {
    pub fn of(session: &Session, author: &Participant, description: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session.id,
            code: session.code.clone(),
            language: session.language.clone(),
            author_id: author.id.clone(),
            author_name: author.name.clone(),
            timestamp: now_millis(),
            description,
        }
    }
}

/// Zero-based caret position in the code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: CursorPosition,
    pub end: CursorPosition,
}

impl SelectionRange {
    pub fn new(start: CursorPosition, end: CursorPosition) -> Self {
        Self { start, end }
    }
}

// ───────────────────────────────────────────────────────────────────
// Cursor colors
// ───────────────────────────────────────────────────────────────────

/// Stable, visually distinct `#rrggbb` color for a user id.
///
/// The hue comes from an FNV-1a hash of the id; saturation and lightness are
/// fixed so every cursor stays readable on a dark editor background.
pub fn color_for(user_id: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in user_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
