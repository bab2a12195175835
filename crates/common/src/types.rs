// Core domain types shared between the coview engine and its clients.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of a review session: `waiting → active → ended`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    Ended,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown session status '{0}'")]
pub struct ParseSessionStatusError(String);

impl FromStr for SessionStatus {
    type Err = ParseSessionStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            other => Err(ParseSessionStatusError(other.to_string())),
        }
    }
}

/// Role of a durable session member. Exactly one host per session, set at
/// creation and immutable thereafter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Host,
    Member,
}

impl ParticipantRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Member => "member",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown participant role '{0}'")]
pub struct ParseParticipantRoleError(String);

impl FromStr for ParticipantRole {
    type Err = ParseParticipantRoleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "host" => Ok(Self::Host),
            "member" => Ok(Self::Member),
            other => Err(ParseParticipantRoleError(other.to_string())),
        }
    }
}

/// Shape discriminator for an annotation's opaque payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Pen,
    Highlight,
    Shape,
    Comment,
    Text,
}

impl AnnotationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pen => "pen",
            Self::Highlight => "highlight",
            Self::Shape => "shape",
            Self::Comment => "comment",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown annotation kind '{0}'")]
pub struct ParseAnnotationKindError(String);

impl FromStr for AnnotationKind {
    type Err = ParseAnnotationKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pen" => Ok(Self::Pen),
            "highlight" => Ok(Self::Highlight),
            "shape" => Ok(Self::Shape),
            "comment" => Ok(Self::Comment),
            "text" => Ok(Self::Text),
            other => Err(ParseAnnotationKindError(other.to_string())),
        }
    }
}

/// A durable review session over one shared document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub document_id: Uuid,
    pub host_user_id: Uuid,
    /// Short random token participants join with; unique among non-ended
    /// sessions.
    pub join_code: String,
    pub status: SessionStatus,
    pub max_participants: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Durable session membership. At most one row per (session, user);
/// rejoining clears `left_at` instead of inserting a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub role: ParticipantRole,
    /// Hex color assigned at join; sticky across reconnects.
    pub color: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

/// A participant's live, frequently-changing room state. Lost on process
/// restart; one entry per user no matter how many tabs are open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Presence {
    pub user_id: Uuid,
    pub display_name: String,
    pub color: String,
    pub page_number: i32,
    pub cursor_x: f64,
    pub cursor_y: f64,
    pub last_activity_at: DateTime<Utc>,
}

/// A durable annotation on one page of the shared document.
///
/// `payload` is opaque structured data whose shape depends on `kind`
/// (polyline points, rectangle, anchored text, …). The engine stores and
/// relays it without interpretation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub id: Uuid,
    pub session_id: Uuid,
    pub author_id: Uuid,
    pub page_number: i32,
    pub kind: AnnotationKind,
    pub color: String,
    pub payload: serde_json::Value,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A durable chat message, optionally anchored to an annotation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
