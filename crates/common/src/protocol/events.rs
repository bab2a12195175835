// Push-event types for the coview-live.v1 protocol.
//
// Every frame written to a session's push channel is one of these,
// serialized as a flat JSON object with a `type` discriminator. The set is
// closed on purpose: adding an event kind must go through this enum so
// both ends get exhaustiveness checking.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Annotation, Message, Participant, Presence, Session};

/// Peer-connection negotiation message kinds carried by [`RoomEvent::Signal`].
///
/// The engine never interprets the payload; these discriminate for the
/// client-side negotiation state machine only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    VoiceState,
    Speaking,
    Renegotiate,
}

/// All server-to-client events on a session's push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// First frame on every new connection: the room's current state.
    Init {
        session: Session,
        participants: Vec<Presence>,
        annotations: Vec<Annotation>,
        messages: Vec<Message>,
    },

    /// A durable membership was created (REST join).
    ParticipantJoined { participant: Participant },

    /// A user's last connection closed and their presence was removed.
    ParticipantLeft { user_id: Uuid },

    /// Cursor/page movement, or a user's presence appearing on first connect.
    PresenceUpdate { presence: Presence },

    AnnotationCreated { annotation: Annotation },

    AnnotationUpdated { annotation: Annotation },

    AnnotationDeleted { annotation_id: Uuid },

    MessageCreated { message: Message },

    TypingStart { user_id: Uuid },

    TypingStop { user_id: Uuid },

    /// Hand-raise toggled; `raised` is the resulting state.
    HandRaise { user_id: Uuid, raised: bool },

    /// Screen-share toggled; `sharing` is the resulting state.
    ScreenShare { user_id: Uuid, sharing: bool },

    SessionStarted { started_at: chrono::DateTime<chrono::Utc> },

    SessionEnded,

    /// Directed peer-signaling envelope, relayed verbatim to one target.
    Signal {
        from_user_id: Uuid,
        signal_type: SignalKind,
        payload: serde_json::Value,
    },
}

impl RoomEvent {
    /// The wire value of the `type` discriminator for this event.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::AnnotationCreated { .. } => "annotation_created",
            Self::AnnotationUpdated { .. } => "annotation_updated",
            Self::AnnotationDeleted { .. } => "annotation_deleted",
            Self::MessageCreated { .. } => "message_created",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::HandRaise { .. } => "hand_raise",
            Self::ScreenShare { .. } => "screen_share",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionEnded => "session_ended",
            Self::Signal { .. } => "signal",
        }
    }
}
