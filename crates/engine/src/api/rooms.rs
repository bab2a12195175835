use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use coview_common::protocol::events::{RoomEvent, SignalKind};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::{require_active_participant, ApiContext, SessionApiError};
use crate::auth::middleware::AuthenticatedUser;
use crate::room::PresenceUpdate;
use crate::validation::ValidatedJson;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceUpdateRequest {
    pub page_number: Option<i32>,
    pub cursor_x: Option<f64>,
    pub cursor_y: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypingRequest {
    pub typing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalRequest {
    pub target_user_id: Uuid,
    pub signal_type: SignalKind,
    pub payload: serde_json::Value,
}

/// Presence moves through REST but only exists while the user holds a
/// live stream connection; without one there is nothing to update.
pub async fn update_presence(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<PresenceUpdateRequest>,
) -> Result<Json<serde_json::Value>, SessionApiError> {
    require_active_participant(&context.store, session_id, user.user_id).await?;

    if let Some(page_number) = request.page_number {
        if page_number < 1 {
            return Err(SessionApiError::BadRequest("page_number must be positive".to_string()));
        }
    }

    let room = context.registry.get(session_id).await.ok_or_else(no_live_presence)?;
    let presence = room
        .update_presence(
            user.user_id,
            PresenceUpdate {
                page_number: request.page_number,
                cursor_x: request.cursor_x,
                cursor_y: request.cursor_y,
            },
        )
        .await
        .ok_or_else(no_live_presence)?;

    room.broadcast(&RoomEvent::PresenceUpdate { presence: presence.clone() }, Some(user.user_id))
        .await;

    Ok(Json(json!({ "presence": presence })))
}

pub async fn toggle_hand_raise(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, SessionApiError> {
    require_active_participant(&context.store, session_id, user.user_id).await?;

    let room = context.registry.get(session_id).await.ok_or_else(no_live_presence)?;
    let raised = room.toggle_hand_raise(user.user_id).await;
    room.broadcast(&RoomEvent::HandRaise { user_id: user.user_id, raised }, Some(user.user_id))
        .await;

    Ok(Json(json!({ "user_id": user.user_id, "raised": raised })))
}

pub async fn toggle_screen_share(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, SessionApiError> {
    require_active_participant(&context.store, session_id, user.user_id).await?;

    let room = context.registry.get(session_id).await.ok_or_else(no_live_presence)?;
    let sharing = room.toggle_screen_share(user.user_id).await;
    room.broadcast(
        &RoomEvent::ScreenShare { user_id: user.user_id, sharing },
        Some(user.user_id),
    )
    .await;

    Ok(Json(json!({ "user_id": user.user_id, "sharing": sharing })))
}

pub async fn set_typing(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<TypingRequest>,
) -> Result<Json<serde_json::Value>, SessionApiError> {
    require_active_participant(&context.store, session_id, user.user_id).await?;

    let room = context.registry.get(session_id).await.ok_or_else(no_live_presence)?;
    let changed = room.set_typing(user.user_id, request.typing).await;

    // Repeated no-op calls (client keepalive) do not re-broadcast.
    if changed {
        let event = if request.typing {
            RoomEvent::TypingStart { user_id: user.user_id }
        } else {
            RoomEvent::TypingStop { user_id: user.user_id }
        };
        room.broadcast(&event, Some(user.user_id)).await;
    }

    Ok(Json(json!({ "user_id": user.user_id, "typing": request.typing })))
}

/// Relays a WebRTC signaling frame to one participant. The engine
/// never inspects or buffers the payload; if the target has no live
/// connection the frame is dropped.
pub async fn send_signal(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<SignalRequest>,
) -> Result<Response, SessionApiError> {
    require_active_participant(&context.store, session_id, user.user_id).await?;

    let delivered = match context.registry.get(session_id).await {
        Some(room) => {
            let event = RoomEvent::Signal {
                from_user_id: user.user_id,
                signal_type: request.signal_type,
                payload: request.payload,
            };
            room.relay(request.target_user_id, &event).await
        }
        None => 0,
    };

    if delivered == 0 {
        debug!(
            session_id = %session_id,
            target = %request.target_user_id,
            "dropped signal for absent target"
        );
    }

    Ok((StatusCode::ACCEPTED, Json(json!({ "delivered": delivered }))).into_response())
}

fn no_live_presence() -> SessionApiError {
    SessionApiError::NotFound("caller has no live presence in this session".to_string())
}
