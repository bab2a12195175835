use axum::extract::{Path, State};
use axum::response::Response;
use axum::{Extension, Json};
use coview_common::protocol::events::RoomEvent;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{created, require_active_participant, ApiContext, SessionApiError};
use crate::auth::middleware::AuthenticatedUser;
use crate::validation::{validate_message_content, ValidatedJson};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateMessageRequest {
    pub content: String,
    /// Anchors the message to an annotation thread.
    pub annotation_id: Option<Uuid>,
}

pub async fn list_messages(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, SessionApiError> {
    require_active_participant(&context.store, session_id, user.user_id).await?;
    let messages = context.store.messages(session_id).await?;
    Ok(Json(json!({ "messages": messages })))
}

pub async fn create_message(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<CreateMessageRequest>,
) -> Result<Response, SessionApiError> {
    require_active_participant(&context.store, session_id, user.user_id).await?;
    validate_message_content(&request.content)?;

    if let Some(annotation_id) = request.annotation_id {
        if !context.store.annotation_exists(session_id, annotation_id).await? {
            return Err(SessionApiError::BadRequest(format!(
                "annotation {annotation_id} does not exist in this session"
            )));
        }
    }

    let message = context
        .store
        .create_message(session_id, user.user_id, &request.content, request.annotation_id)
        .await?;

    if let Some(room) = context.registry.get(session_id).await {
        room.broadcast(&RoomEvent::MessageCreated { message: message.clone() }, None).await;

        // Sending a message implicitly ends the author's typing state.
        room.clear_typing(user.user_id).await;
        room.broadcast(&RoomEvent::TypingStop { user_id: user.user_id }, Some(user.user_id))
            .await;
    }

    Ok(created(message))
}
