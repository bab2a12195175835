use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::{Extension, Json};
use coview_common::protocol::events::RoomEvent;
use coview_common::types::AnnotationKind;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{created, require_active_participant, ApiContext, SessionApiError};
use crate::auth::middleware::AuthenticatedUser;
use crate::validation::validate_annotation_payload;
use crate::validation::ValidatedJson;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateAnnotationRequest {
    pub page_number: i32,
    pub kind: AnnotationKind,
    /// Defaults to the author's participant color.
    pub color: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateAnnotationRequest {
    pub payload: Option<serde_json::Value>,
    pub resolved: Option<bool>,
}

pub async fn list_annotations(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, SessionApiError> {
    require_active_participant(&context.store, session_id, user.user_id).await?;
    let annotations = context.store.annotations(session_id).await?;
    Ok(Json(json!({ "annotations": annotations })))
}

pub async fn create_annotation(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<CreateAnnotationRequest>,
) -> Result<Response, SessionApiError> {
    let (_, participant) =
        require_active_participant(&context.store, session_id, user.user_id).await?;

    if request.page_number < 1 {
        return Err(SessionApiError::BadRequest("page_number must be positive".to_string()));
    }
    validate_annotation_payload(&request.payload)?;

    let color = request.color.unwrap_or(participant.color);
    let annotation = context
        .store
        .create_annotation(
            session_id,
            user.user_id,
            request.page_number,
            request.kind,
            &color,
            request.payload,
        )
        .await?;

    if let Some(room) = context.registry.get(session_id).await {
        room.broadcast(&RoomEvent::AnnotationCreated { annotation: annotation.clone() }, None)
            .await;
    }

    Ok(created(annotation))
}

pub async fn update_annotation(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((session_id, annotation_id)): Path<(Uuid, Uuid)>,
    ValidatedJson(request): ValidatedJson<UpdateAnnotationRequest>,
) -> Result<Json<coview_common::types::Annotation>, SessionApiError> {
    require_active_participant(&context.store, session_id, user.user_id).await?;

    if let Some(payload) = &request.payload {
        validate_annotation_payload(payload)?;
    }
    if request.payload.is_none() && request.resolved.is_none() {
        return Err(SessionApiError::BadRequest(
            "at least one of payload or resolved is required".to_string(),
        ));
    }

    let annotation = context
        .store
        .update_annotation(session_id, annotation_id, request.payload, request.resolved)
        .await?
        .ok_or_else(|| {
            SessionApiError::NotFound(format!("annotation {annotation_id} not found"))
        })?;

    if let Some(room) = context.registry.get(session_id).await {
        room.broadcast(&RoomEvent::AnnotationUpdated { annotation: annotation.clone() }, None)
            .await;
    }

    Ok(Json(annotation))
}

pub async fn delete_annotation(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((session_id, annotation_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, SessionApiError> {
    require_active_participant(&context.store, session_id, user.user_id).await?;

    let deleted = context.store.delete_annotation(session_id, annotation_id).await?;
    if !deleted {
        return Err(SessionApiError::NotFound(format!("annotation {annotation_id} not found")));
    }

    if let Some(room) = context.registry.get(session_id).await {
        room.broadcast(&RoomEvent::AnnotationDeleted { annotation_id }, None).await;
    }

    Ok(StatusCode::NO_CONTENT)
}
