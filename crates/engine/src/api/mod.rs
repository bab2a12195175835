pub mod annotations;
pub mod messages;
pub mod rooms;
pub mod sessions;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use coview_common::types::{Participant, Session};
use tracing::error;
use uuid::Uuid;

use crate::auth::jwt::JwtAccessTokenService;
use crate::auth::middleware::require_bearer_auth;
use crate::error::{EngineError, ErrorCode};
use crate::room::registry::RoomRegistry;
use crate::store::SessionStore;

#[derive(Clone)]
pub struct ApiContext {
    pub store: SessionStore,
    pub registry: Arc<RoomRegistry>,
}

pub fn router(context: ApiContext, jwt_service: JwtAccessTokenService) -> Router {
    Router::new()
        .route("/v1/sessions", post(sessions::create_session))
        .route("/v1/sessions/join", post(sessions::join_session))
        .route("/v1/sessions/{id}", get(sessions::session_detail))
        .route("/v1/sessions/{id}/start", post(sessions::start_session))
        .route("/v1/sessions/{id}/end", post(sessions::end_session))
        .route("/v1/sessions/{id}/leave", post(sessions::leave_session))
        .route("/v1/sessions/{id}/presence", post(rooms::update_presence))
        .route("/v1/sessions/{id}/hand-raise", post(rooms::toggle_hand_raise))
        .route("/v1/sessions/{id}/screen-share", post(rooms::toggle_screen_share))
        .route("/v1/sessions/{id}/typing", post(rooms::set_typing))
        .route("/v1/sessions/{id}/signal", post(rooms::send_signal))
        .route(
            "/v1/sessions/{id}/annotations",
            get(annotations::list_annotations).post(annotations::create_annotation),
        )
        .route(
            "/v1/sessions/{id}/annotations/{annotation_id}",
            axum::routing::patch(annotations::update_annotation)
                .delete(annotations::delete_annotation),
        )
        .route(
            "/v1/sessions/{id}/messages",
            get(messages::list_messages).post(messages::create_message),
        )
        .route_layer(from_fn_with_state(jwt_service, require_bearer_auth))
        .with_state(context)
}

/// Error surface shared by the session REST handlers. Everything maps
/// onto the engine's structured error body.
#[derive(Debug)]
pub enum SessionApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Engine(EngineError),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for SessionApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(error)
    }
}

impl From<EngineError> for SessionApiError {
    fn from(error: EngineError) -> Self {
        Self::Engine(error)
    }
}

impl IntoResponse for SessionApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => {
                EngineError::new(ErrorCode::ValidationFailed, message).into_response()
            }
            Self::Forbidden(message) => {
                EngineError::new(ErrorCode::AuthForbidden, message).into_response()
            }
            Self::NotFound(message) => {
                EngineError::new(ErrorCode::NotFound, message).into_response()
            }
            Self::Engine(error) => error.into_response(),
            Self::Internal(source) => {
                error!(error = ?source, "session api internal error");
                EngineError::from_code(ErrorCode::InternalError).into_response()
            }
        }
    }
}

pub(crate) async fn require_session(
    store: &SessionStore,
    session_id: Uuid,
) -> Result<Session, SessionApiError> {
    store
        .session(session_id)
        .await?
        .ok_or_else(|| SessionApiError::NotFound(format!("session {session_id} not found")))
}

/// Loads the session and verifies the caller holds a live membership.
/// Members who left must rejoin before acting on the session again.
pub(crate) async fn require_active_participant(
    store: &SessionStore,
    session_id: Uuid,
    user_id: Uuid,
) -> Result<(Session, Participant), SessionApiError> {
    let session = require_session(store, session_id).await?;

    let participant = store
        .membership(session_id, user_id)
        .await?
        .filter(|participant| participant.left_at.is_none())
        .ok_or_else(|| {
            SessionApiError::Forbidden("caller is not an active participant".to_string())
        })?;

    Ok((session, participant))
}

pub(crate) fn created<T: serde::Serialize>(body: T) -> Response {
    (StatusCode::CREATED, axum::Json(body)).into_response()
}
