use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use coview_common::protocol::events::RoomEvent;
use coview_common::types::{Participant, ParticipantRole, Session, SessionStatus};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{created, require_active_participant, ApiContext, SessionApiError};
use crate::auth::middleware::AuthenticatedUser;
use crate::room::assign_color;
use crate::validation::ValidatedJson;

const DEFAULT_MAX_PARTICIPANTS: i32 = 12;
const MAX_MAX_PARTICIPANTS: i32 = 100;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSessionRequest {
    pub document_id: Uuid,
    pub max_participants: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinSessionRequest {
    pub join_code: String,
}

#[derive(Debug, Serialize)]
pub struct SessionEnvelope {
    pub session: Session,
    pub participant: Participant,
}

#[derive(Debug, Serialize)]
pub struct SessionDetail {
    pub session: Session,
    pub participants: Vec<Participant>,
}

/// Host-only lifecycle transitions share one policy gate.
#[derive(Debug, Clone, Copy)]
pub(crate) enum HostAction {
    Start,
    End,
}

pub(crate) fn authorize_host_action(
    action: HostAction,
    session: &Session,
    participant: &Participant,
) -> Result<(), SessionApiError> {
    if participant.role != ParticipantRole::Host {
        return Err(SessionApiError::Forbidden(
            "only the session host may perform this action".to_string(),
        ));
    }

    match (action, session.status) {
        (HostAction::Start, SessionStatus::Waiting) => Ok(()),
        (HostAction::Start, _) => Err(SessionApiError::BadRequest(
            "session can only be started from the waiting state".to_string(),
        )),
        (HostAction::End, SessionStatus::Ended) => {
            Err(SessionApiError::BadRequest("session has already ended".to_string()))
        }
        (HostAction::End, _) => Ok(()),
    }
}

pub async fn create_session(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    ValidatedJson(request): ValidatedJson<CreateSessionRequest>,
) -> Result<Response, SessionApiError> {
    let max_participants = request.max_participants.unwrap_or(DEFAULT_MAX_PARTICIPANTS);
    if !(1..=MAX_MAX_PARTICIPANTS).contains(&max_participants) {
        return Err(SessionApiError::BadRequest(format!(
            "max_participants must be between 1 and {MAX_MAX_PARTICIPANTS}"
        )));
    }

    let host_color = assign_color(&[]);
    let (session, participant) = context
        .store
        .create_session(
            request.document_id,
            user.user_id,
            &user.display_name,
            &host_color,
            max_participants,
        )
        .await?;

    info!(session_id = %session.id, host = %user.user_id, "created session");
    Ok(created(SessionEnvelope { session, participant }))
}

pub async fn join_session(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    ValidatedJson(request): ValidatedJson<JoinSessionRequest>,
) -> Result<Response, SessionApiError> {
    let join_code = request.join_code.trim().to_uppercase();
    if join_code.is_empty() {
        return Err(SessionApiError::BadRequest("join_code is required".to_string()));
    }

    let session = context
        .store
        .session_by_join_code(&join_code)
        .await?
        .ok_or_else(|| SessionApiError::NotFound("no session with that join code".to_string()))?;

    if session.status == SessionStatus::Ended {
        return Err(SessionApiError::BadRequest("session has already ended".to_string()));
    }

    let participant = match context.store.membership(session.id, user.user_id).await? {
        // Already an active member: idempotent join.
        Some(existing) if existing.left_at.is_none() => existing,
        // Rejoin: reactivate the old row, keeping its color and role.
        Some(_) => {
            context
                .store
                .reactivate_participant(session.id, user.user_id, &user.display_name)
                .await?
        }
        None => {
            let colors = context.store.colors_in_use(session.id).await?;
            let color = assign_color(&colors);
            context
                .store
                .add_participant(
                    session.id,
                    user.user_id,
                    &user.display_name,
                    &color,
                    session.max_participants,
                )
                .await?
                .ok_or_else(|| {
                    SessionApiError::BadRequest("session is at capacity".to_string())
                })?
        }
    };

    if let Some(room) = context.registry.get(session.id).await {
        room.broadcast(&RoomEvent::ParticipantJoined { participant: participant.clone() }, None)
            .await;
    }

    info!(session_id = %session.id, user = %user.user_id, "participant joined session");
    Ok(Json(SessionEnvelope { session, participant }).into_response())
}

pub async fn session_detail(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionDetail>, SessionApiError> {
    let (session, _) =
        require_active_participant(&context.store, session_id, user.user_id).await?;
    let participants = context.store.active_participants(session_id).await?;

    Ok(Json(SessionDetail { session, participants }))
}

pub async fn start_session(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, SessionApiError> {
    let (session, participant) =
        require_active_participant(&context.store, session_id, user.user_id).await?;
    authorize_host_action(HostAction::Start, &session, &participant)?;

    let session = context.store.mark_started(session_id).await?;

    if let Some(room) = context.registry.get(session_id).await {
        if let Some(started_at) = session.started_at {
            room.broadcast(&RoomEvent::SessionStarted { started_at }, Some(user.user_id)).await;
        }
    }

    info!(session_id = %session_id, "session started");
    Ok(Json(serde_json::json!({ "session": session })))
}

pub async fn end_session(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, SessionApiError> {
    let (session, participant) =
        require_active_participant(&context.store, session_id, user.user_id).await?;
    authorize_host_action(HostAction::End, &session, &participant)?;

    if let Some(room) = context.registry.get(session_id).await {
        room.broadcast(&RoomEvent::SessionEnded, None).await;
    }
    context.registry.remove(session_id).await;
    context.store.delete_session(session_id).await?;

    info!(session_id = %session_id, "session ended");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn leave_session(
    State(context): State<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, SessionApiError> {
    require_active_participant(&context.store, session_id, user.user_id).await?;

    context.store.mark_left(session_id, user.user_id).await?;
    info!(session_id = %session_id, user = %user.user_id, "participant left session");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::api::{router, ApiContext};
    use crate::auth::jwt::JwtAccessTokenService;
    use crate::room::registry::RoomRegistry;
    use crate::store::SessionStore;

    const TEST_SECRET: &str = "coview_test_secret_that_is_definitely_long_enough";

    pub(crate) struct TestHarness {
        pub app: Router,
        pub jwt: JwtAccessTokenService,
        pub registry: Arc<RoomRegistry>,
        pub store: SessionStore,
    }

    pub(crate) fn harness() -> TestHarness {
        let store = SessionStore::in_memory();
        let registry = Arc::new(RoomRegistry::new());
        let jwt = JwtAccessTokenService::new(TEST_SECRET).expect("jwt service");
        let context = ApiContext { store: store.clone(), registry: Arc::clone(&registry) };
        let app = router(context, jwt.clone());
        TestHarness { app, jwt, registry, store }
    }

    impl TestHarness {
        pub fn token_for(&self, user_id: Uuid, name: &str) -> String {
            self.jwt.issue_access_token(user_id, name).expect("token")
        }

        pub async fn request(
            &self,
            method: &str,
            uri: &str,
            token: &str,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder()
                .method(method)
                .uri(uri)
                .header("authorization", format!("Bearer {token}"));

            let body = match body {
                Some(value) => {
                    builder = builder.header("content-type", "application/json");
                    Body::from(value.to_string())
                }
                None => Body::empty(),
            };

            let response = self
                .app
                .clone()
                .oneshot(builder.body(body).expect("request should build"))
                .await
                .expect("response expected");

            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .expect("body should read");
            let parsed = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).expect("body should be json")
            };
            (status, parsed)
        }

        pub async fn create_session(&self, host: Uuid, max: i64) -> (Uuid, String) {
            let token = self.token_for(host, "Host");
            let (status, body) = self
                .request(
                    "POST",
                    "/v1/sessions",
                    &token,
                    Some(json!({ "document_id": Uuid::new_v4(), "max_participants": max })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
            let session_id = body["session"]["id"].as_str().expect("session id").to_string();
            let join_code = body["session"]["join_code"].as_str().expect("join code").to_string();
            (session_id.parse().expect("uuid"), join_code)
        }
    }

    #[tokio::test]
    async fn create_session_returns_waiting_session_with_host_membership() {
        let harness = harness();
        let host = Uuid::new_v4();
        let token = harness.token_for(host, "Host");

        let (status, body) = harness
            .request(
                "POST",
                "/v1/sessions",
                &token,
                Some(json!({ "document_id": Uuid::new_v4() })),
            )
            .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["session"]["status"], "waiting");
        assert_eq!(body["session"]["max_participants"], 12);
        assert_eq!(body["participant"]["role"], "host");
        assert_eq!(body["participant"]["user_id"], host.to_string());
        assert_eq!(body["session"]["join_code"].as_str().expect("code").len(), 8);
    }

    #[tokio::test]
    async fn create_session_rejects_nonpositive_capacity() {
        let harness = harness();
        let token = harness.token_for(Uuid::new_v4(), "Host");

        let (status, body) = harness
            .request(
                "POST",
                "/v1/sessions",
                &token,
                Some(json!({ "document_id": Uuid::new_v4(), "max_participants": 0 })),
            )
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn join_by_code_is_case_insensitive_and_assigns_distinct_colors() {
        let harness = harness();
        let host = Uuid::new_v4();
        let (_, join_code) = harness.create_session(host, 4).await;

        let guest = Uuid::new_v4();
        let token = harness.token_for(guest, "Guest");
        let (status, body) = harness
            .request(
                "POST",
                "/v1/sessions/join",
                &token,
                Some(json!({ "join_code": join_code.to_lowercase() })),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["participant"]["role"], "member");
        assert_ne!(body["participant"]["color"], Value::Null);

        let host_color = harness
            .store
            .membership(
                body["session"]["id"].as_str().expect("id").parse().expect("uuid"),
                host,
            )
            .await
            .expect("lookup")
            .expect("host membership")
            .color;
        assert_ne!(body["participant"]["color"], host_color);
    }

    #[tokio::test]
    async fn join_with_unknown_code_is_not_found() {
        let harness = harness();
        let token = harness.token_for(Uuid::new_v4(), "Guest");

        let (status, body) = harness
            .request("POST", "/v1/sessions/join", &token, Some(json!({ "join_code": "NOPE1234" })))
            .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn join_is_rejected_at_capacity_but_allows_rejoin() {
        let harness = harness();
        let host = Uuid::new_v4();
        let (session_id, join_code) = harness.create_session(host, 2).await;

        let guest = Uuid::new_v4();
        let guest_token = harness.token_for(guest, "Guest");
        let (status, _) = harness
            .request("POST", "/v1/sessions/join", &guest_token, Some(json!({ "join_code": join_code })))
            .await;
        assert_eq!(status, StatusCode::OK);

        // Session is now full: host + guest.
        let third_token = harness.token_for(Uuid::new_v4(), "Third");
        let (status, body) = harness
            .request("POST", "/v1/sessions/join", &third_token, Some(json!({ "join_code": join_code })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");

        // The guest leaves and rejoins on the same membership row.
        let (status, _) = harness
            .request("POST", &format!("/v1/sessions/{session_id}/leave"), &guest_token, None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = harness
            .request("POST", "/v1/sessions/join", &guest_token, Some(json!({ "join_code": join_code })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["participant"]["left_at"], Value::Null);

        let active = harness.store.active_participants(session_id).await.expect("list");
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn racing_joins_admit_exactly_one_into_the_last_slot() {
        let harness = harness();
        let host = Uuid::new_v4();
        let (session_id, join_code) = harness.create_session(host, 2).await;

        let token_a = harness.token_for(Uuid::new_v4(), "A");
        let token_b = harness.token_for(Uuid::new_v4(), "B");
        let ((status_a, _), (status_b, _)) = tokio::join!(
            harness.request(
                "POST",
                "/v1/sessions/join",
                &token_a,
                Some(json!({ "join_code": join_code.clone() })),
            ),
            harness.request(
                "POST",
                "/v1/sessions/join",
                &token_b,
                Some(json!({ "join_code": join_code })),
            ),
        );

        let statuses = [status_a, status_b];
        assert!(statuses.contains(&StatusCode::OK));
        assert!(statuses.contains(&StatusCode::BAD_REQUEST));
        assert_eq!(harness.store.active_participants(session_id).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn detail_requires_active_membership() {
        let harness = harness();
        let host = Uuid::new_v4();
        let (session_id, _) = harness.create_session(host, 4).await;

        let stranger_token = harness.token_for(Uuid::new_v4(), "Stranger");
        let (status, body) = harness
            .request("GET", &format!("/v1/sessions/{session_id}"), &stranger_token, None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "AUTH_FORBIDDEN");

        let host_token = harness.token_for(host, "Host");
        let (status, body) = harness
            .request("GET", &format!("/v1/sessions/{session_id}"), &host_token, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["participants"].as_array().expect("participants").len(), 1);
    }

    #[tokio::test]
    async fn only_the_host_may_start_and_only_from_waiting() {
        let harness = harness();
        let host = Uuid::new_v4();
        let (session_id, join_code) = harness.create_session(host, 4).await;

        let guest = Uuid::new_v4();
        let guest_token = harness.token_for(guest, "Guest");
        harness
            .request("POST", "/v1/sessions/join", &guest_token, Some(json!({ "join_code": join_code })))
            .await;

        let (status, body) = harness
            .request("POST", &format!("/v1/sessions/{session_id}/start"), &guest_token, None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "AUTH_FORBIDDEN");

        let host_token = harness.token_for(host, "Host");
        let (status, body) = harness
            .request("POST", &format!("/v1/sessions/{session_id}/start"), &host_token, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["status"], "active");
        assert_ne!(body["session"]["started_at"], Value::Null);

        let (status, _) = harness
            .request("POST", &format!("/v1/sessions/{session_id}/start"), &host_token, None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn end_session_deletes_it_and_drops_the_room() {
        let harness = harness();
        let host = Uuid::new_v4();
        let (session_id, _) = harness.create_session(host, 4).await;
        harness.registry.get_or_create(session_id).await;

        let host_token = harness.token_for(host, "Host");
        let (status, _) = harness
            .request("POST", &format!("/v1/sessions/{session_id}/end"), &host_token, None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        assert!(harness.registry.get(session_id).await.is_none());
        let (status, _) = harness
            .request("GET", &format!("/v1/sessions/{session_id}"), &host_token, None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn requests_without_tokens_are_unauthorized() {
        let harness = harness();

        let response = harness
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/sessions")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "document_id": Uuid::new_v4() }).to_string()))
                    .expect("request should build"),
            )
            .await
            .expect("response expected");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
