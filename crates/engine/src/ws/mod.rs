use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use coview_common::protocol::events::RoomEvent;
use coview_common::types::{Participant, Presence};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::jwt::JwtAccessTokenService;
use crate::error::{EngineError, ErrorCode};
use crate::protocol;
use crate::room::registry::RoomRegistry;
use crate::room::{LeaveOutcome, Outbound};
use crate::store::SessionStore;

/// Server pings every connection on this cadence.
pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
/// A connection with no pong for this long past the ping is dropped.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone)]
pub struct StreamContext {
    pub store: SessionStore,
    pub registry: Arc<RoomRegistry>,
    pub jwt: JwtAccessTokenService,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Access token, for clients that cannot set headers on upgrade.
    pub token: Option<String>,
    /// Protocol version the client speaks; unset means current.
    pub protocol: Option<String>,
}

pub fn router(context: StreamContext) -> Router {
    Router::new().route("/v1/sessions/{id}/stream", get(stream_handler)).with_state(context)
}

async fn stream_handler(
    State(context): State<StreamContext>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, EngineError> {
    if let Some(version) = &query.protocol {
        protocol::require_supported(version)?;
    }

    let token = query
        .token
        .clone()
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| EngineError::from_code(ErrorCode::AuthInvalidToken))?;

    let identity = context.jwt.validate_access_token(&token).map_err(|error| {
        debug!(error = %error, "rejected stream token");
        EngineError::from_code(ErrorCode::AuthInvalidToken)
    })?;

    let session = context
        .store
        .session(session_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| EngineError::from_code(ErrorCode::NotFound))?;

    let participant = context
        .store
        .membership(session.id, identity.user_id)
        .await
        .map_err(internal)?
        .filter(|participant| participant.left_at.is_none())
        .ok_or_else(|| EngineError::from_code(ErrorCode::AuthForbidden))?;

    Ok(upgrade.on_upgrade(move |socket| handle_socket(socket, context, participant)))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn internal(error: anyhow::Error) -> EngineError {
    warn!(error = ?error, "stream pre-upgrade store failure");
    EngineError::from_code(ErrorCode::InternalError)
}

async fn handle_socket(mut socket: WebSocket, context: StreamContext, participant: Participant) {
    let session_id = participant.session_id;
    let user_id = participant.user_id;
    let conn_id = Uuid::new_v4();

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Outbound>();
    // A room fetched here can be torn down before the join lands; a
    // sealed room refuses the join, so retry for a fresh one.
    let (room, first_connection) = loop {
        let room = context.registry.get_or_create(session_id).await;
        let joined = room
            .join(
                user_id,
                &participant.display_name,
                &participant.color,
                conn_id,
                outbound_sender.clone(),
            )
            .await;
        if let Some(first_connection) = joined {
            break (room, first_connection);
        }
    };

    // Snapshot after joining so the init frame and subsequent events
    // can overlap but never miss state.
    let init = match build_init(&context, session_id).await {
        Ok(Some(init)) => init,
        Ok(None) | Err(_) => {
            detach(&context, &room, user_id, conn_id).await;
            return;
        }
    };

    let Ok(init_frame) = serde_json::to_string(&init) else {
        detach(&context, &room, user_id, conn_id).await;
        return;
    };
    if socket.send(Message::Text(init_frame.into())).await.is_err() {
        detach(&context, &room, user_id, conn_id).await;
        return;
    }

    if first_connection {
        let presence = Presence {
            user_id,
            display_name: participant.display_name.clone(),
            color: participant.color.clone(),
            page_number: 1,
            cursor_x: 0.0,
            cursor_y: 0.0,
            last_activity_at: Utc::now(),
        };
        room.broadcast(&RoomEvent::PresenceUpdate { presence }, Some(user_id)).await;
    }

    debug!(session_id = %session_id, user = %user_id, conn = %conn_id, "stream connected");

    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout =
        Duration::from_millis(HEARTBEAT_INTERVAL_MS + HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(session_id = %session_id, user = %user_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(Outbound::Event(frame)) => {
                        if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: "session ended".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    // The stream is push-only; client text frames are ignored.
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    debug!(session_id = %session_id, user = %user_id, conn = %conn_id, "stream disconnected");
    detach(&context, &room, user_id, conn_id).await;
}

async fn build_init(
    context: &StreamContext,
    session_id: Uuid,
) -> anyhow::Result<Option<RoomEvent>> {
    // Refetched: the session may have started since the upgrade check.
    let Some(session) = context.store.session(session_id).await? else {
        return Ok(None);
    };

    let participants = match context.registry.get(session_id).await {
        Some(room) => room.snapshot_presences().await,
        None => Vec::new(),
    };
    let annotations = context.store.annotations(session_id).await?;
    let messages = context.store.messages(session_id).await?;

    Ok(Some(RoomEvent::Init { session, participants, annotations, messages }))
}

/// Removes the connection from the room; when it was the user's last,
/// announces the departure and garbage-collects an empty room.
async fn detach(
    context: &StreamContext,
    room: &crate::room::Room,
    user_id: Uuid,
    conn_id: Uuid,
) {
    if room.leave(user_id, conn_id).await == LeaveOutcome::PresenceRemoved {
        room.broadcast(&RoomEvent::ParticipantLeft { user_id }, None).await;
        context.registry.drop_if_empty(room.session_id()).await;
    }
}
