mod api;
mod auth;
mod config;
mod cors;
mod db;
mod error;
mod protocol;
mod room;
mod store;
mod validation;
mod ws;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiContext;
use crate::auth::jwt::JwtAccessTokenService;
use crate::config::EngineConfig;
use crate::db::migrations::run_migrations;
use crate::db::pool::{check_pool_health, create_pg_pool, PoolConfig};
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
    EngineError, ErrorCode,
};
use crate::room::registry::RoomRegistry;
use crate::store::SessionStore;
use crate::ws::StreamContext;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config.log_filter);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set COVIEW_ENGINE_JWT_SECRET in deployment");
    }

    let store = match &config.database_url {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env()).await?;
            check_pool_health(&pool).await?;
            run_migrations(&pool).await?;
            info!("connected to postgres");
            SessionStore::Postgres(pool)
        }
        None => {
            warn!("COVIEW_ENGINE_DATABASE_URL unset; sessions live in process memory only");
            SessionStore::in_memory()
        }
    };

    let jwt_service = JwtAccessTokenService::new(&config.jwt_secret)?;
    let registry = Arc::new(RoomRegistry::new());
    let app = build_app(store, registry, jwt_service, &config)?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, ws_base_url = %config.ws_base_url, "engine listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("engine stopped");
    Ok(())
}

fn init_tracing(log_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_app(
    store: SessionStore,
    registry: Arc<RoomRegistry>,
    jwt_service: JwtAccessTokenService,
    config: &EngineConfig,
) -> Result<Router> {
    let api_context = ApiContext { store: store.clone(), registry: Arc::clone(&registry) };
    let stream_context = StreamContext { store, registry, jwt: jwt_service.clone() };

    let router = Router::new()
        .route("/healthz", get(healthz))
        .merge(api::router(api_context, jwt_service))
        .merge(ws::router(stream_context));

    Ok(router
        .layer(middleware::from_fn(catch_panics))
        .layer(middleware::from_fn(request_context))
        .layer(cors::cors_layer(config.cors_origins.as_deref())?)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES)))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Scopes every request to a request id (propagated from the caller's
/// `x-request-id` or generated) and logs one line per request.
async fn request_context(request: Request, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Runs the handler on its own task so a panic surfaces as a 500
/// instead of tearing down the connection mid-response.
async fn catch_panics(request: Request, next: Next) -> Response {
    match tokio::spawn(next.run(request)).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(error = %join_error, "request handler panicked");
            EngineError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => error!(error = %error, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
