use anyhow::{bail, Context, Result};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use tower_http::cors::CorsLayer;

/// Origins allowed when `COVIEW_ENGINE_CORS_ORIGINS` is unset. Local
/// frontend dev servers only.
const DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

pub fn cors_layer(configured_origins: Option<&str>) -> Result<CorsLayer> {
    let origins = match configured_origins {
        Some(raw) => parse_origins(raw)?,
        None => DEV_ORIGINS.iter().copied().map(HeaderValue::from_static).collect(),
    };

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]))
}

fn parse_origins(raw: &str) -> Result<Vec<HeaderValue>> {
    let mut origins = Vec::new();

    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        if entry == "*" {
            bail!("wildcard CORS origin is not allowed; list explicit origins");
        }

        let origin = entry
            .parse::<HeaderValue>()
            .with_context(|| format!("invalid CORS origin '{entry}'"))?;
        origins.push(origin);
    }

    if origins.is_empty() {
        bail!("COVIEW_ENGINE_CORS_ORIGINS is set but contains no origins");
    }

    Ok(origins)
}
