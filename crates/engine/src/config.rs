// Engine server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool still reads its own sizing vars — this
// module covers the core server settings.

use std::net::SocketAddr;

/// Core engine server configuration.
///
/// Constructed via [`EngineConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for access tokens.
    pub jwt_secret: String,
    /// Base URL clients use for the push channel (e.g. `ws://localhost:8080`).
    pub ws_base_url: String,
    /// PostgreSQL connection string; in-memory store when unset.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins; unset falls back to local dev defaults.
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `coview_engine=debug`).
    pub log_filter: String,
}

impl EngineConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `COVIEW_ENGINE_HOST` | `0.0.0.0` |
    /// | `COVIEW_ENGINE_PORT` | `8080` |
    /// | `COVIEW_ENGINE_JWT_SECRET` | dev-only placeholder |
    /// | `COVIEW_ENGINE_WS_BASE_URL` | `ws://{host}:{port}` |
    /// | `COVIEW_ENGINE_DATABASE_URL` | *(none — memory store)* |
    /// | `COVIEW_ENGINE_CORS_ORIGINS` | *(none — cors.rs uses dev defaults)* |
    /// | `COVIEW_ENGINE_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("COVIEW_ENGINE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("COVIEW_ENGINE_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("COVIEW_ENGINE_JWT_SECRET").unwrap_or_else(|_| {
            "coview_local_development_jwt_secret_must_be_32_chars".into()
        });

        let ws_base_url = env("COVIEW_ENGINE_WS_BASE_URL")
            .unwrap_or_else(|_| format!("ws://{listen_addr}"));

        let database_url = env("COVIEW_ENGINE_DATABASE_URL").ok();
        let cors_origins = env("COVIEW_ENGINE_CORS_ORIGINS").ok();

        let log_filter =
            env("COVIEW_ENGINE_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, jwt_secret, ws_base_url, database_url, cors_origins, log_filter }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == "coview_local_development_jwt_secret_must_be_32_chars"
    }
}
