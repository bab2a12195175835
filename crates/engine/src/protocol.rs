use serde_json::json;

use crate::error::{EngineError, ErrorCode};

/// Wire protocol version spoken by the live session stream.
pub const CURRENT_VERSION: &str = "coview-live.v1";

/// Versions the engine still accepts. Current plus one release back.
pub const SUPPORTED_VERSIONS: &[&str] = &["coview-live.v1", "coview-live.v0"];

pub fn is_supported(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

pub fn supported_versions() -> Vec<String> {
    SUPPORTED_VERSIONS.iter().map(|version| version.to_string()).collect()
}

/// Rejects unsupported protocol versions with a 426 carrying the
/// versions the server does speak, so old clients can self-diagnose.
pub fn require_supported(version: &str) -> Result<(), EngineError> {
    if is_supported(version) {
        return Ok(());
    }

    Err(EngineError::from_code(ErrorCode::UpgradeRequired).with_details(json!({
        "requested": version,
        "supported": supported_versions(),
    })))
}
