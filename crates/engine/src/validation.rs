use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::{EngineError, ErrorCode};

/// Largest chat message body the engine accepts, in bytes.
pub const MAX_MESSAGE_CONTENT_BYTES: usize = 4_096;

/// Largest serialized annotation payload, in bytes. Pen strokes
/// dominate; 64 KiB covers dense drawings without letting one client
/// balloon every init snapshot.
pub const MAX_ANNOTATION_PAYLOAD_BYTES: usize = 64 * 1024;

/// JSON extractor that turns axum's deserialization rejections into the
/// engine's structured 400 body instead of axum's plain-text defaults.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = EngineError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(request, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(classify_json_rejection(rejection)),
        }
    }
}

fn classify_json_rejection(rejection: JsonRejection) -> EngineError {
    let reason = match &rejection {
        JsonRejection::JsonDataError(_) => "body does not match the expected schema",
        JsonRejection::JsonSyntaxError(_) => "body is not valid JSON",
        JsonRejection::MissingJsonContentType(_) => "expected content-type: application/json",
        JsonRejection::BytesRejection(_) => "failed to read request body",
        _ => "invalid request body",
    };

    EngineError::new(ErrorCode::ValidationFailed, reason)
        .with_details(json!({ "detail": rejection.body_text() }))
}

pub fn validate_message_content(content: &str) -> Result<(), EngineError> {
    if content.trim().is_empty() {
        return Err(EngineError::new(ErrorCode::ValidationFailed, "message content is empty"));
    }

    if content.len() > MAX_MESSAGE_CONTENT_BYTES {
        return Err(EngineError::new(
            ErrorCode::ValidationFailed,
            "message content exceeds maximum length",
        )
        .with_details(json!({
            "max_bytes": MAX_MESSAGE_CONTENT_BYTES,
            "actual_bytes": content.len(),
        })));
    }

    Ok(())
}

pub fn validate_annotation_payload(payload: &serde_json::Value) -> Result<(), EngineError> {
    if !payload.is_object() {
        return Err(EngineError::new(
            ErrorCode::ValidationFailed,
            "annotation payload must be a JSON object",
        ));
    }

    let serialized_len = serde_json::to_string(payload).map(|s| s.len()).unwrap_or(usize::MAX);
    if serialized_len > MAX_ANNOTATION_PAYLOAD_BYTES {
        return Err(EngineError::new(
            ErrorCode::ValidationFailed,
            "annotation payload exceeds maximum size",
        )
        .with_details(json!({
            "max_bytes": MAX_ANNOTATION_PAYLOAD_BYTES,
            "actual_bytes": serialized_len,
        })));
    }

    Ok(())
}
