use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;
use uuid::Uuid;

use crate::auth::jwt::JwtAccessTokenService;
use crate::error::{EngineError, ErrorCode};

/// Authenticated caller attached to the request extensions by
/// [`require_bearer_auth`]. Handlers pull it out with `Extension`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub display_name: String,
}

pub async fn require_bearer_auth(
    State(jwt_service): State<JwtAccessTokenService>,
    mut request: Request,
    next: Next,
) -> Result<Response, EngineError> {
    let token = bearer_token_from_request(&request)?;

    let identity = jwt_service.validate_access_token(token).map_err(|error| {
        debug!(error = %error, "rejected invalid access token");
        EngineError::from_code(ErrorCode::AuthInvalidToken)
    })?;

    request.extensions_mut().insert(AuthenticatedUser {
        user_id: identity.user_id,
        display_name: identity.display_name,
    });

    Ok(next.run(request).await)
}

fn bearer_token_from_request(request: &Request) -> Result<&str, EngineError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or_else(|| EngineError::from_code(ErrorCode::AuthInvalidToken))?;

    let header = header
        .to_str()
        .map_err(|_| EngineError::from_code(ErrorCode::AuthInvalidToken))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| EngineError::from_code(ErrorCode::AuthInvalidToken))?
        .trim();

    if token.is_empty() {
        return Err(EngineError::from_code(ErrorCode::AuthInvalidToken));
    }

    Ok(token)
}
