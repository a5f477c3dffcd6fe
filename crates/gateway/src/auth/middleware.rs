use crate::{
    auth::extract::extract_bearer_token,
    auth::jwt::TokenVerifier,
    error::{ErrorCode, GatewayError},
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// Identity injected into request extensions by [`require_bearer_auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
    pub permissions: Vec<String>,
}

/// Bearer-token middleware for the REST ingest surface.
///
/// Rejections are uniform (`AUTH_REJECTED`); the validation failure kind is
/// logged, never returned.
pub async fn require_bearer_auth(
    State(verifier): State<Arc<TokenVerifier>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token,
        None => {
            warn!(reason = "no_credential", "rejected unauthenticated request");
            return rejected_response();
        }
    };

    let claims = match verifier.validate(token) {
        Ok(claims) => claims,
        Err(error) => {
            warn!(reason = error.kind(), "rejected request with invalid bearer token");
            return rejected_response();
        }
    };

    request.extensions_mut().insert(AuthenticatedUser {
        user_id: claims.user_id,
        permissions: claims.permissions,
    });

    next.run(request).await
}

fn rejected_response() -> Response {
    GatewayError::from_code(ErrorCode::AuthRejected).into_response()
}
