// Connection authentication: credential extraction + token validation,
// resolved before the transport-level accept.

pub mod extract;
pub mod jwt;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Uri};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, GatewayError};
use self::extract::Credential;
use self::jwt::TokenVerifier;

/// Classified authentication failure. Every kind maps to the same uniform
/// rejection at the transport boundary; the distinction exists for logs and
/// metrics only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no credential present on the connection request")]
    NoCredential,
    #[error("credential is not a well-formed token")]
    InvalidFormat,
    #[error("credential signature did not verify")]
    InvalidSignature,
    #[error("credential has expired")]
    Expired,
    #[error("credential is missing required claim `{0}`")]
    MissingClaim(String),
    #[error("credential is not an access token")]
    WrongTokenType,
    #[error("authentication did not complete within the allowed time")]
    Timeout,
}

impl AuthError {
    /// Stable label for logs and metrics. Never sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoCredential => "no_credential",
            Self::InvalidFormat => "invalid_format",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "expired",
            Self::MissingClaim(_) => "missing_claim",
            Self::WrongTokenType => "wrong_token_type",
            Self::Timeout => "timeout",
        }
    }
}

/// Connection-attempt authentication state machine.
///
/// `Authenticated` and `Rejected` are terminal; a rejected attempt never
/// reaches the transport accept step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Pending,
    Authenticating,
    Authenticated,
    Rejected,
}

impl AuthPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Authenticated | Self::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Jwt,
    Bypass,
}

/// The identity bound to a connection once authentication succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    pub user_id: Uuid,
    pub permissions: Vec<String>,
    pub method: AuthMethod,
}

/// Orchestrates extraction + validation for one connection attempt.
pub struct Authenticator {
    verifier: Arc<TokenVerifier>,
    auth_timeout: Duration,
    test_bypass_enabled: bool,
}

impl Authenticator {
    pub fn new(verifier: Arc<TokenVerifier>, auth_timeout: Duration, test_bypass_enabled: bool) -> Self {
        Self { verifier, auth_timeout, test_bypass_enabled }
    }

    pub fn verifier(&self) -> &Arc<TokenVerifier> {
        &self.verifier
    }

    /// Authenticates a connection request, completing (or definitively
    /// failing) before the caller performs the transport-level accept.
    ///
    /// The upgrade handler only calls `on_upgrade` once this returns `Ok`,
    /// so no socket is ever accepted ahead of validation.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        uri: &Uri,
    ) -> Result<AuthenticatedIdentity, AuthError> {
        trace_phase(AuthPhase::Pending);

        let Some(credential) =
            extract::extract_credential(headers, uri, self.test_bypass_enabled)
        else {
            trace_phase(AuthPhase::Rejected);
            return Err(AuthError::NoCredential);
        };

        trace_phase(AuthPhase::Authenticating);

        match tokio::time::timeout(self.auth_timeout, self.resolve(credential)).await {
            Ok(Ok(identity)) => {
                trace_phase(AuthPhase::Authenticated);
                debug!(user_id = %identity.user_id, "connection authenticated");
                Ok(identity)
            }
            Ok(Err(error)) => {
                trace_phase(AuthPhase::Rejected);
                Err(error)
            }
            Err(_elapsed) => {
                trace_phase(AuthPhase::Rejected);
                Err(AuthError::Timeout)
            }
        }
    }

    async fn resolve(&self, credential: Credential) -> Result<AuthenticatedIdentity, AuthError> {
        match credential {
            Credential::Token(token) => {
                let claims = self.verifier.validate(&token)?;
                Ok(AuthenticatedIdentity {
                    user_id: claims.user_id,
                    permissions: claims.permissions,
                    method: AuthMethod::Jwt,
                })
            }
            Credential::Bypass(user_id) => {
                warn!(user_id = %user_id, "test-bypass credential accepted; the bypass gate must stay closed in production");
                Ok(AuthenticatedIdentity {
                    user_id,
                    permissions: vec!["read".to_string(), "write".to_string()],
                    method: AuthMethod::Bypass,
                })
            }
        }
    }
}

fn trace_phase(phase: AuthPhase) {
    debug!(phase = phase.as_str(), "connection authentication phase");
}

/// The uniform transport-boundary rejection. Callers log the precise
/// [`AuthError`] separately; the response body never distinguishes causes.
pub fn rejection() -> GatewayError {
    GatewayError::from_code(ErrorCode::AuthRejected)
}
