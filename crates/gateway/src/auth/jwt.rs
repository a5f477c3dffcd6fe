use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use super::AuthError;

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 30 * 60;
pub const TOKEN_ISSUER: &str = "parley-identity";

const ACCESS_TOKEN_TYPE: &str = "access";

/// Raw wire claims. Required-claim presence is enforced by the validator so
/// absence surfaces as `MissingClaim` instead of a serde failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
}

/// Validated claims bound to a connection identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessClaims {
    pub user_id: Uuid,
    pub issued_at: i64,
    pub expires_at: i64,
    pub permissions: Vec<String>,
    pub issuer: String,
}

/// Verifies bearer tokens minted by the external identity service.
///
/// Pure given the secret supplied at construction: no I/O, no shared state.
/// The `issue*` methods mirror the identity service's reference fixtures so
/// the validator can be exercised against known-good and known-expired
/// tokens; production connection handling only ever calls [`validate`].
///
/// [`validate`]: TokenVerifier::validate
#[derive(Clone)]
pub struct TokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue(&self, user_id: Uuid, permissions: &[&str]) -> anyhow::Result<String> {
        self.issue_at(user_id, permissions, current_unix_timestamp()?, ACCESS_TOKEN_TTL_SECONDS)
    }

    /// Fixture-grade issuance with explicit timestamps.
    pub fn issue_at(
        &self,
        user_id: Uuid,
        permissions: &[&str],
        issued_at: i64,
        ttl_seconds: i64,
    ) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: Some(user_id.to_string()),
            iss: Some(TOKEN_ISSUER.to_string()),
            iat: Some(issued_at),
            exp: Some(issued_at + ttl_seconds),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            token_type: Some(ACCESS_TOKEN_TYPE.to_string()),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    /// Validates a bearer token and returns its claims.
    ///
    /// Every failure is a classified [`AuthError`]; malformed input of any
    /// shape (empty string, wrong segment count, empty payload segment) fails
    /// fast as `InvalidFormat` rather than reaching signature verification.
    pub fn validate(&self, token: &str) -> Result<AccessClaims, AuthError> {
        check_compact_form(token)?;

        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(classify_decode_error)?
            .claims;

        if claims.token_type.as_deref() != Some(ACCESS_TOKEN_TYPE) {
            return Err(AuthError::WrongTokenType);
        }

        let sub = claims.sub.ok_or_else(|| AuthError::MissingClaim("sub".to_string()))?;
        let expires_at = claims.exp.ok_or_else(|| AuthError::MissingClaim("exp".to_string()))?;
        let issued_at = claims.iat.unwrap_or(0);

        if expires_at <= issued_at {
            return Err(AuthError::InvalidFormat);
        }

        let user_id = Uuid::parse_str(&sub).map_err(|_| AuthError::InvalidFormat)?;

        Ok(AccessClaims {
            user_id,
            issued_at,
            expires_at,
            permissions: claims.permissions,
            issuer: claims.iss.unwrap_or_default(),
        })
    }
}

/// JWT compact form: exactly three non-empty dot-separated segments.
fn check_compact_form(token: &str) -> Result<(), AuthError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 || segments.iter().any(|segment| segment.is_empty()) {
        return Err(AuthError::InvalidFormat);
    }
    Ok(())
}

fn classify_decode_error(error: jsonwebtoken::errors::Error) -> AuthError {
    match error.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
        _ => AuthError::InvalidFormat,
    }
}

pub fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
