use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::tier::Tier;

/// Access token payload shared with the sign-in service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub email: String,
    pub tier: String,
    pub exp: i64,
}

/// Caller identity resolved from a bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: String,
    pub tier: Tier,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError>;
}

/// Verifies and issues locally-signed HS256 access tokens.
///
/// Third-party credentials are exchanged for one of these by the sign-in
/// service before they reach the classification API.
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl JwtVerifier {
    pub fn new(secret: &str, ttl: Duration) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::Config("JWT secret must not be empty".to_string()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        })
    }

    pub fn issue(&self, user_id: &str, email: &str, tier: Tier) -> Result<String, AuthError> {
        let exp = chrono::Utc::now().timestamp() + self.ttl.as_secs() as i64;
        self.issue_with_expiry(user_id, email, tier, exp)
    }

    pub fn issue_with_expiry(
        &self,
        user_id: &str,
        email: &str,
        tier: Tier,
        exp: i64,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: user_id.to_string(),
            email: email.to_string(),
            tier: tier.to_string(),
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Config(e.to_string()))
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "Token verification failed");
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken,
            }
        })?;

        let claims = data.claims;
        if claims.user_id.is_empty() || claims.email.is_empty() {
            return Err(AuthError::InvalidToken);
        }

        Ok(AuthenticatedUser {
            user_id: claims.user_id,
            email: claims.email,
            tier: Tier::parse_or_free(&claims.tier),
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Invalid or expired token")]
    Expired,

    #[error("Authentication configuration error: {0}")]
    Config(String),
}
