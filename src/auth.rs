//! Bearer-token authentication for user-facing routes.
//!
//! Session tokens are issued by the identity provider the frontend signs in
//! against; this service only verifies them locally with the shared HS256
//! secret and exposes the result as an axum extractor.

use crate::app::AppContext;
use crate::error::{ApiError, Result};
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

/// Claims carried by the identity provider's access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the local user id.
    pub sub: String,
    pub email: Option<String>,
    /// Expiry as a Unix timestamp.
    pub exp: usize,
}

/// JWT verifier for HS256 access tokens.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier from the provider's shared signing secret.
    #[must_use]
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        // Tokens carry the provider's own audience; this service keys on the
        // subject only.
        validation.validate_aud = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify a token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns an unauthorized error when the signature, expiry, or shape of
    /// the token is invalid.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(
                    target: "passclass::auth",
                    error = %e,
                    "Token verification failed"
                );
                ApiError::unauthorized("Invalid or expired token")
            })
    }
}

/// The authenticated user, extracted from the `Authorization` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

/// Extract the token from a `Bearer <token>` header value.
fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ")
}

impl FromRequestParts<AppContext> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> std::result::Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError::unauthorized("Missing or invalid Authorization header")
            })?;

        let token = bearer_token(header).ok_or_else(|| {
            ApiError::unauthorized("Missing or invalid Authorization header")
        })?;

        let claims = state.auth.verify(token)?;

        Ok(AuthUser {
            id: claims.sub,
            email: claims.email,
        })
    }
}
