//! Request authentication.
//!
//! The storefront authenticates against Supabase; this service only
//! validates the resulting HS256 access token. Extraction is infallible:
//! a missing or invalid token yields an anonymous `AuthUser`, and each
//! handler decides whether anonymity is acceptable (admin actions answer
//! with their uniform result shape rather than an HTTP error).

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, serde::Deserialize)]
struct Claims {
    sub: String,
    email: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AuthUser {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
}

impl AuthUser {
    fn from_token(token: &str, secret: &str) -> Option<Self> {
        if secret.is_empty() {
            return None;
        }

        let mut validation = Validation::new(Algorithm::HS256);
        // Supabase sets aud = "authenticated"; the subject is what we key on.
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .ok()?;

        let user_id = Uuid::parse_str(&data.claims.sub).ok()?;
        Some(Self {
            user_id: Some(user_id),
            email: data.claims.email,
        })
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        Ok(token
            .and_then(|t| AuthUser::from_token(t, &state.config.supabase_jwt_secret))
            .unwrap_or_default())
    }
}
