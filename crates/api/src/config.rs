//! Server configuration from the environment.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// HS256 secret for Supabase-issued access tokens. Empty disables token
    /// validation: every caller is treated as unauthenticated.
    pub supabase_jwt_secret: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let supabase_jwt_secret = std::env::var("SUPABASE_JWT_SECRET").unwrap_or_default();
        if supabase_jwt_secret.is_empty() {
            tracing::warn!(
                "SUPABASE_JWT_SECRET not set - all requests will be treated as unauthenticated"
            );
        }

        Ok(Self {
            database_url,
            bind_address,
            supabase_jwt_secret,
        })
    }
}
