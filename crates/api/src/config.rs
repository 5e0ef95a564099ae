//! API server configuration, loaded from the environment.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    /// HS256 secret for the bearer tokens issued by the auth service.
    pub jwt_secret: String,
    /// Frontend origin allowed by CORS.
    pub frontend_origin: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?,
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            jwt_secret: std::env::var("JWT_SECRET").context("JWT_SECRET is not set")?,
            frontend_origin: std::env::var("FRONTEND_ORIGIN")
                .unwrap_or_else(|_| "https://wildpatch.example".into()),
        })
    }
}
