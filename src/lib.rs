//! PassClass backend API.
//!
//! Axum/Tokio service for the billing side of the PassClass education
//! product: Stripe webhook reconciliation, checkout sessions, and the
//! customer portal.
//!
//! # Features
//!
//! - **Webhooks**: signed Stripe event intake with an idempotency claim
//!   table, stale-claim recovery, and per-event-type handlers
//! - **Checkout**: checkout-session and billing-portal flows with lazy
//!   customer creation
//! - **Authentication**: bearer-JWT verification for user-facing routes
//! - **Persistence**: pluggable stores with a SeaORM/Postgres backend
//!   behind the `database` feature
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use passclass_api::{app, ConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     passclass_api::init_tracing();
//!
//!     let config = ConfigBuilder::from_env().build()?;
//!     let context = app::AppContext::in_memory(config)?;
//!
//!     app::serve(context).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod auth;
pub mod billing;
mod config;
mod error;
pub mod health;
pub mod profiles;
pub mod routes;

// Re-exports for public API
pub use config::{
    AuthConfig, Config, ConfigBuilder, ConfigError, CorsConfig, LoggingConfig, ServerConfig,
    StripeConfig,
};
#[cfg(feature = "database")]
pub use config::DatabaseConfig;
pub use error::{ApiError, ErrorResponse, Result};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults.
///
/// Call this early in `main()`, before building the app.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "passclass_api=debug")
/// - `PASSCLASS_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("PASSCLASS_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing from an explicit logging configuration.
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
