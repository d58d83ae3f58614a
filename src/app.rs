//! Application wiring: dependency context, router assembly, and serving.

use crate::auth::JwtVerifier;
use crate::billing::checkout::{CheckoutConfig, CheckoutManager};
use crate::billing::client::StripeGateway;
use crate::billing::events::{EventRecordStore, InMemoryEventRecordStore};
use crate::billing::live_client::{InvalidApiKeyError, LiveStripeClient};
use crate::billing::portal::PortalManager;
use crate::billing::webhook::WebhookReconciler;
use crate::billing::HandlerRegistry;
use crate::config::{Config, CorsConfig};
use crate::profiles::{InMemoryProfileStore, ProfileStore};
use crate::routes;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Application context for dependency injection and shared state.
///
/// Holds the stores, managers, and verifier every handler needs. Construct
/// it once at startup and hand it to [`serve`].
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub profiles: Arc<dyn ProfileStore>,
    pub events: Arc<dyn EventRecordStore>,
    pub reconciler: Arc<WebhookReconciler>,
    pub checkout: Arc<CheckoutManager>,
    pub portal: Arc<PortalManager>,
    pub auth: JwtVerifier,
}

impl AppContext {
    /// Build a context over explicit stores and a live Stripe client derived
    /// from the configured secret key.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured Stripe API key is malformed.
    pub fn with_stores(
        config: Config,
        profiles: Arc<dyn ProfileStore>,
        events: Arc<dyn EventRecordStore>,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        let gateway: Arc<dyn StripeGateway> = Arc::new(LiveStripeClient::with_default_config(
            config.stripe.secret_key.clone(),
        )?);
        Ok(Self::with_gateway(config, profiles, events, gateway))
    }

    /// Build a context over explicit stores and an explicit Stripe gateway
    /// (used by tests to substitute a fake).
    #[must_use]
    pub fn with_gateway(
        config: Config,
        profiles: Arc<dyn ProfileStore>,
        events: Arc<dyn EventRecordStore>,
        gateway: Arc<dyn StripeGateway>,
    ) -> Self {
        let reconciler = Arc::new(WebhookReconciler::new(
            events.clone(),
            profiles.clone(),
            HandlerRegistry::stripe_defaults(),
            config.stripe.webhook_secret.clone(),
        ));

        let checkout = Arc::new(CheckoutManager::new(
            profiles.clone(),
            gateway.clone(),
            CheckoutConfig {
                price_id: config.stripe.price_id.clone(),
                app_url: config.stripe.app_url.clone(),
            },
        ));

        let portal = Arc::new(PortalManager::new(
            profiles.clone(),
            gateway,
            config.stripe.app_url.clone(),
        ));

        let auth = JwtVerifier::from_secret(config.auth.jwt_secret.expose_secret().as_bytes());

        Self {
            config: Arc::new(config),
            profiles,
            events,
            reconciler,
            checkout,
            portal,
            auth,
        }
    }

    /// Build a context backed by in-memory stores (development and tests).
    ///
    /// # Errors
    ///
    /// Returns an error when the configured Stripe API key is malformed.
    pub fn in_memory(config: Config) -> std::result::Result<Self, InvalidApiKeyError> {
        Self::with_stores(
            config,
            Arc::new(InMemoryProfileStore::new()),
            Arc::new(InMemoryEventRecordStore::new()),
        )
    }
}

/// Build the application router with its middleware stack applied.
pub fn router(context: AppContext) -> Router {
    let max_body_size = context.config.server.max_body_size;
    let cors = build_cors_layer(&context.config.cors);

    let mut router = routes::router()
        .with_state(context)
        .layer(DefaultBodyLimit::max(max_body_size));

    if let Some(cors) = cors {
        router = router.layer(cors);
    }

    router
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
}

/// Build the CORS layer from the configured origin list.
fn build_cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
    )
}

/// Start the application server.
pub async fn serve(context: AppContext) -> std::io::Result<()> {
    let addr = context
        .config
        .server
        .addr()
        .expect("Invalid server address in config");

    let app = router(context);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Server starting on http://{}", addr);
    tracing::info!("Health check available at http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Give connections a grace period to close
    tokio::time::sleep(Duration::from_secs(1)).await;
    tracing::info!("Shutdown complete");
}
