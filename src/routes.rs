//! HTTP boundary for the billing flows.
//!
//! The webhook route consumes the raw request body: signature verification
//! runs over the exact bytes Stripe signed, before any parsing.

use crate::app::AppContext;
use crate::auth::AuthUser;
use crate::error::{ApiError, Result};
use crate::health;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::{get, post},
};
use serde::Serialize;

/// Assemble all routes.
pub fn router() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/billing/webhook", post(stripe_webhook))
        .route(
            "/billing/create-checkout-session",
            post(create_checkout_session),
        )
        .route("/billing/portal", post(billing_portal))
}

#[derive(Debug, Serialize)]
struct AckResponse {
    received: bool,
}

#[derive(Debug, Serialize)]
struct SessionUrlResponse {
    url: String,
}

/// Inbound Stripe event notifications.
///
/// A 2xx tells Stripe not to retry; any error response leaves redelivery to
/// Stripe's own retry schedule.
async fn stripe_webhook(
    State(context): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AckResponse>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("Missing stripe-signature header"))?;

    let event = context.reconciler.verify_signature(&body, signature)?;
    let outcome = context.reconciler.process(event).await?;

    tracing::debug!(
        target: "passclass::http",
        outcome = ?outcome,
        "Webhook acknowledged"
    );

    Ok(Json(AckResponse { received: true }))
}

/// Start a checkout for the paid plan.
async fn create_checkout_session(
    State(context): State<AppContext>,
    user: AuthUser,
) -> Result<Json<SessionUrlResponse>> {
    let email = user
        .email
        .ok_or_else(|| ApiError::bad_request("Token carries no email address"))?;

    let session = context
        .checkout
        .create_checkout_session(&user.id, &email)
        .await?;

    Ok(Json(SessionUrlResponse { url: session.url }))
}

/// Open the Stripe customer portal for the authenticated user.
async fn billing_portal(
    State(context): State<AppContext>,
    user: AuthUser,
) -> Result<Json<SessionUrlResponse>> {
    let session = context.portal.create_portal_session(&user.id).await?;

    Ok(Json(SessionUrlResponse { url: session.url }))
}
