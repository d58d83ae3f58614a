//! Billing module for Stripe-based subscriptions.
//!
//! The webhook reconciler is the heart of this module: it turns provider
//! event deliveries into at-most-once profile mutations. Checkout and portal
//! flows cover the outbound half of the integration.

pub mod checkout;
pub mod client;
pub mod error;
pub mod events;
pub mod handlers;
pub mod live_client;
pub mod portal;
#[cfg(feature = "database")]
pub mod sea_orm_store;
pub mod webhook;

// Event record exports
pub use events::{
    ClaimInsert, EventRecord, EventRecordStore, EventStatus, InMemoryEventRecordStore,
};

// Handler exports
pub use handlers::{HandlerRegistry, ProfileMutation, SubscriptionEventHandler};

// Webhook exports
pub use webhook::{
    STALE_CLAIM_THRESHOLD, WebhookEvent, WebhookEventData, WebhookOutcome, WebhookReconciler,
};

// Checkout exports
pub use checkout::{CheckoutConfig, CheckoutManager};

// Portal exports
pub use portal::PortalManager;

// Client exports
pub use client::{
    CheckoutSession, CheckoutSessionRequest, CreateCustomerRequest, PortalSession,
    PortalSessionRequest, StripeCheckoutClient, StripeCustomerClient, StripeGateway,
    StripePortalClient,
};

// Live client exports (production Stripe client)
pub use live_client::{InvalidApiKeyError, LiveStripeClient, LiveStripeClientConfig};

// Error exports
pub use error::BillingError;

// SeaORM storage exports
#[cfg(feature = "database")]
pub use sea_orm_store::SeaOrmBillingStore;
