//! Outbound Stripe client ports.
//!
//! Individual traits stay separate so tests can fake one capability at a
//! time; [`StripeGateway`] bundles them for app wiring.

use crate::error::Result;
use async_trait::async_trait;

/// Request to create a Stripe customer for a local user.
#[derive(Debug, Clone)]
pub struct CreateCustomerRequest {
    pub email: String,
    /// Local user id, attached as customer metadata so provider-side records
    /// can be traced back.
    pub user_id: String,
}

/// Customer lifecycle operations.
#[async_trait]
pub trait StripeCustomerClient: Send + Sync {
    /// Create a customer, returning its Stripe id.
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<String>;

    /// Delete a customer (used to roll back an orphaned creation).
    async fn delete_customer(&self, customer_id: &str) -> Result<()>;
}

/// Request to create a checkout session.
#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Local user id, attached as session metadata.
    pub user_id: String,
}

/// Checkout session response.
#[derive(Debug, Clone)]
#[must_use]
pub struct CheckoutSession {
    /// Stripe checkout session ID.
    pub id: String,
    /// URL to redirect the customer to.
    pub url: String,
}

/// Checkout operations.
#[async_trait]
pub trait StripeCheckoutClient: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession>;
}

/// Request to create a billing portal session.
#[derive(Debug, Clone)]
pub struct PortalSessionRequest {
    pub customer_id: String,
    /// URL to return to after the portal.
    pub return_url: String,
}

/// Portal session response.
#[derive(Debug, Clone)]
#[must_use]
pub struct PortalSession {
    /// Stripe portal session ID.
    pub id: String,
    /// URL to redirect the customer to.
    pub url: String,
}

/// Customer portal operations.
#[async_trait]
pub trait StripePortalClient: Send + Sync {
    async fn create_portal_session(&self, request: PortalSessionRequest)
    -> Result<PortalSession>;
}

/// A type that implements every Stripe client trait this service needs.
pub trait StripeGateway:
    StripeCustomerClient + StripeCheckoutClient + StripePortalClient
{
}

/// Blanket implementation for any type that implements all traits.
impl<T> StripeGateway for T where
    T: StripeCustomerClient + StripeCheckoutClient + StripePortalClient
{
}
