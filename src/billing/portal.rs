//! Stripe Customer Portal session management.

use super::client::{PortalSession, PortalSessionRequest, StripeGateway};
use super::error::BillingError;
use crate::error::Result;
use crate::profiles::ProfileStore;
use std::sync::Arc;

/// Customer Portal session management.
///
/// The portal lets customers manage their subscription and payment methods
/// on Stripe-hosted pages.
pub struct PortalManager {
    profiles: Arc<dyn ProfileStore>,
    gateway: Arc<dyn StripeGateway>,
    /// Public base URL the portal returns to.
    app_url: String,
}

impl PortalManager {
    /// Create a new portal manager.
    #[must_use]
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        gateway: Arc<dyn StripeGateway>,
        app_url: impl Into<String>,
    ) -> Self {
        Self {
            profiles,
            gateway,
            app_url: app_url.into(),
        }
    }

    /// Create a portal session for the user's Stripe customer.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::NoCustomer`] (400) when the account has no
    /// Stripe customer on file.
    pub async fn create_portal_session(&self, user_id: &str) -> Result<PortalSession> {
        let profile = self
            .profiles
            .find_by_user_id(user_id)
            .await?
            .ok_or_else(|| crate::error::ApiError::not_found("Profile not found"))?;

        let customer_id = profile.stripe_customer_id.ok_or_else(|| {
            BillingError::NoCustomer {
                user_id: user_id.to_string(),
            }
        })?;

        let session = self
            .gateway
            .create_portal_session(PortalSessionRequest {
                customer_id,
                return_url: format!("{}/account", self.app_url),
            })
            .await?;

        Ok(session)
    }
}
