//! Stripe Checkout session management.
//!
//! Creates checkout sessions for the paid plan, creating the Stripe customer
//! lazily on first purchase.

use super::client::{CheckoutSession, CheckoutSessionRequest, CreateCustomerRequest, StripeGateway};
use super::error::BillingError;
use crate::error::Result;
use crate::profiles::{PLAN_PRO, Profile, ProfileStore};
use std::sync::Arc;

/// Product settings for the checkout flow.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// Price the checkout subscribes the customer to.
    pub price_id: String,
    /// Public base URL for redirect targets.
    pub app_url: String,
}

/// Checkout session management.
pub struct CheckoutManager {
    profiles: Arc<dyn ProfileStore>,
    gateway: Arc<dyn StripeGateway>,
    config: CheckoutConfig,
}

impl CheckoutManager {
    /// Create a new checkout manager.
    #[must_use]
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        gateway: Arc<dyn StripeGateway>,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            profiles,
            gateway,
            config,
        }
    }

    /// Create a checkout session for upgrading the user to the paid plan.
    ///
    /// Accounts already on the paid plan are rejected. Accounts without a
    /// Stripe customer get one created and linked first; if persisting the
    /// link fails, the just-created customer is deleted again so no orphaned
    /// provider records accumulate.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::AlreadyOnPlan`] (409) when the account already
    /// has the paid plan, a not-found error when the profile is missing, and
    /// Stripe/storage errors otherwise.
    pub async fn create_checkout_session(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<CheckoutSession> {
        let profile = self
            .profiles
            .find_by_user_id(user_id)
            .await?
            .ok_or_else(|| crate::error::ApiError::not_found("Profile not found"))?;

        if profile.is_pro() {
            return Err(BillingError::AlreadyOnPlan {
                plan_id: PLAN_PRO.to_string(),
            }
            .into());
        }

        let customer_id = self.ensure_customer(&profile, email).await?;

        let session = self
            .gateway
            .create_checkout_session(CheckoutSessionRequest {
                customer_id,
                price_id: self.config.price_id.clone(),
                success_url: format!(
                    "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
                    self.config.app_url
                ),
                cancel_url: format!("{}/#pricing", self.config.app_url),
                user_id: user_id.to_string(),
            })
            .await?;

        tracing::info!(
            target: "passclass::billing::checkout",
            user_id = %user_id,
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(session)
    }

    /// Return the profile's Stripe customer id, creating and linking one if
    /// none exists yet.
    async fn ensure_customer(&self, profile: &Profile, email: &str) -> Result<String> {
        if let Some(ref customer_id) = profile.stripe_customer_id {
            return Ok(customer_id.clone());
        }

        let customer_id = self
            .gateway
            .create_customer(CreateCustomerRequest {
                email: email.to_string(),
                user_id: profile.user_id.clone(),
            })
            .await?;

        if let Err(store_err) = self
            .profiles
            .set_stripe_customer_id(&profile.user_id, &customer_id)
            .await
        {
            // The link never landed; remove the orphaned provider record.
            if let Err(delete_err) = self.gateway.delete_customer(&customer_id).await {
                tracing::error!(
                    target: "passclass::billing::checkout",
                    customer_id = %customer_id,
                    error = %delete_err,
                    "Failed to delete orphaned Stripe customer after store error"
                );
            }
            return Err(store_err);
        }

        Ok(customer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::client::test::MockStripeGateway;
    use crate::error::ApiError;
    use crate::profiles::{InMemoryProfileStore, SubscriptionPatch, SubscriptionStatus};
    use async_trait::async_trait;

    fn config() -> CheckoutConfig {
        CheckoutConfig {
            price_id: "price_123".to_string(),
            app_url: "https://passthatclass.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_creates_customer_then_session() {
        let profiles = InMemoryProfileStore::new();
        profiles.seed(Profile::new("user_1", "u@example.com")).await;

        let manager = CheckoutManager::new(
            Arc::new(profiles.clone()),
            Arc::new(MockStripeGateway::new()),
            config(),
        );

        let session = manager
            .create_checkout_session("user_1", "u@example.com")
            .await
            .unwrap();
        assert!(session.url.starts_with("https://checkout.stripe.com/"));

        let profile = profiles.find_by_user_id("user_1").await.unwrap().unwrap();
        assert_eq!(profile.stripe_customer_id.as_deref(), Some("cus_mock_0"));
    }

    #[tokio::test]
    async fn test_reuses_existing_customer() {
        let profiles = InMemoryProfileStore::new();
        let mut profile = Profile::new("user_1", "u@example.com");
        profile.stripe_customer_id = Some("cus_existing".to_string());
        profiles.seed(profile).await;

        let gateway = Arc::new(MockStripeGateway::new());
        let manager = CheckoutManager::new(Arc::new(profiles.clone()), gateway, config());

        manager
            .create_checkout_session("user_1", "u@example.com")
            .await
            .unwrap();

        let profile = profiles.find_by_user_id("user_1").await.unwrap().unwrap();
        assert_eq!(profile.stripe_customer_id.as_deref(), Some("cus_existing"));
    }

    #[tokio::test]
    async fn test_rejects_existing_pro_plan() {
        let profiles = InMemoryProfileStore::new();
        let mut profile = Profile::new("user_1", "u@example.com");
        profile.plan_id = PLAN_PRO.to_string();
        profile.subscription_status = SubscriptionStatus::Active;
        profiles.seed(profile).await;

        let manager = CheckoutManager::new(
            Arc::new(profiles),
            Arc::new(MockStripeGateway::new()),
            config(),
        );

        let err = manager
            .create_checkout_session("user_1", "u@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_missing_profile_is_not_found() {
        let manager = CheckoutManager::new(
            Arc::new(InMemoryProfileStore::new()),
            Arc::new(MockStripeGateway::new()),
            config(),
        );

        let err = manager
            .create_checkout_session("user_missing", "u@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    /// Profile store whose customer-id link step always fails.
    struct LinkFailsStore {
        inner: InMemoryProfileStore,
    }

    #[async_trait]
    impl ProfileStore for LinkFailsStore {
        async fn find_by_user_id(&self, user_id: &str) -> Result<Option<Profile>> {
            self.inner.find_by_user_id(user_id).await
        }

        async fn find_by_customer_id(&self, customer_id: &str) -> Result<Option<Profile>> {
            self.inner.find_by_customer_id(customer_id).await
        }

        async fn set_stripe_customer_id(&self, _user_id: &str, _customer_id: &str) -> Result<()> {
            Err(ApiError::internal("store down"))
        }

        async fn apply_subscription_patch(
            &self,
            customer_id: &str,
            patch: &SubscriptionPatch,
        ) -> Result<u64> {
            self.inner.apply_subscription_patch(customer_id, patch).await
        }
    }

    #[tokio::test]
    async fn test_rolls_back_customer_when_link_fails() {
        let inner = InMemoryProfileStore::new();
        inner.seed(Profile::new("user_1", "u@example.com")).await;

        let gateway = Arc::new(MockStripeGateway::new());
        let manager = CheckoutManager::new(
            Arc::new(LinkFailsStore { inner }),
            gateway.clone(),
            config(),
        );

        let err = manager
            .create_checkout_session("user_1", "u@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));

        let deleted = gateway.deleted_customers.read().unwrap();
        assert_eq!(deleted.as_slice(), ["cus_mock_0".to_string()]);
    }
}
