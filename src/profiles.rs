//! Account/subscription state owned by the profile store.
//!
//! A profile is created when a user registers and is mutated here only
//! through absolute-value patches, so a patch applied twice leaves the same
//! state as a patch applied once.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Plan identifier for accounts without a paid subscription.
pub const PLAN_FREE: &str = "free";
/// Plan identifier for the paid tier.
pub const PLAN_PRO: &str = "pro";

/// Subscription status as stored on the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription is active and paid.
    Active,
    /// Subscription is scheduled to cancel at period end.
    Canceled,
    /// No subscription on file.
    None,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::None => "none",
        }
    }

    /// Parse from the stored string form. Unknown values map to `None`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "canceled" => Self::Canceled,
            _ => Self::None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user's billing profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub email: String,
    pub plan_id: String,
    pub subscription_status: SubscriptionStatus,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
}

impl Profile {
    /// Create a fresh free-tier profile, as registration does.
    #[must_use]
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            plan_id: PLAN_FREE.to_string(),
            subscription_status: SubscriptionStatus::None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            current_period_start: None,
            current_period_end: None,
        }
    }

    #[must_use]
    pub fn is_pro(&self) -> bool {
        self.plan_id == PLAN_PRO
    }
}

/// Absolute-value update to a profile's subscription fields.
///
/// Outer `Some` means "set this column to the contained value"; outer `None`
/// leaves the column untouched. For nullable columns the inner `Option`
/// distinguishes setting a value from clearing the column. Patches carry
/// target values, never deltas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionPatch {
    pub plan_id: Option<String>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub stripe_customer_id: Option<Option<String>>,
    pub stripe_subscription_id: Option<Option<String>>,
    pub current_period_start: Option<Option<DateTime<Utc>>>,
    pub current_period_end: Option<Option<DateTime<Utc>>>,
}

impl SubscriptionPatch {
    /// Apply the patch to an in-memory profile.
    pub fn apply_to(&self, profile: &mut Profile) {
        if let Some(ref plan_id) = self.plan_id {
            profile.plan_id = plan_id.clone();
        }
        if let Some(status) = self.subscription_status {
            profile.subscription_status = status;
        }
        if let Some(ref customer_id) = self.stripe_customer_id {
            profile.stripe_customer_id = customer_id.clone();
        }
        if let Some(ref subscription_id) = self.stripe_subscription_id {
            profile.stripe_subscription_id = subscription_id.clone();
        }
        if let Some(start) = self.current_period_start {
            profile.current_period_start = start;
        }
        if let Some(end) = self.current_period_end {
            profile.current_period_end = end;
        }
    }
}

/// Trait for persisting billing profiles.
///
/// Implement this to back profiles with your database. An in-memory
/// implementation is provided for development and testing.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Look up a profile by local user id.
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<Profile>>;

    /// Look up a profile by Stripe customer id.
    async fn find_by_customer_id(&self, customer_id: &str) -> Result<Option<Profile>>;

    /// Link a profile to a Stripe customer.
    async fn set_stripe_customer_id(&self, user_id: &str, customer_id: &str) -> Result<()>;

    /// Apply an absolute-value patch to every profile matching the Stripe
    /// customer id. Returns the number of rows updated; zero rows is not an
    /// error.
    async fn apply_subscription_patch(
        &self,
        customer_id: &str,
        patch: &SubscriptionPatch,
    ) -> Result<u64>;
}

/// In-memory profile store (for development/testing).
///
/// Wraps data in `Arc` for cheap cloning and counts mutating writes so tests
/// can assert how many times account state was touched.
#[derive(Default, Clone)]
pub struct InMemoryProfileStore {
    inner: std::sync::Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    profiles: tokio::sync::RwLock<std::collections::HashMap<String, Profile>>,
    writes: std::sync::atomic::AtomicU64,
}

impl InMemoryProfileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a profile (for testing).
    pub async fn seed(&self, profile: Profile) {
        let mut profiles = self.inner.profiles.write().await;
        profiles.insert(profile.user_id.clone(), profile);
    }

    /// Number of mutating writes issued so far (for testing).
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<Profile>> {
        let profiles = self.inner.profiles.read().await;
        Ok(profiles.get(user_id).cloned())
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> Result<Option<Profile>> {
        let profiles = self.inner.profiles.read().await;
        Ok(profiles
            .values()
            .find(|p| p.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn set_stripe_customer_id(&self, user_id: &str, customer_id: &str) -> Result<()> {
        let mut profiles = self.inner.profiles.write().await;
        if let Some(profile) = profiles.get_mut(user_id) {
            profile.stripe_customer_id = Some(customer_id.to_string());
            self.inner
                .writes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(())
    }

    async fn apply_subscription_patch(
        &self,
        customer_id: &str,
        patch: &SubscriptionPatch,
    ) -> Result<u64> {
        let mut profiles = self.inner.profiles.write().await;
        let mut updated = 0;
        for profile in profiles.values_mut() {
            if profile.stripe_customer_id.as_deref() == Some(customer_id) {
                patch.apply_to(profile);
                updated += 1;
            }
        }
        if updated > 0 {
            self.inner
                .writes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(updated)
    }
}
