//! Per-event-type subscription mutations.
//!
//! Each supported provider event type maps to one handler. A handler is a
//! pure function from the event's payload to a [`ProfileMutation`]: the
//! Stripe customer id to match on plus an absolute-value
//! [`SubscriptionPatch`]. Handlers never talk to storage, which keeps every
//! mutation independently testable and safe to apply more than once.

use super::error::BillingError;
use crate::profiles::{PLAN_FREE, PLAN_PRO, SubscriptionPatch, SubscriptionStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// The state change an event implies: which profile to touch and the target
/// field values to set on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileMutation {
    /// Stripe customer id the affected profile is matched by. Events never
    /// carry local user ids.
    pub stripe_customer_id: String,
    pub patch: SubscriptionPatch,
}

/// A handler for one provider event type.
pub trait SubscriptionEventHandler: Send + Sync {
    /// Derive the profile mutation from the event's `data.object` payload.
    fn mutation(&self, event_id: &str, object: &Value)
    -> Result<ProfileMutation, BillingError>;
}

/// Mapping from event type tag to its handler.
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Box<dyn SubscriptionEventHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the Stripe event types this product processes. Every
    /// other type is irrelevant and gets acknowledged without side effects.
    #[must_use]
    pub fn stripe_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("invoice.payment_succeeded", InvoicePaymentSucceeded);
        registry.register("invoice.payment_failed", InvoicePaymentFailed);
        registry.register("customer.subscription.updated", SubscriptionUpdated);
        registry.register("customer.subscription.deleted", SubscriptionDeleted);
        registry.register("customer.deleted", CustomerDeleted);
        registry
    }

    pub fn register<H>(&mut self, event_type: &'static str, handler: H)
    where
        H: SubscriptionEventHandler + 'static,
    {
        self.handlers.insert(event_type, Box::new(handler));
    }

    #[must_use]
    pub fn get(&self, event_type: &str) -> Option<&dyn SubscriptionEventHandler> {
        self.handlers.get(event_type).map(|handler| handler.as_ref())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::stripe_defaults()
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Extract the customer id from a `customer` field that Stripe sends either
/// as a plain id string or as an expanded object.
fn customer_reference(object: &Value) -> Option<String> {
    match object.get("customer") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Object(customer)) => customer
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn require_customer(
    event_id: &str,
    customer: Option<String>,
) -> Result<String, BillingError> {
    customer.ok_or_else(|| BillingError::MissingCustomerReference {
        event_id: event_id.to_string(),
    })
}

fn epoch_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn period_bound(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value.and_then(Value::as_i64).and_then(epoch_to_datetime)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `invoice.payment_succeeded`: the account moves to the paid tier with the
/// billing period taken from the invoice's subscription line.
struct InvoicePaymentSucceeded;

impl SubscriptionEventHandler for InvoicePaymentSucceeded {
    fn mutation(
        &self,
        event_id: &str,
        object: &Value,
    ) -> Result<ProfileMutation, BillingError> {
        let customer_id = require_customer(event_id, customer_reference(object))?;

        let subscription_id = object
            .pointer("/parent/subscription_details/subscription")
            .and_then(Value::as_str)
            .map(str::to_string);

        let line = subscription_line(object);
        let period_start = period_bound(line.and_then(|l| l.pointer("/period/start")));
        let period_end = period_bound(line.and_then(|l| l.pointer("/period/end")));

        Ok(ProfileMutation {
            stripe_customer_id: customer_id,
            patch: SubscriptionPatch {
                plan_id: Some(PLAN_PRO.to_string()),
                subscription_status: Some(SubscriptionStatus::Active),
                stripe_subscription_id: Some(subscription_id),
                current_period_start: Some(period_start),
                current_period_end: Some(period_end),
                ..Default::default()
            },
        })
    }
}

/// Pick the invoice line whose period describes the subscription: prefer the
/// non-proration subscription item line, then any subscription item line,
/// then the first line.
fn subscription_line(invoice: &Value) -> Option<&Value> {
    let lines = invoice.pointer("/lines/data")?.as_array()?;

    let is_subscription_line =
        |line: &&Value| line.pointer("/parent/type").and_then(Value::as_str)
            == Some("subscription_item_details");

    lines
        .iter()
        .filter(is_subscription_line)
        .find(|line| {
            line.pointer("/parent/subscription_item_details/proration")
                .and_then(Value::as_bool)
                == Some(false)
        })
        .or_else(|| lines.iter().find(is_subscription_line))
        .or_else(|| lines.first())
}

/// `invoice.payment_failed`: the account reverts to the free tier and its
/// billing period is cleared.
struct InvoicePaymentFailed;

impl SubscriptionEventHandler for InvoicePaymentFailed {
    fn mutation(
        &self,
        event_id: &str,
        object: &Value,
    ) -> Result<ProfileMutation, BillingError> {
        let customer_id = require_customer(event_id, customer_reference(object))?;

        Ok(ProfileMutation {
            stripe_customer_id: customer_id,
            patch: downgrade_patch(),
        })
    }
}

/// `customer.subscription.updated`: resync plan, identifiers, period, and
/// status from the subscription object.
struct SubscriptionUpdated;

impl SubscriptionEventHandler for SubscriptionUpdated {
    fn mutation(
        &self,
        event_id: &str,
        object: &Value,
    ) -> Result<ProfileMutation, BillingError> {
        let customer_id = require_customer(event_id, customer_reference(object))?;

        let subscription_id = object
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BillingError::InvalidWebhookPayload {
                message: "subscription object missing id".to_string(),
            })?;

        let item = object.pointer("/items/data/0");
        let period_start = period_bound(item.and_then(|i| i.get("current_period_start")));
        let period_end = period_bound(item.and_then(|i| i.get("current_period_end")));

        let stripe_status = object.get("status").and_then(Value::as_str).unwrap_or("");
        let cancel_scheduled = object
            .get("cancel_at")
            .map(|v| !v.is_null())
            .unwrap_or(false);

        let plan_id = if stripe_status == "active" {
            PLAN_PRO
        } else {
            PLAN_FREE
        };
        let status = if cancel_scheduled {
            SubscriptionStatus::Canceled
        } else {
            SubscriptionStatus::Active
        };

        Ok(ProfileMutation {
            stripe_customer_id: customer_id.clone(),
            patch: SubscriptionPatch {
                plan_id: Some(plan_id.to_string()),
                subscription_status: Some(status),
                stripe_customer_id: Some(Some(customer_id)),
                stripe_subscription_id: Some(Some(subscription_id)),
                current_period_start: Some(period_start),
                current_period_end: Some(period_end),
            },
        })
    }
}

/// `customer.subscription.deleted`: the account reverts to the free tier;
/// provider identifiers are left in place for support lookups.
struct SubscriptionDeleted;

impl SubscriptionEventHandler for SubscriptionDeleted {
    fn mutation(
        &self,
        event_id: &str,
        object: &Value,
    ) -> Result<ProfileMutation, BillingError> {
        let customer_id = require_customer(event_id, customer_reference(object))?;

        Ok(ProfileMutation {
            stripe_customer_id: customer_id,
            patch: downgrade_patch(),
        })
    }
}

/// `customer.deleted`: the account reverts to the free tier and its provider
/// identifiers are cleared — the customer no longer exists upstream.
struct CustomerDeleted;

impl SubscriptionEventHandler for CustomerDeleted {
    fn mutation(
        &self,
        event_id: &str,
        object: &Value,
    ) -> Result<ProfileMutation, BillingError> {
        // The payload object is the customer itself here.
        let customer_id = require_customer(
            event_id,
            object.get("id").and_then(Value::as_str).map(str::to_string),
        )?;

        let mut patch = downgrade_patch();
        patch.stripe_customer_id = Some(None);
        patch.stripe_subscription_id = Some(None);

        Ok(ProfileMutation {
            stripe_customer_id: customer_id,
            patch,
        })
    }
}

/// Target values shared by every downgrade-shaped event.
fn downgrade_patch() -> SubscriptionPatch {
    SubscriptionPatch {
        plan_id: Some(PLAN_FREE.to_string()),
        subscription_status: Some(SubscriptionStatus::None),
        current_period_start: Some(None),
        current_period_end: Some(None),
        ..Default::default()
    }
}
