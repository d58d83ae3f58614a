//! Stripe webhook reconciliation.
//!
//! Verifies event signatures, claims each event exactly once through the
//! event-record table, applies the event's profile mutation, and records the
//! terminal status so provider retries become no-ops.
//!
//! Claims are leases: a `processing` record older than
//! [`STALE_CLAIM_THRESHOLD`] is assumed to belong to a crashed worker and may
//! be reclaimed by a later delivery. That re-application is safe because
//! every handler produces absolute target values, never deltas.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::error::BillingError;
use super::events::{ClaimInsert, EventRecord, EventRecordStore, EventStatus};
use super::handlers::HandlerRegistry;
use crate::error::Result;
use crate::profiles::ProfileStore;

/// How long a `processing` claim is trusted before another delivery may take
/// it over.
pub const STALE_CLAIM_THRESHOLD: Duration = Duration::minutes(3);

/// Maximum accepted age of a webhook signature timestamp.
const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

/// Webhook reconciler for Stripe events.
///
/// Handles signature verification, idempotent claiming, and event
/// application. The webhook secret is stored using [`SecretString`] to
/// prevent accidental exposure in logs or debug output.
pub struct WebhookReconciler {
    events: Arc<dyn EventRecordStore>,
    profiles: Arc<dyn ProfileStore>,
    handlers: HandlerRegistry,
    webhook_secret: SecretString,
}

impl WebhookReconciler {
    /// Create a new reconciler over the given stores.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventRecordStore>,
        profiles: Arc<dyn ProfileStore>,
        handlers: HandlerRegistry,
        webhook_secret: impl Into<SecretString>,
    ) -> Self {
        Self {
            events,
            profiles,
            handlers,
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Verify the webhook signature and parse the event.
    ///
    /// # Arguments
    /// * `payload` - The raw request body
    /// * `signature` - The `Stripe-Signature` header value
    ///
    /// # Errors
    /// Returns an error if the signature is missing pieces, stale, or does
    /// not match, or if the payload is not a well-formed event. Nothing is
    /// written in any of those cases.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        let sig_parts = parse_signature_header(signature)?;

        let now = Utc::now().timestamp();
        let age = (now - sig_parts.timestamp).abs();
        if age > SIGNATURE_TOLERANCE_SECONDS {
            return Err(BillingError::WebhookTimestampExpired { age_seconds: age }.into());
        }

        let signed_payload = format!(
            "{}.{}",
            sig_parts.timestamp,
            String::from_utf8_lossy(payload)
        );
        let expected = compute_signature(
            self.webhook_secret.expose_secret(),
            signed_payload.as_bytes(),
        )?;

        let expected_bytes = hex::decode(&expected)
            .map_err(|_| BillingError::Internal {
                message: "hex encoding of computed signature".to_string(),
            })?;
        let provided_bytes = hex::decode(&sig_parts.signature)
            .map_err(|_| BillingError::InvalidWebhookSignature)?;

        if expected_bytes.ct_eq(&provided_bytes).unwrap_u8() != 1 {
            return Err(BillingError::InvalidWebhookSignature.into());
        }

        let event: WebhookEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "passclass::billing::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            BillingError::InvalidWebhookPayload {
                message: "malformed JSON payload".to_string(),
            }
        })?;

        Ok(event)
    }

    /// Process a verified webhook event.
    ///
    /// Irrelevant event types are acknowledged with zero writes. For relevant
    /// types the event is claimed through the record table, its mutation is
    /// applied to the matching profile, and the record is finalized.
    ///
    /// # Errors
    /// Returns an error when the mutation or the record bookkeeping fails;
    /// the caller should answer with a server error so the provider retries.
    pub async fn process(&self, event: WebhookEvent) -> Result<WebhookOutcome> {
        let Some(handler) = self.handlers.get(&event.event_type) else {
            tracing::debug!(
                target: "passclass::billing::webhook",
                event_id = %event.id,
                event_type = %event.event_type,
                "Ignoring irrelevant event type"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let now = Utc::now();
        match self.claim(&event, now).await? {
            ClaimDecision::AlreadyProcessed => {
                tracing::debug!(
                    target: "passclass::billing::webhook",
                    event_id = %event.id,
                    "Event already processed, acknowledging"
                );
                return Ok(WebhookOutcome::AlreadyProcessed);
            }
            ClaimDecision::InFlight => {
                tracing::debug!(
                    target: "passclass::billing::webhook",
                    event_id = %event.id,
                    "Event claimed by another worker, acknowledging"
                );
                return Ok(WebhookOutcome::InFlight);
            }
            ClaimDecision::FailedEarlier => {
                tracing::warn!(
                    target: "passclass::billing::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Event previously failed; not retried without operator intervention"
                );
                return Ok(WebhookOutcome::FailedEarlier);
            }
            ClaimDecision::Claimed => {}
        }

        // The claim is ours: derive and apply the mutation, then finalize.
        let mutation = match handler.mutation(&event.id, &event.data.object) {
            Ok(mutation) => mutation,
            Err(e) => {
                self.events.mark_failed(&event.id).await?;
                return Err(e.into());
            }
        };

        match self
            .profiles
            .apply_subscription_patch(&mutation.stripe_customer_id, &mutation.patch)
            .await
        {
            Ok(rows) => {
                if rows == 0 {
                    tracing::warn!(
                        target: "passclass::billing::webhook",
                        event_id = %event.id,
                        customer_id = %mutation.stripe_customer_id,
                        "No profile matched the event's customer id"
                    );
                }
                self.events.mark_processed(&event.id).await?;
                tracing::info!(
                    target: "passclass::billing::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook processed"
                );
                Ok(WebhookOutcome::Processed)
            }
            Err(e) => {
                if let Err(bookkeeping) = self.events.mark_failed(&event.id).await {
                    tracing::error!(
                        target: "passclass::billing::webhook",
                        event_id = %event.id,
                        error = %bookkeeping,
                        "Failed to record terminal status after mutation error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Establish exclusivity for this event.
    async fn claim(&self, event: &WebhookEvent, now: DateTime<Utc>) -> Result<ClaimDecision> {
        match self.events.find(&event.id).await? {
            None => {
                match self
                    .events
                    .try_insert_processing(&event.id, &event.event_type, now)
                    .await?
                {
                    ClaimInsert::Inserted => Ok(ClaimDecision::Claimed),
                    ClaimInsert::Conflict => {
                        // A concurrent delivery raced ahead; re-fetch and
                        // decide from the record it left behind.
                        let record = self.events.find(&event.id).await?.ok_or_else(|| {
                            BillingError::Internal {
                                message: format!(
                                    "event '{}' vanished between insert conflict and re-fetch",
                                    event.id
                                ),
                            }
                        })?;
                        self.decide_existing(record, now).await
                    }
                }
            }
            Some(record) => self.decide_existing(record, now).await,
        }
    }

    async fn decide_existing(
        &self,
        record: EventRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimDecision> {
        match record.status {
            EventStatus::Processed => Ok(ClaimDecision::AlreadyProcessed),
            EventStatus::Failed => Ok(ClaimDecision::FailedEarlier),
            EventStatus::Processing => {
                let age = now - record.processing_started_at;
                if age < STALE_CLAIM_THRESHOLD {
                    return Ok(ClaimDecision::InFlight);
                }
                // The earlier worker most likely died mid-mutation. Take the
                // claim over; losing the conditional update means someone
                // else already did.
                if self
                    .events
                    .reclaim(&record.event_id, record.processing_started_at, now)
                    .await?
                {
                    tracing::info!(
                        target: "passclass::billing::webhook",
                        event_id = %record.event_id,
                        stale_for_seconds = age.num_seconds(),
                        "Reclaimed stale processing record"
                    );
                    Ok(ClaimDecision::Claimed)
                } else {
                    Ok(ClaimDecision::InFlight)
                }
            }
        }
    }
}

/// What the claim step decided about this delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimDecision {
    Claimed,
    AlreadyProcessed,
    InFlight,
    FailedEarlier,
}

/// Parsed webhook event.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEvent {
    /// Event ID.
    pub id: String,
    /// Event type (e.g., "invoice.payment_succeeded").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: WebhookEventData,
    /// Timestamp when the event was created.
    pub created: u64,
}

/// Webhook event data.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
}

/// Outcome of webhook processing. Every variant is acknowledged with a 2xx;
/// errors surface separately so the provider retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event was claimed and its mutation applied.
    Processed,
    /// Event type is not relevant; nothing written.
    Ignored,
    /// Event was already fully applied (provider retry).
    AlreadyProcessed,
    /// Another worker holds a fresh claim on this event.
    InFlight,
    /// Event failed earlier and stays failed until an operator steps in.
    FailedEarlier,
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: i64,
    signature: String,
}

/// Parse the Stripe-Signature header (`t=<unix>,v1=<hex>`).
fn parse_signature_header(header: &str) -> std::result::Result<SignatureParts, BillingError> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return Err(BillingError::InvalidWebhookSignature);
        };

        match key.trim() {
            "t" => timestamp = value.parse().ok(),
            "v1" => signature = Some(value.to_string()),
            _ => {} // Ignore other schemes
        }
    }

    Ok(SignatureParts {
        timestamp: timestamp.ok_or(BillingError::InvalidWebhookSignature)?,
        signature: signature.ok_or(BillingError::InvalidWebhookSignature)?,
    })
}

/// Compute the hex HMAC-SHA256 signature of a payload.
fn compute_signature(
    secret: &str,
    payload: &[u8],
) -> std::result::Result<String, BillingError> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        BillingError::Internal {
            message: "HMAC key setup".to_string(),
        }
    })?;

    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::events::InMemoryEventRecordStore;
    use crate::profiles::{InMemoryProfileStore, Profile, SubscriptionStatus};

    fn test_reconciler(
        events: InMemoryEventRecordStore,
        profiles: InMemoryProfileStore,
    ) -> WebhookReconciler {
        WebhookReconciler::new(
            Arc::new(events),
            Arc::new(profiles),
            HandlerRegistry::stripe_defaults(),
            "whsec_test_secret",
        )
    }

    fn signed_header(secret: &str, payload: &[u8], timestamp: i64) -> String {
        let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
        let sig = compute_signature(secret, signed_payload.as_bytes()).unwrap();
        format!("t={},v1={}", timestamp, sig)
    }

    fn deleted_customer_event(event_id: &str) -> WebhookEvent {
        WebhookEvent {
            id: event_id.to_string(),
            event_type: "customer.deleted".to_string(),
            data: WebhookEventData {
                object: serde_json::json!({"id": "cus_1"}),
            },
            created: 1735689600,
        }
    }

    #[test]
    fn test_parse_signature_header() {
        let parts = parse_signature_header("t=1234567890,v1=abc123def456").unwrap();
        assert_eq!(parts.timestamp, 1234567890);
        assert_eq!(parts.signature, "abc123def456");
    }

    #[test]
    fn test_parse_signature_header_invalid() {
        assert!(parse_signature_header("garbage").is_err());
        assert!(parse_signature_header("t=123").is_err());
        assert!(parse_signature_header("v1=abc").is_err());
    }

    #[test]
    fn test_verify_signature_valid() {
        let reconciler =
            test_reconciler(InMemoryEventRecordStore::new(), InMemoryProfileStore::new());

        let payload =
            br#"{"id":"evt_1","type":"customer.deleted","data":{"object":{}},"created":1}"#;
        let header = signed_header("whsec_test_secret", payload, Utc::now().timestamp());

        let event = reconciler.verify_signature(payload, &header).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "customer.deleted");
    }

    #[test]
    fn test_verify_signature_wrong_secret() {
        let reconciler =
            test_reconciler(InMemoryEventRecordStore::new(), InMemoryProfileStore::new());

        let payload =
            br#"{"id":"evt_1","type":"customer.deleted","data":{"object":{}},"created":1}"#;
        let header = signed_header("whsec_other_secret", payload, Utc::now().timestamp());

        assert!(reconciler.verify_signature(payload, &header).is_err());
    }

    #[test]
    fn test_verify_signature_tampered_payload() {
        let reconciler =
            test_reconciler(InMemoryEventRecordStore::new(), InMemoryProfileStore::new());

        let payload =
            br#"{"id":"evt_1","type":"customer.deleted","data":{"object":{}},"created":1}"#;
        let header = signed_header("whsec_test_secret", payload, Utc::now().timestamp());

        let tampered =
            br#"{"id":"evt_2","type":"customer.deleted","data":{"object":{}},"created":1}"#;
        assert!(reconciler.verify_signature(tampered, &header).is_err());
    }

    #[test]
    fn test_verify_signature_old_timestamp() {
        let reconciler =
            test_reconciler(InMemoryEventRecordStore::new(), InMemoryProfileStore::new());

        let payload =
            br#"{"id":"evt_1","type":"customer.deleted","data":{"object":{}},"created":1}"#;
        let old = Utc::now().timestamp() - 600;
        let header = signed_header("whsec_test_secret", payload, old);

        assert!(reconciler.verify_signature(payload, &header).is_err());
    }

    #[tokio::test]
    async fn test_process_applies_once_then_acknowledges() {
        let events = InMemoryEventRecordStore::new();
        let profiles = InMemoryProfileStore::new();
        let mut profile = Profile::new("user_1", "u@example.com");
        profile.stripe_customer_id = Some("cus_1".to_string());
        profiles.seed(profile).await;

        let reconciler = test_reconciler(events.clone(), profiles.clone());

        let outcome = reconciler
            .process(deleted_customer_event("evt_1"))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(profiles.write_count(), 1);
        assert_eq!(
            events.find("evt_1").await.unwrap().unwrap().status,
            EventStatus::Processed
        );

        let outcome = reconciler
            .process(deleted_customer_event("evt_1"))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::AlreadyProcessed);
        assert_eq!(profiles.write_count(), 1);
    }

    #[tokio::test]
    async fn test_process_ignores_unknown_types_without_writes() {
        let events = InMemoryEventRecordStore::new();
        let profiles = InMemoryProfileStore::new();
        let reconciler = test_reconciler(events.clone(), profiles.clone());

        let event = WebhookEvent {
            id: "evt_unknown".to_string(),
            event_type: "charge.refunded".to_string(),
            data: WebhookEventData {
                object: serde_json::json!({}),
            },
            created: 1735689600,
        };

        let outcome = reconciler.process(event).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert!(events.records().await.is_empty());
        assert_eq!(profiles.write_count(), 0);
    }

    #[tokio::test]
    async fn test_process_fresh_claim_is_not_reprocessed() {
        let events = InMemoryEventRecordStore::new();
        let profiles = InMemoryProfileStore::new();
        events
            .seed(EventRecord {
                event_id: "evt_1".to_string(),
                event_type: "customer.deleted".to_string(),
                status: EventStatus::Processing,
                processing_started_at: Utc::now(),
            })
            .await;

        let reconciler = test_reconciler(events, profiles.clone());
        let outcome = reconciler
            .process(deleted_customer_event("evt_1"))
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::InFlight);
        assert_eq!(profiles.write_count(), 0);
    }

    #[tokio::test]
    async fn test_process_reclaims_stale_claim() {
        let events = InMemoryEventRecordStore::new();
        let profiles = InMemoryProfileStore::new();
        let mut profile = Profile::new("user_1", "u@example.com");
        profile.stripe_customer_id = Some("cus_1".to_string());
        profiles.seed(profile).await;

        events
            .seed(EventRecord {
                event_id: "evt_1".to_string(),
                event_type: "customer.deleted".to_string(),
                status: EventStatus::Processing,
                processing_started_at: Utc::now() - Duration::minutes(10),
            })
            .await;

        let reconciler = test_reconciler(events.clone(), profiles.clone());
        let outcome = reconciler
            .process(deleted_customer_event("evt_1"))
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(profiles.write_count(), 1);
        assert_eq!(
            events.find("evt_1").await.unwrap().unwrap().status,
            EventStatus::Processed
        );
    }

    #[tokio::test]
    async fn test_process_failed_event_stays_failed() {
        let events = InMemoryEventRecordStore::new();
        let profiles = InMemoryProfileStore::new();
        events
            .seed(EventRecord {
                event_id: "evt_1".to_string(),
                event_type: "customer.deleted".to_string(),
                status: EventStatus::Failed,
                processing_started_at: Utc::now() - Duration::minutes(30),
            })
            .await;

        let reconciler = test_reconciler(events.clone(), profiles.clone());
        let outcome = reconciler
            .process(deleted_customer_event("evt_1"))
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::FailedEarlier);
        assert_eq!(profiles.write_count(), 0);
        assert_eq!(
            events.find("evt_1").await.unwrap().unwrap().status,
            EventStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_process_malformed_payload_marks_failed() {
        let events = InMemoryEventRecordStore::new();
        let profiles = InMemoryProfileStore::new();
        let reconciler = test_reconciler(events.clone(), profiles.clone());

        // customer.deleted without an id cannot be matched to a profile.
        let event = WebhookEvent {
            id: "evt_bad".to_string(),
            event_type: "customer.deleted".to_string(),
            data: WebhookEventData {
                object: serde_json::json!({}),
            },
            created: 1735689600,
        };

        assert!(reconciler.process(event).await.is_err());
        assert_eq!(
            events.find("evt_bad").await.unwrap().unwrap().status,
            EventStatus::Failed
        );
        assert_eq!(profiles.write_count(), 0);
    }

    #[tokio::test]
    async fn test_process_applies_subscription_update() {
        let events = InMemoryEventRecordStore::new();
        let profiles = InMemoryProfileStore::new();
        let mut profile = Profile::new("user_1", "u@example.com");
        profile.stripe_customer_id = Some("cus_1".to_string());
        profiles.seed(profile).await;

        let reconciler = test_reconciler(events, profiles.clone());

        let event = WebhookEvent {
            id: "evt_sub".to_string(),
            event_type: "customer.subscription.updated".to_string(),
            data: WebhookEventData {
                object: serde_json::json!({
                    "id": "sub_1",
                    "customer": "cus_1",
                    "status": "active",
                    "items": {"data": [
                        {"current_period_start": 1735689600, "current_period_end": 1738368000}
                    ]}
                }),
            },
            created: 1735689600,
        };

        let outcome = reconciler.process(event).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let profile = profiles.find_by_customer_id("cus_1").await.unwrap().unwrap();
        assert!(profile.is_pro());
        assert_eq!(profile.subscription_status, SubscriptionStatus::Active);
        assert_eq!(profile.stripe_subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(
            profile.current_period_start.unwrap().timestamp(),
            1735689600
        );
    }
}
