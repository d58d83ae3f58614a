//! Webhook event records and the idempotency claim store.
//!
//! One record exists per provider event id. Records move through
//! `processing` → `processed`/`failed`; a stale `processing` claim may be
//! reclaimed by a later delivery. Exclusion is expressed entirely through
//! the uniqueness of `event_id` and conditional updates, never in-process
//! locks.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Processing status of a webhook event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// A worker has claimed the event and its mutation is in flight.
    Processing,
    /// The mutation was committed; terminal.
    Processed,
    /// The mutation errored; terminal until an operator intervenes.
    Failed,
}

impl EventStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    /// Parse from the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row per externally-generated event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Provider-assigned event id; globally unique.
    pub event_id: String,
    /// Event classification tag, kept for diagnostics only.
    pub event_type: String,
    pub status: EventStatus,
    /// When the current claim was taken.
    pub processing_started_at: DateTime<Utc>,
}

/// Outcome of attempting to insert a fresh `processing` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimInsert {
    /// The claim row was inserted; the caller owns the event.
    Inserted,
    /// A concurrent delivery inserted first; re-fetch and decide again.
    Conflict,
}

/// Trait for persisting webhook event records.
///
/// Backing storage must provide point lookup by `event_id`, insert with
/// uniqueness-conflict detection, and conditional update. An in-memory
/// implementation is provided for development/testing.
#[async_trait]
pub trait EventRecordStore: Send + Sync {
    /// Look up the record for an event id.
    async fn find(&self, event_id: &str) -> Result<Option<EventRecord>>;

    /// Insert a fresh `processing` claim. Reports a uniqueness conflict
    /// instead of failing when another delivery raced ahead.
    async fn try_insert_processing(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimInsert>;

    /// Take over a stale `processing` claim by resetting its start time.
    ///
    /// The update is conditional on the record still being `processing` with
    /// the start time the caller observed, so two racing reclaimers cannot
    /// both win. Returns whether the reclaim succeeded.
    async fn reclaim(
        &self,
        event_id: &str,
        observed_started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Mark the event's mutation as committed.
    async fn mark_processed(&self, event_id: &str) -> Result<()>;

    /// Mark the event's mutation as errored.
    async fn mark_failed(&self, event_id: &str) -> Result<()>;
}

/// In-memory event record store (for development/testing).
///
/// In production, use the database-backed store so claims survive restarts.
#[derive(Default, Clone)]
pub struct InMemoryEventRecordStore {
    records: Arc<RwLock<HashMap<String, EventRecord>>>,
}

impl InMemoryEventRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly (for testing claim states).
    pub async fn seed(&self, record: EventRecord) {
        let mut records = self.records.write().await;
        records.insert(record.event_id.clone(), record);
    }

    /// Snapshot of all records (for testing).
    pub async fn records(&self) -> Vec<EventRecord> {
        let records = self.records.read().await;
        records.values().cloned().collect()
    }
}

#[async_trait]
impl EventRecordStore for InMemoryEventRecordStore {
    async fn find(&self, event_id: &str) -> Result<Option<EventRecord>> {
        let records = self.records.read().await;
        Ok(records.get(event_id).cloned())
    }

    async fn try_insert_processing(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimInsert> {
        let mut records = self.records.write().await;
        match records.entry(event_id.to_string()) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(ClaimInsert::Conflict),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(EventRecord {
                    event_id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    status: EventStatus::Processing,
                    processing_started_at: now,
                });
                Ok(ClaimInsert::Inserted)
            }
        }
    }

    async fn reclaim(
        &self,
        event_id: &str,
        observed_started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(event_id) {
            Some(record)
                if record.status == EventStatus::Processing
                    && record.processing_started_at == observed_started_at =>
            {
                record.processing_started_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_processed(&self, event_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(event_id) {
            record.status = EventStatus::Processed;
        }
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(event_id) {
            record.status = EventStatus::Failed;
        }
        Ok(())
    }
}
