//! SeaORM-backed storage for profiles and webhook event records.
//!
//! Expected tables: `profiles` (user_id primary key, stripe_customer_id
//! indexed) and `stripe_webhook_events` (event_id primary key). All
//! concurrency control is expressed as discrete statements — uniqueness on
//! insert and conditional updates — never multi-statement transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    sea_query::{Expr, OnConflict},
};

use super::events::{ClaimInsert, EventRecord, EventRecordStore, EventStatus};
use crate::error::{ApiError, Result};
use crate::profiles::{Profile, ProfileStore, SubscriptionPatch, SubscriptionStatus};

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    use sea_orm::entity::prelude::*;

    // -------------------------------------------------------------------------
    // Profile Entity
    // -------------------------------------------------------------------------
    pub mod profile {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "profiles")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            pub email: String,
            pub plan_id: String,
            pub subscription_status: String,
            pub stripe_customer_id: Option<String>,
            pub stripe_subscription_id: Option<String>,
            pub current_period_start: Option<DateTimeUtc>,
            pub current_period_end: Option<DateTimeUtc>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Webhook Event Entity
    // -------------------------------------------------------------------------
    pub mod webhook_event {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "stripe_webhook_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub event_id: String,
            pub event_type: String,
            pub status: String,
            pub processing_started_at: DateTimeUtc,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{profile, webhook_event};

// =============================================================================
// Converters
// =============================================================================

fn model_to_profile(model: profile::Model) -> Profile {
    Profile {
        user_id: model.user_id,
        email: model.email,
        plan_id: model.plan_id,
        subscription_status: SubscriptionStatus::parse(&model.subscription_status),
        stripe_customer_id: model.stripe_customer_id,
        stripe_subscription_id: model.stripe_subscription_id,
        current_period_start: model.current_period_start,
        current_period_end: model.current_period_end,
    }
}

fn model_to_event_record(model: webhook_event::Model) -> Result<EventRecord> {
    let status = EventStatus::parse(&model.status).ok_or_else(|| {
        ApiError::Database(format!(
            "unknown event status '{}' for event '{}'",
            model.status, model.event_id
        ))
    })?;

    Ok(EventRecord {
        event_id: model.event_id,
        event_type: model.event_type,
        status,
        processing_started_at: model.processing_started_at,
    })
}

// =============================================================================
// Store
// =============================================================================

/// SeaORM-backed store implementing both persistence ports.
#[derive(Clone)]
pub struct SeaOrmBillingStore {
    db: DatabaseConnection,
}

impl SeaOrmBillingStore {
    /// Create a new store over an existing connection.
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventRecordStore for SeaOrmBillingStore {
    async fn find(&self, event_id: &str) -> Result<Option<EventRecord>> {
        let model = webhook_event::Entity::find_by_id(event_id)
            .one(&self.db)
            .await?;
        model.map(model_to_event_record).transpose()
    }

    async fn try_insert_processing(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimInsert> {
        let record = webhook_event::ActiveModel {
            event_id: Set(event_id.to_string()),
            event_type: Set(event_type.to_string()),
            status: Set(EventStatus::Processing.as_str().to_string()),
            processing_started_at: Set(now),
        };

        let insert = webhook_event::Entity::insert(record)
            .on_conflict(
                OnConflict::column(webhook_event::Column::EventId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(&self.db)
            .await;

        match insert {
            Ok(_) => Ok(ClaimInsert::Inserted),
            // do_nothing hit the uniqueness constraint: a concurrent
            // delivery claimed the event first.
            Err(sea_orm::DbErr::RecordNotInserted) => Ok(ClaimInsert::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn reclaim(
        &self,
        event_id: &str,
        observed_started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = webhook_event::Entity::update_many()
            .col_expr(
                webhook_event::Column::ProcessingStartedAt,
                Expr::value(now),
            )
            .filter(webhook_event::Column::EventId.eq(event_id))
            .filter(webhook_event::Column::Status.eq(EventStatus::Processing.as_str()))
            .filter(webhook_event::Column::ProcessingStartedAt.eq(observed_started_at))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn mark_processed(&self, event_id: &str) -> Result<()> {
        self.set_status(event_id, EventStatus::Processed).await
    }

    async fn mark_failed(&self, event_id: &str) -> Result<()> {
        self.set_status(event_id, EventStatus::Failed).await
    }
}

impl SeaOrmBillingStore {
    async fn set_status(&self, event_id: &str, status: EventStatus) -> Result<()> {
        let result = webhook_event::Entity::update_many()
            .col_expr(webhook_event::Column::Status, Expr::value(status.as_str()))
            .filter(webhook_event::Column::EventId.eq(event_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            tracing::warn!(
                target: "passclass::billing::store",
                event_id = %event_id,
                status = %status,
                "No event record found while recording terminal status"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for SeaOrmBillingStore {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<Profile>> {
        let model = profile::Entity::find_by_id(user_id).one(&self.db).await?;
        Ok(model.map(model_to_profile))
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> Result<Option<Profile>> {
        let model = profile::Entity::find()
            .filter(profile::Column::StripeCustomerId.eq(customer_id))
            .one(&self.db)
            .await?;
        Ok(model.map(model_to_profile))
    }

    async fn set_stripe_customer_id(&self, user_id: &str, customer_id: &str) -> Result<()> {
        let model = profile::Entity::find_by_id(user_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ApiError::not_found("Profile not found"))?;

        let mut active: profile::ActiveModel = model.into();
        active.stripe_customer_id = Set(Some(customer_id.to_string()));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn apply_subscription_patch(
        &self,
        customer_id: &str,
        patch: &SubscriptionPatch,
    ) -> Result<u64> {
        let mut update = profile::Entity::update_many()
            .filter(profile::Column::StripeCustomerId.eq(customer_id));

        let mut touched = false;
        if let Some(ref plan_id) = patch.plan_id {
            update = update.col_expr(profile::Column::PlanId, Expr::value(plan_id.clone()));
            touched = true;
        }
        if let Some(status) = patch.subscription_status {
            update = update.col_expr(
                profile::Column::SubscriptionStatus,
                Expr::value(status.as_str()),
            );
            touched = true;
        }
        if let Some(ref value) = patch.stripe_customer_id {
            update = update.col_expr(
                profile::Column::StripeCustomerId,
                Expr::value(value.clone()),
            );
            touched = true;
        }
        if let Some(ref value) = patch.stripe_subscription_id {
            update = update.col_expr(
                profile::Column::StripeSubscriptionId,
                Expr::value(value.clone()),
            );
            touched = true;
        }
        if let Some(value) = patch.current_period_start {
            update = update.col_expr(
                profile::Column::CurrentPeriodStart,
                Expr::value(value),
            );
            touched = true;
        }
        if let Some(value) = patch.current_period_end {
            update = update.col_expr(profile::Column::CurrentPeriodEnd, Expr::value(value));
            touched = true;
        }

        if !touched {
            return Ok(0);
        }

        let result = update.exec(&self.db).await?;
        Ok(result.rows_affected)
    }
}
