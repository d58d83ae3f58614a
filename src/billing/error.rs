//! Billing-specific error types.
//!
//! Granular errors for webhook verification, event application, and Stripe
//! API calls. Converted to `ApiError` at the HTTP boundary.

use std::fmt;

/// Billing-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Webhook errors
    /// Webhook signature is missing pieces or does not match the payload.
    InvalidWebhookSignature,
    /// Webhook timestamp is too old (replay protection).
    WebhookTimestampExpired { age_seconds: i64 },
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },
    /// The event payload carries no customer reference to match a profile by.
    MissingCustomerReference { event_id: String },

    // Checkout/portal errors
    /// The account already holds the plan it tried to buy.
    AlreadyOnPlan { plan_id: String },
    /// No Stripe customer on file for this account.
    NoCustomer { user_id: String },

    // Stripe API errors
    /// Stripe API returned an error.
    StripeApiError {
        operation: String,
        message: String,
        code: Option<String>,
        http_status: Option<u16>,
    },

    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidWebhookSignature => {
                write!(f, "Invalid webhook signature")
            }
            Self::WebhookTimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::MissingCustomerReference { event_id } => {
                write!(f, "Event '{}' carries no customer reference", event_id)
            }
            Self::AlreadyOnPlan { plan_id } => {
                write!(f, "Account already holds the '{}' plan", plan_id)
            }
            Self::NoCustomer { user_id } => {
                write!(f, "No Stripe customer on file for '{}'", user_id)
            }
            Self::StripeApiError {
                operation,
                message,
                code,
                http_status,
            } => {
                write!(f, "Stripe API error during {}: {}", operation, message)?;
                if let Some(code) = code {
                    write!(f, " (code: {})", code)?;
                }
                if let Some(status) = http_status {
                    write!(f, " (HTTP {})", status)?;
                }
                Ok(())
            }
            Self::Internal { message } => {
                write!(f, "Internal billing error: {}", message)
            }
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for crate::error::ApiError {
    fn from(err: BillingError) -> Self {
        use crate::error::ApiError;
        match &err {
            BillingError::InvalidWebhookSignature
            | BillingError::WebhookTimestampExpired { .. }
            | BillingError::InvalidWebhookPayload { .. } => ApiError::BadRequest(err.to_string()),
            BillingError::MissingCustomerReference { .. } => ApiError::Internal(err.to_string()),
            BillingError::AlreadyOnPlan { .. } => ApiError::Conflict(err.to_string()),
            BillingError::NoCustomer { .. } => ApiError::BadRequest(err.to_string()),
            BillingError::StripeApiError { http_status, .. } => {
                if matches!(http_status, Some(s) if (500..600).contains(s)) {
                    ApiError::ServiceUnavailable(err.to_string())
                } else {
                    ApiError::Internal(err.to_string())
                }
            }
            BillingError::Internal { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;

    #[test]
    fn test_display() {
        let err = BillingError::WebhookTimestampExpired { age_seconds: 600 };
        assert_eq!(err.to_string(), "Webhook timestamp expired (600 seconds old)");

        let err = BillingError::StripeApiError {
            operation: "create_customer".to_string(),
            message: "rate limited".to_string(),
            code: Some("rate_limit".to_string()),
            http_status: Some(429),
        };
        assert_eq!(
            err.to_string(),
            "Stripe API error during create_customer: rate limited (code: rate_limit) (HTTP 429)"
        );
    }

    #[test]
    fn test_http_mapping() {
        let err: ApiError = BillingError::InvalidWebhookSignature.into();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err: ApiError = BillingError::AlreadyOnPlan {
            plan_id: "pro".to_string(),
        }
        .into();
        assert!(matches!(err, ApiError::Conflict(_)));

        let err: ApiError = BillingError::StripeApiError {
            operation: "create_checkout_session".to_string(),
            message: "upstream down".to_string(),
            code: None,
            http_status: Some(503),
        }
        .into();
        assert!(matches!(err, ApiError::ServiceUnavailable(_)));
    }
}
