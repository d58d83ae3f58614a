//! Live Stripe client implementation.
//!
//! Production Stripe client with retry logic, secure API key handling, and
//! error mapping into [`BillingError`].

use crate::error::Result;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use super::client::{
    CheckoutSession, CheckoutSessionRequest, CreateCustomerRequest, PortalSession,
    PortalSessionRequest, StripeCheckoutClient, StripeCustomerClient, StripePortalClient,
};
use super::error::BillingError;
use async_trait::async_trait;

/// Metadata key for the local user id on provider-side records.
const META_USER_ID: &str = "user_id";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the live Stripe client.
#[derive(Debug, Clone)]
pub struct LiveStripeClientConfig {
    /// Maximum number of retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveStripeClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_seconds: 30,
        }
    }
}

// ============================================================================
// API Key Validation
// ============================================================================

/// Error returned when API key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidApiKeyError {
    /// Description of why the key is invalid.
    pub reason: String,
}

impl std::fmt::Display for InvalidApiKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid Stripe API key: {}", self.reason)
    }
}

impl std::error::Error for InvalidApiKeyError {}

/// Validate a Stripe secret key format (`sk_test_`, `sk_live_`, `rk_test_`,
/// `rk_live_`).
fn validate_api_key(key: &str) -> std::result::Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidApiKeyError {
            reason: "API key cannot be empty".to_string(),
        });
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_"
                .to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Live Stripe Client
// ============================================================================

/// Live Stripe client for production use.
///
/// Implements the gateway traits with:
/// - Secure API key handling using `SecretString`
/// - Retry logic with exponential backoff for transient failures
/// - Idempotency key support for mutating operations
/// - Error mapping to [`BillingError`] types
#[derive(Clone)]
pub struct LiveStripeClient {
    client: stripe::Client,
    config: LiveStripeClientConfig,
    api_key: SecretString,
}

impl LiveStripeClient {
    /// Create a new live Stripe client.
    ///
    /// The API key is validated and stored securely, and won't be exposed in
    /// debug output.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn new(
        api_key: impl Into<SecretString>,
        config: LiveStripeClientConfig,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        let api_key: SecretString = api_key.into();

        validate_api_key(api_key.expose_secret())?;

        let client = stripe::Client::new(api_key.expose_secret()).with_app_info(
            "passclass-api".to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// Create a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn with_default_config(
        api_key: impl Into<SecretString>,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        Self::new(api_key, LiveStripeClientConfig::default())
    }

    /// Check if the client is using a test mode API key.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    /// Get a client configured with an idempotency key for mutating
    /// operations.
    #[inline]
    fn idempotent_client(&self, operation: &str) -> stripe::Client {
        let key = format!("{}_{}", operation, uuid::Uuid::new_v4());
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key))
    }
}

// Debug implementation that doesn't expose the API key
impl std::fmt::Debug for LiveStripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStripeClient")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Retry Logic
// ============================================================================

/// Execute an async operation with retry logic and timeout.
///
/// Retries on HTTP 429, HTTP 5xx, and timeouts.
async fn with_retry<T, F, Fut>(
    config: &LiveStripeClientConfig,
    operation: &str,
    operation_fn: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, stripe::StripeError>>,
{
    let timeout_duration = Duration::from_secs(config.timeout_seconds);
    let mut attempts = 0;

    loop {
        let result = tokio::time::timeout(timeout_duration, operation_fn()).await;

        match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                if !is_retryable_error(&e) || attempts >= config.max_retries {
                    return Err(map_stripe_error(e, operation).into());
                }

                let delay =
                    calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
                tracing::warn!(
                    target: "passclass::billing::stripe",
                    operation = operation,
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying Stripe API call after transient error"
                );
                tokio::time::sleep(delay).await;
                attempts += 1;
            }
            Err(_timeout) => {
                if attempts >= config.max_retries {
                    return Err(BillingError::StripeApiError {
                        operation: operation.to_string(),
                        message: format!(
                            "Request timed out after {} seconds",
                            config.timeout_seconds
                        ),
                        code: None,
                        http_status: Some(408),
                    }
                    .into());
                }

                let delay =
                    calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
                tracing::warn!(
                    target: "passclass::billing::stripe",
                    operation = operation,
                    attempt = attempts + 1,
                    timeout_seconds = config.timeout_seconds,
                    "Stripe API request timed out, retrying"
                );
                tokio::time::sleep(delay).await;
                attempts += 1;
            }
        }
    }
}

/// Check if an error is retryable.
#[inline]
fn is_retryable_error(error: &stripe::StripeError) -> bool {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            status == 429 || (500..600).contains(&status)
        }
        stripe::StripeError::Timeout => true,
        _ => false,
    }
}

/// Calculate backoff delay with exponential backoff and jitter.
#[inline]
fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    // 0-25% jitter so concurrent retries don't stampede.
    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

// ============================================================================
// Error Mapping
// ============================================================================

/// Map Stripe errors to [`BillingError`] types.
fn map_stripe_error(error: stripe::StripeError, operation: &str) -> BillingError {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let http_status = request_error.http_status;
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            let code = request_error.code.as_ref().map(|c| format!("{c:?}"));

            BillingError::StripeApiError {
                operation: operation.to_string(),
                message,
                code,
                http_status: Some(http_status),
            }
        }
        stripe::StripeError::Timeout => BillingError::StripeApiError {
            operation: operation.to_string(),
            message: "Request timed out".to_string(),
            code: None,
            http_status: Some(408),
        },
        other => BillingError::Internal {
            message: format!("Stripe client error during {}: {}", operation, other),
        },
    }
}

fn parse_customer_id(id: &str) -> Result<stripe::CustomerId> {
    id.parse()
        .map_err(|_| crate::error::ApiError::bad_request(format!("Invalid customer ID: {}", id)))
}

// ============================================================================
// Gateway trait implementations
// ============================================================================

#[async_trait]
impl StripeCustomerClient for LiveStripeClient {
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<String> {
        let client = self.idempotent_client("create_customer");

        let mut params = stripe::CreateCustomer::new();
        params.email = Some(&request.email);

        let mut meta = std::collections::HashMap::new();
        meta.insert(META_USER_ID.to_string(), request.user_id.clone());
        params.metadata = Some(meta);

        let customer = with_retry(&self.config, "create_customer", || {
            let client = client.clone();
            let params = params.clone();
            async move { stripe::Customer::create(&client, params).await }
        })
        .await?;

        Ok(customer.id.to_string())
    }

    async fn delete_customer(&self, customer_id: &str) -> Result<()> {
        let customer_id = parse_customer_id(customer_id)?;

        with_retry(&self.config, "delete_customer", || {
            let client = self.client.clone();
            let customer_id = customer_id.clone();
            async move { stripe::Customer::delete(&client, &customer_id).await }
        })
        .await?;

        Ok(())
    }
}

#[async_trait]
impl StripeCheckoutClient for LiveStripeClient {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSession> {
        let client = self.idempotent_client("create_checkout_session");
        let customer_id = parse_customer_id(&request.customer_id)?;

        let mut params = stripe::CreateCheckoutSession::new();
        params.customer = Some(customer_id);
        params.mode = Some(stripe::CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);

        let mut meta = std::collections::HashMap::new();
        meta.insert(META_USER_ID.to_string(), request.user_id.clone());
        params.metadata = Some(meta);

        let session = with_retry(&self.config, "create_checkout_session", || {
            let client = client.clone();
            let params = params.clone();
            async move { stripe::CheckoutSession::create(&client, params).await }
        })
        .await?;

        Ok(CheckoutSession {
            id: session.id.to_string(),
            url: session.url.ok_or_else(|| {
                crate::error::ApiError::internal("Checkout session URL missing")
            })?,
        })
    }
}

#[async_trait]
impl StripePortalClient for LiveStripeClient {
    async fn create_portal_session(
        &self,
        request: PortalSessionRequest,
    ) -> Result<PortalSession> {
        let customer_id = parse_customer_id(&request.customer_id)?;

        let mut params = stripe::CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(&request.return_url);

        let session = with_retry(&self.config, "create_portal_session", || {
            let client = self.client.clone();
            let params = params.clone();
            async move { stripe::BillingPortalSession::create(&client, params).await }
        })
        .await?;

        Ok(PortalSession {
            id: session.id.to_string(),
            url: session.url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_api_key() {
        assert!(validate_api_key("sk_test_abcdefghijklmnop").is_ok());
        assert!(validate_api_key("rk_live_abcdefghijklmnop").is_ok());

        assert!(validate_api_key("").is_err());
        assert!(validate_api_key("sk_test_x").is_err());
        assert!(validate_api_key("pk_test_abcdefghijklmnop").is_err());
    }

    #[test]
    fn test_client_rejects_bad_key() {
        let result =
            LiveStripeClient::with_default_config("not_a_key_but_long_enough_anyway");
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_hides_api_key() {
        let client =
            LiveStripeClient::with_default_config("sk_test_abcdefghijklmnop").unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("sk_test_abcdefghijklmnop"));
        assert!(debug.contains("is_test_mode"));
    }

    #[test]
    fn test_backoff_is_bounded() {
        for attempt in 0..12 {
            let delay = calculate_backoff_delay(attempt, 500, 30_000);
            // max delay plus max jitter
            assert!(delay <= Duration::from_millis(30_000 + 7_500));
        }
        assert!(calculate_backoff_delay(0, 500, 30_000) >= Duration::from_millis(500));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable_error(&stripe::StripeError::Timeout));
        assert!(!is_retryable_error(&stripe::StripeError::ClientError(
            "bad request".to_string()
        )));
    }
}
