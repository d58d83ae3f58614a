//! HTTP boundary tests for the billing routes.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use passclass_api::billing::{
    CheckoutSession, CheckoutSessionRequest, CreateCustomerRequest, InMemoryEventRecordStore,
    PortalSession, PortalSessionRequest, StripeCheckoutClient, StripeCustomerClient,
    StripePortalClient,
};
use passclass_api::profiles::{InMemoryProfileStore, Profile, ProfileStore};
use passclass_api::{ConfigBuilder, app, auth::Claims};
use sha2::Sha256;
use std::sync::Arc;
use tower::ServiceExt;

const WEBHOOK_SECRET: &str = "whsec_test_secret";
const JWT_SECRET: &str = "super-secret-signing-key";

/// Stripe gateway fake for route-level tests.
struct FakeGateway;

#[async_trait]
impl StripeCustomerClient for FakeGateway {
    async fn create_customer(
        &self,
        _request: CreateCustomerRequest,
    ) -> passclass_api::Result<String> {
        Ok("cus_fake_1".to_string())
    }

    async fn delete_customer(&self, _customer_id: &str) -> passclass_api::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl StripeCheckoutClient for FakeGateway {
    async fn create_checkout_session(
        &self,
        _request: CheckoutSessionRequest,
    ) -> passclass_api::Result<CheckoutSession> {
        Ok(CheckoutSession {
            id: "cs_fake_1".to_string(),
            url: "https://checkout.stripe.com/c/pay/cs_fake_1".to_string(),
        })
    }
}

#[async_trait]
impl StripePortalClient for FakeGateway {
    async fn create_portal_session(
        &self,
        _request: PortalSessionRequest,
    ) -> passclass_api::Result<PortalSession> {
        Ok(PortalSession {
            id: "bps_fake_1".to_string(),
            url: "https://billing.stripe.com/session/bps_fake_1".to_string(),
        })
    }
}

struct TestApp {
    router: Router,
    events: InMemoryEventRecordStore,
    profiles: InMemoryProfileStore,
}

fn test_app() -> TestApp {
    let config = ConfigBuilder::new()
        .with_jwt_secret(JWT_SECRET)
        .with_stripe_secret_key("sk_test_abcdefghijklmnop")
        .with_stripe_webhook_secret(WEBHOOK_SECRET)
        .with_stripe_price_id("price_123")
        .with_app_url("https://passthatclass.com")
        .build()
        .unwrap();

    let events = InMemoryEventRecordStore::new();
    let profiles = InMemoryProfileStore::new();

    let context = app::AppContext::with_gateway(
        config,
        Arc::new(profiles.clone()),
        Arc::new(events.clone()),
        Arc::new(FakeGateway),
    );

    TestApp {
        router: app::router(context),
        events,
        profiles,
    }
}

fn sign_payload(payload: &[u8]) -> String {
    type HmacSha256 = Hmac<Sha256>;

    let timestamp = chrono::Utc::now().timestamp();
    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let mut mac = HmacSha256::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(signed_payload.as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

fn bearer_token(sub: &str, email: Option<&str>) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        email: email.map(str::to_string),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {}", token)
}

fn customer_deleted_payload() -> Vec<u8> {
    serde_json::json!({
        "id": "evt_http_1",
        "type": "customer.deleted",
        "data": {"object": {"id": "cus_1"}},
        "created": 1735689600u64
    })
    .to_string()
    .into_bytes()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = test_app();

    let response = app
        .router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["ok"], true);
}

#[tokio::test]
async fn webhook_with_valid_signature_is_acknowledged() {
    let app = test_app();
    let mut profile = Profile::new("user_1", "u@example.com");
    profile.stripe_customer_id = Some("cus_1".to_string());
    app.profiles.seed(profile).await;

    let payload = customer_deleted_payload();
    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/billing/webhook")
                .header("stripe-signature", sign_payload(&payload))
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["received"], true);

    let records = app.events.records().await;
    assert_eq!(records.len(), 1);

    let profile = app
        .profiles
        .find_by_user_id("user_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.stripe_customer_id, None);
}

#[tokio::test]
async fn webhook_with_tampered_signature_writes_nothing() {
    let app = test_app();

    let payload = customer_deleted_payload();
    let mut tampered = payload.clone();
    tampered.extend_from_slice(b" ");

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/billing/webhook")
                .header("stripe-signature", sign_payload(&payload))
                .body(Body::from(tampered))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.events.records().await.is_empty());
    assert_eq!(app.profiles.write_count(), 0);
}

#[tokio::test]
async fn webhook_without_signature_header_is_rejected() {
    let app = test_app();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/billing/webhook")
                .body(Body::from(customer_deleted_payload()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.events.records().await.is_empty());
}

#[tokio::test]
async fn webhook_ignores_types_outside_the_allow_list() {
    let app = test_app();

    let payload = serde_json::json!({
        "id": "evt_http_2",
        "type": "charge.refunded",
        "data": {"object": {}},
        "created": 1735689600u64
    })
    .to_string()
    .into_bytes();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/billing/webhook")
                .header("stripe-signature", sign_payload(&payload))
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(app.events.records().await.is_empty());
    assert_eq!(app.profiles.write_count(), 0);
}

#[tokio::test]
async fn checkout_requires_authentication() {
    let app = test_app();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/billing/create-checkout-session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn checkout_returns_session_url() {
    let app = test_app();
    app.profiles.seed(Profile::new("user_1", "u@example.com")).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/billing/create-checkout-session")
                .header(header::AUTHORIZATION, bearer_token("user_1", Some("u@example.com")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["url"], "https://checkout.stripe.com/c/pay/cs_fake_1");

    // The lazily created customer got linked to the profile.
    let profile = app
        .profiles
        .find_by_user_id("user_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.stripe_customer_id.as_deref(), Some("cus_fake_1"));
}

#[tokio::test]
async fn checkout_conflicts_for_existing_pro_plan() {
    let app = test_app();
    let mut profile = Profile::new("user_1", "u@example.com");
    profile.plan_id = "pro".to_string();
    app.profiles.seed(profile).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/billing/create-checkout-session")
                .header(header::AUTHORIZATION, bearer_token("user_1", Some("u@example.com")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn portal_requires_a_customer_on_file() {
    let app = test_app();
    app.profiles.seed(Profile::new("user_1", "u@example.com")).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/billing/portal")
                .header(header::AUTHORIZATION, bearer_token("user_1", None))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn portal_returns_session_url() {
    let app = test_app();
    let mut profile = Profile::new("user_1", "u@example.com");
    profile.stripe_customer_id = Some("cus_1".to_string());
    app.profiles.seed(profile).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/billing/portal")
                .header(header::AUTHORIZATION, bearer_token("user_1", None))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["url"], "https://billing.stripe.com/session/bps_fake_1");
}
