//! Common test utilities for nevis-gateway integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use axum_test::{TestResponse, TestServer};

use nevis_gateway_core::RequestClass;
use nevis_gateway_service::config::{RetryPolicy, RouterConfig};
use nevis_gateway_service::stripe::sign_payload;
use nevis_gateway_service::{
    create_router, AppState, FallbackRouter, HealthTracker, ProviderAdapter, ScriptedAdapter,
    ServiceConfig, Tier,
};
use nevis_gateway_store::MemoryStore;

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The service API key for service-to-service requests.
    pub service_api_key: String,
    /// Secret used to sign payment webhooks.
    pub webhook_secret: String,
    /// Adapters behind tiers `T1..`, in chain order.
    pub adapters: Vec<Arc<ScriptedAdapter>>,
}

impl TestHarness {
    /// Four tiers that always succeed.
    pub fn new() -> Self {
        Self::with_adapters(vec![
            ScriptedAdapter::new("gemini-primary", "google"),
            ScriptedAdapter::new("gemini-secondary", "google"),
            ScriptedAdapter::new("gemini-tertiary", "google"),
            ScriptedAdapter::new("openrouter", "openrouter"),
        ])
    }

    /// One tier per adapter, labelled `T1`, `T2`, ... in order.
    pub fn with_adapters(adapters: Vec<ScriptedAdapter>) -> Self {
        Self::with_config(adapters, |_| {})
    }

    /// Like [`TestHarness::with_adapters`], with a chance to adjust the config.
    pub fn with_config(adapters: Vec<ScriptedAdapter>, configure: impl FnOnce(&mut ServiceConfig)) -> Self {
        let service_api_key = "test-service-key".to_string();
        let webhook_secret = "whsec_test_secret".to_string();

        let mut config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            service_api_key: Some(service_api_key.clone()),
            stripe_webhook_secret: Some(webhook_secret.clone()),
            router: RouterConfig {
                retry: RetryPolicy {
                    max_retries: 2,
                    initial_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(5),
                },
                tier_timeout: Duration::from_secs(2),
                deadline: Duration::from_secs(10),
            },
            ..ServiceConfig::default()
        };
        configure(&mut config);

        let adapters: Vec<Arc<ScriptedAdapter>> = adapters.into_iter().map(Arc::new).collect();
        let tiers: Vec<Tier> = adapters
            .iter()
            .enumerate()
            .map(|(i, adapter)| {
                let adapter: Arc<dyn ProviderAdapter> = Arc::<ScriptedAdapter>::clone(adapter);
                Tier::new(format!("T{}", i + 1), adapter)
            })
            .collect();

        let health = Arc::new(HealthTracker::new(config.breaker));
        let router = FallbackRouter::new(Arc::clone(&health), config.router)
            .with_chain_for_all_versions(RequestClass::Image, &tiers)
            .with_chain_for_all_versions(RequestClass::Text, &tiers);

        let state = AppState::from_parts(Arc::new(MemoryStore::new()), config, health, router);
        let router: Router = create_router(state);

        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            service_api_key,
            webhook_secret,
            adapters,
        }
    }

    /// The service API key as a header value.
    pub fn api_key(&self) -> HeaderValue {
        HeaderValue::from_str(&self.service_api_key).expect("valid header value")
    }

    /// Sign a webhook payload with the harness secret.
    pub fn stripe_signature(&self, payload: &str) -> HeaderValue {
        let signature = sign_payload(payload, &self.webhook_secret, chrono::Utc::now().timestamp());
        HeaderValue::from_str(&signature).expect("valid header value")
    }

    /// Post a generation request with the service key.
    pub async fn generate(&self, path: &str, body: &serde_json::Value) -> TestResponse {
        self.server
            .post(path)
            .add_header(api_key_header(), self.api_key())
            .json(body)
            .await
    }

    /// Fetch a user's credit summary.
    pub async fn credits(&self, user_id: &str) -> serde_json::Value {
        let response = self
            .server
            .get(&format!("/credits/{user_id}"))
            .add_header(api_key_header(), self.api_key())
            .await;
        response.assert_status_ok();
        response.json()
    }

    /// Fetch a user's monthly quota.
    pub async fn quota(&self, user_id: &str) -> serde_json::Value {
        let response = self
            .server
            .get(&format!("/quota/{user_id}"))
            .add_header(api_key_header(), self.api_key())
            .await;
        response.assert_status_ok();
        response.json()
    }

    /// Post a signed payment webhook.
    pub async fn payment_webhook(&self, event: &serde_json::Value) -> TestResponse {
        let payload = event.to_string();
        self.server
            .post("/api/webhooks/payment")
            .add_header(stripe_signature_header(), self.stripe_signature(&payload))
            .text(payload)
            .await
    }
}

/// Name of the service API key header.
pub fn api_key_header() -> HeaderName {
    HeaderName::from_static("x-api-key")
}

/// Name of the Stripe signature header.
pub fn stripe_signature_header() -> HeaderName {
    HeaderName::from_static("stripe-signature")
}

/// A paid `checkout.session.completed` event.
pub fn checkout_completed(session_id: &str, user_id: &str, credits: i64) -> serde_json::Value {
    serde_json::json!({
        "id": format!("evt_{session_id}"),
        "type": "checkout.session.completed",
        "created": 1_700_000_000,
        "data": {
            "object": {
                "id": session_id,
                "payment_status": "paid",
                "amount_total": 999,
                "client_reference_id": user_id,
                "metadata": {
                    "credits_amount": credits.to_string(),
                    "plan_id": "credits_100"
                }
            }
        }
    })
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
