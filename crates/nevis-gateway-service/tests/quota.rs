//! Monthly quota integration tests.

mod common;

use common::{api_key_header, TestHarness};
use nevis_gateway_core::ProviderErrorKind;
use nevis_gateway_service::ScriptedAdapter;
use serde_json::json;

fn harness_with_limit(limit: u32, adapters: Vec<ScriptedAdapter>) -> TestHarness {
    TestHarness::with_config(adapters, |config| config.monthly_request_limit = limit)
}

fn healthy() -> Vec<ScriptedAdapter> {
    vec![ScriptedAdapter::new("gemini-primary", "google")]
}

#[tokio::test]
async fn requests_past_the_limit_are_rejected_without_charge() {
    let harness = harness_with_limit(2, healthy());
    let request = json!({ "prompt": "hi", "user_id": "user_capped" });

    for expected in 1..=2 {
        let response = harness.generate("/generate-text", &request).await;
        response.assert_status_ok();
        assert_eq!(response.json::<serde_json::Value>()["user_quota"], expected);
    }

    let response = harness.generate("/generate-text", &request).await;

    response.assert_status(axum::http::StatusCode::TOO_MANY_REQUESTS);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error_kind"], "quota_exceeded");
    assert_eq!(harness.adapters[0].calls(), 2);

    let credits = harness.credits("user_capped").await;
    assert_eq!(credits["credits_remaining"], 8);
}

#[tokio::test]
async fn quota_endpoint_reports_usage() {
    let harness = harness_with_limit(5, healthy());

    harness
        .generate("/generate-text", &json!({ "prompt": "hi", "user_id": "user_usage" }))
        .await
        .assert_status_ok();

    let body = harness.quota("user_usage").await;

    assert_eq!(body["user_id"], "user_usage");
    assert_eq!(body["current_usage"], 1);
    assert_eq!(body["monthly_limit"], 5);
    assert_eq!(body["remaining"], 4);
    assert_eq!(body["month"], chrono::Utc::now().format("%Y-%m").to_string());
}

#[tokio::test]
async fn failed_generations_are_not_counted() {
    let harness = harness_with_limit(
        1,
        vec![ScriptedAdapter::new("gemini-primary", "google").always_fail(ProviderErrorKind::Auth)],
    );
    let request = json!({ "prompt": "hi", "user_id": "user_unlucky" });

    for _ in 0..2 {
        harness
            .generate("/generate-text", &request)
            .await
            .assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    let body = harness.quota("user_unlucky").await;
    assert_eq!(body["current_usage"], 0);
    assert_eq!(body["remaining"], 1);
}

#[tokio::test]
async fn quota_requires_api_key() {
    let harness = TestHarness::new();

    let response = harness.server.get("/quota/user_anon").await;

    response.assert_status_unauthorized();
}

#[tokio::test]
async fn quota_rejects_invalid_user_id() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .get("/quota/bad%20user")
        .add_header(api_key_header(), harness.api_key())
        .await;

    response.assert_status_bad_request();
}
