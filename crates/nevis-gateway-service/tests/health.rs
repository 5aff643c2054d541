//! Health and admin endpoint integration tests.

mod common;

use common::{api_key_header, TestHarness};
use nevis_gateway_core::ProviderErrorKind;
use nevis_gateway_service::ScriptedAdapter;
use serde_json::json;

fn adapter_state<'a>(body: &'a serde_json::Value, id: &str) -> &'a serde_json::Value {
    body["adapters"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["id"] == id)
        .map(|a| &a["state"])
        .unwrap()
}

/// A harness whose first tier fails every call.
fn harness_with_broken_primary() -> TestHarness {
    TestHarness::with_adapters(vec![
        ScriptedAdapter::new("gemini-primary", "google").always_fail(ProviderErrorKind::ServerError),
        ScriptedAdapter::new("openrouter", "openrouter"),
    ])
}

#[tokio::test]
async fn health_check_returns_ok() {
    let harness = TestHarness::new();

    let response = harness.server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn health_reports_fallback_chain() {
    let harness = TestHarness::new();

    let response = harness.server.get("/health").await;

    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["fallback_system"], "4-tier");
    assert_eq!(body["fallback_levels"][0]["tier"], "T1");
    assert_eq!(body["fallback_levels"][3]["adapter"], "openrouter");
    assert_eq!(body["fallback_levels"][3]["provider"], "openrouter");
    assert_eq!(body["adapters"].as_array().unwrap().len(), 4);
    assert_eq!(body["openrouter_configured"], false);
    assert!(body["api_key_status"]["1.0"].is_object());
    let models: Vec<&str> = body["allowed_models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap())
        .collect();
    assert!(models.contains(&"gemini-2.5-flash"));
    assert!(models.contains(&"gemini-2.5-flash-image-preview"));
}

#[tokio::test]
async fn open_breaker_degrades_health() {
    let harness = harness_with_broken_primary();

    harness
        .generate(
            "/generate-text",
            &json!({ "prompt": "hi", "user_id": "user_breaker" }),
        )
        .await
        .assert_status_ok();

    let body: serde_json::Value = harness.server.get("/health").await.json();
    assert_eq!(body["status"], "degraded");
    assert_eq!(adapter_state(&body, "gemini-primary"), "open");
    assert_eq!(adapter_state(&body, "openrouter"), "closed");

    // The open tier is skipped on the next request
    let calls_before = harness.adapters[0].calls();
    harness
        .generate(
            "/generate-text",
            &json!({ "prompt": "hi again", "user_id": "user_breaker" }),
        )
        .await
        .assert_status_ok();
    assert_eq!(harness.adapters[0].calls(), calls_before);
}

#[tokio::test]
async fn admin_reset_closes_breaker() {
    let harness = harness_with_broken_primary();

    harness
        .generate(
            "/generate-text",
            &json!({ "prompt": "hi", "user_id": "user_reset" }),
        )
        .await
        .assert_status_ok();

    let response = harness
        .server
        .post("/admin/adapters/gemini-primary/reset")
        .add_header(api_key_header(), harness.api_key())
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["adapter"], "gemini-primary");
    assert_eq!(body["state"], "closed");

    let body: serde_json::Value = harness.server.get("/health").await.json();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn admin_reset_unknown_adapter_is_not_found() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/admin/adapters/nope/reset")
        .add_header(api_key_header(), harness.api_key())
        .await;

    response.assert_status_not_found();
}

#[tokio::test]
async fn admin_reset_requires_api_key() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/admin/adapters/gemini-primary/reset")
        .await;

    response.assert_status_unauthorized();
}
