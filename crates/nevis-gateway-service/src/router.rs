//! Fallback router.
//!
//! Walks a static tier chain per `(revo version, request class)`:
//!
//! 1. Skip tiers whose breaker is open. If every tier is open, force a trial call on
//!    the least-recently-opened one.
//! 2. Call the tier with a per-call timeout bounded by the request deadline.
//! 3. `Timeout`/`ServerError` retry on the same tier with exponential backoff;
//!    `Auth`/`QuotaExceeded`/`Unsupported` advance immediately.
//! 4. First success wins and is attributed to the tier label (`"T2"`, ...).
//! 5. Otherwise the request is exhausted and the caller refunds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use nevis_gateway_core::{ProviderErrorKind, RequestClass};

use crate::config::{RevoVersion, RouterConfig, ServiceConfig};
use crate::health::{Admission, BreakerState, HealthTracker};
use crate::provider::{
    GeminiAdapter, GenerationOutput, GenerationRequest, OpenRouterAdapter, ProviderAdapter,
    ProviderError,
};

/// One entry in a fallback chain.
#[derive(Clone)]
pub struct Tier {
    /// Label reported as `fallback_level`.
    pub label: String,
    /// The adapter serving this tier.
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl Tier {
    /// Create a tier.
    #[must_use]
    pub fn new(label: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            label: label.into(),
            adapter,
        }
    }
}

/// Description of one tier for the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackLevel {
    /// Tier label.
    pub tier: String,
    /// Adapter id.
    pub adapter: String,
    /// Provider family.
    pub provider: String,
}

/// A request served by some tier.
#[derive(Debug, Clone)]
pub struct RouteSuccess {
    /// Provider output.
    pub output: GenerationOutput,
    /// Label of the tier that served the request.
    pub tier: String,
    /// Provider family of that tier.
    pub provider: String,
    /// Provider calls made across all tiers.
    pub tier_attempts: u32,
}

/// A request no tier could serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteFailure {
    /// Classification of the last failed call, if any call was made.
    pub last_error: Option<ProviderErrorKind>,
    /// Provider calls made across all tiers.
    pub tier_attempts: u32,
}

/// Result of routing one request.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    /// Some tier produced content.
    Succeeded(RouteSuccess),
    /// Every tier failed or was skipped.
    Exhausted(RouteFailure),
}

/// Routes generation requests across tier chains.
pub struct FallbackRouter {
    chains: HashMap<(RevoVersion, RequestClass), Vec<Tier>>,
    health: Arc<HealthTracker>,
    config: RouterConfig,
}

impl FallbackRouter {
    /// Create a router with no chains.
    #[must_use]
    pub fn new(health: Arc<HealthTracker>, config: RouterConfig) -> Self {
        Self {
            chains: HashMap::new(),
            health,
            config,
        }
    }

    /// Install the chain for a version and class.
    #[must_use]
    pub fn with_chain(mut self, version: RevoVersion, class: RequestClass, tiers: Vec<Tier>) -> Self {
        for tier in &tiers {
            self.health.register(tier.adapter.id());
        }
        self.chains.insert((version, class), tiers);
        self
    }

    /// Install the same chain for every version of a class.
    #[must_use]
    pub fn with_chain_for_all_versions(mut self, class: RequestClass, tiers: &[Tier]) -> Self {
        for version in RevoVersion::ALL {
            self = self.with_chain(version, class, tiers.to_vec());
        }
        self
    }

    /// Build Gemini and `OpenRouter` chains from configured credentials.
    ///
    /// Tier labels stay fixed (`T1` primary, `T2` secondary, `T3` tertiary,
    /// `T4` cross-provider) even when a credential is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &ServiceConfig, health: Arc<HealthTracker>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.router.tier_timeout)
            .build()?;
        let credentials = &config.credentials;

        let openrouter: Option<Arc<dyn ProviderAdapter>> =
            credentials.openrouter_api_key.as_ref().map(|key| {
                Arc::new(OpenRouterAdapter::new(
                    "openrouter",
                    key.clone(),
                    credentials.openrouter_base_url.clone(),
                    client.clone(),
                )) as Arc<dyn ProviderAdapter>
            });

        let mut router = Self::new(health, config.router);
        for version in RevoVersion::ALL {
            let keys = credentials.gemini_keys(version);
            let mut tiers = Vec::new();
            for (label, slot, key) in [
                ("T1", "primary", keys.primary),
                ("T2", "secondary", keys.secondary),
                ("T3", "tertiary", keys.tertiary),
            ] {
                if let Some(key) = key {
                    let adapter = GeminiAdapter::new(
                        format!("gemini-{version}-{slot}"),
                        key,
                        credentials.gemini_base_url.clone(),
                        client.clone(),
                    );
                    tiers.push(Tier::new(label, Arc::new(adapter)));
                }
            }
            if let Some(adapter) = &openrouter {
                tiers.push(Tier::new("T4", Arc::clone(adapter)));
            }

            for class in [RequestClass::Image, RequestClass::Text] {
                router = router.with_chain(version, class, tiers.clone());
            }
        }

        Ok(router)
    }

    /// The configured chain for a version and class.
    #[must_use]
    pub fn chain(&self, version: RevoVersion, class: RequestClass) -> &[Tier] {
        self.chains
            .get(&(version, class))
            .map_or(&[], Vec::as_slice)
    }

    /// Ordered tier descriptions for a version and class.
    #[must_use]
    pub fn fallback_levels(&self, version: RevoVersion, class: RequestClass) -> Vec<FallbackLevel> {
        self.chain(version, class)
            .iter()
            .map(|tier| FallbackLevel {
                tier: tier.label.clone(),
                adapter: tier.adapter.id().to_string(),
                provider: tier.adapter.provider().to_string(),
            })
            .collect()
    }

    /// Whether an adapter id belongs to any chain.
    #[must_use]
    pub fn knows_adapter(&self, id: &str) -> bool {
        self.chains
            .values()
            .flatten()
            .any(|tier| tier.adapter.id() == id)
    }

    /// Upper bound on one routed request.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.config.deadline
    }

    /// Route a request through the chain for `version`.
    pub async fn route(&self, version: RevoVersion, request: &GenerationRequest) -> RouteOutcome {
        self.route_within(version, request, self.config.deadline).await
    }

    /// Route with a caller budget; the configured deadline still caps it.
    pub async fn route_within(
        &self,
        version: RevoVersion,
        request: &GenerationRequest,
        budget: Duration,
    ) -> RouteOutcome {
        let deadline = Instant::now() + budget.min(self.config.deadline);
        let tiers: Vec<&Tier> = self
            .chain(version, request.class)
            .iter()
            .filter(|tier| tier.adapter.supports(request.class))
            .collect();

        let mut attempts = 0u32;
        let mut last_error = None;
        let mut attempted_any = false;

        for tier in &tiers {
            if Instant::now() >= deadline {
                break;
            }
            match self.health.admit(tier.adapter.id()) {
                Admission::Rejected => {
                    tracing::debug!(
                        tier = %tier.label,
                        adapter = %tier.adapter.id(),
                        "Skipping tier with open circuit breaker"
                    );
                    continue;
                }
                Admission::Allowed | Admission::Trial => {}
            }

            attempted_any = true;
            match self.run_tier(tier, request, deadline, &mut attempts).await {
                Ok(output) => return Self::succeeded(tier, output, attempts),
                Err(kind) => last_error = Some(kind),
            }
        }

        if !attempted_any && Instant::now() < deadline {
            let ids: Vec<&str> = tiers.iter().map(|tier| tier.adapter.id()).collect();
            let trial = self
                .health
                .force_trial(&ids)
                .and_then(|id| tiers.iter().find(|tier| tier.adapter.id() == id));
            if let Some(tier) = trial {
                match self.run_tier(tier, request, deadline, &mut attempts).await {
                    Ok(output) => return Self::succeeded(tier, output, attempts),
                    Err(kind) => last_error = Some(kind),
                }
            }
        }

        tracing::error!(
            class = %request.class,
            revo_version = %version,
            tier_attempts = attempts,
            last_error = ?last_error,
            "All provider tiers exhausted"
        );

        RouteOutcome::Exhausted(RouteFailure {
            last_error,
            tier_attempts: attempts,
        })
    }

    fn succeeded(tier: &Tier, output: GenerationOutput, attempts: u32) -> RouteOutcome {
        RouteOutcome::Succeeded(RouteSuccess {
            output,
            tier: tier.label.clone(),
            provider: tier.adapter.provider().to_string(),
            tier_attempts: attempts,
        })
    }

    /// Call one tier, retrying transient failures.
    async fn run_tier(
        &self,
        tier: &Tier,
        request: &GenerationRequest,
        deadline: Instant,
        attempts: &mut u32,
    ) -> Result<GenerationOutput, ProviderErrorKind> {
        let id = tier.adapter.id();
        let policy = self.config.retry;
        let mut retry = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProviderErrorKind::Timeout);
            }
            *attempts += 1;

            let call_timeout = self.config.tier_timeout.min(remaining);
            let result = match tokio::time::timeout(call_timeout, tier.adapter.generate(request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::new(
                    ProviderErrorKind::Timeout,
                    format!("no response within {}ms", call_timeout.as_millis()),
                )),
            };

            let err = match result {
                Ok(output) => {
                    self.health.record_success(id);
                    tracing::info!(tier = %tier.label, adapter = %id, retry, "Tier succeeded");
                    return Ok(output);
                }
                Err(err) => err,
            };

            let state = self.health.record_failure(id);
            tracing::warn!(
                tier = %tier.label,
                adapter = %id,
                kind = %err.kind,
                retry,
                error = %err.message,
                "Provider call failed"
            );

            if !err.kind.is_transient() || retry >= policy.max_retries || state != BreakerState::Closed {
                return Err(err.kind);
            }

            retry += 1;
            let delay = policy.backoff_for(retry);
            if Instant::now() + delay >= deadline {
                return Err(err.kind);
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, RetryPolicy};
    use crate::provider::ScriptedAdapter;

    fn router_config() -> RouterConfig {
        RouterConfig {
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_millis(1000),
            },
            tier_timeout: Duration::from_secs(5),
            deadline: Duration::from_secs(60),
        }
    }

    fn health() -> Arc<HealthTracker> {
        Arc::new(HealthTracker::new(BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }))
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            class: RequestClass::Text,
            prompt: "tagline for a bakery".into(),
            model: "gemini-2.5-flash".into(),
            max_tokens: 100,
            temperature: 0.7,
        }
    }

    fn router(health: Arc<HealthTracker>, tiers: Vec<Tier>) -> FallbackRouter {
        FallbackRouter::new(health, router_config()).with_chain(RevoVersion::V2_0, RequestClass::Text, tiers)
    }

    #[tokio::test(start_paused = true)]
    async fn auth_advances_and_timeouts_retry_on_same_tier() {
        let t1 = Arc::new(ScriptedAdapter::new("t1", "google").always_fail(ProviderErrorKind::Auth));
        let t2 = Arc::new(
            ScriptedAdapter::new("t2", "google")
                .then_fail(ProviderErrorKind::Timeout)
                .then_fail(ProviderErrorKind::Timeout)
                .then_succeed(),
        );
        let t3 = Arc::new(ScriptedAdapter::new("t3", "openrouter"));
        let router = router(
            health(),
            vec![
                Tier::new("T1", t1.clone()),
                Tier::new("T2", t2.clone()),
                Tier::new("T3", t3.clone()),
            ],
        );

        let RouteOutcome::Succeeded(success) = router.route(RevoVersion::V2_0, &request()).await else {
            panic!("expected success");
        };
        assert_eq!(success.tier, "T2");
        assert_eq!(success.provider, "google");
        assert_eq!(success.tier_attempts, 4);
        assert_eq!(t1.calls(), 1);
        assert_eq!(t2.calls(), 3);
        assert_eq!(t3.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_stop_at_retry_bound() {
        let t1 = Arc::new(ScriptedAdapter::new("t1", "google").always_fail(ProviderErrorKind::ServerError));
        let t2 = Arc::new(ScriptedAdapter::new("t2", "openrouter"));
        let router = router(
            Arc::new(HealthTracker::new(BreakerConfig {
                failure_threshold: 10,
                cooldown: Duration::from_secs(60),
            })),
            vec![Tier::new("T1", t1.clone()), Tier::new("T2", t2.clone())],
        );

        let RouteOutcome::Succeeded(success) = router.route(RevoVersion::V2_0, &request()).await else {
            panic!("expected success");
        };
        assert_eq!(success.tier, "T2");
        assert_eq!(t1.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reports_last_error() {
        let t1 = Arc::new(ScriptedAdapter::new("t1", "google").always_fail(ProviderErrorKind::QuotaExceeded));
        let t2 = Arc::new(ScriptedAdapter::new("t2", "openrouter").always_fail(ProviderErrorKind::Unsupported));
        let router = router(health(), vec![Tier::new("T1", t1), Tier::new("T2", t2)]);

        let RouteOutcome::Exhausted(failure) = router.route(RevoVersion::V2_0, &request()).await else {
            panic!("expected exhaustion");
        };
        assert_eq!(failure.last_error, Some(ProviderErrorKind::Unsupported));
        assert_eq!(failure.tier_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_is_skipped_during_cooldown() {
        let health = health();
        let t1 = Arc::new(ScriptedAdapter::new("t1", "google").always_fail(ProviderErrorKind::ServerError));
        let t2 = Arc::new(ScriptedAdapter::new("t2", "openrouter"));
        let router = router(
            Arc::clone(&health),
            vec![Tier::new("T1", t1.clone()), Tier::new("T2", t2.clone())],
        );

        // Three transient failures open T1's breaker.
        router.route(RevoVersion::V2_0, &request()).await;
        assert_eq!(t1.calls(), 3);
        assert_eq!(health.state("t1"), Some(BreakerState::Open));

        for _ in 0..5 {
            let RouteOutcome::Succeeded(success) = router.route(RevoVersion::V2_0, &request()).await else {
                panic!("expected success");
            };
            assert_eq!(success.tier, "T2");
        }
        assert_eq!(t1.calls(), 3, "open adapter must not be called during cool-down");

        tokio::time::advance(Duration::from_secs(61)).await;
        router.route(RevoVersion::V2_0, &request()).await;
        // Exactly one trial call, which fails and re-opens the breaker.
        assert_eq!(t1.calls(), 4);
        assert_eq!(health.state("t1"), Some(BreakerState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn all_open_forces_a_trial_of_least_recently_opened() {
        let health = health();
        let t1 = Arc::new(ScriptedAdapter::new("t1", "google").always_fail(ProviderErrorKind::Auth));
        let t2 = Arc::new(ScriptedAdapter::new("t2", "openrouter").always_fail(ProviderErrorKind::Auth));
        let router = router(
            Arc::clone(&health),
            vec![Tier::new("T1", t1.clone()), Tier::new("T2", t2.clone())],
        );

        for _ in 0..3 {
            router.route(RevoVersion::V2_0, &request()).await;
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(health.state("t1"), Some(BreakerState::Open));
        assert_eq!(health.state("t2"), Some(BreakerState::Open));
        let (c1, c2) = (t1.calls(), t2.calls());

        router.route(RevoVersion::V2_0, &request()).await;
        assert_eq!(t1.calls(), c1 + 1, "ties go to the earlier tier");
        assert_eq!(t2.calls(), c2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tier_times_out_and_advances() {
        let t1 = Arc::new(ScriptedAdapter::new("t1", "google").with_delay(Duration::from_secs(30)));
        let t2 = Arc::new(ScriptedAdapter::new("t2", "openrouter"));
        let router = router(
            Arc::new(HealthTracker::new(BreakerConfig {
                failure_threshold: 10,
                cooldown: Duration::from_secs(60),
            })),
            vec![Tier::new("T1", t1.clone()), Tier::new("T2", t2)],
        );

        let RouteOutcome::Succeeded(success) = router.route(RevoVersion::V2_0, &request()).await else {
            panic!("expected success");
        };
        assert_eq!(success.tier, "T2");
        // One call plus two retries, each cut off by the tier timeout.
        assert_eq!(t1.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_budget_bounds_the_chain() {
        let t1 = Arc::new(ScriptedAdapter::new("t1", "google").with_delay(Duration::from_secs(3)));
        let t2 = Arc::new(ScriptedAdapter::new("t2", "openrouter").with_delay(Duration::from_secs(3)));
        let router = router(health(), vec![Tier::new("T1", t1.clone()), Tier::new("T2", t2.clone())]);

        let started = Instant::now();
        let outcome = router
            .route_within(RevoVersion::V2_0, &request(), Duration::from_millis(500))
            .await;

        assert!(matches!(
            outcome,
            RouteOutcome::Exhausted(RouteFailure {
                last_error: Some(ProviderErrorKind::Timeout),
                ..
            })
        ));
        assert!(started.elapsed() <= Duration::from_millis(600));
        assert_eq!(t1.calls(), 1);
        assert_eq!(t2.calls(), 0);
    }

    #[tokio::test]
    async fn unsupported_class_is_filtered() {
        let image_only = Arc::new(ScriptedAdapter::new("img", "google").only(&[RequestClass::Image]));
        let router = router(health(), vec![Tier::new("T1", image_only.clone())]);

        let outcome = router.route(RevoVersion::V2_0, &request()).await;
        assert!(matches!(outcome, RouteOutcome::Exhausted(RouteFailure { last_error: None, tier_attempts: 0 })));
        assert_eq!(image_only.calls(), 0);
    }

    #[test]
    fn from_config_keeps_fixed_labels() {
        let mut config = ServiceConfig::default();
        config.credentials.gemini.insert(
            RevoVersion::V1_5,
            crate::config::GeminiKeys {
                primary: Some("p".into()),
                secondary: None,
                tertiary: Some("t".into()),
            },
        );
        config.credentials.openrouter_api_key = Some("or".into());

        let router = FallbackRouter::from_config(&config, health()).unwrap();
        let levels = router.fallback_levels(RevoVersion::V1_5, RequestClass::Image);
        let labels: Vec<_> = levels.iter().map(|l| l.tier.as_str()).collect();
        assert_eq!(labels, ["T1", "T3", "T4"]);
        assert_eq!(levels[0].adapter, "gemini-1.5-primary");
        assert_eq!(levels[2].provider, "openrouter");

        // Versions without Gemini keys still fall back to OpenRouter.
        assert_eq!(router.chain(RevoVersion::V1_0, RequestClass::Text).len(), 1);
        assert!(router.knows_adapter("gemini-1.5-tertiary"));
    }
}
