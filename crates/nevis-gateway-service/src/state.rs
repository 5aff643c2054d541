//! Application state.

use std::sync::Arc;

use nevis_gateway_store::Store;

use crate::config::ServiceConfig;
use crate::gateway::GenerationGateway;
use crate::health::HealthTracker;
use crate::ledger::CreditLedger;
use crate::quota::QuotaTracker;
use crate::reconciler::PaymentReconciler;
use crate::recorder::UsageRecorder;
use crate::router::FallbackRouter;

/// Application state shared across handlers.
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Credit ledger.
    pub ledger: Arc<CreditLedger>,

    /// Per-adapter circuit breakers.
    pub health: Arc<HealthTracker>,

    /// Tier chains.
    pub router: Arc<FallbackRouter>,

    /// Attempt audit log.
    pub recorder: Arc<UsageRecorder>,

    /// Monthly request counters.
    pub quota: Arc<QuotaTracker>,

    /// Payment webhook inbox.
    pub reconciler: Arc<PaymentReconciler>,

    /// Generation pipeline.
    pub gateway: Arc<GenerationGateway>,
}

impl AppState {
    /// Create the state with provider adapters built from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider HTTP client cannot be built.
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Result<Self, reqwest::Error> {
        let health = Arc::new(HealthTracker::new(config.breaker));
        let router = FallbackRouter::from_config(&config, Arc::clone(&health))?;

        if config.credentials.openrouter_api_key.is_none() {
            tracing::warn!("OpenRouter not configured - no cross-provider fallback");
        }
        for version in crate::config::RevoVersion::ALL {
            if config.credentials.gemini_keys(version).primary.is_none() {
                tracing::warn!(revo_version = %version, "No primary Gemini key configured");
            }
        }

        Ok(Self::from_parts(store, config, health, router))
    }

    /// Create the state around an already-built router.
    #[must_use]
    pub fn from_parts(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        health: Arc<HealthTracker>,
        router: FallbackRouter,
    ) -> Self {
        let ledger = Arc::new(CreditLedger::new(
            Arc::clone(&store),
            config.ledger_retry,
            config.free_tier_credits,
        ));
        let router = Arc::new(router);
        let recorder = Arc::new(UsageRecorder::new(Arc::clone(&store), config.pricing.clone()));
        let quota = Arc::new(QuotaTracker::new(Arc::clone(&store), config.monthly_request_limit));
        let reconciler = Arc::new(PaymentReconciler::new(Arc::clone(&ledger)));
        let gateway = Arc::new(GenerationGateway::new(
            Arc::clone(&ledger),
            Arc::clone(&router),
            Arc::clone(&recorder),
            config.pricing.clone(),
        ));

        Self {
            store,
            config,
            ledger,
            health,
            router,
            recorder,
            quota,
            reconciler,
            gateway,
        }
    }
}
