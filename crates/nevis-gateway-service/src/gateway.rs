//! Generation pipeline.
//!
//! `deduct → route → record`, with a refund when every tier fails. The
//! pipeline runs on its own task so that a caller hanging up mid-route cannot
//! strand a committed deduction without its refund: the task watches the
//! reply channel, abandons the provider calls once the caller is gone and
//! refunds through the same path as an exhausted chain.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::Instant;

use nevis_gateway_core::{
    AttemptId, ErrorKind, GatewayError, GenerationAttempt, PricingConfig, ProviderErrorKind,
    TransactionKind, UserId, EXHAUSTED_TIER,
};

use crate::config::RevoVersion;
use crate::ledger::{refund_key, CreditLedger, LedgerReceipt};
use crate::provider::{GenerationOutput, GenerationRequest};
use crate::recorder::UsageRecorder;
use crate::router::{FallbackRouter, RouteFailure, RouteOutcome};

/// How many times one request id may be re-run after its charge was refunded.
const MAX_REFUNDED_RETRIES: u32 = 16;

/// One generation request as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct GenerateCommand {
    /// Paying user.
    pub user_id: UserId,
    /// Credential set to route through.
    pub version: RevoVersion,
    /// Normalized provider request.
    pub request: GenerationRequest,
    /// Caller-supplied request id; used as the deduction key.
    pub request_key: Option<String>,
    /// Tier claimed by the caller, kept as transaction metadata.
    pub user_tier: Option<String>,
    /// Caller budget for the provider chain. The router deadline still applies.
    pub deadline: Option<Duration>,
}

/// A served request.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    /// Provider output.
    pub output: GenerationOutput,
    /// Tier label that produced it.
    pub tier: String,
    /// Provider family of that tier.
    pub provider: String,
    /// Credits left after the deduction.
    pub remaining: i64,
    /// Audit row id.
    pub attempt_id: AttemptId,
}

/// A failed request plus the balance to report alongside it.
#[derive(Debug)]
pub struct GenerationFailure {
    /// What went wrong.
    pub error: GatewayError,
    /// Credits left, when known.
    pub user_credits: Option<i64>,
}

impl GenerationFailure {
    fn new(error: GatewayError, user_credits: Option<i64>) -> Self {
        Self { error, user_credits }
    }
}

impl From<GatewayError> for GenerationFailure {
    fn from(error: GatewayError) -> Self {
        let user_credits = match &error {
            GatewayError::InsufficientCredits { remaining, .. } => Some(*remaining),
            _ => None,
        };
        Self::new(error, user_credits)
    }
}

type Reply = oneshot::Sender<Result<GenerateResult, GenerationFailure>>;

/// A committed deduction.
#[derive(Debug)]
struct Charge {
    user_id: UserId,
    key: String,
    credits: i64,
    receipt: LedgerReceipt,
}

/// Orchestrates ledger, router and recorder for each request.
pub struct GenerationGateway {
    ledger: Arc<CreditLedger>,
    router: Arc<FallbackRouter>,
    recorder: Arc<UsageRecorder>,
    pricing: PricingConfig,
}

impl GenerationGateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(
        ledger: Arc<CreditLedger>,
        router: Arc<FallbackRouter>,
        recorder: Arc<UsageRecorder>,
        pricing: PricingConfig,
    ) -> Self {
        Self {
            ledger,
            router,
            recorder,
            pricing,
        }
    }

    /// Run a generation request on a dedicated task.
    ///
    /// Dropping the returned future abandons the provider calls and refunds
    /// the deduction.
    ///
    /// # Errors
    ///
    /// - `InsufficientCredits` before any provider is called.
    /// - `DuplicateRequest` when the request id was already charged and not refunded.
    /// - `AllProvidersExhausted` after the deduction was refunded.
    /// - `LedgerStorage` when the ledger cannot be written.
    pub async fn generate(self: &Arc<Self>, command: GenerateCommand) -> Result<GenerateResult, GenerationFailure> {
        let (reply, response) = oneshot::channel();
        let gateway = Arc::clone(self);
        tokio::spawn(async move { gateway.serve(command, reply).await });

        response.await.unwrap_or_else(|_| {
            tracing::error!("Generation task ended without a reply");
            Err(GenerationFailure::new(
                GatewayError::LedgerStorage("generation task failed".into()),
                None,
            ))
        })
    }

    async fn serve(&self, command: GenerateCommand, mut reply: Reply) {
        let (result, charge) = self.run(command, &mut reply).await;

        if let Err(Ok(undelivered)) = reply.send(result) {
            // The caller left between the provider answering and the reply.
            if let Some(charge) = charge {
                tracing::warn!(
                    user_id = %charge.user_id,
                    key = %charge.key,
                    attempt_id = %undelivered.attempt_id,
                    "Caller went away before the result was delivered"
                );
                self.refund(&charge, "undelivered").await;
            }
        }
    }

    async fn run(
        &self,
        command: GenerateCommand,
        reply: &mut Reply,
    ) -> (Result<GenerateResult, GenerationFailure>, Option<Charge>) {
        let GenerateCommand {
            user_id,
            version,
            request,
            request_key,
            user_tier,
            deadline,
        } = command;

        let class = request.class;
        let credits = self.pricing.credits_for(class);
        let key = request_key.unwrap_or_else(|| format!("gen_{}", ulid::Ulid::new()));
        let metadata = json!({
            "request_class": class,
            "model": request.model,
            "revo_version": version.as_str(),
            "user_tier": user_tier,
        });

        let charge = match self.charge(&user_id, credits, &key, metadata).await {
            Ok(charge) => charge,
            Err(failure) => return (Err(failure), None),
        };

        let budget = deadline.unwrap_or_else(|| self.router.deadline());
        let started = Instant::now();
        let outcome = tokio::select! {
            outcome = self.router.route_within(version, &request, budget) => outcome,
            () = reply.closed() => {
                tracing::warn!(
                    user_id = %user_id,
                    key = %charge.key,
                    "Caller went away, abandoning provider calls"
                );
                RouteOutcome::Exhausted(RouteFailure {
                    last_error: Some(ProviderErrorKind::Timeout),
                    tier_attempts: 0,
                })
            }
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut attempt = GenerationAttempt {
            id: AttemptId::generate(),
            user_id: user_id.clone(),
            request_fingerprint: charge.key.clone(),
            request_class: class,
            provider_tier: EXHAUSTED_TIER.into(),
            provider: None,
            cost_credits: credits,
            success: false,
            latency_ms,
            error_kind: None,
            tier_attempts: 0,
            refunded: false,
            estimated_cost_usd_micros: 0,
            created_at: Utc::now(),
        };

        let result = match outcome {
            RouteOutcome::Succeeded(success) => {
                attempt.provider_tier.clone_from(&success.tier);
                attempt.provider = Some(success.provider.clone());
                attempt.success = true;
                attempt.tier_attempts = success.tier_attempts;
                attempt.estimated_cost_usd_micros = self
                    .recorder
                    .estimated_cost_usd_micros(Some(&success.provider), class);
                self.recorder.record(&attempt);

                tracing::info!(
                    user_id = %user_id,
                    class = %class,
                    tier = %success.tier,
                    provider = %success.provider,
                    remaining = charge.receipt.remaining,
                    latency_ms,
                    "Generation succeeded"
                );

                Ok(GenerateResult {
                    output: success.output,
                    tier: success.tier,
                    provider: success.provider,
                    remaining: charge.receipt.remaining,
                    attempt_id: attempt.id,
                })
            }
            RouteOutcome::Exhausted(failure) => {
                let (refunded, user_credits) = self
                    .refund(&charge, ErrorKind::AllProvidersExhausted.as_str())
                    .await;

                attempt.error_kind = Some(
                    failure
                        .last_error
                        .map_or(ErrorKind::AllProvidersExhausted, |kind| kind.error_kind()),
                );
                attempt.tier_attempts = failure.tier_attempts;
                attempt.refunded = refunded;
                self.recorder.record(&attempt);

                Err(GenerationFailure::new(
                    GatewayError::AllProvidersExhausted {
                        last_error: failure.last_error,
                        refunded,
                    },
                    user_credits,
                ))
            }
        };

        (result, Some(charge))
    }

    /// Deduct for a request id.
    ///
    /// A replayed id whose charge was refunded runs again under
    /// `<id>#retry-<n>`; any other replay is a duplicate.
    async fn charge(
        &self,
        user_id: &UserId,
        credits: i64,
        request_key: &str,
        metadata: serde_json::Value,
    ) -> Result<Charge, GenerationFailure> {
        let mut key = request_key.to_string();

        for retry in 1..=MAX_REFUNDED_RETRIES {
            let receipt = self.ledger.deduct(user_id, credits, &key, metadata.clone()).await?;
            if receipt.applied {
                return Ok(Charge {
                    user_id: user_id.clone(),
                    key,
                    credits,
                    receipt,
                });
            }
            if !self.ledger.was_refunded(user_id, &key).await? {
                break;
            }
            tracing::debug!(user_id = %user_id, key = %key, "Previous charge was refunded, charging again");
            key = format!("{request_key}#retry-{retry}");
        }

        tracing::warn!(user_id = %user_id, key = %request_key, "Request id already charged");
        let remaining = self.ledger.balance(user_id).await?.remaining;
        Err(GenerationFailure::new(
            GatewayError::DuplicateRequest(request_key.to_string()),
            Some(remaining),
        ))
    }

    /// Return a charge. Yields whether it was refunded and the balance after.
    async fn refund(&self, charge: &Charge, reason: &str) -> (bool, Option<i64>) {
        let refund = self
            .ledger
            .credit(
                &charge.user_id,
                charge.credits,
                TransactionKind::Refund,
                &refund_key(&charge.key),
                json!({
                    "deduction_key": charge.key,
                    "reason": reason,
                }),
            )
            .await;

        match refund {
            Ok(receipt) => (true, Some(receipt.remaining)),
            Err(e) => {
                tracing::error!(
                    user_id = %charge.user_id,
                    key = %charge.key,
                    error = %e,
                    "Refund failed"
                );
                (false, None)
            }
        }
    }
}
