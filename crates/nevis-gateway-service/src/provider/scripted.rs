//! Scripted adapter for exercising routing without a network.
//!
//! Each call pops the next step off the script; once the script is empty the
//! fallback step repeats forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use nevis_gateway_core::{ProviderErrorKind, RequestClass};

use super::{GenerationOutput, GenerationRequest, ProviderAdapter, ProviderError};

#[derive(Debug, Clone, Copy)]
enum Step {
    Succeed,
    Fail(ProviderErrorKind),
}

/// An adapter whose outcomes are fixed in advance.
pub struct ScriptedAdapter {
    id: String,
    provider: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Option<Duration>,
    classes: Option<Vec<RequestClass>>,
    calls: AtomicU32,
}

impl ScriptedAdapter {
    /// An adapter that succeeds on every call.
    #[must_use]
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Succeed,
            delay: None,
            classes: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Queue one failing call.
    #[must_use]
    pub fn then_fail(self, kind: ProviderErrorKind) -> Self {
        self.push(Step::Fail(kind))
    }

    /// Queue one successful call.
    #[must_use]
    pub fn then_succeed(self) -> Self {
        self.push(Step::Succeed)
    }

    /// Fail every call not covered by the script.
    #[must_use]
    pub fn always_fail(mut self, kind: ProviderErrorKind) -> Self {
        self.fallback = Step::Fail(kind);
        self
    }

    /// Sleep before answering each call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Restrict the adapter to some request classes.
    #[must_use]
    pub fn only(mut self, classes: &[RequestClass]) -> Self {
        self.classes = Some(classes.to_vec());
        self
    }

    /// Number of calls received so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(self, step: Step) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
        self
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn supports(&self, class: RequestClass) -> bool {
        self.classes.as_ref().map_or(true, |c| c.contains(&class))
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match step {
            Step::Succeed => Ok(GenerationOutput {
                data: serde_json::json!({
                    "adapter": self.id,
                    "text": format!("generated: {}", request.prompt),
                }),
                model_used: request.model.clone(),
            }),
            Step::Fail(kind) => Err(ProviderError::new(kind, format!("scripted {kind} from {}", self.id))),
        }
    }
}
