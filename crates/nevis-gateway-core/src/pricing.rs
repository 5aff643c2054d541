//! Pricing configuration.
//!
//! Two prices live here: what a request costs the user in credits, and an
//! estimate of what the provider call costs us (for `total_ai_cost_incurred`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::RequestClass;

/// Default credits charged for one image generation.
pub const DEFAULT_IMAGE_CREDITS: i64 = 3;

/// Default credits charged for one text generation.
pub const DEFAULT_TEXT_CREDITS: i64 = 1;

/// Pricing for generation requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Credits charged per image request.
    pub image_credits: i64,

    /// Credits charged per text request.
    pub text_credits: i64,

    /// Estimated provider spend per successful call, keyed by provider family
    /// and request class, in millionths of a USD.
    pub provider_costs: HashMap<ProviderCostKey, i64>,

    /// Estimate used when no entry matches.
    pub default_cost_usd_micros: i64,
}

/// Key for provider cost lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderCostKey {
    /// Provider family (e.g. "google").
    pub provider: String,
    /// Request class.
    pub class: RequestClass,
}

impl ProviderCostKey {
    /// Create a new cost key.
    #[must_use]
    pub fn new(provider: impl Into<String>, class: RequestClass) -> Self {
        Self {
            provider: provider.into(),
            class,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        let mut provider_costs = HashMap::new();

        provider_costs.insert(ProviderCostKey::new("google", RequestClass::Image), 39_000); // ~$0.039 per image
        provider_costs.insert(ProviderCostKey::new("google", RequestClass::Text), 1_000);
        provider_costs.insert(ProviderCostKey::new("openrouter", RequestClass::Image), 45_000);
        provider_costs.insert(ProviderCostKey::new("openrouter", RequestClass::Text), 1_500);

        Self {
            image_credits: DEFAULT_IMAGE_CREDITS,
            text_credits: DEFAULT_TEXT_CREDITS,
            provider_costs,
            default_cost_usd_micros: 2_000,
        }
    }
}

impl PricingConfig {
    /// Credits charged for a request of the given class.
    #[must_use]
    pub const fn credits_for(&self, class: RequestClass) -> i64 {
        match class {
            RequestClass::Image => self.image_credits,
            RequestClass::Text => self.text_credits,
        }
    }

    /// Estimated provider spend for one successful call.
    #[must_use]
    pub fn provider_cost_usd_micros(&self, provider: &str, class: RequestClass) -> i64 {
        self.provider_costs
            .get(&ProviderCostKey::new(provider, class))
            .copied()
            .unwrap_or(self.default_cost_usd_micros)
    }
}

/// Convert millionths of a USD to dollars for display.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn micros_to_usd(micros: i64) -> f64 {
    micros as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credits_per_class() {
        let pricing = PricingConfig::default();
        assert_eq!(pricing.credits_for(RequestClass::Image), 3);
        assert_eq!(pricing.credits_for(RequestClass::Text), 1);
    }

    #[test]
    fn provider_cost_falls_back_to_default() {
        let pricing = PricingConfig::default();
        assert_eq!(
            pricing.provider_cost_usd_micros("google", RequestClass::Image),
            39_000
        );
        assert_eq!(
            pricing.provider_cost_usd_micros("unknown", RequestClass::Text),
            pricing.default_cost_usd_micros
        );
    }

    #[test]
    fn micros_display() {
        assert!((micros_to_usd(39_000) - 0.039).abs() < f64::EPSILON);
    }
}
