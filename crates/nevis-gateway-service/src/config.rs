//! Service configuration.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use nevis_gateway_core::{PricingConfig, RequestClass, DEFAULT_FREE_TIER_CREDITS};

use crate::quota::DEFAULT_MONTHLY_REQUEST_LIMIT;

/// Default Gemini API base URL.
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default `OpenRouter` API base URL.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to `RocksDB` data directory (default: "/data/nevis-gateway").
    pub data_dir: String,

    /// Service API key. When set, generation, credits and admin routes
    /// require a matching `x-api-key` header.
    pub service_api_key: Option<String>,

    /// Stripe webhook signing secret (optional).
    pub stripe_webhook_secret: Option<String>,

    /// Maximum age of a signed webhook timestamp, in seconds.
    pub stripe_webhook_tolerance_seconds: i64,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds. Also caps the generation deadline.
    pub request_timeout_seconds: u64,

    /// Credits granted when an account is first seen.
    pub free_tier_credits: i64,

    /// Successful generations allowed per user per month (`0` = unlimited).
    pub monthly_request_limit: u32,

    /// Pricing configuration.
    pub pricing: PricingConfig,

    /// Fallback router tuning.
    pub router: RouterConfig,

    /// Circuit breaker tuning.
    pub breaker: BreakerConfig,

    /// Retry policy for ledger storage failures.
    pub ledger_retry: RetryPolicy,

    /// Provider credentials and endpoints.
    pub credentials: ProviderCredentials,

    /// Allowed models per request class.
    pub models: ModelCatalog,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Fallback router tuning.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Retry policy applied to transient errors on a single tier.
    pub retry: RetryPolicy,
    /// Timeout for one provider call.
    pub tier_timeout: Duration,
    /// Bound on the whole attempt chain for one request.
    pub deadline: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_millis(2000),
            },
            tier_timeout: Duration::from_secs(30),
            deadline: Duration::from_secs(90),
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Credential set selector carried by generation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum RevoVersion {
    /// Revo 1.0.
    V1_0,
    /// Revo 1.5.
    V1_5,
    /// Revo 2.0.
    #[default]
    V2_0,
}

impl RevoVersion {
    /// All versions in display order.
    pub const ALL: [Self; 3] = [Self::V1_0, Self::V1_5, Self::V2_0];

    /// Get the version as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::V1_0 => "1.0",
            Self::V1_5 => "1.5",
            Self::V2_0 => "2.0",
        }
    }

    const fn env_suffix(self) -> &'static str {
        match self {
            Self::V1_0 => "1_0",
            Self::V1_5 => "1_5",
            Self::V2_0 => "2_0",
        }
    }
}

impl fmt::Display for RevoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevoVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(Self::V1_0),
            "1.5" => Ok(Self::V1_5),
            "2.0" => Ok(Self::V2_0),
            other => Err(format!("unknown revo_version: {other}")),
        }
    }
}

/// Three Gemini credentials, tried in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GeminiKeys {
    /// Primary credential.
    #[serde(default)]
    pub primary: Option<String>,
    /// Secondary credential.
    #[serde(default)]
    pub secondary: Option<String>,
    /// Tertiary credential.
    #[serde(default)]
    pub tertiary: Option<String>,
}

/// Provider credentials and endpoints.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    /// Gemini keys per Revo version.
    pub gemini: HashMap<RevoVersion, GeminiKeys>,
    /// `OpenRouter` key for the cross-provider fallback.
    pub openrouter_api_key: Option<String>,
    /// Gemini API base URL.
    pub gemini_base_url: String,
    /// `OpenRouter` API base URL.
    pub openrouter_base_url: String,
}

impl Default for ProviderCredentials {
    fn default() -> Self {
        Self {
            gemini: HashMap::new(),
            openrouter_api_key: None,
            gemini_base_url: GEMINI_BASE_URL.into(),
            openrouter_base_url: OPENROUTER_BASE_URL.into(),
        }
    }
}

impl ProviderCredentials {
    /// Keys for a version (all empty when not configured).
    #[must_use]
    pub fn gemini_keys(&self, version: RevoVersion) -> GeminiKeys {
        self.gemini.get(&version).cloned().unwrap_or_default()
    }
}

/// Allowed models per request class.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    /// Models accepted on `/generate-image`; the first is the default.
    pub image: Vec<String>,
    /// Models accepted on `/generate-text`; the first is the default.
    pub text: Vec<String>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            image: vec!["gemini-2.5-flash-image-preview".into()],
            text: vec![
                "gemini-2.5-flash".into(),
                "gemini-2.5-flash-lite".into(),
                "gemini-1.5-pro".into(),
            ],
        }
    }
}

impl ModelCatalog {
    fn models(&self, class: RequestClass) -> &[String] {
        match class {
            RequestClass::Image => &self.image,
            RequestClass::Text => &self.text,
        }
    }

    /// Every allowed model, image models first.
    #[must_use]
    pub fn allowed(&self) -> Vec<String> {
        self.image.iter().chain(&self.text).cloned().collect()
    }

    /// Resolve the model for a request, defaulting when none was asked for.
    ///
    /// # Errors
    ///
    /// Returns a message listing the allowed models if the model is unknown.
    pub fn resolve(&self, class: RequestClass, requested: Option<&str>) -> Result<String, String> {
        let allowed = self.models(class);
        match requested {
            None => allowed
                .first()
                .cloned()
                .ok_or_else(|| format!("no {class} models configured")),
            Some(model) if allowed.iter().any(|m| m == model) => Ok(model.to_string()),
            Some(model) => Err(format!(
                "Model '{model}' not allowed. Allowed models: {}",
                allowed.join(", ")
            )),
        }
    }

    /// Model name used on `OpenRouter` for a Gemini model.
    #[must_use]
    pub fn openrouter_model(model: &str) -> String {
        format!("google/{model}")
    }
}

/// Provider secrets file structure.
#[derive(Debug, Default, Deserialize)]
struct ProviderSecrets {
    #[serde(default)]
    google_api_key: Option<String>,
    #[serde(default)]
    openrouter_api_key: Option<String>,
    /// Keys per Revo version, keyed by "1.0", "1.5", "2.0".
    #[serde(default)]
    revo: HashMap<String, GeminiKeys>,
}

/// Stripe secrets file structure.
#[derive(Debug, Deserialize)]
struct StripeSecrets {
    #[serde(default)]
    webhook_secret: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let router_defaults = defaults.router;
        let breaker_defaults = defaults.breaker;

        let mut pricing = PricingConfig::default();
        pricing.image_credits = env_parse("IMAGE_CREDITS", pricing.image_credits);
        pricing.text_credits = env_parse("TEXT_CREDITS", pricing.text_credits);

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            stripe_webhook_secret: load_stripe_secret(),
            stripe_webhook_tolerance_seconds: env_parse(
                "STRIPE_WEBHOOK_TOLERANCE_SECONDS",
                defaults.stripe_webhook_tolerance_seconds,
            ),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout_seconds: env_parse(
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            ),
            free_tier_credits: env_parse("FREE_TIER_CREDITS", defaults.free_tier_credits),
            monthly_request_limit: env_parse("MONTHLY_REQUEST_LIMIT", defaults.monthly_request_limit),
            pricing,
            router: RouterConfig {
                retry: RetryPolicy {
                    max_retries: env_parse("PROVIDER_MAX_RETRIES", router_defaults.retry.max_retries),
                    initial_backoff: env_millis(
                        "PROVIDER_INITIAL_BACKOFF_MS",
                        router_defaults.retry.initial_backoff,
                    ),
                    max_backoff: env_millis("PROVIDER_MAX_BACKOFF_MS", router_defaults.retry.max_backoff),
                },
                tier_timeout: env_millis("PROVIDER_TIER_TIMEOUT_MS", router_defaults.tier_timeout),
                deadline: env_millis("GENERATION_DEADLINE_MS", router_defaults.deadline),
            },
            breaker: BreakerConfig {
                failure_threshold: env_parse(
                    "BREAKER_FAILURE_THRESHOLD",
                    breaker_defaults.failure_threshold,
                ),
                cooldown: Duration::from_secs(env_parse(
                    "BREAKER_COOLDOWN_SECONDS",
                    breaker_defaults.cooldown.as_secs(),
                )),
            },
            ledger_retry: RetryPolicy {
                max_retries: env_parse("LEDGER_MAX_RETRIES", defaults.ledger_retry.max_retries),
                initial_backoff: env_millis(
                    "LEDGER_INITIAL_BACKOFF_MS",
                    defaults.ledger_retry.initial_backoff,
                ),
                max_backoff: env_millis("LEDGER_MAX_BACKOFF_MS", defaults.ledger_retry.max_backoff),
            },
            credentials: load_provider_credentials(),
            models: ModelCatalog::default(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map_or(default, Duration::from_millis)
}

const SECRET_DIRS: [&str; 3] = [".secrets", "nevis-gateway/.secrets", "../.secrets"];

/// Load provider credentials from file or environment.
fn load_provider_credentials() -> ProviderCredentials {
    let secrets = SECRET_DIRS
        .iter()
        .map(|dir| format!("{dir}/providers.json"))
        .find_map(|path| match load_secrets_file::<ProviderSecrets>(&path) {
            Ok(secrets) => {
                tracing::info!(path = %path, "Loaded provider secrets from file");
                Some(secrets)
            }
            Err(_) => None,
        });

    let mut credentials = ProviderCredentials {
        gemini_base_url: std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| GEMINI_BASE_URL.into()),
        openrouter_base_url: std::env::var("OPENROUTER_BASE_URL")
            .unwrap_or_else(|_| OPENROUTER_BASE_URL.into()),
        ..ProviderCredentials::default()
    };

    if let Some(secrets) = secrets {
        for version in RevoVersion::ALL {
            let mut keys = secrets.revo.get(version.as_str()).cloned().unwrap_or_default();
            if keys.primary.is_none() {
                keys.primary.clone_from(&secrets.google_api_key);
            }
            credentials.gemini.insert(version, keys);
        }
        credentials.openrouter_api_key = secrets.openrouter_api_key;
        return credentials;
    }

    // Fall back to environment variables
    tracing::debug!("Provider secrets file not found, using environment variables");
    let google_api_key = non_empty_env("GOOGLE_API_KEY");
    for version in RevoVersion::ALL {
        let suffix = version.env_suffix();
        let keys = GeminiKeys {
            primary: non_empty_env(&format!("GEMINI_API_KEY_REVO_{suffix}_PRIMARY"))
                .or_else(|| google_api_key.clone()),
            secondary: non_empty_env(&format!("GEMINI_API_KEY_REVO_{suffix}_SECONDARY")),
            tertiary: non_empty_env(&format!("GEMINI_API_KEY_REVO_{suffix}_TERTIARY")),
        };
        credentials.gemini.insert(version, keys);
    }
    credentials.openrouter_api_key = non_empty_env("OPENROUTER_API_KEY");
    credentials
}

/// Load the Stripe webhook secret from file or environment.
fn load_stripe_secret() -> Option<String> {
    for dir in &SECRET_DIRS {
        let path = format!("{dir}/stripe.json");
        if let Ok(secrets) = load_secrets_file::<StripeSecrets>(&path) {
            tracing::info!(path = %path, "Loaded Stripe secrets from file");
            return secrets.webhook_secret;
        }
    }

    tracing::debug!("Stripe secrets file not found, using environment variables");
    non_empty_env("STRIPE_WEBHOOK_SECRET")
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/nevis-gateway".into(),
            service_api_key: None,
            stripe_webhook_secret: None,
            stripe_webhook_tolerance_seconds: 300,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 120,
            free_tier_credits: DEFAULT_FREE_TIER_CREDITS,
            monthly_request_limit: DEFAULT_MONTHLY_REQUEST_LIMIT,
            pricing: PricingConfig::default(),
            router: RouterConfig::default(),
            breaker: BreakerConfig::default(),
            ledger_retry: RetryPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(1000),
            },
            credentials: ProviderCredentials::default(),
            models: ModelCatalog::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(30), Duration::from_millis(350));
    }

    #[test]
    fn revo_version_parses() {
        assert_eq!("1.5".parse::<RevoVersion>().unwrap(), RevoVersion::V1_5);
        assert!("3.0".parse::<RevoVersion>().is_err());
        assert_eq!(RevoVersion::default().as_str(), "2.0");
    }

    #[test]
    fn model_catalog_rejects_unknown_models() {
        let catalog = ModelCatalog::default();
        assert_eq!(
            catalog.resolve(RequestClass::Image, None).unwrap(),
            "gemini-2.5-flash-image-preview"
        );
        assert_eq!(
            catalog
                .resolve(RequestClass::Text, Some("gemini-1.5-pro"))
                .unwrap(),
            "gemini-1.5-pro"
        );
        let err = catalog
            .resolve(RequestClass::Text, Some("gpt-4o"))
            .unwrap_err();
        assert!(err.contains("not allowed"));
        assert!(catalog
            .resolve(RequestClass::Image, Some("gemini-2.5-flash"))
            .is_err());
    }

    #[test]
    fn secrets_file_shape() {
        let json = r#"{
            "google_api_key": "g",
            "openrouter_api_key": "or",
            "revo": { "1.5": { "secondary": "s15" } }
        }"#;
        let secrets: ProviderSecrets = serde_json::from_str(json).unwrap();
        assert_eq!(secrets.revo["1.5"].secondary.as_deref(), Some("s15"));
        assert_eq!(secrets.openrouter_api_key.as_deref(), Some("or"));
    }
}
