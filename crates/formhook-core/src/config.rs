use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix used by [`AppConfig::load`].
pub const ENV_PREFIX: &str = "FORMHOOK";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub delivery: DeliveryConfig,
    pub retry: RetryDefaults,
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env(ENV_PREFIX)
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Self::defaults(Config::builder())?.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load configuration from a file with environment overrides.
    ///
    /// A missing file is not an error; the defaults and environment still apply.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let builder = Self::defaults(Config::builder())?
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    fn defaults(
        builder: ConfigBuilder<DefaultState>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        builder
            .set_default("http.timeout_seconds", default_timeout_seconds())?
            .set_default("http.user_agent", default_user_agent())?
            .set_default("delivery.require_signature", false)?
            .set_default(
                "delivery.max_response_body_bytes",
                default_max_response_body_bytes() as u64,
            )?
            .set_default("retry.max_retries", default_max_retries())?
            .set_default("retry.backoff_multiplier", default_backoff_multiplier())?
            .set_default("retry.initial_delay_ms", default_initial_delay_ms())?
            .set_default("retry.max_delay_ms", default_max_delay_ms())?
            .set_default("storage.webhooks_key", default_webhooks_key())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            delivery: DeliveryConfig::default(),
            retry: RetryDefaults::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Outbound HTTP client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("formhook-webhook/{}", env!("CARGO_PKG_VERSION"))
}

/// Delivery behaviour shared by every webhook
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Refuse to send unsigned payloads; configs without a secret fail immediately
    #[serde(default)]
    pub require_signature: bool,
    /// Response bodies longer than this are truncated before they are recorded
    #[serde(default = "default_max_response_body_bytes")]
    pub max_response_body_bytes: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            require_signature: false,
            max_response_body_bytes: default_max_response_body_bytes(),
        }
    }
}

fn default_max_response_body_bytes() -> usize {
    4096
}

/// Retry policy applied to webhooks that do not carry their own
#[derive(Debug, Clone, Deserialize)]
pub struct RetryDefaults {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_multiplier: default_backoff_multiplier(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// JSON document backing the key-value store; in-memory when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Key under which the webhook configuration set is stored
    #[serde(default = "default_webhooks_key")]
    pub webhooks_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            webhooks_key: default_webhooks_key(),
        }
    }
}

fn default_webhooks_key() -> String {
    "webhooks".to_string()
}
