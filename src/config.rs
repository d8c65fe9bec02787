//! Configuration management for Tollgate.
//!
//! Configuration is read once at startup and handed to constructors
//! explicitly. It can come from a YAML file, from `TOLLGATE__`-prefixed
//! environment variables (`TOLLGATE__STORE__TIMEOUT_MS=40`), or both, with
//! the environment taking precedence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TollgateError};
use crate::fastpath::MarkerCodec;
use crate::quota::{EngineOptions, QuotaPolicy};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Environment override for the marker secret, read as a raw string.
pub const ENV_MARKER_SECRET: &str = "TOLLGATE__MARKER__SECRET";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Quota algorithm and parameters
    #[serde(default)]
    pub policy: QuotaPolicy,

    /// State store access
    #[serde(default)]
    pub store: StoreConfig,

    /// Fast-path marker settings
    #[serde(default)]
    pub marker: MarkerConfig,

    /// Where the client's session id is found
    #[serde(default)]
    pub session: SessionConfig,
}

/// State store access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Timeout for a single store call in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,

    /// Decide cycles attempted on write contention before failing open
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lifetime of a quota record after its last write, in seconds
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_store_timeout_ms(),
            max_attempts: default_max_attempts(),
            record_ttl_secs: default_record_ttl_secs(),
        }
    }
}

impl StoreConfig {
    /// Engine tuning derived from this configuration.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_attempts: self.max_attempts,
            store_timeout: Duration::from_millis(self.timeout_ms),
            record_ttl: Duration::from_secs(self.record_ttl_secs),
        }
    }
}

fn default_store_timeout_ms() -> u64 {
    25
}

fn default_max_attempts() -> u32 {
    3
}

fn default_record_ttl_secs() -> u64 {
    24 * 60 * 60
}

/// Fast-path marker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerConfig {
    /// Cookie carrying the marker
    #[serde(default = "default_marker_cookie")]
    pub cookie_name: String,

    /// Hex-encoded HMAC key shared by all edge nodes
    #[serde(default)]
    pub secret: Option<String>,

    /// Longest block a single marker may carry, in seconds
    #[serde(default = "default_max_block_secs")]
    pub max_block_secs: u64,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_marker_cookie(),
            secret: None,
            max_block_secs: default_max_block_secs(),
        }
    }
}

impl MarkerConfig {
    /// Build the marker codec, generating a key when none is configured.
    pub fn codec(&self) -> Result<MarkerCodec> {
        match &self.secret {
            Some(secret) => MarkerCodec::from_hex(secret),
            None => {
                warn!("No marker secret configured, markers will only be honoured by this process");
                MarkerCodec::random()
            }
        }
    }
}

fn default_marker_cookie() -> String {
    "over-limit".to_string()
}

fn default_max_block_secs() -> u64 {
    3600
}

/// Session identification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Cookie holding the session id
    #[serde(default = "default_session_cookie")]
    pub cookie_name: String,

    /// Header the viewer hop copies the session id into
    #[serde(default = "default_session_header")]
    pub header_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_session_cookie(),
            header_name: default_session_header(),
        }
    }
}

fn default_session_cookie() -> String {
    "session-id".to_string()
}

fn default_session_header() -> String {
    "rate-limit-session-id".to_string()
}

/// Whether `name` can be used as a cookie name.
fn is_cookie_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b))
}

impl TollgateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file overlaid with
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        // Numeric parsing would turn an all-digit hex secret into an integer
        // and drop its leading zeros.
        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("marker.secret", std::env::var(ENV_MARKER_SECRET).ok())?
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;

        if self.store.max_attempts == 0 {
            return Err(TollgateError::Config("store.max_attempts must be positive".into()));
        }
        if self.store.timeout_ms == 0 {
            return Err(TollgateError::Config("store.timeout_ms must be positive".into()));
        }
        if self.store.record_ttl_secs == 0 {
            return Err(TollgateError::Config("store.record_ttl_secs must be positive".into()));
        }
        if self.marker.max_block_secs == 0 {
            return Err(TollgateError::Config("marker.max_block_secs must be positive".into()));
        }
        if let Some(secret) = &self.marker.secret {
            MarkerCodec::from_hex(secret)?;
        }

        for (field, name) in [
            ("marker.cookie_name", &self.marker.cookie_name),
            ("session.cookie_name", &self.session.cookie_name),
        ] {
            if !is_cookie_token(name) {
                return Err(TollgateError::Config(format!(
                    "{} is not a valid cookie name: {:?}",
                    field, name
                )));
            }
        }
        if self.session.header_name.trim().is_empty() {
            return Err(TollgateError::Config("session.header_name must not be empty".into()));
        }

        Ok(())
    }
}
