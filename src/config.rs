//! Configuration types for tvcache

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{Result, TvError};

/// Upstream listing walked by the capture trigger, live matches included
pub const DEFAULT_FIND_PATH: &str = "/find/any?dummy=0";

/// Default limit on one upstream call
pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port the emulated upstream surface listens on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Directory holding captured replays
    pub data_dir: PathBuf,
    /// Upstream replay service
    pub upstream: UpstreamConfig,
    /// Live capture settings
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Cache manifest listing settings
    #[serde(default)]
    pub listing: ListingConfig,
    /// Event index settings
    #[serde(default)]
    pub event_index: EventIndexConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_listen_port() -> u16 {
    8080
}

/// Transport spoken to upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain HTTP
    #[default]
    Http,
    /// HTTP over TLS
    Https,
}

impl Scheme {
    /// URI scheme text
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Port used when none is configured
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// Upstream endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream host name
    pub host: String,
    /// `http` or `https`
    #[serde(default)]
    pub scheme: Scheme,
    /// Upstream port; the scheme's port when unset
    #[serde(default)]
    pub port: Option<u16>,
    /// Skip certificate verification for `https` upstreams
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// User-Agent presented to upstream
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Connect-and-headers timeout for a single upstream call
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_upstream_timeout_ms() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT_MS
}

impl UpstreamConfig {
    /// Plain HTTP upstream at `host:port` with default settings
    #[must_use]
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            scheme: Scheme::Http,
            port: Some(port),
            accept_invalid_certs: false,
            user_agent: None,
            timeout_ms: DEFAULT_UPSTREAM_TIMEOUT_MS,
        }
    }

    /// Effective port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// Timeout as a [`Duration`]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Live capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Upstream listing the trigger walks
    pub find_path: String,
    /// Sleep between attempts at an unavailable chunk
    pub retry_backoff_ms: u64,
    /// Time without a successful chunk after which a live replay counts as finished
    pub idle_timeout_secs: u64,
    /// Period of the in-server trigger; 0 disables it
    pub trigger_interval_secs: u64,
    /// Origin written into the package tag line
    pub origin_tag: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            find_path: DEFAULT_FIND_PATH.to_string(),
            retry_backoff_ms: 10_000,
            idle_timeout_secs: 300,
            trigger_interval_secs: 0,
            origin_tag: "tvcache".to_string(),
        }
    }
}

impl CaptureConfig {
    /// Retry backoff as a [`Duration`]
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Idle ceiling as a [`Duration`]
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Cache manifest listing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// Entries per page when the client passes `offset`
    pub page_size: usize,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self { page_size: 50 }
    }
}

/// Scope cleared by an event index rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexScope {
    /// Every rebuild replaces the whole index
    #[default]
    Single,
    /// A rebuild replaces only the entries of its own replay
    PerReplay,
}

/// Event index configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventIndexConfig {
    /// Rebuild scope
    #[serde(default)]
    pub scope: IndexScope,
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent client connections
    pub max_connections: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 4096,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TvError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TvError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.upstream.host.is_empty() {
            return Err(TvError::ConfigError(
                "upstream.host cannot be empty".to_string(),
            ));
        }

        if self.upstream.port == Some(0) {
            return Err(TvError::ConfigError(
                "upstream.port cannot be 0".to_string(),
            ));
        }

        if self.listen_port == 0 {
            return Err(TvError::ConfigError("listen_port cannot be 0".to_string()));
        }

        if !self.capture.find_path.starts_with('/') {
            return Err(TvError::ConfigError(format!(
                "capture.find_path must start with '/': {}",
                self.capture.find_path
            )));
        }

        if self.capture.idle_timeout_secs == 0 {
            return Err(TvError::ConfigError(
                "capture.idle_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.capture.origin_tag.contains('\n') {
            return Err(TvError::ConfigError(
                "capture.origin_tag must be a single line".to_string(),
            ));
        }

        if self.listing.page_size == 0 {
            return Err(TvError::ConfigError(
                "listing.page_size must be > 0".to_string(),
            ));
        }

        if self.limits.max_connections == 0 {
            return Err(TvError::ConfigError(
                "limits.max_connections must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
