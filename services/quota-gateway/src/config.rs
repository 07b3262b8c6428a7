//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are loaded from the QUOTA_API_KEYS env var or `pool.keys_file`,
//! never stored in the TOML directly to avoid leaking secrets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use downstream::CredentialLocation;
use key_pool::QuotaPolicy;
use key_pool::executor::DEFAULT_MAX_ATTEMPTS;
use key_pool::quota::{DEFAULT_DAILY_LIMIT, DEFAULT_ERROR_THRESHOLD, DEFAULT_SOFT_CEILING};
use serde::Deserialize;

/// Env var holding comma-separated API keys.
pub const KEYS_ENV: &str = "QUOTA_API_KEYS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub downstream: DownstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub costs: CostTable,
    /// Resolved from QUOTA_API_KEYS or `pool.keys_file`.
    #[serde(skip)]
    pub keys: Vec<Secret<String>>,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin endpoints are only served when this is set.
    #[serde(default)]
    pub admin_listen_addr: Option<SocketAddr>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// The API the keys belong to
#[derive(Debug, Deserialize)]
pub struct DownstreamConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub credential_location: CredentialLocation,
    #[serde(default = "default_credential_name")]
    pub credential_name: String,
}

/// Quota accounting and failover knobs
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub daily_limit: u64,
    pub soft_ceiling: f64,
    pub error_threshold: u32,
    pub max_attempts: u32,
    /// Seconds between background reset checks; 0 disables the ticker.
    pub reset_check_secs: u64,
    /// One key per line; blank lines and `#` comments are ignored.
    pub keys_file: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            soft_ceiling: DEFAULT_SOFT_CEILING,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reset_check_secs: 60,
            keys_file: None,
        }
    }
}

impl PoolConfig {
    pub fn policy(&self) -> QuotaPolicy {
        QuotaPolicy::new(self.daily_limit, self.soft_ceiling, self.error_threshold)
    }

    /// `None` when the background ticker is disabled.
    pub fn reset_interval(&self) -> Option<Duration> {
        (self.reset_check_secs > 0).then(|| Duration::from_secs(self.reset_check_secs))
    }
}

/// Quota cost per endpoint. The `default` entry covers unlisted endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct CostTable(HashMap<String, u64>);

impl CostTable {
    /// Units charged for `endpoint` when the caller gives no estimate.
    pub fn units_for(&self, endpoint: &str) -> u64 {
        let endpoint = endpoint.trim_matches('/');
        self.0
            .get(endpoint)
            .or_else(|| self.0.get("default"))
            .copied()
            .unwrap_or(1)
    }

    /// Metric label for `endpoint`: the matching table key, or `other`.
    /// Caller-supplied paths never become label values directly.
    pub fn metric_label(&self, endpoint: &str) -> &str {
        let endpoint = endpoint.trim_matches('/');
        self.0
            .get_key_value(endpoint)
            .map_or("other", |(key, _)| key.as_str())
    }
}

fn default_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1000
}

fn default_credential_name() -> String {
    "key".to_string()
}

impl Config {
    /// Load configuration from a TOML file, then resolve API keys.
    ///
    /// Key resolution order:
    /// 1. QUOTA_API_KEYS env var
    /// 2. keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.keys = resolve_keys(config.pool.keys_file.as_deref())?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let url = &self.downstream.base_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {url}"
            )));
        }

        let zero_checks = [
            ("downstream.timeout_secs", self.downstream.timeout_secs == 0),
            ("server.max_connections", self.server.max_connections == 0),
            ("pool.daily_limit", self.pool.daily_limit == 0),
            ("pool.error_threshold", self.pool.error_threshold == 0),
            ("pool.max_attempts", self.pool.max_attempts == 0),
        ];
        if let Some((name, _)) = zero_checks.iter().find(|(_, is_zero)| *is_zero) {
            return Err(common::Error::Config(format!(
                "{name} must be greater than 0"
            )));
        }

        let ceiling = self.pool.soft_ceiling;
        if !(ceiling > 0.0 && ceiling <= 1.0) {
            return Err(common::Error::Config(format!(
                "pool.soft_ceiling must be in (0, 1], got: {ceiling}"
            )));
        }

        if self.downstream.credential_name.trim().is_empty() {
            return Err(common::Error::Config(
                "downstream.credential_name must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("quota-gateway.toml")
    }
}

fn resolve_keys(keys_file: Option<&Path>) -> common::Result<Vec<Secret<String>>> {
    let raw: Vec<String> = if let Ok(value) = std::env::var(KEYS_ENV) {
        value
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_owned)
            .collect()
    } else if let Some(path) = keys_file {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            common::Error::Credentials(format!(
                "failed to read keys_file {}: {e}",
                path.display()
            ))
        })?;
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
            .collect()
    } else {
        Vec::new()
    };

    if raw.is_empty() {
        return Err(common::Error::Credentials(format!(
            "no API keys configured: set {KEYS_ENV} or pool.keys_file"
        )));
    }

    let mut keys: Vec<Secret<String>> = Vec::with_capacity(raw.len());
    for key in raw {
        let secret = Secret::new(key);
        if keys.iter().any(|k| k.expose() == secret.expose()) {
            return Err(common::Error::Credentials(format!(
                "duplicate API key {}",
                secret.redacted()
            )));
        }
        keys.push(secret);
    }
    Ok(keys)
}
