use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Final, merged runtime configuration used by the executor layer.
///
/// Merge order: defaults < environment < explicit patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Optional outbound proxy for upstream egress.
    pub outbound_proxy: Option<String>,
    /// Per-request upstream timeout in seconds. Zero disables the timeout
    /// (streaming responses may legitimately run for a long time).
    pub request_timeout_secs: u64,
    /// Sliding-window admission limit applied by rate-limited providers.
    pub rate_limit_per_minute: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            outbound_proxy: None,
            request_timeout_secs: 0,
            rate_limit_per_minute: 60,
        }
    }
}

/// Optional layer used for merging runtime config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPatch {
    pub outbound_proxy: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub rate_limit_per_minute: Option<usize>,
}

impl ConfigPatch {
    pub fn overlay(&mut self, other: ConfigPatch) {
        if other.outbound_proxy.is_some() {
            self.outbound_proxy = other.outbound_proxy;
        }
        if other.request_timeout_secs.is_some() {
            self.request_timeout_secs = other.request_timeout_secs;
        }
        if other.rate_limit_per_minute.is_some() {
            self.rate_limit_per_minute = other.rate_limit_per_minute;
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut patch = Self::default();
        if let Ok(value) = std::env::var("MPROXY_PROXY") {
            let value = value.trim().to_string();
            if !value.is_empty() {
                patch.outbound_proxy = Some(value);
            }
        }
        if let Ok(value) = std::env::var("MPROXY_REQUEST_TIMEOUT_SECS") {
            patch.request_timeout_secs =
                Some(parse_env("MPROXY_REQUEST_TIMEOUT_SECS", &value)?);
        }
        if let Ok(value) = std::env::var("MPROXY_RATE_LIMIT_PER_MINUTE") {
            patch.rate_limit_per_minute =
                Some(parse_env("MPROXY_RATE_LIMIT_PER_MINUTE", &value)?);
        }
        Ok(patch)
    }

    pub fn into_config(self) -> Config {
        let defaults = Config::default();
        Config {
            outbound_proxy: self.outbound_proxy,
            request_timeout_secs: self
                .request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
            rate_limit_per_minute: self
                .rate_limit_per_minute
                .unwrap_or(defaults.rate_limit_per_minute),
        }
    }
}

impl From<Config> for ConfigPatch {
    fn from(value: Config) -> Self {
        Self {
            outbound_proxy: value.outbound_proxy,
            request_timeout_secs: Some(value.request_timeout_secs),
            rate_limit_per_minute: Some(value.rate_limit_per_minute),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
