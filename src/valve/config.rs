use crate::env;
use crate::lock::ContentionPolicy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::error;

/// Settings for [`PersistentValve`](super::PersistentValve), fixed once the valve is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValveConfig {
    /// Regex matched against the whole decoded path; matching requests skip
    /// session handling entirely
    pub bypass_filter: Option<String>,
    /// Grant a contended session to waiters in arrival order
    pub lock_fairness: bool,
    /// Wait for a contended session instead of rejecting the request
    pub block_on_contention: bool,
    /// Let request cancellation abort the wait (only used when blocking)
    pub interruptible_wait: bool,
    /// Status sent when a request is refused the session
    pub rejection_status: u16,
    /// Persist sessions created by requests that arrived without one
    pub persist_new_sessions: bool,
    /// Seconds between sweeps that drop expired sessions from the working
    /// set (0 disables the background sweep)
    pub expiry_sweep_interval_secs: u64,
}

impl Default for ValveConfig {
    fn default() -> Self {
        Self {
            bypass_filter: None,
            lock_fairness: true,
            block_on_contention: true,
            interruptible_wait: true,
            rejection_status: env::valve::DEFAULT_REJECTION_STATUS,
            persist_new_sessions: false,
            expiry_sweep_interval_secs: env::valve::DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS,
        }
    }
}

impl ValveConfig {
    /// Sweep period, `None` when the sweep is disabled
    pub fn expiry_sweep_interval(&self) -> Option<Duration> {
        (self.expiry_sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.expiry_sweep_interval_secs))
    }

    pub fn contention_policy(&self) -> ContentionPolicy {
        ContentionPolicy::from_flags(self.block_on_contention, self.interruptible_wait)
    }

    /// Compile the bypass filter, logging and ignoring a malformed pattern
    pub fn bypass_filter(&self) -> Option<BypassFilter> {
        match BypassFilter::compile(self.bypass_filter.as_deref()) {
            Ok(filter) => filter,
            Err(e) => {
                error!("Bypass filter disabled: {}", e);
                None
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

/// Compiled bypass pattern. A path is bypassed only when the pattern matches
/// all of it, not just a substring.
#[derive(Debug, Clone)]
pub struct BypassFilter {
    source: String,
    regex: Regex,
}

impl BypassFilter {
    /// Compile `pattern`. `None` or an empty pattern means no filter.
    pub fn compile(pattern: Option<&str>) -> Result<Option<Self>, ConfigError> {
        let Some(pattern) = pattern.filter(|p| !p.is_empty()) else {
            return Ok(None);
        };

        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| {
            ConfigError::MalformedFilter {
                pattern: pattern.to_string(),
                source,
            }
        })?;

        Ok(Some(Self {
            source: pattern.to_string(),
            regex,
        }))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The bypass pattern is not a valid regex
    #[error("Malformed bypass filter {pattern:?}: {source}")]
    MalformedFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML could not be parsed
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML could not be produced
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
