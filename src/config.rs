//! Startup configuration, loaded from environment variables.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `HANDLERS_NAMESPACE` | `""` | metric namespace |
//! | `HANDLERS_SUBSYSTEM` | `""` | metric subsystem |
//! | `HANDLERS_DURATION_BUCKETS` | see [`DEFAULT_BUCKETS`] | comma-separated histogram bounds, milliseconds |
//! | `HANDLERS_AUTHORIZATION_KEY` | `is_admin` | context key read by [`Authorize`](crate::middleware::Authorize) |
//!
//! Unset variables fall back to the default. A set but malformed variable is
//! an error: configuration is validated once, before anything is registered.

use std::env;

use crate::middleware::authorize::DEFAULT_KEY;
use crate::registry::DEFAULT_BUCKETS;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: `{value}` is not a number")]
    NotANumber { var: &'static str, value: String },
    #[error("{var}: buckets must be finite and strictly increasing")]
    UnorderedBuckets { var: &'static str },
    #[error("{var}: must not be empty")]
    Empty { var: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub namespace: String,
    pub subsystem: String,
    /// Upper bounds of the duration histogram, in milliseconds.
    pub duration_buckets: Vec<f64>,
    /// Context key holding the authorization flag.
    pub authorization_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            subsystem: String::new(),
            duration_buckets: DEFAULT_BUCKETS.to_vec(),
            authorization_key: DEFAULT_KEY.to_owned(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ns) = lookup("HANDLERS_NAMESPACE") {
            config.namespace = ns;
        }
        if let Some(ss) = lookup("HANDLERS_SUBSYSTEM") {
            config.subsystem = ss;
        }
        if let Some(raw) = lookup("HANDLERS_DURATION_BUCKETS") {
            config.duration_buckets = parse_buckets("HANDLERS_DURATION_BUCKETS", &raw)?;
        }
        if let Some(key) = lookup("HANDLERS_AUTHORIZATION_KEY") {
            if key.trim().is_empty() {
                return Err(ConfigError::Empty { var: "HANDLERS_AUTHORIZATION_KEY" });
            }
            config.authorization_key = key;
        }

        Ok(config)
    }
}

fn parse_buckets(var: &'static str, raw: &str) -> Result<Vec<f64>, ConfigError> {
    let buckets = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().map_err(|_| ConfigError::NotANumber { var, value: s.to_owned() }))
        .collect::<Result<Vec<_>, _>>()?;

    if buckets.is_empty() {
        return Err(ConfigError::Empty { var });
    }
    if buckets.iter().any(|b| !b.is_finite()) || buckets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ConfigError::UnorderedBuckets { var });
    }
    Ok(buckets)
}
