//! # DHT Configuration
//!
//! Policy constants for routing, lookups and record lifetimes. Every field has
//! a default; a TOML file may override any subset, environment variables
//! override the file, and CLI flags override both.
//!
//! ```toml
//! k = 20
//! alpha = 3
//! provider_ttl_secs = 172800
//! reprovide_interval_secs = 79200
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Bucket size and lookup result width.
    pub k: usize,
    /// Concurrent queries per lookup round.
    pub alpha: usize,
    pub query_timeout_ms: u64,
    /// Extra attempts per peer after a timeout or transport failure.
    pub query_retries: u32,
    /// Liveness check of a full bucket's oldest entry.
    pub ping_timeout_ms: u64,
    /// Hard deadline for one whole lookup.
    pub lookup_timeout_ms: u64,
    pub max_rounds: usize,
    pub provider_ttl_secs: u64,
    /// Must stay below `provider_ttl_secs` or announcements lapse.
    pub reprovide_interval_secs: u64,
    pub max_providers_per_key: usize,
    /// Distinct content ids a node holds provider records for.
    pub max_provider_keys: usize,
    pub peer_record_ttl_secs: u64,
    pub max_peer_records: usize,
    pub max_name_records: usize,
    pub prune_interval_secs: u64,
    pub bucket_refresh_interval_secs: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            query_timeout_ms: 3_000,
            query_retries: 0,
            ping_timeout_ms: 1_000,
            lookup_timeout_ms: 30_000,
            max_rounds: 20,
            provider_ttl_secs: 48 * 60 * 60,
            reprovide_interval_secs: 22 * 60 * 60,
            max_providers_per_key: 20,
            max_provider_keys: 100_000,
            peer_record_ttl_secs: 24 * 60 * 60,
            max_peer_records: 10_000,
            max_name_records: 10_000,
            prune_interval_secs: 60,
            bucket_refresh_interval_secs: 30 * 60,
        }
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl DhtConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `KADROUTE_<FIELD>` environment variables, e.g.
    /// `KADROUTE_K` or `KADROUTE_LOOKUP_TIMEOUT_MS`.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with an
    /// arbitrary variable source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        macro_rules! overrides {
            ($config:ident, $lookup:ident; $($field:ident => $key:literal),+ $(,)?) => {
                $(
                    if let Some(raw) = $lookup($key) {
                        $config.$field = parse_override($key, &raw)?;
                    }
                )+
            };
        }

        overrides! {
            self, lookup;
            k => "KADROUTE_K",
            alpha => "KADROUTE_ALPHA",
            query_timeout_ms => "KADROUTE_QUERY_TIMEOUT_MS",
            query_retries => "KADROUTE_QUERY_RETRIES",
            ping_timeout_ms => "KADROUTE_PING_TIMEOUT_MS",
            lookup_timeout_ms => "KADROUTE_LOOKUP_TIMEOUT_MS",
            max_rounds => "KADROUTE_MAX_ROUNDS",
            provider_ttl_secs => "KADROUTE_PROVIDER_TTL_SECS",
            reprovide_interval_secs => "KADROUTE_REPROVIDE_INTERVAL_SECS",
            max_providers_per_key => "KADROUTE_MAX_PROVIDERS_PER_KEY",
            max_provider_keys => "KADROUTE_MAX_PROVIDER_KEYS",
            peer_record_ttl_secs => "KADROUTE_PEER_RECORD_TTL_SECS",
            max_peer_records => "KADROUTE_MAX_PEER_RECORDS",
            max_name_records => "KADROUTE_MAX_NAME_RECORDS",
            prune_interval_secs => "KADROUTE_PRUNE_INTERVAL_SECS",
            bucket_refresh_interval_secs => "KADROUTE_BUCKET_REFRESH_INTERVAL_SECS",
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, reason: &str| {
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.k == 0 {
            return invalid("k", "must be at least 1");
        }
        if self.alpha == 0 {
            return invalid("alpha", "must be at least 1");
        }
        if self.query_timeout_ms == 0 {
            return invalid("query_timeout_ms", "must be positive");
        }
        if self.ping_timeout_ms == 0 {
            return invalid("ping_timeout_ms", "must be positive");
        }
        if self.lookup_timeout_ms == 0 {
            return invalid("lookup_timeout_ms", "must be positive");
        }
        if self.max_rounds == 0 {
            return invalid("max_rounds", "must be at least 1");
        }
        for (key, value) in [
            ("max_providers_per_key", self.max_providers_per_key),
            ("max_provider_keys", self.max_provider_keys),
            ("max_peer_records", self.max_peer_records),
            ("max_name_records", self.max_name_records),
        ] {
            if value == 0 {
                return invalid(key, "must be at least 1");
            }
        }
        if self.peer_record_ttl_secs == 0 {
            return invalid("peer_record_ttl_secs", "must be positive");
        }
        if self.reprovide_interval_secs >= self.provider_ttl_secs {
            return invalid(
                "reprovide_interval_secs",
                "must be shorter than provider_ttl_secs",
            );
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn provider_ttl(&self) -> Duration {
        Duration::from_secs(self.provider_ttl_secs)
    }

    pub fn reprovide_interval(&self) -> Duration {
        Duration::from_secs(self.reprovide_interval_secs)
    }

    pub fn peer_record_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_record_ttl_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn bucket_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.bucket_refresh_interval_secs)
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            provider_ttl: self.provider_ttl(),
            max_providers_per_key: self.max_providers_per_key,
            max_provider_keys: self.max_provider_keys,
            peer_record_ttl: self.peer_record_ttl(),
            max_peer_records: self.max_peer_records,
            max_name_records: self.max_name_records,
        }
    }
}
