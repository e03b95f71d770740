//! Engine configuration loaded through figment.
//!
//! Sources are merged in precedence order (later sources override earlier ones):
//! 1. Default values (hardcoded)
//! 2. An optional configuration file (TOML, YAML or JSON by extension)
//! 3. Environment variables with the `SPECFIELD_` prefix

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Prefix for environment variable overrides, e.g. `SPECFIELD_CACHE_TTL_SECS`.
pub const ENV_PREFIX: &str = "SPECFIELD_";

/// Baseline TTL for cached store reads.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
/// Baseline TTL for generated form schemas.
pub const DEFAULT_SCHEMA_CACHE_TTL_SECS: u64 = 300;
/// Longest conditional dependency chain accepted at registration.
pub const DEFAULT_MAX_CONDITIONAL_DEPTH: usize = 5;

/// Tunables for the registry, caches and validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache_ttl_secs: u64,
    pub schema_cache_ttl_secs: u64,
    pub max_conditional_depth: usize,
    /// Reject field keys that do not match `^[a-zA-Z][a-zA-Z0-9_]*$`.
    pub enforce_key_pattern: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            schema_cache_ttl_secs: DEFAULT_SCHEMA_CACHE_TTL_SECS,
            max_conditional_depth: DEFAULT_MAX_CONDITIONAL_DEPTH,
            enforce_key_pattern: true,
        }
    }
}

impl EngineConfig {
    /// Load from defaults and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::extract(Self::figment(None))
    }

    /// Load from defaults, the given file, then environment variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::extract(Self::figment(Some(path)))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn schema_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.schema_cache_ttl_secs)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(EngineConfig::default()));

        if let Some(path) = path {
            debug!(path = %path.display(), "loading engine configuration file");
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }

        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: EngineConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "cache_ttl_secs".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.schema_cache_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "schema_cache_ttl_secs".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.max_conditional_depth == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_conditional_depth".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
