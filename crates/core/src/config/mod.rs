//! Cache configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (REQCACHE_*, nested keys split on `__`)
//! 2. TOML config file (if REQCACHE_CONFIG_FILE set)
//! 3. Built-in defaults
//!
//! Callback settings (`filter_fn`, `key_fn`) cannot be expressed here and are
//! set on [`CacheSettings`] in code.

use std::collections::BTreeSet;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use http::Method;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::backends::sqlite::SqliteOptions;
use crate::policy::{CacheSettings, ExpireAfter, MatchHeaders, StaleSetting, UrlExpiration};

mod validation;

pub use validation::ConfigError;

const ENV_PREFIX: &str = "REQCACHE_";
const CONFIG_FILE_VAR: &str = "REQCACHE_CONFIG_FILE";

/// One entry of `urls_expire_after`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlPattern {
    pub pattern: String,
    pub expire_after: ExpireAfter,
}

/// Cache configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (REQCACHE_*)
/// 2. TOML config file (if REQCACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// File, directory, namespace or table name, depending on the backend.
    pub cache_name: String,

    /// Backend alias. Unset means SQLite, falling back to memory.
    pub backend: Option<String>,

    /// Serializer name. Unset means the backend's default.
    pub serializer: Option<String>,

    /// Store JSON and text bodies decoded, so they are readable in the backend.
    pub decode_content: bool,

    /// Key for the signing stage of `safe_json`.
    pub secret_key: Option<String>,

    pub expire_after: ExpireAfter,
    pub urls_expire_after: Vec<UrlPattern>,
    pub allowable_codes: Vec<u16>,
    pub allowable_methods: Vec<String>,
    pub always_revalidate: bool,
    pub cache_control: bool,
    pub disabled: bool,
    pub ignored_parameters: Vec<String>,
    pub match_headers: MatchHeaders,
    pub only_if_cached: bool,
    pub stale_if_error: StaleSetting,
    pub stale_while_revalidate: StaleSetting,
    pub verify: bool,

    pub sqlite: SqliteConfig,
    pub filesystem: FilesystemConfig,
    pub redis: RedisConfig,
    pub mongodb: MongoConfig,
    pub dynamodb: DynamoConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_name: "http_cache".into(),
            backend: None,
            serializer: None,
            decode_content: true,
            secret_key: None,
            expire_after: ExpireAfter::Never,
            urls_expire_after: Vec::new(),
            allowable_codes: vec![200],
            allowable_methods: vec!["GET".into(), "HEAD".into()],
            always_revalidate: false,
            cache_control: false,
            disabled: false,
            ignored_parameters: Vec::new(),
            match_headers: MatchHeaders::Disabled,
            only_if_cached: false,
            stale_if_error: StaleSetting::Disabled,
            stale_while_revalidate: StaleSetting::Disabled,
            verify: true,
            sqlite: SqliteConfig::default(),
            filesystem: FilesystemConfig::default(),
            redis: RedisConfig::default(),
            mongodb: MongoConfig::default(),
            dynamodb: DynamoConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Put relative database paths under the system temp directory.
    pub use_temp: bool,
    pub wal: bool,
    pub fast_save: bool,
    pub busy_retries: u32,
    pub busy_sleep_ms: u64,
    pub timeout_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self { use_temp: false, wal: false, fast_save: false, busy_retries: 3, busy_sleep_ms: 100, timeout_ms: 30_000 }
    }
}

impl SqliteConfig {
    pub fn options(&self) -> SqliteOptions {
        SqliteOptions {
            wal: self.wal,
            fast_save: self.fast_save,
            busy_retries: self.busy_retries,
            busy_sleep: Duration::from_millis(self.busy_sleep_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    pub use_temp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Set a native TTL on each key.
    pub ttl: bool,
    /// Seconds added to the response's own remaining lifetime.
    pub ttl_offset: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: "redis://127.0.0.1:6379".into(), ttl: true, ttl_offset: 3600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    pub url: String,
    /// Create a TTL index on `expires`.
    pub ttl: bool,
    /// Seconds after `expires` before the server deletes a document.
    pub ttl_offset: u64,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self { url: "mongodb://localhost:27017".into(), ttl: false, ttl_offset: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamoConfig {
    pub region: Option<String>,
    /// Endpoint override, for local DynamoDB.
    pub endpoint_url: Option<String>,
    pub ttl: bool,
    pub ttl_offset: i64,
    pub create_table: bool,
}

impl Default for DynamoConfig {
    fn default() -> Self {
        Self { region: None, endpoint_url: None, ttl: true, ttl_offset: 3600, create_table: true }
    }
}

impl CacheConfig {
    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `REQCACHE_`
    /// 2. TOML file from `REQCACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var(CONFIG_FILE_VAR) {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed(ENV_PREFIX)
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        Self::from_figment(figment)
    }

    /// Extract and validate from an already-layered figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document layered over the defaults.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::from(Serialized::defaults(Self::default())).merge(Toml::string(toml)))
    }
}

impl CacheSettings {
    /// Runtime settings from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration does not validate.
    pub fn from_config(config: &CacheConfig) -> Result<Self, Error> {
        config.validate()?;
        let allowable_methods = config
            .allowable_methods
            .iter()
            .map(|m| Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("allowable_methods: {e}")))?;
        let urls_expire_after = config
            .urls_expire_after
            .iter()
            .map(|p| UrlExpiration::new(&p.pattern, p.expire_after))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            allowable_codes: config.allowable_codes.iter().copied().collect::<BTreeSet<_>>(),
            allowable_methods,
            always_revalidate: config.always_revalidate,
            cache_control: config.cache_control,
            disabled: config.disabled,
            expire_after: config.expire_after,
            urls_expire_after,
            filter_fn: None,
            key_fn: None,
            ignored_parameters: config.ignored_parameters.clone(),
            match_headers: config.match_headers.clone(),
            only_if_cached: config.only_if_cached,
            stale_if_error: config.stale_if_error,
            stale_while_revalidate: config.stale_while_revalidate,
            verify: config.verify,
        })
    }
}
