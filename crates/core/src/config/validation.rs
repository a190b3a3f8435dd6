//! Configuration validation rules.
//!
//! This module provides validation logic for `CacheConfig` values
//! after they have been loaded from environment, files, or defaults.

use http::Method;
use thiserror::Error;

use crate::backends::BACKEND_NAMES;
use crate::config::CacheConfig;
use crate::serializers::SERIALIZER_NAMES;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err.to_string())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl CacheConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `cache_name` is empty
    /// - `backend` or `serializer` is not a registered name
    /// - `match_headers` lists an invalid header name
    /// - an allowable status code is outside 100-599, or no method is allowed
    /// - a URL expiration pattern is empty
    /// - SQLite busy retries are configured with a zero sleep
    ///
    /// Returns `ConfigError::Missing` if `safe_json` is selected without a `secret_key`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_name.trim().is_empty() {
            return Err(invalid("cache_name", "must not be empty"));
        }

        if let Some(backend) = &self.backend {
            let name = backend.trim().to_ascii_lowercase();
            if !BACKEND_NAMES.contains(&name.as_str()) {
                return Err(invalid("backend", format!("unknown backend `{backend}`, expected one of: {}", BACKEND_NAMES.join(", "))));
            }
        }

        if let Some(serializer) = &self.serializer {
            let name = serializer.trim().to_ascii_lowercase();
            if !SERIALIZER_NAMES.contains(&name.as_str()) {
                return Err(invalid(
                    "serializer",
                    format!("unknown serializer `{serializer}`, expected one of: {}", SERIALIZER_NAMES.join(", ")),
                ));
            }
            if name == "safe_json" && self.secret_key.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::Missing {
                    field: "secret_key".into(),
                    hint: "required by the safe_json serializer".into(),
                });
            }
        }

        self.match_headers.validate().map_err(|e| invalid("match_headers", e.to_string()))?;

        if let Some(code) = self.allowable_codes.iter().find(|c| !(100..=599).contains(*c)) {
            return Err(invalid("allowable_codes", format!("{code} is not an HTTP status code")));
        }

        if self.allowable_methods.is_empty() {
            return Err(invalid("allowable_methods", "must not be empty"));
        }
        for method in &self.allowable_methods {
            if Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes()).is_err() {
                return Err(invalid("allowable_methods", format!("invalid method {method:?}")));
            }
        }

        if self.urls_expire_after.iter().any(|p| p.pattern.trim().trim_end_matches('*').is_empty()) {
            return Err(invalid("urls_expire_after", "patterns must not be empty"));
        }

        if self.sqlite.busy_retries > 0 && self.sqlite.busy_sleep_ms == 0 {
            return Err(invalid("sqlite.busy_sleep_ms", "must be greater than 0 when busy_retries is set"));
        }

        if self.expire_after.is_do_not_cache() && !self.urls_expire_after.is_empty() {
            tracing::warn!(
                patterns = self.urls_expire_after.len(),
                "expire_after is do_not_cache; only URLs matching urls_expire_after will be cached"
            );
        }

        Ok(())
    }
}
