//! Session configuration parsed from environment variables.
//!
//! SYSTEM CONTEXT
//! ==============
//! Both session controllers and the REST backend read their knobs from here.
//! The binary loads `.env` through `dotenvy` before calling [`SessionConfig::from_env`].

use std::time::Duration;

pub const DEFAULT_SESSION_RESOLVE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_ADMIN_RESOLVE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_BACKEND_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {var}")]
    Missing { var: String },
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Resolution bounds for the two controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub session_resolve: Duration,
    pub admin_resolve: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            session_resolve: Duration::from_millis(DEFAULT_SESSION_RESOLVE_TIMEOUT_MS),
            admin_resolve: Duration::from_millis(DEFAULT_ADMIN_RESOLVE_TIMEOUT_MS),
        }
    }
}

/// Hosted backend connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub url: String,
    pub anon_key: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl BackendConfig {
    /// Build from `BACKEND_URL` and `BACKEND_ANON_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when either variable is unset or blank,
    /// and [`ConfigError::Invalid`] when the URL has no http(s) scheme.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = required("BACKEND_URL")?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid { var: "BACKEND_URL".into(), reason: "expected http(s) URL".into() });
        }
        let anon_key = required("BACKEND_ANON_KEY")?;
        Ok(Self {
            url: url.trim_end_matches('/').to_owned(),
            anon_key,
            request_timeout: Duration::from_secs(env_parse(
                "BACKEND_REQUEST_TIMEOUT_SECS",
                DEFAULT_BACKEND_REQUEST_TIMEOUT_SECS,
            )),
            connect_timeout: Duration::from_secs(env_parse(
                "BACKEND_CONNECT_TIMEOUT_SECS",
                DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS,
            )),
        })
    }
}

/// Top-level configuration for an application instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionConfig {
    /// `None` when running against an in-process backend.
    pub backend: Option<BackendConfig>,
    pub timeouts: Timeouts,
}

impl SessionConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `BACKEND_URL`
    /// - `BACKEND_ANON_KEY`
    ///
    /// Optional:
    /// - `SESSION_RESOLVE_TIMEOUT_MS`: default 5000
    /// - `ADMIN_RESOLVE_TIMEOUT_MS`: default 5000
    /// - `BACKEND_REQUEST_TIMEOUT_SECS`: default 30
    /// - `BACKEND_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Propagates [`BackendConfig::from_env`] failures.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self { backend: Some(BackendConfig::from_env()?), timeouts: timeouts_from_env() })
    }
}

fn timeouts_from_env() -> Timeouts {
    Timeouts {
        session_resolve: Duration::from_millis(env_parse(
            "SESSION_RESOLVE_TIMEOUT_MS",
            DEFAULT_SESSION_RESOLVE_TIMEOUT_MS,
        )),
        admin_resolve: Duration::from_millis(env_parse("ADMIN_RESOLVE_TIMEOUT_MS", DEFAULT_ADMIN_RESOLVE_TIMEOUT_MS)),
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::Missing { var: key.to_owned() })
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
