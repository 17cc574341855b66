//! Observer service configuration.
//!
//! Configuration is loaded from environment variables. Every variable is
//! optional and has a documented default.

use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default app name, used as the service name and the `app_name` label.
pub const DEFAULT_APP_NAME: &str = "app";

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default graceful-shutdown drain period in seconds.
pub const DEFAULT_DRAIN_SECONDS: u64 = 0;

/// Observer service configuration.
#[derive(Clone)]
pub struct Config {
    /// Service name for spans and the `app_name` metric label (default: "app").
    pub app_name: String,

    /// Server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// OTLP/gRPC collector endpoint. Traces are not exported when unset.
    pub otlp_endpoint: Option<String>,

    /// Treat every request as a public endpoint: spans always start a new
    /// trace and link to the caller's span instead of continuing it.
    pub public_endpoint: bool,

    /// Seconds to keep draining connections after a shutdown signal (default: 0).
    pub drain_seconds: u64,
}

/// Custom Debug implementation that redacts the collector endpoint, which
/// may carry credentials in its userinfo.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("app_name", &self.app_name)
            .field("bind_address", &self.bind_address)
            .field(
                "otlp_endpoint",
                &self.otlp_endpoint.as_ref().map(|_| "[REDACTED]"),
            )
            .field("public_endpoint", &self.public_endpoint)
            .field("drain_seconds", &self.drain_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid app name: {0}")]
    InvalidAppName(String),

    #[error("Invalid public endpoint flag: {0}")]
    InvalidPublicEndpoint(String),

    #[error("Invalid drain period configuration: {0}")]
    InvalidDrainSeconds(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let app_name = vars
            .get("APP_NAME")
            .cloned()
            .unwrap_or_else(|| DEFAULT_APP_NAME.to_string());

        if app_name.trim().is_empty() {
            return Err(ConfigError::InvalidAppName(
                "APP_NAME must not be empty".to_string(),
            ));
        }

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let otlp_endpoint = vars
            .get("OTEL_EXPORTER_OTLP_ENDPOINT")
            .filter(|value| !value.trim().is_empty())
            .cloned();

        let public_endpoint = match vars.get("PUBLIC_ENDPOINT").map(|v| v.trim()) {
            None => false,
            Some(value) => parse_flag(value).ok_or_else(|| {
                ConfigError::InvalidPublicEndpoint(format!(
                    "PUBLIC_ENDPOINT must be true/false/1/0, got '{}'",
                    value
                ))
            })?,
        };

        let drain_seconds = if let Some(value_str) = vars.get("DRAIN_SECONDS") {
            value_str.parse().map_err(|e| {
                ConfigError::InvalidDrainSeconds(format!(
                    "DRAIN_SECONDS must be a valid non-negative integer, got '{}': {}",
                    value_str, e
                ))
            })?
        } else {
            DEFAULT_DRAIN_SECONDS
        };

        Ok(Config {
            app_name,
            bind_address,
            otlp_endpoint,
            public_endpoint,
            drain_seconds,
        })
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
