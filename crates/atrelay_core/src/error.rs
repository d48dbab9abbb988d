use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration-specific errors
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for field {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Diagnostic, Debug)]
pub enum CoreError {
    #[error("Login failed for {handle}")]
    #[diagnostic(
        code(atrelay_core::login_failed),
        help("Check BSKY_HANDLE and BSKY_APP_PASSWORD; use an app password, not the account password")
    )]
    LoginFailed { handle: String, cause: String },

    #[error("Not logged in to {service}")]
    #[diagnostic(
        code(atrelay_core::not_logged_in),
        help("Call login before fetching the timeline")
    )]
    NotLoggedIn { service: String },

    #[error("Upstream request {operation} failed: {cause}")]
    #[diagnostic(
        code(atrelay_core::upstream_request),
        help("Check network connectivity and the configured service URL")
    )]
    UpstreamRequest { operation: String, cause: String },

    #[error("Configuration error for field '{field}'")]
    #[diagnostic(
        code(atrelay_core::configuration_error),
        help("Check configuration file at {config_path}\nExpected: {expected}")
    )]
    ConfigurationError {
        config_path: String,
        field: String,
        expected: String,
        #[source]
        cause: ConfigError,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn upstream_request(operation: impl Into<String>, cause: impl ToString) -> Self {
        Self::UpstreamRequest {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    pub fn missing_config(config_path: impl Into<String>, field: impl Into<String>) -> Self {
        let field = field.into();
        Self::ConfigurationError {
            config_path: config_path.into(),
            expected: format!("a value for {field}"),
            cause: ConfigError::MissingField(field.clone()),
            field,
        }
    }
}
