//! Error taxonomy for the provider layer
//!
//! Every failure that crosses a component boundary is a [`ProviderError`].
//! [`ProviderError::kind`] maps it onto the closed [`ErrorKind`] set that the
//! retry executor uses to decide whether another attempt is worthwhile.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::ProviderKind;

pub type Result<T, E = ProviderError> = std::result::Result<T, E>;

/// Closed classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimit,
    ProviderUnavailable,
    Authentication,
    Validation,
    Model,
    Configuration,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::RateLimit,
        ErrorKind::ProviderUnavailable,
        ErrorKind::Authentication,
        ErrorKind::Validation,
        ErrorKind::Model,
        ErrorKind::Configuration,
    ];

    /// Transient kinds may succeed on a later attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::RateLimit
                | ErrorKind::ProviderUnavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Validation => "validation",
            ErrorKind::Model => "model",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by providers, the registry, the health checker and the
/// AI system facade.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("A factory is already registered for provider type '{0}'")]
    DuplicateFactory(ProviderKind),

    #[error("No factory registered for provider type '{0}'")]
    UnknownFactoryType(ProviderKind),

    #[error("A provider named '{0}' is already registered")]
    DuplicateProviderName(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("AI system is not initialized (state: {0})")]
    NotInitialized(String),

    #[error("Provider '{provider}': {source}")]
    Provider {
        provider: String,
        #[source]
        source: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Wrap an error with the name of the provider it came from.
    ///
    /// Already wrapped errors for the same provider are returned unchanged.
    pub fn for_provider(provider: impl Into<String>, source: ProviderError) -> Self {
        let provider = provider.into();
        let already_wrapped =
            matches!(&source, ProviderError::Provider { provider: p, .. } if *p == provider);
        if already_wrapped {
            return source;
        }
        ProviderError::Provider {
            provider,
            source: Box::new(source),
        }
    }

    /// A deadline of `limit` elapsed before the operation settled.
    pub fn timeout(limit: Duration) -> Self {
        ProviderError::Timeout(format!("operation exceeded {}ms", limit.as_millis()))
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        ProviderError::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Strip provider context wrappers.
    pub fn root(&self) -> &ProviderError {
        match self {
            ProviderError::Provider { source, .. } => source.root(),
            other => other,
        }
    }

    /// Name of the provider this error is attributed to, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            ProviderError::Provider { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Classify into the closed taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            ProviderError::Network(_) => ErrorKind::Network,
            ProviderError::Timeout(_) => ErrorKind::Timeout,
            ProviderError::RateLimit { .. } => ErrorKind::RateLimit,
            ProviderError::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            ProviderError::Authentication(_) => ErrorKind::Authentication,
            ProviderError::Validation(_) => ErrorKind::Validation,
            ProviderError::Model(_) => ErrorKind::Model,
            ProviderError::ProviderNotFound(_) => ErrorKind::ProviderUnavailable,
            ProviderError::Configuration(_)
            | ProviderError::DuplicateFactory(_)
            | ProviderError::UnknownFactoryType(_)
            | ProviderError::DuplicateProviderName(_)
            | ProviderError::NotInitialized(_) => ErrorKind::Configuration,
            ProviderError::Provider { .. } => ErrorKind::Configuration,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Server supplied wait hint for rate limit errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            ProviderError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Map an HTTP status code and response body onto the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 | 413 | 422 => ProviderError::Validation(message),
            401 | 403 => ProviderError::Authentication(message),
            404 => ProviderError::Model(message),
            408 | 504 => ProviderError::Timeout(message),
            429 => ProviderError::rate_limited(message, None),
            500..=599 => ProviderError::ProviderUnavailable(message),
            _ => ProviderError::Network(format!("unexpected status {}: {}", status, message)),
        }
    }

    /// Classify an opaque error message by keyword.
    ///
    /// Unknown failures are treated as network errors so that they get the
    /// benefit of a retry.
    pub fn classify_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("timeout") || lower.contains("timed out") {
            ProviderError::Timeout(message)
        } else if lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("429")
            || lower.contains("quota")
        {
            ProviderError::rate_limited(message, None)
        } else if lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("api key")
            || lower.contains("401")
            || lower.contains("403")
        {
            ProviderError::Authentication(message)
        } else if lower.contains("model") && (lower.contains("not found") || lower.contains("missing"))
        {
            ProviderError::Model(message)
        } else if lower.contains("invalid")
            || lower.contains("bad request")
            || lower.contains("validation")
            || lower.contains("400")
        {
            ProviderError::Validation(message)
        } else if lower.contains("unavailable")
            || lower.contains("overloaded")
            || lower.contains("502")
            || lower.contains("503")
        {
            ProviderError::ProviderUnavailable(message)
        } else if lower.contains("config") {
            ProviderError::Configuration(message)
        } else {
            ProviderError::Network(message)
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_connect() {
            ProviderError::Network(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            ProviderError::ProviderUnavailable(format!("malformed response: {}", err))
        } else if err.is_builder() {
            ProviderError::Configuration(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::ProviderUnavailable(format!("malformed response: {}", err))
    }
}
