use thiserror::Error;

/// Structured error types for the calsyncd daemon
#[derive(Error, Debug, Clone)]
pub enum CalsyncError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Persistent cache (Redis) errors
    #[error("Cache error: {operation} failed: {message}")]
    Cache {
        operation: String,
        message: String,
    },

    /// Authentication errors
    #[error("Authentication error: {service} authentication failed: {message}")]
    Authentication { service: String, message: String },

    /// API call errors (Google Calendar, etc.)
    #[error("API error: {service} API call failed: {message}")]
    Api { service: String, message: String },

    /// Upstream rate limiting (HTTP 429), with the server-suggested delay
    #[error("Rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The stored incremental sync token was rejected (HTTP 410 Gone);
    /// the caller must fall back to a full re-fetch
    #[error("Sync token expired, full re-fetch required")]
    SyncTokenExpired,

    /// Network connectivity errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Parsing errors (JSON, TOML, etc.)
    #[error("Parsing error: Failed to parse {format}: {message}")]
    Parsing {
        format: String,
        message: String,
    },

    /// Timeout errors
    #[error("Timeout error: {operation} timed out after {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    /// Validation errors (bad date range, bad sync interval, etc.)
    #[error("Validation error: {field} is invalid: {message}")]
    Validation { field: String, message: String },

    /// Internal errors that shouldn't happen
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias using CalsyncError
pub type CalsyncResult<T> = std::result::Result<T, CalsyncError>;

impl CalsyncError {
    /// Whether this error is an upstream rate limit and should be retried
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Convert anyhow::Error to CalsyncError
impl From<anyhow::Error> for CalsyncError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal {
            message: error.to_string(),
        }
    }
}

/// Convert redis::RedisError to CalsyncError
impl From<redis::RedisError> for CalsyncError {
    fn from(error: redis::RedisError) -> Self {
        Self::Cache {
            operation: "redis_command".to_string(),
            message: error.to_string(),
        }
    }
}

/// Convert serde_json::Error to CalsyncError
impl From<serde_json::Error> for CalsyncError {
    fn from(error: serde_json::Error) -> Self {
        Self::Parsing {
            format: "JSON".to_string(),
            message: error.to_string(),
        }
    }
}

/// Convert toml::de::Error to CalsyncError
impl From<toml::de::Error> for CalsyncError {
    fn from(error: toml::de::Error) -> Self {
        Self::Parsing {
            format: "TOML".to_string(),
            message: error.to_string(),
        }
    }
}

/// Convert reqwest::Error to CalsyncError
impl From<reqwest::Error> for CalsyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout {
                operation: "HTTP request".to_string(),
                timeout_seconds: 30, // Default assumption
            }
        } else if error.is_connect() {
            Self::Network {
                message: format!("Connection failed: {}", error),
            }
        } else {
            Self::Api {
                service: "HTTP".to_string(),
                message: error.to_string(),
            }
        }
    }
}
