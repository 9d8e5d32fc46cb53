//! Error types for datasource resolution, pooling and probing

use std::fmt;
use tracing::{error, warn};

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, DataSourceError>;

/// Main error type for the datasource subsystem
#[derive(Debug)]
pub enum DataSourceError {
    /// A connection source was present but could not be parsed
    MalformedSource {
        /// Configuration key the value came from
        key: String,
        /// What was wrong with it
        message: String,
    },
    /// A connection could not be borrowed from the pool
    ConnectionAcquisition {
        /// The underlying database error
        source: sqlx::Error,
        /// User-friendly error message
        message: String,
    },
    /// Every external source failed; absorbed by the supervisor
    AllSourcesExhausted {
        /// Keys that were tried, in order
        attempts: Vec<String>,
    },
    /// Validation errors
    Validation {
        /// The validation error message
        message: String,
        /// The invalid value that caused the error
        invalid_value: Option<String>,
    },
    /// Configuration errors
    Configuration {
        /// Configuration parameter that is invalid
        parameter: String,
        /// Error message
        message: String,
    },
    /// Timeout errors
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },
    /// Query errors raised while probing
    Query {
        /// The SQL that failed
        sql: String,
        /// The underlying database error
        source: sqlx::Error,
    },
    /// General I/O errors
    Io {
        /// The underlying I/O error
        source: std::io::Error,
        /// Context about the I/O operation
        context: String,
    },
}

impl DataSourceError {
    /// Create a new malformed-source error
    pub fn malformed_source(key: impl Into<String>, message: impl Into<String>) -> Self {
        let key = key.into();
        let message = crate::mask::mask_secrets(&message.into());
        warn!("Malformed connection source '{}': {}", key, message);

        Self::MalformedSource { key, message }
    }

    /// Create a new connection acquisition error
    pub fn connection_acquisition(source: sqlx::Error) -> Self {
        let message = Self::format_acquisition_error(&source);
        error!("Connection acquisition failed: {}", crate::mask::mask_secrets(&source.to_string()));

        Self::ConnectionAcquisition { source, message }
    }

    /// Create a new all-sources-exhausted error
    pub fn all_sources_exhausted(attempts: Vec<String>) -> Self {
        error!("All connection sources exhausted: {:?}", attempts);

        Self::AllSourcesExhausted { attempts }
    }

    /// Create a new validation error
    pub fn validation_error(message: String, invalid_value: Option<String>) -> Self {
        warn!("Validation error: {} | Invalid value: {:?}", message, invalid_value);

        Self::Validation {
            message,
            invalid_value,
        }
    }

    /// Create a new configuration error
    pub fn configuration_error(parameter: String, message: String) -> Self {
        error!("Configuration error for '{}': {}", parameter, message);

        Self::Configuration { parameter, message }
    }

    /// Create a new timeout error
    pub fn timeout_error(operation: String, timeout_ms: u64) -> Self {
        warn!("Operation timed out: {} after {}ms", operation, timeout_ms);

        Self::Timeout {
            operation,
            timeout_ms,
        }
    }

    /// Create a new query error
    pub fn query_error(sql: String, source: sqlx::Error) -> Self {
        warn!("Query failed: {} | SQL: {}", source, sql);

        Self::Query { sql, source }
    }

    /// Create a new I/O error
    pub fn io_error(source: std::io::Error, context: String) -> Self {
        error!("I/O error in {}: {}", context, source);

        Self::Io { source, context }
    }

    /// Stable short name of the error kind, surfaced in health details
    pub fn kind(&self) -> &'static str {
        match self {
            DataSourceError::MalformedSource { .. } => "MalformedSourceError",
            DataSourceError::ConnectionAcquisition { .. } => "ConnectionAcquisitionError",
            DataSourceError::AllSourcesExhausted { .. } => "AllSourcesExhaustedError",
            DataSourceError::Validation { .. } => "ValidationError",
            DataSourceError::Configuration { .. } => "ConfigurationError",
            DataSourceError::Timeout { .. } => "TimeoutError",
            DataSourceError::Query { .. } => "QueryError",
            DataSourceError::Io { .. } => "IoError",
        }
    }

    /// Get a user-friendly error message (safe to expose)
    pub fn user_message(&self) -> String {
        match self {
            DataSourceError::MalformedSource { key, message } => {
                format!("Malformed connection source '{}': {}", key, message)
            }
            DataSourceError::ConnectionAcquisition { message, .. } => message.clone(),
            DataSourceError::AllSourcesExhausted { attempts } => {
                format!("No usable connection source among: {}", attempts.join(", "))
            }
            DataSourceError::Validation { message, .. } => message.clone(),
            DataSourceError::Configuration { parameter, message } => {
                format!("Configuration error for '{}': {}", parameter, message)
            }
            DataSourceError::Timeout { operation, timeout_ms } => {
                format!("Operation '{}' timed out after {}ms", operation, timeout_ms)
            }
            DataSourceError::Query { source, .. } => {
                format!("Query failed: {}", crate::mask::mask_secrets(&source.to_string()))
            }
            DataSourceError::Io { context, .. } => format!("I/O error during {}", context),
        }
    }

    /// Get detailed error information for logging
    pub fn detailed_message(&self) -> String {
        let detail = match self {
            DataSourceError::ConnectionAcquisition { source, message } => {
                format!("Connection acquisition error: {} | Source: {}", message, source)
            }
            DataSourceError::Validation { message, invalid_value } => {
                format!("Validation error: {} | Invalid value: {:?}", message, invalid_value)
            }
            DataSourceError::Query { sql, source } => {
                format!("Query error: {} | SQL: {}", source, sql)
            }
            DataSourceError::Io { source, context } => {
                format!("I/O error in {}: {}", context, source)
            }
            other => other.user_message(),
        };

        crate::mask::mask_secrets(&detail)
    }

    fn format_acquisition_error(source: &sqlx::Error) -> String {
        match source {
            sqlx::Error::PoolTimedOut => {
                "Timed out waiting for a pooled connection".to_string()
            }
            sqlx::Error::PoolClosed => "Connection pool has been closed".to_string(),
            sqlx::Error::Io(_) => {
                "Unable to reach the database. Please check network connectivity.".to_string()
            }
            sqlx::Error::Tls(_) => {
                "Database connection failed due to TLS/SSL error.".to_string()
            }
            _ => {
                let text = source.to_string();
                if text.contains("Access denied") || text.contains("authentication") {
                    "Database connection failed: invalid credentials or insufficient permissions."
                        .to_string()
                } else {
                    format!("Database connection failed: {}", crate::mask::mask_secrets(&text))
                }
            }
        }
    }
}

impl fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for DataSourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataSourceError::ConnectionAcquisition { source, .. } => Some(source),
            DataSourceError::Query { source, .. } => Some(source),
            DataSourceError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for DataSourceError {
    fn from(err: sqlx::Error) -> Self {
        DataSourceError::connection_acquisition(err)
    }
}
