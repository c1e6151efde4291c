/// Unified error handling for the pasarela gateway
///
/// This module provides the error taxonomy shared by every component of the
/// gateway: parameter and configuration failures, missing resources, access
/// control failures, network errors and aggregated shutdown failures.

use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or missing required parameter, unsupported protocol,
    /// unexpected identity kind
    #[error("bad parameter: {message}")]
    BadParameter { message: String },

    /// A requested resource (database, lock, rotation state) does not exist
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Authorization failure
    #[error("access denied: {message}")]
    AccessDenied { message: String },

    /// Network-related errors
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// TLS handshake or TLS configuration errors
    #[error("tls error: {message}")]
    Tls { message: String },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Control plane (announce/keep-alive) errors
    #[error("announce failed: {message}")]
    Announce { message: String },

    /// Timeout errors
    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    /// The operation was interrupted by server shutdown
    #[error("operation canceled: {operation}")]
    Canceled { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Several independent failures collected during a single operation
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<GatewayError>),
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

fn format_aggregate(errors: &[GatewayError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convenience methods for creating specific error types
impl GatewayError {
    pub fn bad_parameter<S: Into<String>>(message: S) -> Self {
        GatewayError::BadParameter {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        GatewayError::NotFound {
            message: message.into(),
        }
    }

    pub fn access_denied<S: Into<String>>(message: S) -> Self {
        GatewayError::AccessDenied {
            message: message.into(),
        }
    }

    pub fn tls<S: Into<String>>(message: S) -> Self {
        GatewayError::Tls {
            message: message.into(),
        }
    }

    pub fn announce<S: Into<String>>(message: S) -> Self {
        GatewayError::Announce {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        GatewayError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn canceled<S: Into<String>>(operation: S) -> Self {
        GatewayError::Canceled {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        GatewayError::Internal {
            message: message.into(),
        }
    }

    /// Collapse a list of results into a single outcome.
    ///
    /// Successful entries are dropped. No failures yields `Ok(())`, a single
    /// failure is returned unchanged and several failures are combined into
    /// `Aggregate` so none of them is lost.
    pub fn aggregate<I>(results: I) -> GatewayResult<()>
    where
        I: IntoIterator<Item = GatewayResult<()>>,
    {
        let mut errors: Vec<GatewayError> = results.into_iter().filter_map(Result::err).collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(GatewayError::Aggregate(errors)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, GatewayError::AccessDenied { .. })
    }

    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, GatewayError::BadParameter { .. })
    }

    /// Whether this error represents an ordinary client disconnect rather
    /// than a server fault.
    pub fn is_ok_network_error(&self) -> bool {
        match self {
            GatewayError::Network(e) => crate::utils::is_ok_network_error(e),
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            GatewayError::Config(_) => ErrorSeverity::Critical,
            GatewayError::Internal { .. } => ErrorSeverity::Critical,
            GatewayError::AccessDenied { .. } => ErrorSeverity::Info,
            GatewayError::NotFound { .. } => ErrorSeverity::Info,
            GatewayError::Canceled { .. } => ErrorSeverity::Info,
            GatewayError::Network(e) if crate::utils::is_ok_network_error(e) => ErrorSeverity::Info,
            GatewayError::Network(_) => ErrorSeverity::Warning,
            GatewayError::Announce { .. } => ErrorSeverity::Warning,
            GatewayError::Timeout { .. } => ErrorSeverity::Warning,
            GatewayError::Aggregate(errors) => errors
                .iter()
                .map(GatewayError::severity)
                .min()
                .unwrap_or(ErrorSeverity::Error),
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about expected failures
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

impl From<rustls::Error> for GatewayError {
    fn from(e: rustls::Error) -> Self {
        GatewayError::tls(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = GatewayError::not_found("\"ghost\" not found");
        assert!(error.is_not_found());
        assert_eq!(error.to_string(), "not found: \"ghost\" not found");
    }

    #[test]
    fn test_error_severity() {
        let config_error = GatewayError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let reset = GatewayError::Network(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(reset.severity(), ErrorSeverity::Info);

        let refused = GatewayError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(refused.severity(), ErrorSeverity::Warning);

        assert_eq!(GatewayError::access_denied("nope").severity(), ErrorSeverity::Info);
    }

    #[test]
    fn test_ok_network_error_classification() {
        let eof = GatewayError::Network(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(eof.is_ok_network_error());

        let refused = GatewayError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(!refused.is_ok_network_error());

        assert!(!GatewayError::bad_parameter("x").is_ok_network_error());
    }

    #[test]
    fn test_aggregate_keeps_every_error() {
        assert!(GatewayError::aggregate(vec![Ok(()), Ok(())]).is_ok());

        let single = GatewayError::aggregate(vec![Ok(()), Err(GatewayError::internal("one"))]);
        assert!(matches!(single, Err(GatewayError::Internal { .. })));

        let combined = GatewayError::aggregate(vec![
            Err(GatewayError::announce("first")),
            Ok(()),
            Err(GatewayError::internal("second")),
        ])
        .unwrap_err();
        match &combined {
            GatewayError::Aggregate(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {:?}", other),
        }
        let message = combined.to_string();
        assert!(message.contains("first"));
        assert!(message.contains("second"));
        assert_eq!(combined.severity(), ErrorSeverity::Critical);
    }
}
