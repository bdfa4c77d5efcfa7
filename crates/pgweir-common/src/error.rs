//! Error types for pgweir services

/// Result type alias using WeirError
pub type Result<T> = std::result::Result<T, WeirError>;

/// Main error type for pgweir services
#[derive(Debug, thiserror::Error)]
pub enum WeirError {
    /// Configuration error (missing file, bad YAML, invalid field)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid request/argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Routing failed (no rule matched, unknown backend)
    #[error("No route for {0}")]
    RouteNotFound(String),

    /// I/O error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WeirError {
    /// Create an internal error from any error type
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        WeirError::Internal(err.to_string())
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            WeirError::ConfigError(_) => "CONFIG_ERROR",
            WeirError::InvalidArgument(_) => "INVALID_ARGUMENT",
            WeirError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            WeirError::IoError(_) => "IO_ERROR",
            WeirError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<::config::ConfigError> for WeirError {
    fn from(err: ::config::ConfigError) -> Self {
        WeirError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(WeirError::ConfigError("x".into()).code(), "CONFIG_ERROR");
        assert_eq!(WeirError::internal("boom").code(), "INTERNAL");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: WeirError = io.into();
        assert_eq!(err.code(), "IO_ERROR");
    }
}
