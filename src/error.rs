//! Error handling for the slipscan pipeline
//!
//! Network-level failures during probing are not errors: they become result
//! labels like TIMEOUT or ERROR so the pipeline keeps moving. The variants
//! here cover the cases that must stop a run instead.

use thiserror::Error;

/// Main error type for scan runs
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No scannable targets in input")]
    NoTargets,

    #[error("Output error: {0}")]
    OutputError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for scan operations
pub type ScanResult<T> = Result<T, ScanError>;

impl From<toml::de::Error> for ScanError {
    fn from(e: toml::de::Error) -> Self {
        ScanError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::ConfigError("domain cannot be empty".to_string());
        assert_eq!(err.to_string(), "Configuration error: domain cannot be empty");

        let err = ScanError::NoTargets;
        assert_eq!(err.to_string(), "No scannable targets in input");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ScanError = io.into();
        assert!(matches!(err, ScanError::IoError(_)));
    }
}
