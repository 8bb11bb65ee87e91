//! Error types for LiSB

use thiserror::Error;

/// Main error type for LiSB
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Forwarding error: {0}")]
    Forwarding(String),

    #[error("Rejected by relay: {0}")]
    Rejected(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for LiSB
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Filter(_) => "FILTER_ERROR",
            Error::Dns(_) => "DNS_ERROR",
            Error::Forwarding(_) => "FORWARDING_ERROR",
            Error::Rejected(_) => "REJECTED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the failure is worth retrying later
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Dns(_) | Error::Forwarding(_) | Error::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Config("x".into()).code(), "CONFIG_ERROR");
        assert_eq!(Error::Forwarding("x".into()).code(), "FORWARDING_ERROR");
        assert_eq!(
            Error::Other(anyhow::anyhow!("boom")).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::Forwarding("refused".into()).is_transient());
        assert!(Error::Dns("timeout".into()).is_transient());
        assert!(!Error::Config("bad".into()).is_transient());
        assert!(!Error::Rejected("550 no such user".into()).is_transient());
    }
}
