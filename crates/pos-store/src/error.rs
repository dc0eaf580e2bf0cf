//! Driver error classification

use thiserror::Error;

/// Driver failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// Server selection or socket timeout
    Timeout,
    /// Host name did not resolve
    Dns,
    /// Nothing listening / refused
    ConnectionRefused,
    /// Established connection dropped mid-operation
    NetworkClosed,
    /// Bad credentials
    Authentication,
    /// Malformed connection string
    InvalidUri,
    /// Unique index violation
    DuplicateKey,
    /// Anything else the server rejected
    Other,
}

impl DriverErrorKind {
    /// Transient errors are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Dns | Self::ConnectionRefused | Self::NetworkClosed
        )
    }
}

/// Error reported by a shard driver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct DriverError {
    /// Failure category
    pub kind: DriverErrorKind,
    /// Driver message
    pub message: String,
}

impl DriverError {
    /// Build a driver error
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Result type for driver calls
pub type StoreResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DriverError::new(DriverErrorKind::Timeout, "server selection").is_transient());
        assert!(DriverError::new(DriverErrorKind::Dns, "no such host").is_transient());
        assert!(DriverError::new(DriverErrorKind::ConnectionRefused, "refused").is_transient());
        assert!(!DriverError::new(DriverErrorKind::Authentication, "bad auth").is_transient());
        assert!(!DriverError::new(DriverErrorKind::InvalidUri, "no scheme").is_transient());
        assert!(!DriverError::new(DriverErrorKind::DuplicateKey, "E11000").is_transient());
    }
}
