//! Error types for the tenancy layer

use crate::ids::ShardId;
use thiserror::Error;

/// Errors surfaced by the routing and model-management layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Missing or malformed base connection string / settings
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid tenant prefix, shard id or collection name
    #[error("validation error: {0}")]
    Validation(String),

    /// Tenant, store or user could not be resolved
    #[error("not found: {0}")]
    NotFound(String),

    /// Shard or registry unreachable after local retries
    #[error("connection error on {}: {message} (after {attempts} attempt(s))", shard_label(.shard_id))]
    Connection {
        /// Shard the failure happened on, when known
        shard_id: Option<ShardId>,
        /// Attempts made before giving up
        attempts: u32,
        /// Last underlying error
        message: String,
    },

    /// Duplicate username/email or prefix within a namespace
    #[error("conflict: {0}")]
    Conflict(String),
}

fn shard_label(shard_id: &Option<ShardId>) -> String {
    match shard_id {
        Some(id) => format!("shard {}", id),
        None => "unknown shard".to_string(),
    }
}

impl RouterError {
    /// Build a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Build a connection error for a shard
    pub fn connection(shard_id: Option<ShardId>, attempts: u32, msg: impl Into<String>) -> Self {
        Self::Connection {
            shard_id,
            attempts,
            message: msg.into(),
        }
    }

    /// Whether callers should surface this as "service unavailable"
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Result type for the tenancy layer
pub type RouterResult<T> = Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = RouterError::connection(Some(ShardId::from_raw(2)), 3, "connection refused");
        assert_eq!(
            err.to_string(),
            "connection error on shard 2: connection refused (after 3 attempt(s))"
        );
        assert!(err.is_service_unavailable());

        let err = RouterError::connection(None, 1, "registry down");
        assert!(err.to_string().contains("unknown shard"));
    }

    #[test]
    fn test_other_errors_not_unavailable() {
        assert!(!RouterError::validation("bad prefix").is_service_unavailable());
        assert!(!RouterError::not_found("tenant").is_service_unavailable());
        assert!(!RouterError::Conflict("dup".into()).is_service_unavailable());
    }
}
