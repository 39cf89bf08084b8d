//! Cache error types

use std::time::Duration;

use redis::RedisError;

/// Boxed error returned by loaders and foreign collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The loader (data source) failed. Never cached.
    #[error("Load failed for key {key}: {source}")]
    Load {
        key: String,
        #[source]
        source: BoxError,
    },

    /// The cross-process lease was not granted within the wait budget.
    #[error("Timed out after {waited:?} waiting for lock on key {key}")]
    LockTimeout { key: String, waited: Duration },

    /// A tier or collaborator that is not Redis-backed could not be reached.
    #[error("Tier unavailable: {0}")]
    Unavailable(String),

    #[error("Reconciliation queue is closed")]
    QueueClosed,

    #[error("Unknown key event '{event}' for key {key}")]
    UnknownEvent { key: String, event: String },

    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    pub(crate) fn load(key: impl Into<String>, source: BoxError) -> Self {
        Self::Load {
            key: key.into(),
            source,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } | Self::Unavailable(_) | Self::QueueClosed => true,
            Self::Redis(e) => {
                e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error()
            }
            _ => false,
        }
    }

    /// Whether the error means the shared tier or lock provider could not be reached.
    pub fn is_tier_unavailable(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = CacheError::LockTimeout {
            key: "app:cache:users:1".to_owned(),
            waited: Duration::from_secs(3),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_tier_unavailable());

        let offline = CacheError::Unavailable("shared tier offline".to_owned());
        assert!(offline.is_retryable());
        assert!(offline.is_tier_unavailable());

        let load = CacheError::load("k", "boom".into());
        assert!(!load.is_retryable());
        assert_eq!(load.to_string(), "Load failed for key k: boom");
    }
}
