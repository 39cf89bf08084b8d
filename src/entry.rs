//! Cached entries and their shared-tier encoding

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};

use crate::CacheError;

/// Shared-tier marker for "the loader produced no value".
///
/// Values are stored as JSON, and this literal is not valid JSON, so it never collides with
/// an encoded value.
pub const NULL_SENTINEL: &str = "__tiercache:null__";

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A value held by either tier
#[derive(Debug)]
pub enum CacheEntry<V> {
    Value(Arc<V>),
    /// Cached absence
    Null,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(v) => Self::Value(Arc::clone(v)),
            Self::Null => Self::Null,
        }
    }
}

impl<V> CacheEntry<V> {
    pub fn value(v: V) -> Self {
        Self::Value(Arc::new(v))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The value, with the sentinel translated back to absent
    pub fn into_option(self) -> Option<Arc<V>> {
        match self {
            Self::Value(v) => Some(v),
            Self::Null => None,
        }
    }
}

impl<V: Cacheable> CacheEntry<V> {
    /// Encode for the shared tier.
    pub fn encode(&self) -> Result<String, CacheError> {
        match self {
            Self::Value(v) => Ok(serde_json::to_string(v.as_ref())?),
            Self::Null => Ok(NULL_SENTINEL.to_owned()),
        }
    }

    /// Decode a shared-tier payload.
    pub fn decode(payload: &str) -> Result<Self, CacheError> {
        if payload == NULL_SENTINEL {
            return Ok(Self::Null);
        }
        Ok(Self::value(serde_json::from_str::<V>(payload)?))
    }
}
