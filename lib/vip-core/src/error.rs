use thiserror::Error;
use vip_api::DecodeError;
use vip_ipam::AllocatorError;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("No cidr configuration for namespace [{namespace}] exists in key [{key}] configmap [{config_map}]")]
    ConfigurationMissing {
        namespace: String,
        key: String,
        config_map: String,
    },

    #[error("Address allocation failed for service {service} in {namespace}: {source}")]
    AllocationFailed {
        namespace: String,
        service: String,
        #[source]
        source: AllocatorError,
    },

    #[error("Registry for service {service} in {namespace} still conflicting after {attempts} attempts")]
    PersistenceConflict {
        namespace: String,
        service: String,
        attempts: u32,
    },

    #[error("Registry document in {namespace} is corrupt: {source}")]
    CorruptRegistry {
        namespace: String,
        #[source]
        source: DecodeError,
    },

    #[error("Reconcile of service {service} in {namespace} cancelled")]
    Cancelled { namespace: String, service: String },

    #[error("Invalid service: {0}")]
    InvalidService(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether a fresh attempt with re-fetched state may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Store(e) if e.is_retryable())
    }

    /// A write failed in a way that leaves its outcome unknown
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, CoreError::Store(e) if e.is_indeterminate())
    }
}
