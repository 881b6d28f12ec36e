//! Document store contract for the per-namespace registry ConfigMap
//!
//! The store is the only shared mutable state between reconciles. Writes carry
//! the `resourceVersion` read in the same attempt and fail with
//! [`StoreError::Conflict`] when it is stale.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("Document {namespace}/{name} was modified concurrently")]
    Conflict { namespace: String, name: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid document: {0}")]
    Invalid(String),

    #[error("Write outcome unknown: {0}")]
    Indeterminate(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::Error),
}

impl StoreError {
    /// A write lost a race; re-reading and trying again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::NotFound { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// The write may or may not have been committed
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, StoreError::Indeterminate(_))
    }
}

/// Get/create/update of named documents with optimistic concurrency
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document. Absence is reported as [`StoreError::NotFound`].
    async fn get(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError>;

    /// Create an empty document, or return the existing one if it already exists
    async fn create(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError>;

    /// Replace a document. Fails with [`StoreError::Conflict`] if its version is stale.
    async fn update(&self, document: &ConfigMap) -> Result<ConfigMap, StoreError>;
}
