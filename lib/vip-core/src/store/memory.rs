//! In-memory document store with Kubernetes-like versioning

use super::{DocumentStore, StoreError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// MemoryStore keeps documents in a map keyed by (namespace, name)
///
/// Every successful write bumps a global `resourceVersion`. Conflicts and
/// outages can be injected to exercise the engine's retry paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    documents: Arc<Mutex<HashMap<(String, String), ConfigMap>>>,
    version: Arc<AtomicU64>,
    injected_conflicts: Arc<AtomicUsize>,
    lost_replies: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
    updates: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    /// Put a document as-is, assigning it a fresh version
    pub async fn insert(&self, mut document: ConfigMap) {
        let namespace = document.metadata.namespace.clone().unwrap_or_default();
        let name = document.metadata.name.clone().unwrap_or_default();
        document.metadata.resource_version = Some(self.next_version());

        let mut documents = self.documents.lock().await;
        documents.insert(Self::key(&namespace, &name), document);
    }

    /// Current stored copy of a document
    pub async fn document(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        let documents = self.documents.lock().await;
        documents.get(&Self::key(namespace, name)).cloned()
    }

    /// Make the next `count` updates fail with a conflict
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Commit the next `count` updates but report their outcome as unknown
    pub fn inject_lost_replies(&self, count: usize) {
        self.lost_replies.store(count, Ordering::SeqCst);
    }

    /// Simulate the backing store going away
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful updates so far
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError> {
        self.check_available()?;
        let document = {
            let documents = self.documents.lock().await;
            documents.get(&Self::key(namespace, name)).cloned()
        };
        // let concurrent reconciles interleave between read and write
        tokio::task::yield_now().await;

        document.ok_or_else(|| StoreError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    async fn create(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError> {
        self.check_available()?;
        let mut documents = self.documents.lock().await;
        let document = documents
            .entry(Self::key(namespace, name))
            .or_insert_with(|| {
                debug!(namespace, name, "Creating document");
                ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        resource_version: Some(self.next_version()),
                        ..Default::default()
                    },
                    ..Default::default()
                }
            });
        Ok(document.clone())
    }

    async fn update(&self, document: &ConfigMap) -> Result<ConfigMap, StoreError> {
        self.check_available()?;
        let namespace = document.metadata.namespace.clone().unwrap_or_default();
        let name = document
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::Invalid("document has no name".to_string()))?;

        let conflict = || StoreError::Conflict {
            namespace: namespace.clone(),
            name: name.clone(),
        };

        let injected = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(conflict());
        }

        let mut documents = self.documents.lock().await;
        let stored = documents
            .get_mut(&Self::key(&namespace, &name))
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.clone(),
                name: name.clone(),
            })?;

        if stored.metadata.resource_version != document.metadata.resource_version {
            return Err(conflict());
        }

        let mut updated = document.clone();
        updated.metadata.resource_version = Some(self.next_version());
        *stored = updated.clone();
        self.updates.fetch_add(1, Ordering::SeqCst);

        let lost = self
            .lost_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(StoreError::Indeterminate(format!(
                "reply for {}/{} lost",
                namespace, name
            )));
        }

        Ok(updated)
    }
}
