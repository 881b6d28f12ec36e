//! Reconciliation engine for LoadBalancer services
//!
//! Each operation is a self-contained read-modify-write of the namespace's
//! registry ConfigMap, retried on version conflicts. Ordering rules:
//! - Ensure allocates before writing, and releases the address again if the
//!   write never lands.
//! - Delete writes first and releases afterwards, so an address never looks
//!   free while the registry still holds it.

use crate::store::{DocumentStore, StoreError};
use crate::{load_balancer_status, CoreError, Result, RetryPolicy, ServiceRequest};
use k8s_openapi::api::core::v1::{ConfigMap, LoadBalancerStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vip_api::{
    DecodeError, ServiceRecord, ServiceRegistry, PROVIDER_ANNOTATION, PROVIDER_NAME, SERVICES_KEY,
};
use vip_ipam::{AddressAllocator, AllocatorError};

/// Where the engine finds its documents
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Name of the registry ConfigMap in every service namespace
    pub config_map: String,
    /// Name of the ConfigMap holding `cidr-<namespace>` keys
    pub pool_config_map: String,
    /// Namespace of the pool ConfigMap
    pub pool_config_namespace: String,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_map: "plndr".to_string(),
            pool_config_map: "plndr".to_string(),
            pool_config_namespace: "kube-system".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct Engine {
    store: Arc<dyn DocumentStore>,
    allocator: Arc<dyn AddressAllocator>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        allocator: Arc<dyn AddressAllocator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            allocator,
            config,
        }
    }

    /// Make sure `service` has a VIP recorded in its namespace's registry
    ///
    /// Re-running for a uid that is already recorded returns the same VIP.
    pub async fn ensure(
        &self,
        service: &ServiceRequest,
        cancel: &CancellationToken,
    ) -> Result<LoadBalancerStatus> {
        let port = service.port.ok_or_else(|| {
            CoreError::InvalidService(format!(
                "service {}/{} declares no ports",
                service.namespace, service.name
            ))
        })?;
        let cidr = self.pool_cidr(&service.namespace).await?;

        // Address allocated by this call that is not yet persisted
        let mut pending: Option<String> = None;
        let max_attempts = self.config.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let result = self
                .try_ensure(service, port, &cidr, &mut pending, cancel)
                .await;

            match result {
                Ok(vip) => {
                    info!(
                        namespace = %service.namespace,
                        service = %service.name,
                        uid = %service.uid,
                        %vip,
                        attempt,
                        "Synced load balancer"
                    );
                    return Ok(load_balancer_status(&vip));
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        namespace = %service.namespace,
                        uid = %service.uid,
                        attempt,
                        "Registry write conflicted, retrying: {}",
                        e
                    );
                    self.backoff(attempt, max_attempts, cancel).await;
                }
                Err(e) if e.is_indeterminate() => {
                    let Some(vip) = pending.take() else {
                        return Err(e);
                    };
                    // the write may have landed; only release what the registry does not hold
                    match self.recorded_vip(service).await {
                        Ok(Some(recorded)) if recorded == vip => {
                            info!(
                                namespace = %service.namespace,
                                uid = %service.uid,
                                %vip,
                                "Registry write landed despite error: {}",
                                e
                            );
                            return Ok(load_balancer_status(&vip));
                        }
                        Ok(_) => self.compensate(&service.namespace, Some(vip)).await,
                        Err(verify) => warn!(
                            namespace = %service.namespace,
                            %vip,
                            "Unable to confirm registry write, keeping address allocated: {}",
                            verify
                        ),
                    }
                    return Err(e);
                }
                Err(e) => {
                    self.compensate(&service.namespace, pending.take()).await;
                    return Err(e);
                }
            }
        }

        self.compensate(&service.namespace, pending.take()).await;
        Err(CoreError::PersistenceConflict {
            namespace: service.namespace.clone(),
            service: service.uid.clone(),
            attempts: max_attempts,
        })
    }

    async fn try_ensure(
        &self,
        service: &ServiceRequest,
        port: i32,
        cidr: &str,
        pending: &mut Option<String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        Self::check_cancelled(service, cancel)?;
        let document = self.fetch_or_create(&service.namespace).await?;
        let mut registry = match Self::load_registry(&document) {
            Ok(registry) => registry,
            Err(DecodeError::Absent) => ServiceRegistry::new(),
            Err(e) => {
                warn!(
                    namespace = %service.namespace,
                    "Unable to read services from configMap, starting from an empty registry: {}",
                    e
                );
                ServiceRegistry::new()
            }
        };

        let vip = match registry.find(&service.uid) {
            Some(existing) => {
                // someone already persisted this uid; our allocation is surplus
                self.compensate(&service.namespace, pending.take()).await;
                existing.vip.clone()
            }
            None => {
                if let Some(vip) = pending.as_ref() {
                    if registry.find_by_vip(vip).is_some() {
                        // recorded for another uid since our last attempt, so it stays allocated
                        *pending = None;
                    }
                }
                match pending.as_ref() {
                    Some(vip) => vip.clone(),
                    None => {
                        let vip = self.allocate_unclaimed(service, cidr, &registry).await?;
                        *pending = Some(vip.clone());
                        vip
                    }
                }
            }
        };

        let record = ServiceRecord {
            vip: vip.clone(),
            port,
            uid: service.uid.clone(),
            service_name: service.name.clone(),
        };
        if registry.find(&service.uid) == Some(&record) {
            debug!(namespace = %service.namespace, uid = %service.uid, "Registry already up to date");
            return Ok(vip);
        }
        registry.upsert(record);

        Self::check_cancelled(service, cancel)?;
        self.write_registry(document, &registry).await?;
        *pending = None;

        Ok(vip)
    }

    /// Allocate an address no record in `registry` already holds
    ///
    /// Addresses the allocator offers that the registry already carries are
    /// reserved and skipped; each skip is a distinct record, which bounds the loop.
    async fn allocate_unclaimed(
        &self,
        service: &ServiceRequest,
        cidr: &str,
        registry: &ServiceRegistry,
    ) -> Result<String> {
        let allocation_failed = |source| CoreError::AllocationFailed {
            namespace: service.namespace.clone(),
            service: service.uid.clone(),
            source,
        };

        for _ in 0..=registry.len() {
            let vip = self
                .allocator
                .find_available(&service.namespace, cidr)
                .await
                .map_err(allocation_failed)?;

            match registry.find_by_vip(&vip) {
                None => {
                    debug!(namespace = %service.namespace, uid = %service.uid, %vip, "Allocated address");
                    return Ok(vip);
                }
                Some(holder) => {
                    warn!(
                        namespace = %service.namespace,
                        %vip,
                        holder = %holder.uid,
                        "Allocator offered an address the registry already holds, reserving it"
                    );
                    self.allocator
                        .reserve(&service.namespace, &vip)
                        .await
                        .map_err(allocation_failed)?;
                }
            }
        }

        Err(allocation_failed(AllocatorError::PoolExhausted {
            namespace: service.namespace.clone(),
            cidr: cidr.to_string(),
        }))
    }

    /// VIP currently recorded for `service`, if any
    async fn recorded_vip(&self, service: &ServiceRequest) -> Result<Option<String>> {
        let document = match self.store.get(&service.namespace, &self.config.config_map).await {
            Ok(document) => document,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::load_registry(&document)
            .ok()
            .and_then(|registry| registry.find(&service.uid).map(|record| record.vip.clone())))
    }

    /// Same as [`Engine::ensure`], discarding the status
    pub async fn update(&self, service: &ServiceRequest, cancel: &CancellationToken) -> Result<()> {
        self.ensure(service, cancel).await.map(|_| ())
    }

    /// Look up the VIP recorded for `service`
    ///
    /// `Ok(None)` means not provisioned yet: no document, no registry, or no record.
    pub async fn get(&self, service: &ServiceRequest) -> Result<Option<LoadBalancerStatus>> {
        let document = match self.store.get(&service.namespace, &self.config.config_map).await {
            Ok(document) => document,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let registry = match Self::load_registry(&document) {
            Ok(registry) => registry,
            Err(DecodeError::Absent) => return Ok(None),
            Err(source) => {
                return Err(CoreError::CorruptRegistry {
                    namespace: service.namespace.clone(),
                    source,
                })
            }
        };

        Ok(registry
            .find(&service.uid)
            .map(|record| load_balancer_status(&record.vip)))
    }

    /// Remove `service` from the registry, then release its VIP
    ///
    /// Deleting something that was never provisioned succeeds without touching
    /// the allocator.
    pub async fn delete(&self, service: &ServiceRequest, cancel: &CancellationToken) -> Result<()> {
        info!(namespace = %service.namespace, uid = %service.uid, "deleting service '{}'", service.name);
        let max_attempts = self.config.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.try_delete(service, cancel).await {
                Ok(None) => return Ok(()),
                Ok(Some(vip)) => {
                    if let Err(e) = self.allocator.release(&service.namespace, &vip).await {
                        warn!(namespace = %service.namespace, %vip, "Failed to release address: {}", e);
                    }
                    info!(namespace = %service.namespace, uid = %service.uid, %vip, "Released load balancer");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        namespace = %service.namespace,
                        uid = %service.uid,
                        attempt,
                        "Registry write conflicted, retrying: {}",
                        e
                    );
                    self.backoff(attempt, max_attempts, cancel).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(CoreError::PersistenceConflict {
            namespace: service.namespace.clone(),
            service: service.uid.clone(),
            attempts: max_attempts,
        })
    }

    /// One delete attempt; returns the VIP to release once the write landed
    async fn try_delete(
        &self,
        service: &ServiceRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        Self::check_cancelled(service, cancel)?;
        let document = match self.store.get(&service.namespace, &self.config.config_map).await {
            Ok(document) => document,
            Err(e) if e.is_not_found() => {
                debug!(namespace = %service.namespace, "No registry document, nothing to delete");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let registry = match Self::load_registry(&document) {
            Ok(registry) => registry,
            Err(DecodeError::Absent) => return Ok(None),
            Err(e) => {
                // leave the document alone; nothing in it can be trusted to release
                warn!(
                    namespace = %service.namespace,
                    service = %service.name,
                    "The service in configMap [{}] can't be read: {}",
                    self.config.config_map,
                    e
                );
                return Ok(None);
            }
        };

        let Some(vip) = registry.find(&service.uid).map(|record| record.vip.clone()) else {
            debug!(namespace = %service.namespace, uid = %service.uid, "Service not in registry");
            return Ok(None);
        };

        let updated = registry.remove_by_uid(&service.uid);
        Self::check_cancelled(service, cancel)?;
        match self.write_registry(document, &updated).await {
            Ok(_) => Ok(Some(vip)),
            // released only once the record is confirmed gone
            Err(e) if e.is_indeterminate() => match self.recorded_vip(service).await {
                Ok(None) => Ok(Some(vip)),
                _ => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Reserve every VIP recorded in `namespace` with the allocator
    ///
    /// Rebuilds allocator bookkeeping from the registry after a restart.
    pub async fn restore(&self, namespace: &str) -> Result<usize> {
        let document = match self.store.get(namespace, &self.config.config_map).await {
            Ok(document) => document,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let registry = match Self::load_registry(&document) {
            Ok(registry) => registry,
            Err(DecodeError::Absent) => return Ok(0),
            Err(source) => {
                return Err(CoreError::CorruptRegistry {
                    namespace: namespace.to_string(),
                    source,
                })
            }
        };

        for record in registry.iter() {
            self.allocator
                .reserve(namespace, &record.vip)
                .await
                .map_err(|source| CoreError::AllocationFailed {
                    namespace: namespace.to_string(),
                    service: record.uid.clone(),
                    source,
                })?;
        }

        if !registry.is_empty() {
            info!(namespace, count = registry.len(), "Restored allocations from registry");
        }
        Ok(registry.len())
    }

    /// CIDR configured for `namespace` in the pool ConfigMap
    async fn pool_cidr(&self, namespace: &str) -> Result<String> {
        let key = vip_api::cidr_key(namespace);
        let missing = || CoreError::ConfigurationMissing {
            namespace: namespace.to_string(),
            key: key.clone(),
            config_map: self.config.pool_config_map.clone(),
        };

        let document = match self
            .store
            .get(&self.config.pool_config_namespace, &self.config.pool_config_map)
            .await
        {
            Ok(document) => document,
            Err(e) if e.is_not_found() => return Err(missing()),
            Err(e) => return Err(e.into()),
        };

        document
            .data
            .as_ref()
            .and_then(|data| data.get(&key))
            .map(|cidr| cidr.trim().to_string())
            .filter(|cidr| !cidr.is_empty())
            .ok_or_else(missing)
    }

    async fn fetch_or_create(&self, namespace: &str) -> Result<ConfigMap> {
        match self.store.get(namespace, &self.config.config_map).await {
            Ok(document) => Ok(document),
            Err(StoreError::NotFound { .. }) => {
                debug!(namespace, config_map = %self.config.config_map, "Creating registry document");
                Ok(self.store.create(namespace, &self.config.config_map).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn load_registry(document: &ConfigMap) -> std::result::Result<ServiceRegistry, DecodeError> {
        let text = document
            .data
            .as_ref()
            .and_then(|data| data.get(SERVICES_KEY))
            .map(String::as_str);
        ServiceRegistry::from_document(text)
    }

    async fn write_registry(
        &self,
        mut document: ConfigMap,
        registry: &ServiceRegistry,
    ) -> Result<ConfigMap> {
        document
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(SERVICES_KEY.to_string(), registry.to_document()?);
        document
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .entry(PROVIDER_ANNOTATION.to_string())
            .or_insert_with(|| PROVIDER_NAME.to_string());

        Ok(self.store.update(&document).await?)
    }

    /// Give back an address whose registry write never landed
    async fn compensate(&self, namespace: &str, vip: Option<String>) {
        let Some(vip) = vip else { return };
        match self.allocator.release(namespace, &vip).await {
            Ok(()) => debug!(namespace, %vip, "Released unpersisted address"),
            Err(e) => warn!(namespace, %vip, "Failed to release unpersisted address: {}", e),
        }
    }

    async fn backoff(&self, attempt: u32, max_attempts: u32, cancel: &CancellationToken) {
        if attempt >= max_attempts {
            return;
        }
        let delay = self.config.retry.backoff_duration(attempt);
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }

    fn check_cancelled(service: &ServiceRequest, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled {
                namespace: service.namespace.clone(),
                service: service.uid.clone(),
            });
        }
        Ok(())
    }
}
