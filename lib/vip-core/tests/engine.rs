//! End-to-end engine behaviour against the in-memory store and pool allocator

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vip_api::{ServiceRegistry, PROVIDER_ANNOTATION, PROVIDER_NAME, SERVICES_KEY};
use vip_core::status::ingress_ip;
use vip_core::{CoreError, Engine, EngineConfig, MemoryStore, RetryPolicy, ServiceRequest};
use vip_ipam::{AddressAllocator, PoolAllocator};

struct Harness {
    store: MemoryStore,
    allocator: PoolAllocator,
    engine: Arc<Engine>,
    cancel: CancellationToken,
}

impl Harness {
    async fn new() -> Self {
        let store = MemoryStore::new();
        store
            .insert(config_map(
                "kube-system",
                [("cidr-ns1", "10.0.0.0/24"), ("cidr-ns2", "192.168.0.0/30")],
            ))
            .await;
        let allocator = PoolAllocator::new();
        let engine = Arc::new(Engine::new(
            Arc::new(store.clone()),
            Arc::new(allocator.clone()),
            EngineConfig {
                retry: RetryPolicy::immediate(5),
                ..Default::default()
            },
        ));
        Self {
            store,
            allocator,
            engine,
            cancel: CancellationToken::new(),
        }
    }

    async fn registry(&self, namespace: &str) -> ServiceRegistry {
        let document = self.store.document(namespace, "plndr").await.unwrap();
        let text = document.data.as_ref().and_then(|data| data.get(SERVICES_KEY));
        ServiceRegistry::from_document(text.map(String::as_str)).unwrap()
    }

    async fn ensure(&self, service: &ServiceRequest) -> String {
        let status = self.engine.ensure(service, &self.cancel).await.unwrap();
        ingress_ip(&status).unwrap().to_string()
    }

    /// Registry VIPs and allocator bookkeeping must be the same set
    async fn assert_agreement(&self, namespace: &str) {
        let recorded: BTreeSet<Ipv4Addr> = match self.store.document(namespace, "plndr").await {
            Some(_) => self
                .registry(namespace)
                .await
                .iter()
                .map(|record| record.vip.parse().unwrap())
                .collect(),
            None => BTreeSet::new(),
        };
        assert_eq!(recorded, self.allocator.allocated(namespace).await);
    }
}

fn config_map<const N: usize>(namespace: &str, data: [(&str, &str); N]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("plndr".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

fn svc(uid: &str, port: i32) -> ServiceRequest {
    ServiceRequest::new(uid, &format!("{}-name", uid), "ns1", Some(port))
}

#[tokio::test]
async fn test_ensure_is_idempotent() {
    let h = Harness::new().await;
    let first = h.ensure(&svc("svc-a", 80)).await;
    let second = h.ensure(&svc("svc-a", 80)).await;

    assert_eq!(first, "10.0.0.1");
    assert_eq!(first, second);
    assert_eq!(h.registry("ns1").await.len(), 1);
    // the second ensure found nothing to change
    assert_eq!(h.store.update_count(), 1);
    h.assert_agreement("ns1").await;
}

#[tokio::test]
async fn test_ensure_refreshes_port_in_place() {
    let h = Harness::new().await;
    h.ensure(&svc("svc-a", 80)).await;
    h.ensure(&svc("svc-b", 443)).await;
    let vip = h.ensure(&svc("svc-a", 8080)).await;

    let registry = h.registry("ns1").await;
    assert_eq!(vip, "10.0.0.1");
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.services[0].uid, "svc-a");
    assert_eq!(registry.services[0].port, 8080);
    h.assert_agreement("ns1").await;
}

#[tokio::test]
async fn test_get_before_ensure_reports_absence() {
    let h = Harness::new().await;
    assert!(h.engine.get(&svc("svc-a", 80)).await.unwrap().is_none());

    h.ensure(&svc("svc-b", 80)).await;
    assert!(h.engine.get(&svc("svc-a", 80)).await.unwrap().is_none());

    let status = h.engine.get(&svc("svc-b", 80)).await.unwrap().unwrap();
    assert_eq!(ingress_ip(&status), Some("10.0.0.1"));
}

#[tokio::test]
async fn test_get_propagates_store_outage() {
    let h = Harness::new().await;
    h.store.set_unavailable(true);
    let err = h.engine.get(&svc("svc-a", 80)).await.unwrap_err();
    assert!(matches!(err, CoreError::Store(_)));
}

#[tokio::test]
async fn test_namespace_scenario() {
    let h = Harness::new().await;
    let a = svc("svc-a", 80);
    let b = svc("svc-b", 443);

    let (vip_a, vip_b) = tokio::join!(
        h.engine.ensure(&a, &h.cancel),
        h.engine.ensure(&b, &h.cancel)
    );
    let mut vips = vec![
        ingress_ip(&vip_a.unwrap()).unwrap().to_string(),
        ingress_ip(&vip_b.unwrap()).unwrap().to_string(),
    ];
    vips.sort();
    assert_eq!(vips, vec!["10.0.0.1", "10.0.0.2"]);

    let registry = h.registry("ns1").await;
    assert_eq!(registry.len(), 2);
    assert!(registry.find("svc-a").is_some());
    assert!(registry.find("svc-b").is_some());
    h.assert_agreement("ns1").await;

    let released = registry.find("svc-a").unwrap().vip.clone();
    h.engine.delete(&a, &h.cancel).await.unwrap();

    let registry = h.registry("ns1").await;
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.services[0].uid, "svc-b");
    h.assert_agreement("ns1").await;

    // the freed address is handed to the next service
    assert_eq!(h.ensure(&svc("svc-c", 8080)).await, released);
    h.assert_agreement("ns1").await;
}

#[tokio::test]
async fn test_many_concurrent_ensures_lose_nothing() {
    let h = Harness::new().await;
    let engine = Arc::new(Engine::new(
        Arc::new(h.store.clone()),
        Arc::new(h.allocator.clone()),
        EngineConfig {
            retry: RetryPolicy::immediate(20),
            ..Default::default()
        },
    ));

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            let cancel = h.cancel.clone();
            tokio::spawn(async move { engine.ensure(&svc(&format!("svc-{}", i), 80), &cancel).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.registry("ns1").await.len(), 8);
    h.assert_agreement("ns1").await;
}

#[tokio::test]
async fn test_single_conflict_is_retried() {
    let h = Harness::new().await;
    h.ensure(&svc("svc-a", 80)).await;
    h.store.inject_conflicts(1);

    assert_eq!(h.ensure(&svc("svc-b", 443)).await, "10.0.0.2");

    let registry = h.registry("ns1").await;
    assert_eq!(registry.len(), 2);
    h.assert_agreement("ns1").await;
}

#[tokio::test]
async fn test_exhausted_retries_release_address() {
    let h = Harness::new().await;
    h.store.inject_conflicts(100);

    let err = h.engine.ensure(&svc("svc-a", 80), &h.cancel).await.unwrap_err();
    assert!(matches!(err, CoreError::PersistenceConflict { attempts: 5, .. }));
    assert!(h.allocator.allocated("ns1").await.is_empty());
}

#[tokio::test]
async fn test_pool_exhaustion_is_allocation_failure() {
    let h = Harness::new().await;
    let ns2 = |uid: &str| ServiceRequest::new(uid, uid, "ns2", Some(80));

    h.engine.ensure(&ns2("a"), &h.cancel).await.unwrap();
    h.engine.ensure(&ns2("b"), &h.cancel).await.unwrap();
    let err = h.engine.ensure(&ns2("c"), &h.cancel).await.unwrap_err();

    assert!(matches!(err, CoreError::AllocationFailed { .. }));
    assert_eq!(h.registry("ns2").await.len(), 2);
    h.assert_agreement("ns2").await;
}

#[tokio::test]
async fn test_missing_configuration() {
    let h = Harness::new().await;
    let service = ServiceRequest::new("svc-a", "web", "ns9", Some(80));

    let err = h.engine.ensure(&service, &h.cancel).await.unwrap_err();
    assert!(matches!(err, CoreError::ConfigurationMissing { .. }));
    assert!(h.store.document("ns9", "plndr").await.is_none());
    assert!(h.allocator.allocated("ns9").await.is_empty());
}

#[tokio::test]
async fn test_delete_unknown_is_noop() {
    let h = Harness::new().await;
    h.engine.delete(&svc("ghost", 80), &h.cancel).await.unwrap();

    h.ensure(&svc("svc-a", 80)).await;
    let writes = h.store.update_count();
    h.engine.delete(&svc("ghost", 80), &h.cancel).await.unwrap();

    assert_eq!(h.store.update_count(), writes);
    assert_eq!(h.registry("ns1").await.len(), 1);
    h.assert_agreement("ns1").await;
}

#[tokio::test]
async fn test_delete_failure_keeps_address_allocated() {
    let h = Harness::new().await;
    h.ensure(&svc("svc-a", 80)).await;
    h.store.inject_conflicts(100);

    let err = h.engine.delete(&svc("svc-a", 80), &h.cancel).await.unwrap_err();
    assert!(matches!(err, CoreError::PersistenceConflict { .. }));
    // registry still claims the address, so the allocator must too
    h.assert_agreement("ns1").await;
    assert_eq!(h.allocator.allocated("ns1").await.len(), 1);
}

#[tokio::test]
async fn test_corrupt_registry_recovers_on_ensure() {
    let h = Harness::new().await;
    h.store
        .insert(config_map("ns1", [(SERVICES_KEY, "{broken")]))
        .await;

    let err = h.engine.get(&svc("svc-a", 80)).await.unwrap_err();
    assert!(matches!(err, CoreError::CorruptRegistry { .. }));

    assert_eq!(h.ensure(&svc("svc-a", 80)).await, "10.0.0.1");
    assert_eq!(h.registry("ns1").await.len(), 1);
}

#[tokio::test]
async fn test_write_sets_provider_annotation() {
    let h = Harness::new().await;
    h.ensure(&svc("svc-a", 80)).await;

    let document = h.store.document("ns1", "plndr").await.unwrap();
    let annotations = document.metadata.annotations.unwrap();
    assert_eq!(annotations.get(PROVIDER_ANNOTATION).map(String::as_str), Some(PROVIDER_NAME));
}

#[tokio::test]
async fn test_restore_rebuilds_allocator() {
    let h = Harness::new().await;
    h.store
        .insert(config_map(
            "ns1",
            [(
                SERVICES_KEY,
                r#"{"services":[{"vip":"10.0.0.1","port":80,"uid":"svc-a","serviceName":"a"},{"vip":"10.0.0.3","port":80,"uid":"svc-b","serviceName":"b"}]}"#,
            )],
        ))
        .await;

    assert_eq!(h.engine.restore("ns1").await.unwrap(), 2);
    assert_eq!(h.engine.restore("ns-empty").await.unwrap(), 0);
    h.assert_agreement("ns1").await;

    assert_eq!(h.ensure(&svc("svc-c", 80)).await, "10.0.0.2");
}

#[tokio::test]
async fn test_cancelled_reconcile_touches_nothing() {
    let h = Harness::new().await;
    h.cancel.cancel();

    let err = h.engine.ensure(&svc("svc-a", 80), &h.cancel).await.unwrap_err();
    assert!(matches!(err, CoreError::Cancelled { .. }));
    assert!(h.allocator.allocated("ns1").await.is_empty());
    assert_eq!(h.store.update_count(), 0);
}

#[tokio::test]
async fn test_unrestored_allocator_never_hands_out_recorded_address() {
    let h = Harness::new().await;
    h.store
        .insert(config_map(
            "ns1",
            [(
                SERVICES_KEY,
                r#"{"services":[{"vip":"10.0.0.1","port":80,"uid":"svc-a","serviceName":"a"}]}"#,
            )],
        ))
        .await;

    // allocator starts empty, as after a restart whose restore never ran
    assert_eq!(h.ensure(&svc("svc-b", 80)).await, "10.0.0.2");

    let registry = h.registry("ns1").await;
    assert_eq!(registry.find("svc-a").unwrap().vip, "10.0.0.1");
    assert_eq!(registry.len(), 2);
    h.assert_agreement("ns1").await;
}

#[tokio::test]
async fn test_lost_write_reply_keeps_committed_address() {
    let h = Harness::new().await;
    h.store.inject_lost_replies(1);

    assert_eq!(h.ensure(&svc("svc-a", 80)).await, "10.0.0.1");
    assert_eq!(h.registry("ns1").await.find("svc-a").unwrap().vip, "10.0.0.1");
    h.assert_agreement("ns1").await;

    // the address is still held, so the next service gets a fresh one
    assert_eq!(h.ensure(&svc("svc-b", 80)).await, "10.0.0.2");
    h.assert_agreement("ns1").await;
}

#[tokio::test]
async fn test_lost_delete_reply_still_releases() {
    let h = Harness::new().await;
    h.ensure(&svc("svc-a", 80)).await;
    h.store.inject_lost_replies(1);

    h.engine.delete(&svc("svc-a", 80), &h.cancel).await.unwrap();

    assert!(h.registry("ns1").await.is_empty());
    assert!(h.allocator.allocated("ns1").await.is_empty());
}
