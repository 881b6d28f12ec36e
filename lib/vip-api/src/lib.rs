//! Data model for the VIP load-balancer provider
//!
//! This library defines what gets persisted:
//! - ServiceRecord: one service-to-VIP allocation
//! - ServiceRegistry: the ordered set of records stored in a namespace's ConfigMap
//! - Well-known document keys shared by the engine and the Kubernetes store

pub mod registry;

pub use registry::{DecodeError, ServiceRecord, ServiceRegistry};

/// Data key holding the JSON-serialized ServiceRegistry
pub const SERVICES_KEY: &str = "plndrservices";

/// Annotation key recording which provider owns the document
pub const PROVIDER_ANNOTATION: &str = "provider";

/// Value written under [`PROVIDER_ANNOTATION`]
pub const PROVIDER_NAME: &str = "vip-controller";

/// Key under which the address pool for `namespace` is configured
pub fn cidr_key(namespace: &str) -> String {
    format!("cidr-{}", namespace)
}
