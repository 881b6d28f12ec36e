//! What the engine needs to know about a Service

use crate::{CoreError, Result};
use k8s_openapi::api::core::v1::Service;

/// Identity and primary port of a LoadBalancer Service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Service UID, stable for the lifetime of the Service
    pub uid: String,
    /// Service name, for display only
    pub name: String,
    pub namespace: String,
    /// First declared port; only one port per service is tracked
    pub port: Option<i32>,
}

impl ServiceRequest {
    pub fn new(uid: &str, name: &str, namespace: &str, port: Option<i32>) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            port,
        }
    }
}

impl TryFrom<&Service> for ServiceRequest {
    type Error = CoreError;

    fn try_from(service: &Service) -> Result<Self> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let uid = service
            .metadata
            .uid
            .clone()
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| CoreError::InvalidService(format!("service {:?} has no uid", name)))?;
        let namespace = service
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let port = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .and_then(|ports| ports.first())
            .map(|port| port.port);

        Ok(Self {
            uid,
            name,
            namespace,
            port,
        })
    }
}

/// Deterministic load balancer name for a service
///
/// "a" followed by the UID without dashes, cut to 32 characters.
pub fn load_balancer_name(service: &ServiceRequest) -> String {
    std::iter::once('a')
        .chain(service.uid.chars().filter(|c| *c != '-'))
        .take(32)
        .collect()
}
