//! Mapping from an allocated VIP to the status reported on the Service

use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus};

/// Status with `vip` as the only ingress point
pub fn load_balancer_status(vip: &str) -> LoadBalancerStatus {
    LoadBalancerStatus {
        ingress: Some(vec![LoadBalancerIngress {
            ip: Some(vip.to_string()),
            ..Default::default()
        }]),
    }
}

/// First ingress IP of a status, if any
pub fn ingress_ip(status: &LoadBalancerStatus) -> Option<&str> {
    status
        .ingress
        .as_ref()
        .and_then(|ingress| ingress.first())
        .and_then(|point| point.ip.as_deref())
}
