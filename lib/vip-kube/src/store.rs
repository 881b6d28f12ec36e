//! Registry documents stored as ConfigMaps

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::debug;
use vip_api::{PROVIDER_ANNOTATION, PROVIDER_NAME};
use vip_core::{DocumentStore, StoreError};

/// DocumentStore backed by namespaced ConfigMaps
///
/// `replace` sends the object's `resourceVersion`, so the API server rejects
/// stale writes with 409 Conflict.
#[derive(Clone)]
pub struct ConfigMapStore {
    client: Client,
}

impl ConfigMapStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn map_error(err: kube::Error, namespace: &str, name: &str) -> StoreError {
        match err {
            kube::Error::Api(ref e) if e.code == 404 => StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ref e) if e.code == 409 => StoreError::Conflict {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            e => StoreError::KubernetesError(e),
        }
    }

    /// Like `map_error`, but a request that never got an API status back may
    /// still have been applied
    fn map_write_error(err: kube::Error, namespace: &str, name: &str) -> StoreError {
        match err {
            kube::Error::Api(_) => Self::map_error(err, namespace, name),
            e => StoreError::Indeterminate(format!("replace {}/{}: {}", namespace, name, e)),
        }
    }
}

#[async_trait]
impl DocumentStore for ConfigMapStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| Self::map_error(e, namespace, name))
    }

    async fn create(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError> {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                annotations: Some(BTreeMap::from([(
                    PROVIDER_ANNOTATION.to_string(),
                    PROVIDER_NAME.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        let api = self.api(namespace);
        match api.create(&PostParams::default(), &config_map).await {
            Ok(created) => {
                debug!(namespace, name, "Created configMap");
                Ok(created)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                // AlreadyExists: another reconcile created it first
                debug!(namespace, name, "ConfigMap already exists");
                api.get(name)
                    .await
                    .map_err(|e| Self::map_error(e, namespace, name))
            }
            Err(e) => Err(Self::map_error(e, namespace, name)),
        }
    }

    async fn update(&self, document: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let namespace = document
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| StoreError::Invalid("configMap has no namespace".to_string()))?;
        let name = document
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| StoreError::Invalid("configMap has no name".to_string()))?;
        if document.metadata.resource_version.is_none() {
            return Err(StoreError::Invalid(format!(
                "configMap {}/{} has no resourceVersion",
                namespace, name
            )));
        }

        self.api(namespace)
            .replace(name, &PostParams::default(), document)
            .await
            .map_err(|e| Self::map_write_error(e, namespace, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_status_codes_map_to_store_errors() {
        assert!(matches!(
            ConfigMapStore::map_error(api_error(404), "ns1", "plndr"),
            StoreError::NotFound { .. }
        ));
        assert!(matches!(
            ConfigMapStore::map_error(api_error(409), "ns1", "plndr"),
            StoreError::Conflict { .. }
        ));
        assert!(matches!(
            ConfigMapStore::map_error(api_error(500), "ns1", "plndr"),
            StoreError::KubernetesError(_)
        ));
    }

    #[test]
    fn test_transport_failure_on_write_is_indeterminate() {
        let transport = kube::Error::Service("connection reset by peer".into());
        assert!(ConfigMapStore::map_write_error(transport, "ns1", "plndr").is_indeterminate());

        assert!(matches!(
            ConfigMapStore::map_write_error(api_error(409), "ns1", "plndr"),
            StoreError::Conflict { .. }
        ));
        assert!(matches!(
            ConfigMapStore::map_write_error(api_error(422), "ns1", "plndr"),
            StoreError::KubernetesError(_)
        ));
    }
}
