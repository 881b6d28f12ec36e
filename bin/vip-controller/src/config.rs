//! Controller settings read from the environment

use anyhow::{Context, Result};
use std::time::Duration;
use vip_core::{EngineConfig, RetryPolicy};

/// ControllerConfig holds everything tunable about the controller
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Registry ConfigMap name in each service namespace
    pub config_map: String,
    /// ConfigMap holding the `cidr-<namespace>` pools
    pub pool_config_map: String,
    /// Namespace of the pool ConfigMap
    pub pool_config_namespace: String,
    /// Optimistic-concurrency attempts per reconcile
    pub max_attempts: u32,
    /// Requeue interval after a successful reconcile
    pub requeue: Duration,
    /// Requeue interval after a failed reconcile
    pub error_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            config_map: "plndr".to_string(),
            pool_config_map: "plndr".to_string(),
            pool_config_namespace: "kube-system".to_string(),
            max_attempts: 5,
            requeue: Duration::from_secs(300),
            error_requeue: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from `VIP_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let number = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .with_context(|| format!("{} must be a non-negative integer, got {:?}", key, raw))
                })
                .transpose()
        };

        let max_attempts = match number("VIP_MAX_ATTEMPTS")? {
            Some(0) => anyhow::bail!("VIP_MAX_ATTEMPTS must be at least 1"),
            Some(n) => u32::try_from(n).context("VIP_MAX_ATTEMPTS is too large")?,
            None => defaults.max_attempts,
        };

        Ok(Self {
            config_map: lookup("VIP_CONFIG_MAP").unwrap_or(defaults.config_map),
            pool_config_map: lookup("VIP_POOL_CONFIG_MAP").unwrap_or(defaults.pool_config_map),
            pool_config_namespace: lookup("VIP_POOL_CONFIG_NAMESPACE")
                .unwrap_or(defaults.pool_config_namespace),
            max_attempts,
            requeue: number("VIP_REQUEUE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.requeue),
            error_requeue: number("VIP_ERROR_REQUEUE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.error_requeue),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            config_map: self.config_map.clone(),
            pool_config_map: self.pool_config_map.clone(),
            pool_config_namespace: self.pool_config_namespace.clone(),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..Default::default()
            },
        }
    }
}
