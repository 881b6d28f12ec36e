//! Allocator contract consumed by the reconciliation engine

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use thiserror::Error;

#[cfg(feature = "mock")]
use mockall::automock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("no free address left in {cidr} for namespace {namespace}")]
    PoolExhausted { namespace: String, cidr: String },

    #[error("invalid CIDR range {0:?}: {1}")]
    InvalidCidr(String, String),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),
}

/// Hands out and takes back addresses, scoped per namespace
#[cfg_attr(feature = "mock", automock)]
#[async_trait]
pub trait AddressAllocator: Send + Sync {
    /// Pick a free address in `cidr` for `namespace` and mark it allocated
    async fn find_available(&self, namespace: &str, cidr: &str) -> Result<String, AllocatorError>;

    /// Mark `address` free again. Releasing a free address is a no-op.
    async fn release(&self, namespace: &str, address: &str) -> Result<(), AllocatorError>;

    /// Mark `address` allocated without scanning, e.g. when rebuilding from persisted state
    async fn reserve(&self, namespace: &str, address: &str) -> Result<(), AllocatorError>;

    /// Snapshot of the addresses currently allocated in `namespace`
    async fn allocated(&self, namespace: &str) -> BTreeSet<Ipv4Addr>;
}
