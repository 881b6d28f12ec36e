//! In-process CIDR pool allocator

use crate::{AddressAllocator, AllocatorError};
use async_trait::async_trait;
use ipnetwork::{IpNetwork, Ipv4Network};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// PoolAllocator keeps the allocated address set of every namespace in memory
#[derive(Clone, Default)]
pub struct PoolAllocator {
    // namespace -> allocated addresses
    allocated: Arc<Mutex<HashMap<String, BTreeSet<Ipv4Addr>>>>,
}

impl PoolAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_cidr(cidr: &str) -> Result<Ipv4Network, AllocatorError> {
        match cidr.trim().parse::<IpNetwork>() {
            Ok(IpNetwork::V4(network)) => Ok(network),
            Ok(IpNetwork::V6(_)) => Err(AllocatorError::InvalidCidr(
                cidr.to_string(),
                "only IPv4 pools are supported".to_string(),
            )),
            Err(e) => Err(AllocatorError::InvalidCidr(cidr.to_string(), e.to_string())),
        }
    }

    fn parse_address(address: &str) -> Result<Ipv4Addr, AllocatorError> {
        address
            .parse()
            .map_err(|_| AllocatorError::InvalidAddress(address.to_string()))
    }

    /// Usable host addresses of a network in ascending order
    fn hosts(network: Ipv4Network) -> impl Iterator<Item = Ipv4Addr> {
        // /31 and /32 have no network or broadcast address to skip
        let skip_edges = network.prefix() < 31;
        let (first, last) = (u32::from(network.network()), u32::from(network.broadcast()));
        (first..=last)
            .filter(move |addr| !skip_edges || (*addr != first && *addr != last))
            .map(Ipv4Addr::from)
    }
}

#[async_trait]
impl AddressAllocator for PoolAllocator {
    async fn find_available(&self, namespace: &str, cidr: &str) -> Result<String, AllocatorError> {
        let network = Self::parse_cidr(cidr)?;

        let mut allocated = self.allocated.lock().await;
        let used = allocated.entry(namespace.to_string()).or_default();

        let address = Self::hosts(network)
            .find(|addr| !used.contains(addr))
            .ok_or_else(|| AllocatorError::PoolExhausted {
                namespace: namespace.to_string(),
                cidr: cidr.to_string(),
            })?;
        used.insert(address);

        debug!(namespace, %address, "Allocated address");
        Ok(address.to_string())
    }

    async fn release(&self, namespace: &str, address: &str) -> Result<(), AllocatorError> {
        let address = Self::parse_address(address)?;

        let mut allocated = self.allocated.lock().await;
        if let Some(used) = allocated.get_mut(namespace) {
            if used.remove(&address) {
                debug!(namespace, %address, "Released address");
            }
        }
        Ok(())
    }

    async fn reserve(&self, namespace: &str, address: &str) -> Result<(), AllocatorError> {
        let address = Self::parse_address(address)?;

        let mut allocated = self.allocated.lock().await;
        allocated
            .entry(namespace.to_string())
            .or_default()
            .insert(address);
        Ok(())
    }

    async fn allocated(&self, namespace: &str) -> BTreeSet<Ipv4Addr> {
        let allocated = self.allocated.lock().await;
        allocated.get(namespace).cloned().unwrap_or_default()
    }
}
