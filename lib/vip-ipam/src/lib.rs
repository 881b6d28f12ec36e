//! Address allocation for load-balancer VIPs
//!
//! Addresses are handed out from a per-namespace CIDR pool. The engine only
//! depends on the [`AddressAllocator`] trait; [`PoolAllocator`] is the
//! in-process bookkeeping used by the controller.

pub mod allocator;
pub mod pool;

pub use allocator::{AddressAllocator, AllocatorError};
#[cfg(feature = "mock")]
pub use allocator::MockAddressAllocator;
pub use pool::PoolAllocator;
