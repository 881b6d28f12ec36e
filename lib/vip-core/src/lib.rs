//! Service-to-VIP reconciliation
//!
//! This library provides:
//! - The reconciliation engine behind Ensure/Update/Get/Delete of a load balancer
//! - The document store contract used to persist each namespace's registry
//! - Status mapping from an allocated VIP to a LoadBalancerStatus

pub mod engine;
pub mod error;
pub mod retry;
pub mod service;
pub mod status;
pub mod store;

pub use engine::{Engine, EngineConfig};
pub use error::{CoreError, Result};
pub use retry::RetryPolicy;
pub use service::{load_balancer_name, ServiceRequest};
pub use status::load_balancer_status;
pub use store::{DocumentStore, MemoryStore, StoreError};
