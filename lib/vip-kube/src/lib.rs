//! Kubernetes integration for the VIP provider
pub mod client;
pub mod store;

pub use client::KubeClient;
pub use store::ConfigMapStore;
