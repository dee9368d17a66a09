//! Cluster Adapters
//!
//! Implementations of the [`ObjectCache`](crate::domain::ObjectCache) and
//! [`ClusterWriter`](crate::domain::ClusterWriter) ports:
//! - KubeCluster: reflector stores fed by background watchers, writes through the API server
//! - InMemoryCluster: a self-contained cluster backing the controller's tests

pub mod kube_cluster;
pub mod memory;

pub use kube_cluster::*;
pub use memory::*;
