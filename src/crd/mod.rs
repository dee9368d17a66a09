//! Custom Resource Definitions for the Block Volume Controller
//!
//! This module contains the storage system's own resources:
//! - Volume: block volume whose `status.kubernetesStatus` this controller owns
//! - StorageNode: per-node resource carrying the node-gone condition

pub mod volume;
pub mod storage_node;

pub use volume::*;
pub use storage_node::*;
