//! Domain layer - Core reconcile rules and port definitions
//!
//! This module defines the traits (ports) the cluster adapters implement and
//! the pure rules the controllers apply, following hexagonal architecture
//! principles.

pub mod ports;
pub mod projection;
pub mod workload;

pub use ports::*;
pub use projection::*;
pub use workload::*;
