//! Fabric control plane for a two-pod Fat-Tree network
//!
//! Models the topology, computes loop-free multipath routes, probes
//! element health with hysteresis, and recovers from failures by
//! atomically re-installing routes against a pluggable forwarding
//! substrate.

pub mod config;
pub mod error;
pub mod health_monitor;
pub mod optimizer;
pub mod path_computer;
pub mod recovery;
pub mod routing;
pub mod snapshot;
pub mod topology;
pub mod types;

pub use error::{FabricError, FabricResult};
