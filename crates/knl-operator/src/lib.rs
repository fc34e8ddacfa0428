//! KNL Operator Library
//!
//! Kubernetes operator that turns declarative network lab topologies into
//! live cluster resources. A `Lab` names nodes of several kinds (containers,
//! SR Linux emulators, KubeVirt VMs) and the links between them; every link
//! becomes a VxLAN-backed `LAN` whose spokes are attached to the nodes.

pub mod allocator;
pub mod config;
pub mod controllers;
pub mod crds;
pub mod error;
pub mod labels;
pub mod nodes;
pub mod reconcile;
pub mod store;
pub mod topology;

#[cfg(test)]
mod testing;

pub use crds::{KnlConfig, KnlConfigSpec, Lab, LabSpec, LabStatus, Lan, LanSpec};
pub use error::{Error, Result};
