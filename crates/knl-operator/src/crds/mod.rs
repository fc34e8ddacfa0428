//! Custom Resource Definitions
//!
//! `Lab` and `KNLConfig` are served by this operator; `LAN` belongs to the
//! k8slan data plane and is only written here.

pub mod knlconfig;
pub mod lab;
pub mod lan;
pub mod link;

pub use knlconfig::{KnlConfig, KnlConfigSpec};
pub use lab::{Lab, LabSpec, LabStatus, READY_CONDITION};
pub use lan::{Lan, LanSpec, Vni, VXLAN_PORT};
pub use link::{Connector, Link};
