//! LAN CRD
//!
//! A LAN is the overlay broadcast domain backing one lab link. It is consumed
//! by the k8slan data-plane controller, which builds the bridge, the VxLAN
//! tunnel and one veth spoke per entry in `spokes`.

use crate::allocator::MAX_ID;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// UDP port used by every LAN VxLAN tunnel.
pub const VXLAN_PORT: u16 = 48622;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lan.k8slan.io",
    version = "v1beta1",
    kind = "LAN",
    root = "Lan",
    plural = "lans",
    namespaced,
    printcolumn = r#"{"name":"VNI", "type":"integer", "jsonPath":".spec.vni"}"#,
    printcolumn = r#"{"name":"Bridge", "type":"string", "jsonPath":".spec.bridgeName"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LanSpec {
    /// Network namespace the data plane creates for this LAN.
    pub ns: String,

    pub bridge_name: String,

    #[serde(rename = "vxlanName")]
    pub vxlan_name: String,

    /// VxLAN network identifier, allocated cluster-wide.
    pub vni: Vni,

    /// Interface used for VxLAN when the worker is not listed in `vxDevMap`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_vx_dev: Option<String>,

    /// Worker name → VxLAN interface.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vx_dev_map: BTreeMap<String, String>,

    #[serde(default = "default_vx_port")]
    pub vx_port: u16,

    /// Multicast group used for BUM traffic.
    #[serde(default, rename = "vxlanGrp", skip_serializing_if = "Option::is_none")]
    pub vxlan_group: Option<String>,

    /// Spoke names, in connector order.
    #[serde(default, rename = "spokeList")]
    pub spokes: Vec<String>,
}

fn default_vx_port() -> u16 {
    VXLAN_PORT
}

/// VxLAN network identifier (1..=2^24-1).
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct Vni(u32);

impl Vni {
    pub fn new(id: u32) -> Result<Self, &'static str> {
        if id == 0 || id > MAX_ID {
            Err("VNI must be between 1 and 16777215")
        } else {
            Ok(Self(id))
        }
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Vni {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Vni> for u32 {
    fn from(vni: Vni) -> Self {
        vni.0
    }
}

impl std::fmt::Display for Vni {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
