//! Label keys, annotation keys and object naming shared by every object the
//! operator creates.

use crate::nodes::NodeType;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

pub const APP_LABEL_KEY: &str = "app.kubernetes.io/name";
pub const APP_LABEL_VALUE: &str = "kubenetlab";
pub const LAB_LABEL_KEY: &str = "lab.kubenetlab.net/name";
pub const NODE_LABEL_KEY: &str = "node.kubenetlab.net/name";
pub const CHASSIS_NAME_LABEL_KEY: &str = "chassis.kubenetlab.net/name";
pub const CHASSIS_TYPE_LABEL_KEY: &str = "chassis.kubenetlab.net/type";
pub const BRIDGE_INDEX_LABEL_KEY: &str = "bridge.kubenetlab.net/index";

/// Multus network selection annotation.
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";
/// Device-plugin resource backing a network attachment definition.
pub const RESOURCE_NAME_ANNOTATION: &str = "k8s.v1.cni.cncf.io/resourceName";
/// Prefix of the device-plugin resource exposed per LAN spoke.
pub const LAN_RESOURCE_PREFIX: &str = "lan.k8slan.io";

/// Finalizer placed on Labs and on every LAN they own.
pub const FINALIZER: &str = "lab.kubenetlab.net/finalizer";

/// Metadata for an object created on behalf of a lab.
///
/// Node-specific objects additionally carry the chassis name and type labels.
pub fn object_meta(
    name: &str,
    lab: &str,
    namespace: &str,
    node: Option<(&str, NodeType)>,
) -> ObjectMeta {
    let mut labels = BTreeMap::from([
        (APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string()),
        (LAB_LABEL_KEY.to_string(), lab.to_string()),
    ]);
    if let Some((node_name, node_type)) = node {
        labels.insert(CHASSIS_NAME_LABEL_KEY.to_string(), node_name.to_string());
        labels.insert(CHASSIS_TYPE_LABEL_KEY.to_string(), node_type.to_string());
    }
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Label selector matching every object of one lab.
pub fn lab_selector(lab: &str) -> String {
    format!("{LAB_LABEL_KEY}={lab}")
}

/// Name of the LAN backing `link` in `lab`.
pub fn lan_name(lab: &str, link: &str) -> String {
    format!("{lab}-{link}")
}

pub fn bridge_name(vni: u32) -> String {
    format!("klanbr{vni}")
}

pub fn vxlan_name(vni: u32) -> String {
    format!("klanvx{vni}")
}

/// Spoke names only depend on the overlay ID and the connector position.
pub fn spoke_name(vni: u32, connector_index: usize) -> String {
    format!("{vni}-{connector_index}")
}

/// Name of the per-spoke network attachment definition.
pub fn spoke_nad_name(lan: &str, spoke: &str) -> String {
    format!("{lan}-{spoke}")
}

/// Device-plugin resource name a pod requests to attach to a spoke.
pub fn spoke_resource_name(lan: &str, spoke: &str) -> String {
    format!("{LAN_RESOURCE_PREFIX}/{lan}-{spoke}")
}

pub fn pod_name(lab: &str, node: &str) -> String {
    format!("{lab}-{node}")
}
