//! Object builders shared by node kinds.

use super::NodeType;
use crate::labels::{self, NETWORKS_ANNOTATION, NODE_LABEL_KEY, RESOURCE_NAME_ANNOTATION};
use crate::store::{resources, Target};
use crate::topology::{NodeSpoke, ParsedLab};
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod, PodSpec,
    ResourceRequirements, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub(super) fn node_meta(
    lab: &ParsedLab,
    name: &str,
    node: &str,
    node_type: NodeType,
) -> ObjectMeta {
    labels::object_meta(name, lab.name(), lab.namespace(), Some((node, node_type)))
}

/// Single-container pod named after the node.
pub(super) fn base_pod(lab: &ParsedLab, node: &str, node_type: NodeType, image: &str) -> Pod {
    let mut metadata = node_meta(lab, &labels::pod_name(lab.name(), node), node, node_type);
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(NODE_LABEL_KEY.to_string(), node.to_string());
    Pod {
        metadata,
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) fn pvc(
    lab: &ParsedLab,
    name: &str,
    node: &str,
    node_type: NodeType,
    size: &Quantity,
    storage_class: &str,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: node_meta(lab, name, node, node_type),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOncePod".to_string()]),
            storage_class_name: Some(storage_class.to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), size.clone())])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// CPU and memory requests, omitting unset values.
pub(super) fn requests(
    cpu: &Option<Quantity>,
    memory: &Option<Quantity>,
) -> BTreeMap<String, Quantity> {
    [("cpu", cpu), ("memory", memory)]
        .into_iter()
        .filter_map(|(name, q)| q.clone().map(|q| (name.to_string(), q)))
        .collect()
}

pub(super) fn spoke_nad_name(spoke: &NodeSpoke<'_>) -> String {
    labels::spoke_nad_name(&spoke.lan, spoke.spoke)
}

/// Network attachment definition moving the spoke's device into the pod,
/// with static addressing when the connector has an address.
pub(super) fn spoke_nad(lab: &ParsedLab, spoke: &NodeSpoke<'_>, node_type: NodeType) -> Target {
    let name = spoke_nad_name(spoke);
    let mut config = json!({
        "cniVersion": "0.3.1",
        "name": name,
        "type": "host-device",
        "ipam": {},
    });
    if let Some(addr) = &spoke.connector.addr {
        let mut address = json!({ "address": addr });
        if let Some(gw) = spoke.link.gw_addr.as_deref().and_then(|g| g.parse::<IpNet>().ok()) {
            address["gateway"] = Value::String(gw.addr().to_string());
        }
        config["ipam"] = json!({ "type": "static", "addresses": [address] });
    }
    if let Some(mtu) = spoke.link.mtu {
        config["mtu"] = json!(mtu);
    }

    let mut target = Target::dynamic(
        resources::network_attachment_definition(),
        &name,
        json!({ "spec": { "config": config.to_string() } }),
    );
    target.object.metadata = node_meta(lab, &name, &spoke.connector.node, node_type);
    target.object.metadata.annotations = Some(BTreeMap::from([(
        RESOURCE_NAME_ANNOTATION.to_string(),
        labels::spoke_resource_name(&spoke.lan, spoke.spoke),
    )]));
    target
}

/// Request every spoke through the multus annotation and the spoke's
/// device-plugin resource. `interface` names the in-pod interface, if any.
pub(super) fn attach_spokes(
    pod: &mut Pod,
    spokes: &[NodeSpoke<'_>],
    interface: impl Fn(usize, &NodeSpoke<'_>) -> Option<String>,
) {
    if spokes.is_empty() {
        return;
    }
    let networks: Vec<String> = spokes
        .iter()
        .enumerate()
        .map(|(i, spoke)| match interface(i, spoke) {
            Some(ifname) => format!("{}@{ifname}", spoke_nad_name(spoke)),
            None => spoke_nad_name(spoke),
        })
        .collect();
    pod.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(NETWORKS_ANNOTATION.to_string(), networks.join(","));

    if let Some(container) = pod.spec.as_mut().and_then(|s| s.containers.first_mut()) {
        let limits = container
            .resources
            .get_or_insert_with(ResourceRequirements::default)
            .limits
            .get_or_insert_with(BTreeMap::new);
        for spoke in spokes {
            limits.insert(
                labels::spoke_resource_name(&spoke.lan, spoke.spoke),
                Quantity("1".to_string()),
            );
        }
    }
}
