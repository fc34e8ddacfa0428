//! KNLConfig CRD
//!
//! Operator-wide defaults. One named instance lives in the operator's
//! namespace; every reconcile pass reads it into an immutable snapshot.

use crate::nodes::NodeSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "knl.kubenetlab.net",
    version = "v1beta1",
    kind = "KNLConfig",
    root = "KnlConfig",
    plural = "knlconfigs",
    namespaced,
    printcolumn = r#"{"name":"Storage Class", "type":"string", "jsonPath":".spec.storageClass"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KnlConfigSpec {
    /// File server address, `host:port`.
    #[serde(default, rename = "fileSvr", skip_serializing_if = "Option::is_none")]
    pub file_server: Option<String>,

    /// IPv6 multicast group used by VxLAN tunnels between workers.
    #[serde(default, rename = "vxlanGrp", skip_serializing_if = "Option::is_none")]
    pub vxlan_group: Option<String>,

    /// VxLAN device used when a worker is not in `vxlanDevMap`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_vxlan_dev: Option<String>,

    /// Worker name → VxLAN device.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vxlan_dev_map: BTreeMap<String, String>,

    /// Storage class for every PVC and data volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// KubeVirt sidecar hook image.
    #[serde(default, rename = "sideCarImage", skip_serializing_if = "Option::is_none")]
    pub sidecar_image: Option<String>,

    /// Default values per node kind, applied to unset node fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_node: Option<NodeSpec>,
}
