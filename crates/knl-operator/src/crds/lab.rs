//! Lab CRD
//!
//! A Lab declares named nodes of heterogeneous kinds and the links between
//! them. The lab controller converges it into pods, VMs, storage claims and
//! one LAN per link.

use super::link::Link;
use crate::nodes::NodeSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition type reported on every lab.
pub const READY_CONDITION: &str = "Ready";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "knl.kubenetlab.net",
    version = "v1beta1",
    kind = "Lab",
    namespaced,
    status = "LabStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LabSpec {
    /// Node name → node definition.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeSpec>,

    /// Link name → link definition.
    #[serde(default)]
    pub links: BTreeMap<String, Link>,
}

impl LabSpec {
    /// Position of `node` among the lab's nodes in name order.
    pub fn node_index(&self, node: &str) -> Option<usize> {
        self.nodes.keys().position(|n| n == node)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl LabStatus {
    pub fn ready(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == READY_CONDITION)
    }
}
