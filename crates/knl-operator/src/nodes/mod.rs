//! Node kinds
//!
//! Every lab node is exactly one kind. On the wire a node is a one-of object
//! ([`NodeSpec`]) with one field per kind; in the operator it is the tagged
//! [`Node`] enum, and each variant implements the [`NodeKind`] lifecycle.

mod objects;
pub mod pod;
pub mod srl;
pub mod vm;

pub use pod::GeneralPod;
pub use srl::SrLinux;
pub use vm::VmNode;

use crate::allocator::AllocationScope;
use crate::config::ConfigSnapshot;
use crate::crds::link::validate_dns_label;
use crate::crds::{Lab, LabSpec};
use crate::error::{Error, Result};
use crate::reconcile::RepairPolicy;
use crate::store::ObjectStore;
use crate::topology::ParsedLab;
use async_trait::async_trait;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;
use tracing::debug;

/// Kind tag of a node.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum NodeType {
    Vm,
    Srl,
    Pod,
}

/// Wire form of a node: exactly one field must be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NodeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<VmNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srl: Option<SrLinux>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<GeneralPod>,
}

impl NodeSpec {
    pub fn is_empty(&self) -> bool {
        self.vm.is_none() && self.srl.is_none() && self.pod.is_none()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeSpecError {
    #[error("none of node type is specified")]
    NoneSpecified,
    #[error("only one node type is allowed")]
    MultipleSpecified,
}

/// A node of exactly one kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Vm(VmNode),
    Srl(SrLinux),
    Pod(GeneralPod),
}

impl TryFrom<&NodeSpec> for Node {
    type Error = NodeSpecError;

    fn try_from(spec: &NodeSpec) -> Result<Self, Self::Error> {
        let NodeSpec { vm, srl, pod } = spec;
        match (vm, srl, pod) {
            (Some(vm), None, None) => Ok(Node::Vm(vm.clone())),
            (None, Some(srl), None) => Ok(Node::Srl(srl.clone())),
            (None, None, Some(pod)) => Ok(Node::Pod(pod.clone())),
            (None, None, None) => Err(NodeSpecError::NoneSpecified),
            _ => Err(NodeSpecError::MultipleSpecified),
        }
    }
}

impl From<Node> for NodeSpec {
    fn from(node: Node) -> Self {
        let mut spec = NodeSpec::default();
        match node {
            Node::Vm(vm) => spec.vm = Some(vm),
            Node::Srl(srl) => spec.srl = Some(srl),
            Node::Pod(pod) => spec.pod = Some(pod),
        }
        spec
    }
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match self {
            Node::Vm(_) => NodeType::Vm,
            Node::Srl(_) => NodeType::Srl,
            Node::Pod(_) => NodeType::Pod,
        }
    }

    pub fn kind(&self) -> &dyn NodeKind {
        match self {
            Node::Vm(n) => n,
            Node::Srl(n) => n,
            Node::Pod(n) => n,
        }
    }

    pub fn kind_mut(&mut self) -> &mut dyn NodeKind {
        match self {
            Node::Vm(n) => n,
            Node::Srl(n) => n,
            Node::Pod(n) => n,
        }
    }

    /// Fill unset fields from the defaults for the same kind, if any.
    pub fn fill_unset(&mut self, defaults: &NodeSpec) {
        match self {
            Node::Vm(n) => {
                if let Some(d) = &defaults.vm {
                    n.fill_unset(d)
                }
            }
            Node::Srl(n) => {
                if let Some(d) = &defaults.srl {
                    n.fill_unset(d)
                }
            }
            Node::Pod(n) => {
                if let Some(d) = &defaults.pod {
                    n.fill_unset(d)
                }
            }
        }
    }
}

/// How the user wants to reach a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachMode {
    Shell,
    Console,
}

/// Where an interactive session should be opened. The binary turns it into
/// a `kubectl`/`virtctl` invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachTarget {
    Exec {
        namespace: String,
        pod: String,
        command: Vec<String>,
    },
    Console {
        namespace: String,
        vmi: String,
    },
    Ssh {
        namespace: String,
        vmi: String,
        user: String,
    },
}

impl AttachTarget {
    pub fn command_line(&self) -> Vec<String> {
        match self {
            AttachTarget::Exec {
                namespace,
                pod,
                command,
            } => ["kubectl", "-n", namespace.as_str(), "exec", "-it", pod.as_str(), "--"]
                .into_iter()
                .map(str::to_string)
                .chain(command.iter().cloned())
                .collect(),
            AttachTarget::Console { namespace, vmi } => {
                ["virtctl", "console", vmi.as_str(), "-n", namespace.as_str()]
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            }
            AttachTarget::Ssh {
                namespace,
                vmi,
                user,
            } => vec![
                "virtctl".to_string(),
                "ssh".to_string(),
                format!("{user}@vmi/{vmi}"),
                "-n".to_string(),
                namespace.clone(),
            ],
        }
    }
}

/// Per-pass inputs shared by every node kind.
pub struct NodeContext<'a> {
    pub lab: &'a ParsedLab,
    pub config: &'a ConfigSnapshot,
    pub scope: &'a AllocationScope<'a>,
    pub repair: RepairPolicy,
}

/// Lifecycle every node kind implements.
#[async_trait]
pub trait NodeKind: Send + Sync {
    fn node_type(&self) -> NodeType;

    /// Populate operator-wide defaults. Only used to build the application
    /// default configuration.
    fn set_app_defaults(&mut self);

    /// Populate defaults that depend on the node name. Runs after config
    /// defaults are merged.
    fn fill_defaults(&mut self, node_name: &str);

    fn validate(&self, lab: &LabSpec, node_name: &str) -> Result<()>;

    /// Converge this node's objects.
    async fn reconcile(
        &self,
        ctx: &NodeContext<'_>,
        node_name: &str,
        store: &dyn ObjectStore,
        force_removal: bool,
    ) -> Result<()>;

    fn attach(&self, namespace: &str, lab: &str, node_name: &str, mode: AttachMode) -> AttachTarget;
}

/// Constructor of an empty node of one kind.
pub type NodeFactory = fn() -> Node;

/// Kind tag → constructor table.
#[derive(Clone)]
pub struct Registry {
    factories: BTreeMap<NodeType, NodeFactory>,
}

impl Registry {
    /// Table of every kind built into the operator, checked for completeness.
    pub fn builtin() -> Result<Self> {
        let table: [(NodeType, NodeFactory); 3] = [
            (NodeType::Vm, || Node::Vm(VmNode::default())),
            (NodeType::Srl, || Node::Srl(SrLinux::default())),
            (NodeType::Pod, || Node::Pod(GeneralPod::default())),
        ];
        let registry = Self::from_table(table);
        registry.check_complete()?;
        Ok(registry)
    }

    pub fn from_table(entries: impl IntoIterator<Item = (NodeType, NodeFactory)>) -> Self {
        Self {
            factories: entries.into_iter().collect(),
        }
    }

    /// Fail if some kind has no constructor or a constructor builds the wrong kind.
    pub fn check_complete(&self) -> Result<()> {
        for node_type in NodeType::iter() {
            let factory = self.factories.get(&node_type).ok_or_else(|| {
                Error::validation(format!("no constructor registered for node type {node_type}"))
            })?;
            let built = factory().node_type();
            if built != node_type {
                return Err(Error::validation(format!(
                    "constructor registered for {node_type} builds {built}"
                )));
            }
        }
        Ok(())
    }

    pub fn create(&self, node_type: NodeType) -> Result<Node> {
        self.factories
            .get(&node_type)
            .map(|factory| factory())
            .ok_or_else(|| Error::validation(format!("unknown node type {node_type}")))
    }

    /// Application defaults for every kind, one field per kind.
    pub fn app_defaults(&self) -> NodeSpec {
        let mut spec = NodeSpec::default();
        for factory in self.factories.values() {
            let mut node = factory();
            node.kind_mut().set_app_defaults();
            match node {
                Node::Vm(n) => spec.vm = Some(n),
                Node::Srl(n) => spec.srl = Some(n),
                Node::Pod(n) => spec.pod = Some(n),
            }
        }
        spec
    }

    /// Kind implied by the naming convention `<kind>-<suffix>`.
    pub fn kind_from_name(&self, node_name: &str) -> Option<NodeType> {
        let (prefix, _) = node_name.split_once('-')?;
        let node_type = prefix.parse::<NodeType>().ok()?;
        self.factories.contains_key(&node_type).then_some(node_type)
    }
}

pub(crate) fn fill<T: Clone>(slot: &mut Option<T>, default: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(default);
    }
}

/// Resolve every node of `spec` into its kind and apply defaults: name
/// convention for untyped nodes, then the config's default node, then the
/// kind's name-dependent defaults.
pub fn apply_defaults(
    spec: &LabSpec,
    config: &ConfigSnapshot,
    registry: &Registry,
) -> Result<BTreeMap<String, Node>> {
    let mut nodes = BTreeMap::new();
    for (name, node_spec) in &spec.nodes {
        let implied = node_spec
            .is_empty()
            .then(|| registry.kind_from_name(name))
            .flatten();
        let mut node = match implied {
            Some(node_type) => {
                debug!(node = %name, kind = %node_type, "Node kind taken from its name");
                registry.create(node_type)?
            }
            None => Node::try_from(node_spec)
                .map_err(|e| Error::validation(format!("node {name}: {e}")))?,
        };
        if let Some(defaults) = config.default_node() {
            node.fill_unset(defaults);
        }
        node.kind_mut().fill_defaults(name);
        nodes.insert(name.clone(), node);
    }
    Ok(nodes)
}

/// Structural checks on a defaulted lab. Runs before anything is written.
pub fn validate_lab(spec: &LabSpec, nodes: &BTreeMap<String, Node>) -> Result<()> {
    for (name, node) in nodes {
        validate_dns_label("node", name)?;
        node.kind().validate(spec, name).map_err(|e| match e {
            Error::Validation(msg) => Error::validation(format!("node {name}: {msg}")),
            other => other,
        })?;
    }
    for (name, link) in &spec.links {
        link.validate(name, &spec.nodes)?;
    }
    Ok(())
}

/// Where to open an interactive session on `node_name` of `lab`.
pub fn attach_target(
    lab: &Lab,
    config: &ConfigSnapshot,
    registry: &Registry,
    node_name: &str,
    mode: AttachMode,
) -> Result<AttachTarget> {
    if !lab.spec.nodes.contains_key(node_name) {
        return Err(Error::validation(format!(
            "node {node_name} not found in lab {}",
            lab.name_any()
        )));
    }
    let namespace = lab
        .namespace()
        .ok_or_else(|| Error::missing("lab metadata.namespace"))?;
    let nodes = apply_defaults(&lab.spec, config, registry)?;
    let node = nodes
        .get(node_name)
        .ok_or_else(|| Error::validation(format!("node {node_name} has no kind")))?;
    Ok(node
        .kind()
        .attach(&namespace, &lab.name_any(), node_name, mode))
}
