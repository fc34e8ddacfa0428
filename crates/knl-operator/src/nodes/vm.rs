//! KubeVirt virtual machine node
//!
//! A VM node is a DataVolume holding the disk image, a per-node fabric bridge
//! and a VirtualMachineInstance. The VMI is replaced when it reaches a
//! terminal phase.

use super::objects;
use super::{fill, AttachMode, AttachTarget, NodeContext, NodeKind, NodeType};
use crate::allocator::{allocate_ids, IdKind};
use crate::crds::LabSpec;
use crate::error::{Error, Result};
use crate::labels::{self, BRIDGE_INDEX_LABEL_KEY};
use crate::reconcile::{ensure_healthy_or_remove, ensure_or_remove};
use crate::store::{resources, ObjectStore, Target};
use crate::topology::ParsedLab;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::DynamicObject;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

const DEFAULT_CPU: &str = "2.0";
const DEFAULT_MEMORY: &str = "4Gi";
const DEFAULT_USER: &str = "lab";
const DEFAULT_PASSWORD: &str = "lab123";
const FABRIC_MTU: u32 = 9000;
/// MAC of the pod network interface, used for console and SSH access.
const POD_NET_MAC: &str = "02:ff:00:00:00:63";
const SIDECAR_ANNOTATION: &str = "hooks.kubevirt.io/hookSidecars";

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmNode {
    /// Disk image: a registry reference (`docker://...`) or an HTTP(S) URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<Quantity>,

    /// Whole cores are given to the guest; fractions are rounded down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, rename = "passwd", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// DNS domain appended to the guest hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Guest hostname. Defaults to the node name, qualified by `domain`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl VmNode {
    pub fn fill_unset(&mut self, defaults: &Self) {
        fill(&mut self.image, &defaults.image);
        fill(&mut self.disk_size, &defaults.disk_size);
        fill(&mut self.cpu, &defaults.cpu);
        fill(&mut self.memory, &defaults.memory);
        fill(&mut self.user, &defaults.user);
        fill(&mut self.password, &defaults.password);
        fill(&mut self.domain, &defaults.domain);
    }

    fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(DEFAULT_USER)
    }
}

/// Whole cores in a CPU quantity such as `2`, `2.5` or `1500m`.
fn cores(cpu: &Quantity) -> Result<u32> {
    let raw = cpu.0.trim();
    let value = match raw.strip_suffix('m') {
        Some(millis) => millis.parse::<f64>().map(|m| m / 1000.0),
        None => raw.parse::<f64>(),
    }
    .ok()
    .filter(|v| v.is_finite())
    .ok_or_else(|| Error::validation(format!("cpu {raw} is not a valid quantity")))?;
    if value < 1.0 {
        return Err(Error::validation(format!("cpu {raw} is less than one core")));
    }
    if value >= f64::from(u32::MAX) {
        return Err(Error::validation(format!("cpu {raw} is too large")));
    }
    Ok(value.floor() as u32)
}

fn fabric_name(lab: &str, node: &str) -> String {
    format!("{lab}-{node}-fb")
}

fn data_volume_name(lab: &str, node: &str) -> String {
    format!("{lab}-{node}-dv")
}

/// Fabric bridge NAD; the bridge index label makes the index visible to the
/// allocator.
fn fabric_nad(lab: &ParsedLab, node: &str, index: u32) -> Target {
    let name = fabric_name(lab.name(), node);
    let config = json!({
        "cniVersion": "0.3.1",
        "name": name,
        "type": "bridge",
        "mtu": FABRIC_MTU,
        "bridge": format!("knlfb{index}"),
        "ipam": {},
    });
    let mut target = Target::dynamic(
        resources::network_attachment_definition(),
        &name,
        json!({ "spec": { "config": config.to_string() } }),
    );
    let mut metadata = objects::node_meta(lab, &name, node, NodeType::Vm);
    metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(BRIDGE_INDEX_LABEL_KEY.to_string(), index.to_string());
    target.object.metadata = metadata;
    target
}

fn data_volume(
    lab: &ParsedLab,
    node: &str,
    image: &str,
    size: &Quantity,
    storage_class: &str,
) -> Target {
    let name = data_volume_name(lab.name(), node);
    let source = if image.to_lowercase().starts_with("http") {
        json!({ "http": { "url": image } })
    } else {
        json!({ "registry": { "url": image } })
    };
    let mut target = Target::dynamic(
        resources::data_volume(),
        &name,
        json!({
            "spec": {
                "pvc": {
                    "accessModes": ["ReadWriteOncePod"],
                    "storageClassName": storage_class,
                    "resources": { "requests": { "storage": size } },
                },
                "source": source,
            }
        }),
    );
    target.object.metadata = objects::node_meta(lab, &name, node, NodeType::Vm);
    target
}

fn cloud_init(hostname: &str, user: &str, password: &str) -> String {
    let short = hostname.split('.').next().unwrap_or(hostname);
    format!(concat!(
        "#cloud-config\n",
        "hostname: {short}\n",
        "fqdn: {hostname}\n",
        "ssh_pwauth: True\n",
        "users:\n",
        "  - name: {user}\n",
        "    shell: /bin/bash\n",
        "    plain_text_passwd: {password}\n",
        "    lock_passwd: false\n",
        "    sudo: ALL=(ALL) NOPASSWD:ALL\n",
    ), short = short, hostname = hostname, user = user, password = password)
}

/// A VMI that stopped running is not coming back on its own.
fn vmi_health(live: &DynamicObject) -> std::result::Result<(), String> {
    match live.data.pointer("/status/phase").and_then(Value::as_str) {
        Some(phase @ ("Failed" | "Succeeded")) => Err(format!("VMI is in phase {phase}")),
        _ => Ok(()),
    }
}

#[async_trait]
impl NodeKind for VmNode {
    fn node_type(&self) -> NodeType {
        NodeType::Vm
    }

    fn set_app_defaults(&mut self) {
        self.cpu = Some(Quantity(DEFAULT_CPU.to_string()));
        self.memory = Some(Quantity(DEFAULT_MEMORY.to_string()));
        self.user = Some(DEFAULT_USER.to_string());
        self.password = Some(DEFAULT_PASSWORD.to_string());
    }

    fn fill_defaults(&mut self, node_name: &str) {
        if self.hostname.is_none() {
            self.hostname = Some(match self.domain.as_deref() {
                Some(domain) if !domain.is_empty() => format!("{node_name}.{domain}"),
                _ => node_name.to_string(),
            });
        }
    }

    fn validate(&self, _lab: &LabSpec, _node_name: &str) -> Result<()> {
        if self.image.is_none() {
            return Err(Error::validation("image not specified"));
        }
        if self.disk_size.is_none() {
            return Err(Error::validation("diskSize not specified"));
        }
        let cpu = self
            .cpu
            .as_ref()
            .ok_or_else(|| Error::validation("cpu not specified"))?;
        cores(cpu)?;
        if self.memory.is_none() {
            return Err(Error::validation("memory not specified"));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(lab = %ctx.lab.name(), node = %node_name))]
    async fn reconcile(
        &self,
        ctx: &NodeContext<'_>,
        node_name: &str,
        store: &dyn ObjectStore,
        force_removal: bool,
    ) -> Result<()> {
        let lab = ctx.lab;
        let (Some(image), Some(disk_size), Some(cpu), Some(memory)) =
            (&self.image, &self.disk_size, &self.cpu, &self.memory)
        else {
            return Err(Error::validation(format!("vm {node_name} is not fully defaulted")));
        };

        // The index is fixed once the NAD exists. Only allocate for a new one.
        let fabric = fabric_name(lab.name(), node_name);
        let nad_resource = resources::network_attachment_definition();
        let live = store.get(&nad_resource, lab.namespace(), &fabric).await?;
        let index = match &live {
            Some(obj) => IdKind::BridgeIndex.extract_in_range(obj)?,
            None => None,
        };
        let index = match index {
            Some(index) => index,
            None if force_removal => 0,
            None => {
                let index = allocate_ids(store, ctx.scope, IdKind::BridgeIndex, 1)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(Error::Exhausted(IdKind::BridgeIndex))?;
                info!(index, "Allocated fabric bridge index");
                index
            }
        };
        ensure_or_remove(store, &lab.owner, &fabric_nad(lab, node_name, index), true, force_removal)
            .await?;

        // The disk outlives the VMI and is not owned by the lab.
        let dv = data_volume(lab, node_name, image, disk_size, ctx.config.storage_class()?);
        ensure_or_remove(store, &lab.owner, &dv, false, force_removal).await?;

        let spokes = lab.node_spokes(node_name);
        for spoke in &spokes {
            let nad = objects::spoke_nad(lab, spoke, NodeType::Vm);
            ensure_or_remove(store, &lab.owner, &nad, true, force_removal).await?;
        }

        let mut networks = vec![
            json!({ "name": "pod-net", "pod": {} }),
            json!({ "name": "fabric", "multus": { "networkName": fabric } }),
        ];
        let mut interfaces = vec![
            json!({
                "name": "pod-net",
                "macAddress": POD_NET_MAC,
                "masquerade": {},
                "ports": [{ "name": "ssh", "protocol": "TCP", "port": 22 }],
            }),
            json!({ "name": "fabric", "bridge": {} }),
        ];
        for spoke in &spokes {
            networks.push(json!({
                "name": spoke.spoke,
                "multus": { "networkName": objects::spoke_nad_name(spoke) },
            }));
            let mut interface = json!({ "name": spoke.spoke, "binding": { "name": "macvtap" } });
            if let Some(mac) = &spoke.connector.mac {
                interface["macAddress"] = json!(mac);
            }
            interfaces.push(interface);
        }

        let hostname = self.hostname.as_deref().unwrap_or(node_name);
        let password = self.password.as_deref().unwrap_or(DEFAULT_PASSWORD);
        let user_data = cloud_init(hostname, self.user(), password);
        let name = labels::pod_name(lab.name(), node_name);
        let mut vmi = Target::dynamic(
            resources::virtual_machine_instance(),
            &name,
            json!({
                "spec": {
                    "domain": {
                        "cpu": { "model": "host-passthrough", "cores": cores(cpu)? },
                        "memory": { "guest": memory },
                        "devices": {
                            "autoattachGraphicsDevice": true,
                            "disks": [
                                { "name": "root", "disk": { "bus": "virtio" } },
                                { "name": "cloudinit", "disk": { "bus": "virtio" } },
                            ],
                            "interfaces": interfaces,
                        },
                    },
                    "networks": networks,
                    "volumes": [
                        { "name": "root", "dataVolume": { "name": dv.name() } },
                        { "name": "cloudinit", "cloudInitNoCloud": { "userData": user_data } },
                    ],
                }
            }),
        );
        vmi.object.metadata = objects::node_meta(lab, &name, node_name, NodeType::Vm);
        if let Some(image) = &ctx.config.spec.sidecar_image {
            vmi.object.metadata.annotations = Some(
                [(SIDECAR_ANNOTATION.to_string(), json!([{ "image": image }]).to_string())].into(),
            );
        }
        debug!(spokes = spokes.len(), "Converging VMI");
        ensure_healthy_or_remove(
            store,
            &lab.owner,
            &vmi,
            &vmi_health,
            true,
            force_removal,
            &ctx.repair,
        )
        .await?;
        Ok(())
    }

    fn attach(
        &self,
        namespace: &str,
        lab: &str,
        node_name: &str,
        mode: AttachMode,
    ) -> AttachTarget {
        let vmi = labels::pod_name(lab, node_name);
        match mode {
            AttachMode::Console => AttachTarget::Console {
                namespace: namespace.to_string(),
                vmi,
            },
            AttachMode::Shell => AttachTarget::Ssh {
                namespace: namespace.to_string(),
                vmi,
                user: self.user().to_string(),
            },
        }
    }
}
