//! SR Linux container node
//!
//! The emulator reads its hardware model from `/tmp/topology.yml`. The model
//! is either a named product (`ixr-6`) or the raw hardware IDs in the form
//! `chassis_type-base_mac-cpm-slot-iom-mda`.

use super::objects;
use super::{fill, AttachMode, AttachTarget, NodeContext, NodeKind, NodeType};
use crate::crds::LabSpec;
use crate::error::{Error, Result};
use crate::labels;
use crate::reconcile::ensure_or_remove;
use crate::store::{ObjectStore, Target};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, PersistentVolumeClaimVolumeSource, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use macaddr::MacAddr6;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

const DEFAULT_CHASSIS: &str = "ixr-h5-32d";
const DEFAULT_MEMORY: &str = "4Gi";
const ETC_PVC_SIZE: &str = "100Mi";
const TOPOLOGY_FILE: &str = "topology.yml";
const LICENSE_FILE: &str = "license.key";

const ENTRYPOINT: [&str; 8] = [
    "/tini",
    "--",
    "fixuid",
    "-q",
    "/entrypoint.sh",
    "sudo",
    "bash",
    "/opt/srlinux/bin/sr_linux",
];

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SrLinux {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Named model or `chassis_type-base_mac-cpm-slot-iom-mda`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chassis: Option<String>,

    /// Secret holding `license.key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Quantity>,
}

impl SrLinux {
    pub fn fill_unset(&mut self, defaults: &Self) {
        fill(&mut self.image, &defaults.image);
        fill(&mut self.chassis, &defaults.chassis);
        fill(&mut self.license, &defaults.license);
        fill(&mut self.memory, &defaults.memory);
        fill(&mut self.cpu, &defaults.cpu);
    }

    fn chassis(&self) -> Result<Chassis> {
        let chassis = self
            .chassis
            .as_deref()
            .ok_or_else(|| Error::validation("chassis not specified"))?;
        Chassis::parse(chassis).map_err(Error::validation)
    }
}

/// Content of `topology.yml`.
#[derive(Clone, Debug, PartialEq, Serialize)]
struct Chassis {
    chassis_configuration: ChassisConfiguration,
    slot_configuration: BTreeMap<u32, SlotConfiguration>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct ChassisConfiguration {
    chassis_type: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_mac: Option<String>,
    cpm_card_type: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
struct SlotConfiguration {
    card_type: u32,
    mda_type: u32,
}

impl Chassis {
    fn model(chassis_type: u32, cpm: u32, card_type: u32, mda_type: u32) -> Self {
        Self {
            chassis_configuration: ChassisConfiguration {
                chassis_type,
                base_mac: None,
                cpm_card_type: cpm,
            },
            slot_configuration: BTreeMap::from([(1, SlotConfiguration { card_type, mda_type })]),
        }
    }

    fn parse(chassis: &str) -> std::result::Result<Self, String> {
        match chassis.to_lowercase().as_str() {
            "ixr-h5-32d" => Ok(Self::model(47, 180, 180, 106)),
            "ixr-6" => Ok(Self::model(42, 69, 127, 36)),
            "ixr-6e" => Ok(Self::model(68, 184, 182, 199)),
            _ => Self::parse_ids(chassis),
        }
    }

    fn parse_ids(chassis: &str) -> std::result::Result<Self, String> {
        let fields: Vec<&str> = chassis.split('-').filter(|f| !f.is_empty()).collect();
        let &[chassis_type, base_mac, cpm, slot, iom, mda] = fields.as_slice() else {
            return Err(format!(
                "expect 6 fields in SRL chassis {chassis}, but got {} fields",
                fields.len()
            ));
        };
        let number = |what: &str, value: &str| {
            value
                .parse::<u32>()
                .map_err(|e| format!("invalid {what} {value}, {e}"))
        };
        let base_mac = base_mac
            .parse::<MacAddr6>()
            .map_err(|e| format!("invalid base mac {base_mac}, {e}"))?;
        Ok(Self {
            chassis_configuration: ChassisConfiguration {
                chassis_type: number("chassis type id", chassis_type)?,
                base_mac: Some(base_mac.to_string()),
                cpm_card_type: number("cpm type id", cpm)?,
            },
            slot_configuration: BTreeMap::from([(
                number("slot id", slot)?,
                SlotConfiguration {
                    card_type: number("IOM id", iom)?,
                    mda_type: number("MDA id", mda)?,
                },
            )]),
        })
    }
}

/// Base MAC derived from the node's position in the lab. The index fills
/// octets three to five, low byte first.
fn base_mac(node_index: usize) -> String {
    let [low, mid, high, ..] = (node_index as u32).to_le_bytes();
    MacAddr6::new(0xFA, 0xFA, low, mid, high, 0x00).to_string()
}

fn topology_name(lab: &str, node: &str) -> String {
    format!("{lab}-{node}-topo")
}

fn etc_claim_name(lab: &str, node: &str) -> String {
    format!("{lab}-{node}-etc")
}

#[async_trait]
impl NodeKind for SrLinux {
    fn node_type(&self) -> NodeType {
        NodeType::Srl
    }

    fn set_app_defaults(&mut self) {
        self.chassis = Some(DEFAULT_CHASSIS.to_string());
        self.memory = Some(Quantity(DEFAULT_MEMORY.to_string()));
    }

    fn fill_defaults(&mut self, _node_name: &str) {}

    fn validate(&self, _lab: &LabSpec, _node_name: &str) -> Result<()> {
        if self.image.is_none() {
            return Err(Error::validation("image not specified"));
        }
        self.chassis().map(|_| ())
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
        let image = self
            .image
            .as_deref()
            .ok_or_else(|| Error::validation("image not specified"))?;

        let mut chassis = self.chassis()?;
        let index = lab.spec.node_index(node_name).unwrap_or_default();
        chassis.chassis_configuration.base_mac = Some(base_mac(index));
        let topology = serde_yaml::to_string(&chassis)
            .map_err(|e| Error::validation(format!("rendering SRL topology: {e}")))?;
        let topology_name = topology_name(lab.name(), node_name);
        let config_map = ConfigMap {
            metadata: objects::node_meta(lab, &topology_name, node_name, NodeType::Srl),
            data: Some(BTreeMap::from([(TOPOLOGY_FILE.to_string(), topology)])),
            ..Default::default()
        };
        ensure_or_remove(store, &lab.owner, &Target::from_typed(&config_map)?, true, force_removal)
            .await?;

        // Checkpoints survive the pod, so the claim is not owned by the lab.
        let claim_name = etc_claim_name(lab.name(), node_name);
        let claim = objects::pvc(
            lab,
            &claim_name,
            node_name,
            NodeType::Srl,
            &Quantity(ETC_PVC_SIZE.to_string()),
            ctx.config.storage_class()?,
        );
        ensure_or_remove(store, &lab.owner, &Target::from_typed(&claim)?, false, force_removal)
            .await?;

        let spokes = lab.node_spokes(node_name);
        for spoke in &spokes {
            let nad = objects::spoke_nad(lab, spoke, NodeType::Srl);
            ensure_or_remove(store, &lab.owner, &nad, true, force_removal).await?;
        }

        let mut volumes = vec![
            Volume {
                name: "topo".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: topology_name,
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "etc".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name,
                    read_only: Some(false),
                }),
                ..Default::default()
            },
        ];
        // Mounting /etc/opt/srlinux itself breaks the file ACLs linux_mgr expects.
        let mut mounts = vec![
            VolumeMount {
                name: "topo".to_string(),
                mount_path: format!("/tmp/{TOPOLOGY_FILE}"),
                sub_path: Some(TOPOLOGY_FILE.to_string()),
                ..Default::default()
            },
            VolumeMount {
                name: "etc".to_string(),
                mount_path: "/etc/opt/srlinux/checkpoint".to_string(),
                ..Default::default()
            },
        ];
        if let Some(secret) = &self.license {
            volumes.push(Volume {
                name: "lic".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: "lic".to_string(),
                mount_path: format!("/opt/srlinux/etc/{LICENSE_FILE}"),
                sub_path: Some(LICENSE_FILE.to_string()),
                ..Default::default()
            });
        }

        let mut pod = objects::base_pod(lab, node_name, NodeType::Srl, image);
        if let Some(spec) = pod.spec.as_mut() {
            spec.volumes = Some(volumes);
            if let Some(container) = spec.containers.first_mut() {
                container.command = Some(ENTRYPOINT.iter().map(|s| s.to_string()).collect());
                container.security_context = Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                });
                container.volume_mounts = Some(mounts);
                let requests = objects::requests(&self.cpu, &self.memory);
                if !requests.is_empty() {
                    container.resources.get_or_insert_with(Default::default).requests =
                        Some(requests);
                }
            }
        }
        // Front panel ports are e1-1, e1-2, ... in spoke order.
        objects::attach_spokes(&mut pod, &spokes, |i, _| Some(format!("e1-{}", i + 1)));
        debug!(spokes = spokes.len(), "Converging SRL pod");
        ensure_or_remove(store, &lab.owner, &Target::from_typed(&pod)?, true, force_removal)
            .await?;
        Ok(())
    }

    fn attach(
        &self,
        namespace: &str,
        lab: &str,
        node_name: &str,
        _mode: AttachMode,
    ) -> AttachTarget {
        AttachTarget::Exec {
            namespace: namespace.to_string(),
            pod: labels::pod_name(lab, node_name),
            command: vec!["sr_cli".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::IdAllocator;
    use crate::labels::NETWORKS_ANNOTATION;
    use crate::reconcile::RepairPolicy;
    use crate::store::decode;
    use crate::testing::{self, MemoryStore};
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
    use kube::discovery::ApiResource;
    use kube::ResourceExt;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_named_models() {
        let chassis = Chassis::parse("IXR-6").unwrap();
        assert_eq!(chassis.chassis_configuration.chassis_type, 42);
        assert_eq!(chassis.chassis_configuration.cpm_card_type, 69);
        assert_eq!(
            chassis.slot_configuration[&1],
            SlotConfiguration {
                card_type: 127,
                mda_type: 36
            }
        );
        assert_eq!(
            Chassis::parse("ixr-h5-32d").unwrap(),
            Chassis::model(47, 180, 180, 106)
        );
        assert_eq!(
            Chassis::parse("ixr-6e").unwrap(),
            Chassis::model(68, 184, 182, 199)
        );
    }

    #[test]
    fn test_hardware_id_form() {
        let chassis = Chassis::parse("42-1a:2b:3c:4d:5e:6f-69-2-127-36").unwrap();
        assert_eq!(chassis.chassis_configuration.chassis_type, 42);
        assert_eq!(
            chassis.chassis_configuration.base_mac.as_deref(),
            Some("1A:2B:3C:4D:5E:6F")
        );
        assert_eq!(chassis.slot_configuration[&2].card_type, 127);
    }

    #[test]
    fn test_bad_chassis() {
        let err = Chassis::parse("ixr-7").unwrap_err();
        assert_eq!(err, "expect 6 fields in SRL chassis ixr-7, but got 2 fields");
        assert!(Chassis::parse("42-zz:2b:3c:4d:5e:6f-69-1-127-36")
            .unwrap_err()
            .contains("invalid base mac"));
        assert!(Chassis::parse("x-1a:2b:3c:4d:5e:6f-69-1-127-36")
            .unwrap_err()
            .contains("invalid chassis type id"));
    }

    #[test]
    fn test_validate() {
        let spec = LabSpec::default();
        let mut srl = SrLinux::default();
        srl.set_app_defaults();
        assert!(srl.validate(&spec, "srl-1").unwrap_err().to_string().contains("image"));
        srl.image = Some("ghcr.io/nokia/srlinux".to_string());
        srl.validate(&spec, "srl-1").unwrap();
        srl.chassis = Some("bogus".to_string());
        assert!(srl.validate(&spec, "srl-1").is_err());
    }

    #[test]
    fn test_base_mac_stays_six_octets() {
        assert_eq!(base_mac(0), "FA:FA:00:00:00:00");
        assert_eq!(base_mac(255), "FA:FA:FF:00:00:00");
        assert_eq!(base_mac(256), "FA:FA:00:01:00:00");
        assert_eq!(base_mac(0x12_3456), "FA:FA:56:34:12:00");
        for index in [1, 255, 256, 4096, 70_000] {
            assert!(base_mac(index).parse::<MacAddr6>().is_ok());
        }
    }

    #[test]
    fn test_topology_yaml() {
        let mut chassis = Chassis::parse("ixr-6").unwrap();
        chassis.chassis_configuration.base_mac = Some(base_mac(10));
        let rendered = serde_yaml::to_string(&chassis).unwrap();
        let yaml: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(yaml["chassis_configuration"]["base_mac"], "FA:FA:0A:00:00:00");
        assert_eq!(yaml["chassis_configuration"]["cpm_card_type"], 69);
        assert_eq!(yaml["slot_configuration"][1]["mda_type"], 36);
    }

    #[tokio::test]
    async fn test_reconcile_builds_pod_with_front_panel_ports() {
        let store = MemoryStore::new();
        let allocator = IdAllocator::new();
        let scope = allocator.lock().await;
        let lab = testing::parsed_lab(
            &store,
            &scope,
            r#"
nodes:
  srl-1:
    srl:
      image: ghcr.io/nokia/srlinux
      license: srl-license
  srl-2:
    srl:
      image: ghcr.io/nokia/srlinux
links:
  link1:
    nodes:
      - node: srl-1
      - node: srl-2
  link2:
    nodes:
      - node: srl-1
      - node: srl-2
"#,
        )
        .await;
        let config = testing::config();
        let ctx = NodeContext {
            lab: &lab,
            config: &config,
            scope: &scope,
            repair: RepairPolicy::default(),
        };

        lab.nodes["srl-2"]
            .kind()
            .reconcile(&ctx, "srl-2", &store, false)
            .await
            .unwrap();

        let cm: ConfigMap = decode(
            &store
                .object(&ApiResource::erase::<ConfigMap>(&()), "ns1", "lab1-srl-2-topo")
                .unwrap(),
        )
        .unwrap();
        assert!(cm.data.unwrap()[TOPOLOGY_FILE].contains("FA:FA:01:00:00:00"));

        let claim = store
            .object(&ApiResource::erase::<PersistentVolumeClaim>(&()), "ns1", "lab1-srl-2-etc")
            .unwrap();
        assert!(claim.owner_references().is_empty());

        let pod: Pod = decode(
            &store
                .object(&ApiResource::erase::<Pod>(&()), "ns1", "lab1-srl-2")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(
            pod.annotations()[NETWORKS_ANNOTATION],
            "lab1-link1-1-1@e1-1,lab1-link2-2-1@e1-2"
        );
        let spec = pod.spec.unwrap();
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 2);
        assert_eq!(spec.containers[0].command.as_ref().unwrap()[0], "/tini");
        assert_eq!(
            spec.containers[0].security_context.as_ref().unwrap().privileged,
            Some(true)
        );
    }

    #[test]
    fn test_attach_uses_cli() {
        let target = SrLinux::default().attach("ns1", "lab1", "srl-1", AttachMode::Shell);
        assert_eq!(
            target.command_line().join(" "),
            "kubectl -n ns1 exec -it lab1-srl-1 -- sr_cli"
        );
    }
}
