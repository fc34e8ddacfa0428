//! General-purpose container node

use super::objects;
use super::{fill, AttachMode, AttachTarget, NodeContext, NodeKind, NodeType};
use crate::crds::LabSpec;
use crate::error::{Error, Result};
use crate::labels;
use crate::reconcile::ensure_or_remove;
use crate::store::{ObjectStore, Target};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaimVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

const ROOT_VOLUME: &str = "root";
const ROOT_MOUNT_PATH: &str = "/root";

/// A single-container pod with a persistent home directory.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneralPod {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Entrypoint override, one argument per element.
    #[serde(default, rename = "cmd", skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,

    /// Size of the PVC mounted at `/root`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_size: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Quantity>,
}

impl GeneralPod {
    pub fn fill_unset(&mut self, defaults: &Self) {
        fill(&mut self.image, &defaults.image);
        fill(&mut self.command, &defaults.command);
        fill(&mut self.privileged, &defaults.privileged);
        fill(&mut self.pvc_size, &defaults.pvc_size);
        fill(&mut self.memory, &defaults.memory);
        fill(&mut self.cpu, &defaults.cpu);
    }
}

fn root_claim_name(lab: &str, node: &str) -> String {
    format!("{lab}-{node}-root")
}

#[async_trait]
impl NodeKind for GeneralPod {
    fn node_type(&self) -> NodeType {
        NodeType::Pod
    }

    fn set_app_defaults(&mut self) {
        self.pvc_size = Some(Quantity("100Mi".to_string()));
    }

    fn fill_defaults(&mut self, _node_name: &str) {}

    fn validate(&self, _lab: &LabSpec, _node_name: &str) -> Result<()> {
        if self.image.as_deref().map_or(true, str::is_empty) {
            return Err(Error::validation("image not specified"));
        }
        if self.pvc_size.is_none() {
            return Err(Error::validation("pvcSize not specified"));
        }
        if self.command.as_ref().is_some_and(Vec::is_empty) {
            return Err(Error::validation("cmd must not be empty"));
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
        let image = self
            .image
            .as_deref()
            .ok_or_else(|| Error::validation("image not specified"))?;
        let size = self
            .pvc_size
            .as_ref()
            .ok_or_else(|| Error::validation("pvcSize not specified"))?;

        // The claim keeps the node's data across pod restarts and lab edits,
        // so it is not tied to the lab's lifetime.
        let claim_name = root_claim_name(lab.name(), node_name);
        let claim = objects::pvc(
            lab,
            &claim_name,
            node_name,
            NodeType::Pod,
            size,
            ctx.config.storage_class()?,
        );
        ensure_or_remove(store, &lab.owner, &Target::from_typed(&claim)?, false, force_removal)
            .await?;

        let spokes = lab.node_spokes(node_name);
        for spoke in &spokes {
            let nad = objects::spoke_nad(lab, spoke, NodeType::Pod);
            ensure_or_remove(store, &lab.owner, &nad, true, force_removal).await?;
        }

        let mut pod = objects::base_pod(lab, node_name, NodeType::Pod, image);
        if let Some(spec) = pod.spec.as_mut() {
            spec.volumes = Some(vec![Volume {
                name: ROOT_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name,
                    read_only: Some(false),
                }),
                ..Default::default()
            }]);
            if let Some(container) = spec.containers.first_mut() {
                container.command = self.command.clone();
                container.security_context = Some(SecurityContext {
                    privileged: self.privileged,
                    ..Default::default()
                });
                container.volume_mounts = Some(vec![VolumeMount {
                    name: ROOT_VOLUME.to_string(),
                    mount_path: ROOT_MOUNT_PATH.to_string(),
                    ..Default::default()
                }]);
                let requests = objects::requests(&self.cpu, &self.memory);
                if !requests.is_empty() {
                    container.resources.get_or_insert_with(Default::default).requests =
                        Some(requests);
                }
            }
        }
        objects::attach_spokes(&mut pod, &spokes, |_, spoke| spoke.connector.port.clone());
        debug!(spokes = spokes.len(), "Converging pod");
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
            command: vec!["bash".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::IdAllocator;
    use crate::labels::NETWORKS_ANNOTATION;
    use crate::reconcile::RepairPolicy;
    use crate::store::resources;
    use crate::testing::{self, MemoryStore};
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
    use kube::discovery::ApiResource;
    use kube::ResourceExt;
    use pretty_assertions::assert_eq;

    const LAB: &str = r#"
nodes:
  client:
    pod:
      image: alpine
      cmd: ["sleep", "infinity"]
      privileged: true
      memory: 256Mi
  server:
    pod:
      image: nginx
links:
  link1:
    nodes:
      - node: client
        port: eth1
        addr: 192.168.1.1/24
      - node: server
        port: eth1
"#;

    fn pod_resource() -> ApiResource {
        ApiResource::erase::<Pod>(&())
    }

    fn live_pod(store: &MemoryStore, name: &str) -> Pod {
        crate::store::decode(&store.object(&pod_resource(), "ns1", name).unwrap()).unwrap()
    }

    #[test]
    fn test_validate() {
        let spec = LabSpec::default();
        let mut pod = GeneralPod::default();
        assert_eq!(
            pod.validate(&spec, "a").unwrap_err().to_string(),
            "validation error: image not specified"
        );
        pod.image = Some("alpine".to_string());
        assert!(pod.validate(&spec, "a").unwrap_err().to_string().contains("pvcSize"));
        pod.set_app_defaults();
        pod.validate(&spec, "a").unwrap();
        pod.command = Some(Vec::new());
        assert!(pod.validate(&spec, "a").is_err());
    }

    #[test]
    fn test_fill_unset_keeps_user_values() {
        let mut pod = GeneralPod {
            image: Some("alpine".to_string()),
            ..Default::default()
        };
        let defaults = GeneralPod {
            image: Some("busybox".to_string()),
            pvc_size: Some(Quantity("1Gi".to_string())),
            ..Default::default()
        };
        pod.fill_unset(&defaults);
        assert_eq!(pod.image.as_deref(), Some("alpine"));
        assert_eq!(pod.pvc_size, Some(Quantity("1Gi".to_string())));
    }

    #[tokio::test]
    async fn test_reconcile_creates_pod_claim_and_attachments() {
        let store = MemoryStore::new();
        let allocator = IdAllocator::new();
        let scope = allocator.lock().await;
        let lab = testing::parsed_lab(&store, &scope, LAB).await;
        let config = testing::config();
        let ctx = NodeContext {
            lab: &lab,
            config: &config,
            scope: &scope,
            repair: RepairPolicy::default(),
        };

        lab.nodes["client"]
            .kind()
            .reconcile(&ctx, "client", &store, false)
            .await
            .unwrap();

        let claim = store
            .object(&ApiResource::erase::<PersistentVolumeClaim>(&()), "ns1", "lab1-client-root")
            .unwrap();
        assert!(claim.owner_references().is_empty());

        let nad = store
            .object(&resources::network_attachment_definition(), "ns1", "lab1-link1-1-0")
            .unwrap();
        assert_eq!(nad.owner_references().len(), 1);
        let config: serde_json::Value =
            serde_json::from_str(nad.data["spec"]["config"].as_str().unwrap()).unwrap();
        assert_eq!(config["type"], "host-device");
        assert_eq!(config["ipam"]["addresses"][0]["address"], "192.168.1.1/24");

        let pod = live_pod(&store, "lab1-client");
        assert_eq!(
            pod.annotations()[NETWORKS_ANNOTATION],
            "lab1-link1-1-0@eth1"
        );
        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(
            container.command,
            Some(vec!["sleep".to_string(), "infinity".to_string()])
        );
        let resources = container.resources.as_ref().unwrap();
        assert_eq!(
            resources.limits.as_ref().unwrap()["lan.k8slan.io/lab1-link1-1-0"],
            Quantity("1".to_string())
        );
        assert_eq!(
            resources.requests.as_ref().unwrap()["memory"],
            Quantity("256Mi".to_string())
        );
        assert_eq!(container.volume_mounts.as_ref().unwrap()[0].mount_path, "/root");
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent_and_removable() {
        let store = MemoryStore::new();
        let allocator = IdAllocator::new();
        let scope = allocator.lock().await;
        let lab = testing::parsed_lab(&store, &scope, LAB).await;
        let config = testing::config();
        let ctx = NodeContext {
            lab: &lab,
            config: &config,
            scope: &scope,
            repair: RepairPolicy::default(),
        };
        let node = lab.nodes["server"].kind();

        node.reconcile(&ctx, "server", &store, false).await.unwrap();
        let mutations = store.mutations();
        node.reconcile(&ctx, "server", &store, false).await.unwrap();
        assert_eq!(store.mutations(), mutations);

        node.reconcile(&ctx, "server", &store, true).await.unwrap();
        assert!(store.object(&pod_resource(), "ns1", "lab1-server").is_none());
        assert!(store
            .object(&resources::network_attachment_definition(), "ns1", "lab1-link1-1-1")
            .is_none());
    }

    #[test]
    fn test_attach_execs_bash() {
        let target = GeneralPod::default().attach("ns1", "lab1", "client", AttachMode::Console);
        assert_eq!(
            target.command_line().join(" "),
            "kubectl -n ns1 exec -it lab1-client -- bash"
        );
    }
}
