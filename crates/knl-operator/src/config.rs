//! Operator configuration
//!
//! Two layers: process settings read from the environment at startup, and
//! the `KNLConfig` resource, read into an immutable [`ConfigSnapshot`] at the
//! start of every pass and handed down explicitly.

use crate::crds::{KnlConfig, KnlConfigSpec};
use crate::error::{Error, Result};
use crate::nodes::{GeneralPod, NodeSpec, Registry, SrLinux, VmNode};
use crate::reconcile::RepairPolicy;
use crate::store::{decode, ObjectStore};
use kube::discovery::ApiResource;
use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;
use tracing::debug;

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Process settings.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorSettings {
    /// Namespace holding the operator's `KNLConfig`.
    pub namespace: String,
    /// Name of the `KNLConfig` instance.
    pub config_name: String,
    /// Deadline of one reconcile pass.
    pub pass_timeout: Duration,
    /// How long the repair path waits for an unhealthy object to go away.
    pub repair_timeout: Duration,
    /// Requeue interval after a successful pass.
    pub requeue: Duration,
    /// Retry interval after a failed pass.
    pub error_requeue: Duration,
    pub json_logs: bool,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            namespace: "knl-system".to_string(),
            config_name: "knlcfg".to_string(),
            pass_timeout: Duration::from_secs(300),
            repair_timeout: Duration::from_secs(60),
            requeue: Duration::from_secs(300),
            error_requeue: Duration::from_secs(60),
            json_logs: false,
        }
    }
}

impl OperatorSettings {
    /// Create settings from environment variables with defaults
    pub fn from_env() -> Self {
        let mut settings = Self::from_lookup(|key| std::env::var(key).ok());
        if std::env::var("WATCH_NAMESPACE").is_err() {
            if let Ok(ns) = std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE) {
                settings.namespace = ns.trim().to_string();
            }
        }
        settings
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();
        let secs = |key: &str| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        if let Some(ns) = lookup("WATCH_NAMESPACE") {
            settings.namespace = ns;
        }
        if let Some(name) = lookup("KNL_CONFIG_NAME") {
            settings.config_name = name;
        }
        if let Some(timeout) = secs("KNL_PASS_TIMEOUT_SECS") {
            settings.pass_timeout = timeout;
        }
        if let Some(timeout) = secs("KNL_REPAIR_TIMEOUT_SECS") {
            settings.repair_timeout = timeout;
        }
        if let Some(requeue) = secs("KNL_REQUEUE_SECS") {
            settings.requeue = requeue;
        }
        if let Some(retry) = secs("KNL_ERROR_REQUEUE_SECS") {
            settings.error_requeue = retry;
        }
        settings.json_logs = lookup("LOG_FORMAT")
            .is_some_and(|f| f.eq_ignore_ascii_case("json"));
        settings
    }

    pub fn repair_policy(&self) -> RepairPolicy {
        RepairPolicy {
            timeout: self.repair_timeout,
            ..RepairPolicy::default()
        }
    }
}

/// Operator-wide defaults as seen by one pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigSnapshot {
    pub spec: KnlConfigSpec,
    /// Generation of the `KNLConfig` the snapshot was taken from.
    pub generation: i64,
}

impl ConfigSnapshot {
    /// Merge `user` over the application defaults and validate the result.
    pub fn new(user: KnlConfigSpec, generation: i64, registry: &Registry) -> Result<Self> {
        let snapshot = Self {
            spec: merge(user, app_defaults(registry)),
            generation,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Read the named `KNLConfig`.
    pub async fn fetch(
        store: &dyn ObjectStore,
        registry: &Registry,
        namespace: &str,
        name: &str,
    ) -> Result<Self> {
        let resource = ApiResource::erase::<KnlConfig>(&());
        let obj = store
            .get(&resource, namespace, name)
            .await?
            .ok_or_else(|| {
                Error::validation(format!("operator config {namespace}/{name} not found"))
            })?;
        let generation = obj.metadata.generation.unwrap_or_default();
        let config: KnlConfig = decode(&obj)?;
        debug!(config = %name, generation, "Loaded operator config");
        Self::new(config.spec, generation, registry)
    }

    pub fn validate(&self) -> Result<()> {
        let spec = &self.spec;
        let group = spec
            .vxlan_group
            .as_deref()
            .ok_or_else(|| Error::validation("VxLAN group address not specified"))?;
        match group.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) if addr.is_multicast() => {}
            Ok(_) => {
                return Err(Error::validation(format!(
                    "VxLAN group address {group} is not an IPv6 multicast address"
                )))
            }
            Err(_) => {
                return Err(Error::validation(format!(
                    "{group} is not a valid VxLAN group address"
                )))
            }
        }
        if is_blank(&spec.storage_class) {
            return Err(Error::validation("storage class not specified"));
        }
        if is_blank(&spec.default_vxlan_dev) && spec.vxlan_dev_map.is_empty() {
            return Err(Error::validation("vxlan dev not specified"));
        }
        if let Some(server) = &spec.file_server {
            let valid = server
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(Error::validation(format!(
                    "file server {server} is not in host:port format"
                )));
            }
        }
        Ok(())
    }

    /// Per-kind defaults for lab nodes.
    pub fn default_node(&self) -> Option<&NodeSpec> {
        self.spec.default_node.as_ref()
    }

    pub fn storage_class(&self) -> Result<&str> {
        self.spec
            .storage_class
            .as_deref()
            .ok_or_else(|| Error::validation("storage class not specified"))
    }
}

/// Values used for every field the user leaves unset.
pub fn app_defaults(registry: &Registry) -> KnlConfigSpec {
    KnlConfigSpec {
        file_server: Some("knl-sftp-service.knl-system.svc.cluster.local:22".to_string()),
        vxlan_group: Some(Ipv6Addr::new(0xff18, 0, 0, 0, 0, 0, 0, 0x100).to_string()),
        sidecar_image: Some("ghcr.io/hujun-open/knl/knlsidecar:latest".to_string()),
        default_node: Some(registry.app_defaults()),
        ..Default::default()
    }
}

/// `user` with unset fields taken from `defaults`, per node kind for the
/// default node.
pub fn merge(user: KnlConfigSpec, defaults: KnlConfigSpec) -> KnlConfigSpec {
    let default_node = match (user.default_node, defaults.default_node) {
        (Some(mut node), Some(fallback)) => {
            merge_kind(&mut node.vm, fallback.vm, VmNode::fill_unset);
            merge_kind(&mut node.srl, fallback.srl, SrLinux::fill_unset);
            merge_kind(&mut node.pod, fallback.pod, GeneralPod::fill_unset);
            Some(node)
        }
        (node, fallback) => node.or(fallback),
    };
    KnlConfigSpec {
        file_server: user.file_server.or(defaults.file_server),
        vxlan_group: user.vxlan_group.or(defaults.vxlan_group),
        default_vxlan_dev: user.default_vxlan_dev.or(defaults.default_vxlan_dev),
        vxlan_dev_map: if user.vxlan_dev_map.is_empty() {
            defaults.vxlan_dev_map
        } else {
            user.vxlan_dev_map
        },
        storage_class: user.storage_class.or(defaults.storage_class),
        sidecar_image: user.sidecar_image.or(defaults.sidecar_image),
        default_node,
    }
}

fn merge_kind<T>(slot: &mut Option<T>, fallback: Option<T>, fill: fn(&mut T, &T)) {
    if let Some(node) = slot.as_mut() {
        if let Some(fallback) = &fallback {
            fill(node, fallback);
        }
    } else {
        *slot = fallback;
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::DynamicObject;
    use std::collections::HashMap;

    fn user_spec() -> KnlConfigSpec {
        KnlConfigSpec {
            storage_class: Some("local-path".to_string()),
            default_vxlan_dev: Some("eth1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_settings_from_lookup() {
        let env = HashMap::from([
            ("WATCH_NAMESPACE", "labs"),
            ("KNL_PASS_TIMEOUT_SECS", "30"),
            ("KNL_REQUEUE_SECS", "not-a-number"),
            ("KNL_ERROR_REQUEUE_SECS", "15"),
            ("LOG_FORMAT", "JSON"),
        ]);
        let settings = OperatorSettings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.namespace, "labs");
        assert_eq!(settings.config_name, "knlcfg");
        assert_eq!(settings.pass_timeout, Duration::from_secs(30));
        assert_eq!(settings.requeue, Duration::from_secs(300));
        assert_eq!(settings.error_requeue, Duration::from_secs(15));
        assert!(settings.json_logs);
        assert_eq!(settings.repair_policy().timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_user_values_win_over_app_defaults() {
        let registry = Registry::builtin().unwrap();
        let mut user = user_spec();
        user.vxlan_group = Some("ff18::200".to_string());
        user.default_node = Some(NodeSpec {
            pod: Some(GeneralPod {
                image: Some("busybox".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });

        let snapshot = ConfigSnapshot::new(user, 4, &registry).unwrap();
        assert_eq!(snapshot.generation, 4);
        assert_eq!(snapshot.spec.vxlan_group.as_deref(), Some("ff18::200"));
        assert!(snapshot.spec.sidecar_image.is_some());

        let defaults = snapshot.default_node().unwrap();
        let pod = defaults.pod.as_ref().unwrap();
        assert_eq!(pod.image.as_deref(), Some("busybox"));
        assert_eq!(pod.pvc_size, Some(Quantity("100Mi".to_string())));
        assert!(defaults.srl.is_some());
        assert!(defaults.vm.is_some());
    }

    #[test]
    fn test_validation() {
        let registry = Registry::builtin().unwrap();

        let mut v4 = user_spec();
        v4.vxlan_group = Some("239.1.1.1".to_string());
        let err = ConfigSnapshot::new(v4, 1, &registry).unwrap_err();
        assert!(err.to_string().contains("not an IPv6 multicast address"));

        let mut unicast = user_spec();
        unicast.vxlan_group = Some("2001:db8::1".to_string());
        assert!(ConfigSnapshot::new(unicast, 1, &registry).is_err());

        let mut no_storage = user_spec();
        no_storage.storage_class = Some("  ".to_string());
        let err = ConfigSnapshot::new(no_storage, 1, &registry).unwrap_err();
        assert!(err.to_string().contains("storage class not specified"));

        let mut no_dev = user_spec();
        no_dev.default_vxlan_dev = None;
        let err = ConfigSnapshot::new(no_dev.clone(), 1, &registry).unwrap_err();
        assert!(err.to_string().contains("vxlan dev not specified"));
        no_dev.vxlan_dev_map.insert("worker1".to_string(), "ens4".to_string());
        assert!(ConfigSnapshot::new(no_dev, 1, &registry).is_ok());

        let mut bad_server = user_spec();
        bad_server.file_server = Some("sftp-without-port".to_string());
        assert!(ConfigSnapshot::new(bad_server, 1, &registry).is_err());
    }

    #[tokio::test]
    async fn test_fetch() {
        let registry = Registry::builtin().unwrap();
        let store = MemoryStore::new();
        let err = ConfigSnapshot::fetch(&store, &registry, "knl-system", "knlcfg")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("knl-system/knlcfg not found"));

        let resource = ApiResource::erase::<KnlConfig>(&());
        let mut obj = DynamicObject::new("knlcfg", &resource)
            .within("knl-system")
            .data(serde_json::json!({ "spec": serde_json::to_value(user_spec()).unwrap() }));
        obj.metadata.generation = Some(7);
        store.insert(obj);

        let snapshot = ConfigSnapshot::fetch(&store, &registry, "knl-system", "knlcfg")
            .await
            .unwrap();
        assert_eq!(snapshot.generation, 7);
        assert_eq!(snapshot.storage_class().unwrap(), "local-path");
    }
}
