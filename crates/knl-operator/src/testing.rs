//! Test fixtures: an in-memory object store and object builders.

use crate::allocator::AllocationScope;
use crate::config::ConfigSnapshot;
use crate::crds::{KnlConfigSpec, Lab, LabSpec, Lan};
use crate::error::Result;
use crate::labels::BRIDGE_INDEX_LABEL_KEY;
use crate::nodes::Registry;
use crate::store::{resources, ObjectStore};
use crate::topology::ParsedLab;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{DynamicObject, PropagationPolicy};
use kube::core::ErrorResponse;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type Key = (String, String, String, String);

fn key(resource: &ApiResource, namespace: &str, name: &str) -> Key {
    (
        resource.api_version.clone(),
        resource.kind.clone(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> crate::error::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
    .into()
}

/// Label selector subset: comma-separated `key` (exists) or `key=value` terms.
fn selector_matches(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

/// In-memory [`ObjectStore`] with API server-like finalizer semantics.
///
/// Deleting an object with finalizers only stamps its deletion timestamp; the
/// object disappears once a replace clears the last finalizer.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, DynamicObject>>,
    creates: AtomicUsize,
    replaces: AtomicUsize,
    deletes: AtomicUsize,
    next_version: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object, bypassing the mutation counters.
    pub fn insert(&self, mut obj: DynamicObject) {
        let types = obj.types.clone().expect("seeded objects carry type meta");
        let ns = obj.namespace().unwrap_or_default();
        obj.metadata
            .uid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        let k = (types.api_version, types.kind, ns, obj.name_any());
        self.objects.lock().unwrap().insert(k, obj);
    }

    pub fn object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Option<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&key(resource, namespace, name))
            .cloned()
    }

    pub fn count(&self, resource: &ApiResource) -> usize {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(av, kind, _, _)| *av == resource.api_version && *kind == resource.kind)
            .count()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn replaces(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn mutations(&self) -> usize {
        self.creates() + self.replaces() + self.deletes()
    }

    fn bump_version(&self, obj: &mut DynamicObject) {
        let v = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        obj.metadata.resource_version = Some(v.to_string());
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.object(resource, namespace, name))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((av, kind, _, _), _)| *av == resource.api_version && *kind == resource.kind)
            .map(|(_, obj)| obj)
            .filter(|obj| selector_matches(obj, label_selector))
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object.name_any();
        let k = key(resource, namespace, &name);
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists", format!("{name} already exists")));
        }
        let mut created = object.clone();
        created.types = Some(kube::core::TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        self.bump_version(&mut created);
        objects.insert(k, created.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object.name_any();
        let k = key(resource, namespace, &name);
        let mut objects = self.objects.lock().unwrap();
        let Some(existing) = objects.get(&k) else {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        };
        let mut replaced = object.clone();
        replaced.types = existing.types.clone();
        replaced.metadata.namespace = Some(namespace.to_string());
        replaced.metadata.uid = existing.metadata.uid.clone();
        replaced.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
        self.bump_version(&mut replaced);
        self.replaces.fetch_add(1, Ordering::SeqCst);
        if replaced.metadata.deletion_timestamp.is_some() && replaced.finalizers().is_empty() {
            objects.remove(&k);
        } else {
            objects.insert(k, replaced.clone());
        }
        Ok(replaced)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        _propagation: PropagationPolicy,
    ) -> Result<()> {
        let k = key(resource, namespace, name);
        let mut objects = self.objects.lock().unwrap();
        let Some(existing) = objects.get_mut(&k) else {
            return Ok(());
        };
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if existing.finalizers().is_empty() {
            objects.remove(&k);
        } else if existing.metadata.deletion_timestamp.is_none() {
            existing.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        Ok(())
    }
}

/// A live LAN carrying `vni`.
pub fn lan_object(namespace: &str, name: &str, vni: u32) -> DynamicObject {
    let resource = ApiResource::erase::<Lan>(&());
    let mut obj = DynamicObject::new(name, &resource).within(namespace).data(json!({
        "spec": {
            "ns": name,
            "bridgeName": format!("klanbr{vni}"),
            "vxlanName": format!("klanvx{vni}"),
            "vni": vni,
            "spokeList": [],
        }
    }));
    obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
    obj
}

/// A NAD stamped with a bridge index label.
pub fn nad_with_bridge_index(namespace: &str, name: &str, index: &str) -> DynamicObject {
    let resource = resources::network_attachment_definition();
    let mut obj = DynamicObject::new(name, &resource)
        .within(namespace)
        .data(json!({ "spec": { "config": "{}" } }));
    obj.metadata.labels = Some(BTreeMap::from([(
        BRIDGE_INDEX_LABEL_KEY.to_string(),
        index.to_string(),
    )]));
    obj
}

/// A lab as the API server would hand it to the controller.
pub fn lab(namespace: &str, name: &str, spec: LabSpec) -> Lab {
    let mut lab = Lab::new(name, spec);
    lab.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(uuid::Uuid::new_v4().to_string()),
        generation: Some(1),
        ..Default::default()
    };
    lab
}

/// Parse a lab spec from YAML.
pub fn lab_spec(yaml: &str) -> LabSpec {
    serde_yaml::from_str(yaml).expect("valid lab spec fixture")
}

/// A valid snapshot over the application defaults.
pub fn config() -> ConfigSnapshot {
    let user = KnlConfigSpec {
        storage_class: Some("local-path".to_string()),
        default_vxlan_dev: Some("eth1".to_string()),
        ..Default::default()
    };
    let registry = Registry::builtin().expect("builtin registry is complete");
    ConfigSnapshot::new(user, 1, &registry).expect("valid config fixture")
}

/// Resolve a lab named `lab1` in `ns1` against [`config`].
pub async fn parsed_lab(
    store: &dyn ObjectStore,
    scope: &AllocationScope<'_>,
    yaml: &str,
) -> ParsedLab {
    let registry = Registry::builtin().expect("builtin registry is complete");
    let lab = lab("ns1", "lab1", lab_spec(yaml));
    ParsedLab::resolve(store, scope, &lab, &config(), &registry)
        .await
        .expect("valid lab fixture")
}
