//! Object store access
//!
//! Every object the operator touches goes through [`ObjectStore`], which
//! speaks `DynamicObject` so that the reconciliation primitives work for any
//! kind: built-in workloads, LANs, network attachment definitions, VMIs.

use crate::error::Result;
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams, PropagationPolicy};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Namespaced, strongly-consistent object API.
///
/// `get` maps "not found" to `Ok(None)`; every other failure is an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get an object by namespace and name.
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List objects across all namespaces. An empty selector matches everything.
    async fn list(&self, resource: &ApiResource, label_selector: &str)
        -> Result<Vec<DynamicObject>>;

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Replace an existing object; `object` must carry its resource version.
    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Delete an object. Deleting an absent object succeeds.
    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<()>;
}

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), resource);
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        debug!(kind = %resource.kind, name = %object.name_any(), "Creating object");
        Ok(self
            .api(resource, namespace)
            .create(&PostParams::default(), object)
            .await?)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        debug!(kind = %resource.kind, name = %object.name_any(), "Replacing object");
        Ok(self
            .api(resource, namespace)
            .replace(&object.name_any(), &PostParams::default(), object)
            .await?)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<()> {
        debug!(kind = %resource.kind, name = %name, "Deleting object");
        let params = DeleteParams {
            propagation_policy: Some(propagation),
            ..Default::default()
        };
        match self.api(resource, namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// An object definition together with the API resource it belongs to.
#[derive(Clone, Debug)]
pub struct Target {
    pub resource: ApiResource,
    pub object: DynamicObject,
}

impl Target {
    pub fn new(resource: ApiResource, object: DynamicObject) -> Self {
        Self { resource, object }
    }

    /// Erase a typed object into a target.
    pub fn from_typed<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let resource = ApiResource::erase::<K>(&());
        let object: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
        Ok(Self { resource, object })
    }

    /// Build a target for a kind the crate has no typed model for.
    pub fn dynamic(resource: ApiResource, name: &str, data: serde_json::Value) -> Self {
        let object = DynamicObject::new(name, &resource).data(data);
        Self { resource, object }
    }

    pub fn name(&self) -> String {
        self.object.name_any()
    }

    pub fn kind(&self) -> &str {
        &self.resource.kind
    }
}

/// Decode a dynamic object into its typed model.
pub fn decode<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Resources for kinds owned by other projects.
pub mod resources {
    use super::*;

    pub fn network_attachment_definition() -> ApiResource {
        let gvk = GroupVersionKind::gvk("k8s.cni.cncf.io", "v1", "NetworkAttachmentDefinition");
        ApiResource::from_gvk_with_plural(&gvk, "network-attachment-definitions")
    }

    pub fn virtual_machine_instance() -> ApiResource {
        let gvk = GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachineInstance");
        ApiResource::from_gvk_with_plural(&gvk, "virtualmachineinstances")
    }

    pub fn data_volume() -> ApiResource {
        let gvk = GroupVersionKind::gvk("cdi.kubevirt.io", "v1beta1", "DataVolume");
        ApiResource::from_gvk_with_plural(&gvk, "datavolumes")
    }
}

/// Human-readable `namespace/name` of an object, for error messages.
pub fn object_key(obj: &DynamicObject) -> String {
    match obj.namespace() {
        Some(ns) => format!("{ns}/{}", obj.name_any()),
        None => obj.name_any(),
    }
}
