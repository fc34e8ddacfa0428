//! Idempotent reconciliation primitives
//!
//! Each call converges exactly one object toward presence or absence. Objects
//! created on behalf of a lab are stamped with an owner reference to it, and
//! an existing object is never adopted: if it does not carry that reference
//! the call fails with an ownership conflict and leaves it untouched.

use crate::crds::Lab;
use crate::error::{Error, Result};
use crate::store::{ObjectStore, Target};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DynamicObject, PropagationPolicy};
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Binding to the lab that owns everything a pass creates.
#[derive(Clone, Debug)]
pub struct Owner {
    reference: OwnerReference,
    namespace: String,
}

impl Owner {
    pub fn for_lab(lab: &Lab) -> Result<Self> {
        let reference = lab
            .controller_owner_ref(&())
            .ok_or_else(|| Error::missing("lab metadata.uid"))?;
        let namespace = lab
            .namespace()
            .ok_or_else(|| Error::missing("lab metadata.namespace"))?;
        Ok(Self {
            reference,
            namespace,
        })
    }

    /// Name of the owning lab.
    pub fn name(&self) -> &str {
        &self.reference.name
    }

    /// Namespace every owned object lives in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Add the owner reference to `obj` unless it is already there.
    pub fn stamp(&self, obj: &mut DynamicObject) {
        let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.uid == self.reference.uid) {
            refs.push(self.reference.clone());
        }
    }

    pub fn owns(&self, obj: &DynamicObject) -> bool {
        obj.owner_references()
            .iter()
            .any(|r| r.uid == self.reference.uid)
    }
}

/// What a primitive did to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Exists,
    Removed,
    Absent,
    /// Deleted for failing its health check and created again.
    Recreated,
}

/// Bounds of the delete-then-recreate repair path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepairPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Health predicate over a live object. `Err` carries the reason.
pub trait HealthCheck: Send + Sync {
    fn check(&self, live: &DynamicObject) -> std::result::Result<(), String>;
}

impl<F> HealthCheck for F
where
    F: Fn(&DynamicObject) -> std::result::Result<(), String> + Send + Sync,
{
    fn check(&self, live: &DynamicObject) -> std::result::Result<(), String> {
        self(live)
    }
}

/// Create `target` if absent, or delete it when `remove` is set.
///
/// With `need_owner`, the target is stamped with the lab owner reference and
/// an existing object must already carry it.
pub async fn ensure_or_remove(
    store: &dyn ObjectStore,
    owner: &Owner,
    target: &Target,
    need_owner: bool,
    remove: bool,
) -> Result<Outcome> {
    converge(store, owner, target, None, need_owner, remove, &RepairPolicy::default()).await
}

/// Like [`ensure_or_remove`], and additionally replace a live object that
/// fails `health`.
pub async fn ensure_healthy_or_remove(
    store: &dyn ObjectStore,
    owner: &Owner,
    target: &Target,
    health: &dyn HealthCheck,
    need_owner: bool,
    remove: bool,
    policy: &RepairPolicy,
) -> Result<Outcome> {
    converge(store, owner, target, Some(health), need_owner, remove, policy).await
}

async fn converge(
    store: &dyn ObjectStore,
    owner: &Owner,
    target: &Target,
    health: Option<&dyn HealthCheck>,
    need_owner: bool,
    remove: bool,
    policy: &RepairPolicy,
) -> Result<Outcome> {
    let name = target.name();
    let ns = owner.namespace();
    let mut desired = target.object.clone();
    desired.metadata.namespace = Some(ns.to_string());
    if need_owner {
        owner.stamp(&mut desired);
    }

    let Some(live) = store.get(&target.resource, ns, &name).await? else {
        if remove {
            return Ok(Outcome::Absent);
        }
        store.create(&target.resource, ns, &desired).await?;
        info!(kind = %target.kind(), name = %name, lab = %owner.name(), "Created object");
        return Ok(Outcome::Created);
    };

    if need_owner {
        verify_ownership(&live, owner)?;
    }
    if remove {
        store
            .delete(&target.resource, ns, &name, PropagationPolicy::Background)
            .await?;
        info!(kind = %target.kind(), name = %name, lab = %owner.name(), "Removed object");
        return Ok(Outcome::Removed);
    }

    let Some(health) = health else {
        return Ok(Outcome::Exists);
    };
    match health.check(&live) {
        Ok(()) => Ok(Outcome::Exists),
        Err(reason) => {
            warn!(
                kind = %target.kind(),
                name = %name,
                reason = %reason,
                "Object unhealthy, recreating"
            );
            store
                .delete(&target.resource, ns, &name, PropagationPolicy::Background)
                .await?;
            wait_for_gone(store, &target.resource, ns, &name, policy).await?;
            store.create(&target.resource, ns, &desired).await?;
            info!(kind = %target.kind(), name = %name, lab = %owner.name(), "Recreated object");
            Ok(Outcome::Recreated)
        }
    }
}

/// Fail unless one of `obj`'s owner references points at `owner`.
pub fn verify_ownership(obj: &DynamicObject, owner: &Owner) -> Result<()> {
    if owner.owns(obj) {
        return Ok(());
    }
    let refs = obj.owner_references();
    let detail = if refs.is_empty() {
        "doesn't have owner".to_string()
    } else {
        let names: Vec<&str> = refs.iter().map(|r| r.name.as_str()).collect();
        format!("and is owned by {}", names.join(","))
    };
    Err(Error::OwnershipConflict {
        kind: obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_else(|| "object".to_string()),
        name: obj.name_any(),
        detail,
    })
}

/// Poll until the object is gone from the store or `policy.timeout` expires.
pub async fn wait_for_gone(
    store: &dyn ObjectStore,
    resource: &ApiResource,
    namespace: &str,
    name: &str,
    policy: &RepairPolicy,
) -> Result<()> {
    let deadline = Instant::now() + policy.timeout;
    loop {
        if store.get(resource, namespace, name).await?.is_none() {
            debug!(kind = %resource.kind, name = %name, "Object is gone");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                kind: resource.kind.clone(),
                name: name.to_string(),
            });
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
}
