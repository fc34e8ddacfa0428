//! Topology resolution
//!
//! Expands a lab's links into spokes, one per (link, connector position), and
//! keeps one LAN per link in the store. Spoke names only depend on the LAN's
//! overlay ID and the connector position, so they are stable across passes.

use crate::allocator::{allocate_ids, AllocationScope, IdKind};
use crate::config::ConfigSnapshot;
use crate::crds::{Connector, Lab, LabSpec, Lan, LanSpec, Link, Vni, VXLAN_PORT};
use crate::error::{Error, Result};
use crate::labels::{self, FINALIZER};
use crate::nodes::{apply_defaults, validate_lab, Node, Registry};
use crate::reconcile::{ensure_or_remove, Owner};
use crate::store::{decode, ObjectStore, Target};
use kube::api::PropagationPolicy;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};

/// Spoke assignments of one pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedLinks {
    /// node → link → spokes, in connector order.
    pub spokes: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    /// spoke → the connector it was derived from.
    pub connectors: BTreeMap<String, Connector>,
    /// spoke → owning link.
    pub links: BTreeMap<String, String>,
}

impl ResolvedLinks {
    fn record(&mut self, link: &str, spoke: String, connector: &Connector) {
        self.spokes
            .entry(connector.node.clone())
            .or_default()
            .entry(link.to_string())
            .or_default()
            .push(spoke.clone());
        self.connectors.insert(spoke.clone(), connector.clone());
        self.links.insert(spoke, link.to_string());
    }
}

/// One spoke of a node, with everything a node kind needs to attach to it.
#[derive(Clone, Debug)]
pub struct NodeSpoke<'a> {
    pub link_name: &'a str,
    pub link: &'a Link,
    pub spoke: &'a str,
    pub connector: &'a Connector,
    /// Name of the LAN backing the link.
    pub lan: String,
}

/// The resolved view of one lab for one pass. Never shared across passes.
#[derive(Debug)]
pub struct ParsedLab {
    pub owner: Owner,
    pub spec: LabSpec,
    pub nodes: BTreeMap<String, Node>,
    pub links: ResolvedLinks,
}

impl ParsedLab {
    /// Default and validate `lab`, then resolve its links. Nothing is written
    /// to the store unless validation passes.
    pub async fn resolve(
        store: &dyn ObjectStore,
        scope: &AllocationScope<'_>,
        lab: &Lab,
        config: &ConfigSnapshot,
        registry: &Registry,
    ) -> Result<Self> {
        let owner = Owner::for_lab(lab)?;
        let spec = lab.spec.clone();
        let nodes = apply_defaults(&spec, config, registry)?;
        validate_lab(&spec, &nodes)?;
        let links = resolve_links(store, scope, &owner, &spec, config).await?;
        Ok(Self {
            owner,
            spec,
            nodes,
            links,
        })
    }

    pub fn name(&self) -> &str {
        self.owner.name()
    }

    pub fn namespace(&self) -> &str {
        self.owner.namespace()
    }

    /// Spokes of `node` in link name order, then connector order.
    pub fn node_spokes(&self, node: &str) -> Vec<NodeSpoke<'_>> {
        let Some(by_link) = self.links.spokes.get(node) else {
            return Vec::new();
        };
        by_link
            .iter()
            .filter_map(|(link_name, spokes)| {
                self.spec.links.get(link_name).map(|link| (link_name, link, spokes))
            })
            .flat_map(|(link_name, link, spokes)| {
                spokes.iter().filter_map(move |spoke| {
                    self.links.connectors.get(spoke).map(|connector| NodeSpoke {
                        link_name,
                        link,
                        spoke,
                        connector,
                        lan: labels::lan_name(self.name(), link_name),
                    })
                })
            })
            .collect()
    }
}

fn lan_resource() -> ApiResource {
    ApiResource::erase::<Lan>(&())
}

fn new_lan(owner: &Owner, link_name: &str, vni: Vni, config: &ConfigSnapshot) -> Lan {
    let name = labels::lan_name(owner.name(), link_name);
    let mut lan = Lan::new(
        &name,
        LanSpec {
            ns: name.clone(),
            bridge_name: labels::bridge_name(vni.get()),
            vxlan_name: labels::vxlan_name(vni.get()),
            vni,
            default_vx_dev: config.spec.default_vxlan_dev.clone(),
            vx_dev_map: config.spec.vxlan_dev_map.clone(),
            vx_port: VXLAN_PORT,
            vxlan_group: config.spec.vxlan_group.clone(),
            spokes: Vec::new(),
        },
    );
    lan.metadata = labels::object_meta(&name, owner.name(), owner.namespace(), None);
    lan.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    lan
}

/// Resolve every link of `spec` into spokes, creating or extending its LAN.
///
/// Links are processed in name order. The result is only produced when every
/// link resolved; on error the caller discards the pass and retries later.
#[instrument(skip_all, fields(lab = %owner.name()))]
pub async fn resolve_links(
    store: &dyn ObjectStore,
    scope: &AllocationScope<'_>,
    owner: &Owner,
    spec: &LabSpec,
    config: &ConfigSnapshot,
) -> Result<ResolvedLinks> {
    let resource = lan_resource();
    let mut resolved = ResolvedLinks::default();
    for (link_name, link) in &spec.links {
        let lan_name = labels::lan_name(owner.name(), link_name);
        let live = store.get(&resource, owner.namespace(), &lan_name).await?;
        let mut lan = match &live {
            Some(obj) => decode::<Lan>(obj)?,
            None => {
                let id = allocate_ids(store, scope, IdKind::OverlayId, 1)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(Error::Exhausted(IdKind::OverlayId))?;
                let vni = Vni::new(id).map_err(Error::validation)?;
                info!(link = %link_name, vni = %vni, "Allocated overlay id");
                new_lan(owner, link_name, vni, config)
            }
        };

        let known = lan.spec.spokes.len();
        for (i, connector) in link.connectors.iter().enumerate() {
            let spoke = labels::spoke_name(lan.spec.vni.get(), i);
            if !lan.spec.spokes.contains(&spoke) {
                lan.spec.spokes.push(spoke.clone());
            }
            resolved.record(link_name, spoke, connector);
        }

        let target = Target::from_typed(&lan)?;
        ensure_or_remove(store, owner, &target, true, false).await?;
        if live.is_some() && lan.spec.spokes.len() != known {
            debug!(lan = %lan_name, spokes = ?lan.spec.spokes, "Extending LAN spoke list");
            store.replace(&resource, owner.namespace(), &target.object).await?;
        }
    }
    Ok(resolved)
}

/// Release and delete LANs of the lab whose link is no longer declared.
pub async fn prune_stale_lans(
    store: &dyn ObjectStore,
    owner: &Owner,
    spec: &LabSpec,
) -> Result<Vec<String>> {
    let keep: BTreeSet<String> = spec
        .links
        .keys()
        .map(|link| labels::lan_name(owner.name(), link))
        .collect();
    release_lans_except(store, owner, &keep).await
}

/// Release and delete every LAN of the lab. Used when the lab goes away.
pub async fn release_lans(store: &dyn ObjectStore, owner: &Owner) -> Result<Vec<String>> {
    release_lans_except(store, owner, &BTreeSet::new()).await
}

async fn release_lans_except(
    store: &dyn ObjectStore,
    owner: &Owner,
    keep: &BTreeSet<String>,
) -> Result<Vec<String>> {
    let resource = lan_resource();
    let lans = store
        .list(&resource, &labels::lab_selector(owner.name()))
        .await?;
    let mut released = Vec::new();
    for mut lan in lans {
        let name = lan.name_any();
        if lan.namespace().as_deref() != Some(owner.namespace())
            || keep.contains(&name)
            || !owner.owns(&lan)
        {
            continue;
        }
        let finalizers = lan.finalizers().to_vec();
        if finalizers.iter().any(|f| f == FINALIZER) {
            lan.metadata.finalizers = Some(
                finalizers
                    .into_iter()
                    .filter(|f| f != FINALIZER)
                    .collect(),
            );
            store.replace(&resource, owner.namespace(), &lan).await?;
        }
        store
            .delete(&resource, owner.namespace(), &name, PropagationPolicy::Background)
            .await?;
        info!(lan = %name, lab = %owner.name(), "Released LAN");
        released.push(name);
    }
    Ok(released)
}
