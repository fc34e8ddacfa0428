//! Cluster-wide identifier allocation
//!
//! Overlay IDs (VNIs) and bridge indices live in flat 24-bit spaces whose only
//! source of truth is the set of values stamped on live objects. Allocation
//! re-reads that set on every call, so it is only collision-free while a
//! single allocation is in flight: callers must hold an [`AllocationScope`]
//! from the end of the scan until the picked value is committed to the store.

use crate::crds::Lan;
use crate::error::{Error, Result};
use crate::labels::BRIDGE_INDEX_LABEL_KEY;
use crate::store::{object_key, resources, ObjectStore};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use std::collections::HashSet;
use std::sync::Arc;
use strum::Display;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Largest identifier in either space (2^24 - 1).
pub const MAX_ID: u32 = (1 << 24) - 1;

/// The identifier spaces handed out by the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum IdKind {
    /// VxLAN network identifier of a LAN.
    #[strum(serialize = "overlay id")]
    OverlayId,
    /// Index of a per-node fabric bridge.
    #[strum(serialize = "bridge index")]
    BridgeIndex,
}

impl IdKind {
    /// Objects that may carry an identifier of this kind.
    fn resource(&self) -> ApiResource {
        match self {
            IdKind::OverlayId => ApiResource::erase::<Lan>(&()),
            IdKind::BridgeIndex => resources::network_attachment_definition(),
        }
    }

    fn selector(&self) -> &'static str {
        match self {
            IdKind::OverlayId => "",
            IdKind::BridgeIndex => BRIDGE_INDEX_LABEL_KEY,
        }
    }

    /// Identifier stamped on `obj`, if any.
    pub(crate) fn extract(&self, obj: &DynamicObject) -> Result<Option<u64>> {
        let raw = match self {
            IdKind::OverlayId => match obj.data.pointer("/spec/vni") {
                None | Some(serde_json::Value::Null) => return Ok(None),
                Some(serde_json::Value::Number(n)) => n.as_u64().map(|v| v.to_string()),
                Some(other) => Some(other.to_string()),
            },
            IdKind::BridgeIndex => obj
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(BRIDGE_INDEX_LABEL_KEY))
                .cloned(),
        };
        match raw {
            None => Ok(None),
            Some(value) => value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| Error::InvalidIdentifier {
                    kind: *self,
                    value,
                    object: object_key(obj),
                }),
        }
    }
}

impl IdKind {
    /// Like [`IdKind::extract`], but a value outside `0..=MAX_ID` is an error.
    pub(crate) fn extract_in_range(&self, obj: &DynamicObject) -> Result<Option<u32>> {
        match self.extract(obj)? {
            None => Ok(None),
            Some(v) => u32::try_from(v)
                .ok()
                .filter(|v| *v <= MAX_ID)
                .map(Some)
                .ok_or_else(|| Error::InvalidIdentifier {
                    kind: *self,
                    value: v.to_string(),
                    object: object_key(obj),
                }),
        }
    }
}

/// Process-wide mutual exclusion around allocation.
#[derive(Clone, Default)]
pub struct IdAllocator {
    lock: Arc<Mutex<()>>,
}

/// Proof that the caller holds the allocation lock.
///
/// Keep it alive until every allocated identifier has been written to the store.
pub struct AllocationScope<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the identifier spaces.
    pub async fn lock(&self) -> AllocationScope<'_> {
        AllocationScope {
            _guard: self.lock.lock().await,
        }
    }
}

/// Allocate `count` distinct free identifiers of `kind`.
pub async fn allocate_ids(
    store: &dyn ObjectStore,
    _scope: &AllocationScope<'_>,
    kind: IdKind,
    count: usize,
) -> Result<Vec<u32>> {
    allocate_up_to(store, kind, count, MAX_ID).await
}

async fn allocate_up_to(
    store: &dyn ObjectStore,
    kind: IdKind,
    count: usize,
    max: u32,
) -> Result<Vec<u32>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let objects = store.list(&kind.resource(), kind.selector()).await?;
    let mut used = Vec::with_capacity(objects.len());
    for obj in &objects {
        match kind.extract(obj)? {
            Some(v) if v <= u64::from(max) => used.push(v as u32),
            Some(v) => warn!(
                kind = %kind,
                value = v,
                object = %object_key(obj),
                "Ignoring identifier outside allocatable range"
            ),
            None => {}
        }
    }
    let ids = pick_free_up_to(used, count, max).map_err(|_| Error::Exhausted(kind))?;
    debug!(kind = %kind, ids = ?ids, in_use = objects.len(), "Allocated identifiers");
    Ok(ids)
}

/// Marker error: the space ran out before `count` values were found.
#[derive(Debug, PartialEq, Eq)]
pub struct SpaceExhausted;

/// Pick the `count` lowest values in `1..=MAX_ID` not present in `used`.
pub fn pick_free(
    used: impl IntoIterator<Item = u32>,
    count: usize,
) -> std::result::Result<Vec<u32>, SpaceExhausted> {
    pick_free_up_to(used, count, MAX_ID)
}

fn pick_free_up_to(
    used: impl IntoIterator<Item = u32>,
    count: usize,
    max: u32,
) -> std::result::Result<Vec<u32>, SpaceExhausted> {
    let used: HashSet<u32> = used.into_iter().collect();
    let picked: Vec<u32> = (1..=max)
        .filter(|v| !used.contains(v))
        .take(count)
        .collect();
    if picked.len() < count {
        return Err(SpaceExhausted);
    }
    Ok(picked)
}
