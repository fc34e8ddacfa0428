//! Lab controller
//!
//! One pass per Lab event: snapshot the operator config, default and
//! validate the lab, resolve its links and converge every node. Passes run
//! one at a time and hold the allocation lock throughout.

use super::Context;
use crate::allocator::IdAllocator;
use crate::config::{ConfigSnapshot, OperatorSettings};
use crate::crds::{Lab, LabStatus, Lan, READY_CONDITION};
use crate::error::Error;
use crate::labels::FINALIZER;
use crate::nodes::{NodeContext, Registry};
use crate::reconcile::Owner;
use crate::store::ObjectStore;
use crate::topology::{prune_stale_lans, release_lans, ParsedLab};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{
        controller::{self, Action, Controller},
        finalizer::{finalizer, Error as FinalizerError, Event},
        watcher::Config,
    },
    ResourceExt,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Lab(#[from] Error),
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),
    #[error("pass did not finish within {0:?}")]
    PassTimeout(Duration),
}

impl ReconcileError {
    /// Machine-readable reason for the Ready condition.
    fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Lab(Error::Validation(_)) => "InvalidSpec",
            ReconcileError::Lab(e) if e.is_ownership_conflict() => "OwnershipConflict",
            ReconcileError::Lab(Error::Exhausted(_)) => "IdentifiersExhausted",
            ReconcileError::PassTimeout(_) => "Timeout",
            _ => "ReconcileFailed",
        }
    }
}

pub struct LabController;

impl LabController {
    pub async fn run(ctx: Arc<Context>) {
        let client = ctx.client.clone();
        let labs: Api<Lab> = Api::all(client.clone());

        // A single worker keeps identifier allocation single-writer.
        Controller::new(labs, Config::default())
            .owns(Api::<Lan>::all(client.clone()), Config::default())
            .owns(Api::<Pod>::all(client), Config::default())
            .with_config(controller::Config::default().concurrency(1))
            .run(reconcile, error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => info!(name = %obj.name, "Reconciled Lab"),
                    Err(e) => error!(error = %e, "Reconcile error"),
                }
            })
            .await;
    }
}

#[instrument(skip(ctx), fields(name = %lab.name_any()))]
async fn reconcile(
    lab: Arc<Lab>,
    ctx: Arc<Context>,
) -> Result<Action, FinalizerError<ReconcileError>> {
    let ns = lab.namespace().unwrap_or_default();
    let labs: Api<Lab> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&labs, FINALIZER, lab, |event| async {
        match event {
            Event::Apply(lab) => {
                let outcome = converge_lab(
                    ctx.store.as_ref(),
                    &ctx.allocator,
                    &ctx.registry,
                    &ctx.settings,
                    &lab,
                )
                .await;
                update_status(&labs, &lab, outcome.as_ref().err()).await?;
                outcome?;
                Ok(Action::requeue(ctx.settings.requeue))
            }
            Event::Cleanup(lab) => {
                cleanup_lab(ctx.store.as_ref(), &lab).await?;
                Ok(Action::await_change())
            }
        }
    })
    .await
}

fn error_policy(
    _lab: Arc<Lab>,
    error: &FinalizerError<ReconcileError>,
    ctx: Arc<Context>,
) -> Action {
    error!(error = %error, "Reconcile failed");
    Action::requeue(ctx.settings.error_requeue)
}

/// Run one pass over `lab`, bounded by the configured pass timeout.
pub async fn converge_lab(
    store: &dyn ObjectStore,
    allocator: &IdAllocator,
    registry: &Registry,
    settings: &OperatorSettings,
    lab: &Lab,
) -> Result<(), ReconcileError> {
    tokio::time::timeout(settings.pass_timeout, run_pass(store, allocator, registry, settings, lab))
        .await
        .map_err(|_| ReconcileError::PassTimeout(settings.pass_timeout))?
        .map_err(ReconcileError::from)
}

async fn run_pass(
    store: &dyn ObjectStore,
    allocator: &IdAllocator,
    registry: &Registry,
    settings: &OperatorSettings,
    lab: &Lab,
) -> crate::error::Result<()> {
    let config =
        ConfigSnapshot::fetch(store, registry, &settings.namespace, &settings.config_name).await?;
    let scope = allocator.lock().await;
    let parsed = ParsedLab::resolve(store, &scope, lab, &config, registry).await?;
    let pruned = prune_stale_lans(store, &parsed.owner, &parsed.spec).await?;
    if !pruned.is_empty() {
        info!(lans = ?pruned, "Released LANs of removed links");
    }

    let ctx = NodeContext {
        lab: &parsed,
        config: &config,
        scope: &scope,
        repair: settings.repair_policy(),
    };
    for (name, node) in &parsed.nodes {
        node.kind().reconcile(&ctx, name, store, false).await?;
    }
    info!(
        nodes = parsed.nodes.len(),
        links = parsed.spec.links.len(),
        config_generation = config.generation,
        "Lab converged"
    );
    Ok(())
}

/// Release every LAN of a deleted lab. Node objects go with the lab through
/// their owner references.
pub async fn cleanup_lab(
    store: &dyn ObjectStore,
    lab: &Lab,
) -> Result<Vec<String>, ReconcileError> {
    let owner = Owner::for_lab(lab)?;
    let released = release_lans(store, &owner).await?;
    info!(lans = ?released, "Released LANs of deleted lab");
    Ok(released)
}

/// Status after a pass, or `None` when the current one already says the same.
pub fn next_status(
    current: Option<&LabStatus>,
    generation: Option<i64>,
    error: Option<&ReconcileError>,
    now: DateTime<Utc>,
) -> Option<LabStatus> {
    let (status, reason, message) = match error {
        None => ("True", "Converged", "all nodes converged".to_string()),
        Some(e) => ("False", e.reason(), e.to_string()),
    };
    let previous = current.and_then(LabStatus::ready);
    let unchanged = previous.is_some_and(|c| {
        c.status == status && c.reason == reason && c.message == message
    }) && current.and_then(|s| s.observed_generation) == generation;
    if unchanged {
        return None;
    }
    let last_transition_time = match previous {
        Some(c) if c.status == status => c.last_transition_time.clone(),
        _ => Time(now),
    };
    Some(LabStatus {
        conditions: vec![Condition {
            type_: READY_CONDITION.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message,
            observed_generation: generation,
            last_transition_time,
        }],
        observed_generation: generation,
    })
}

async fn update_status(
    labs: &Api<Lab>,
    lab: &Lab,
    error: Option<&ReconcileError>,
) -> Result<(), ReconcileError> {
    let Some(status) = next_status(lab.status.as_ref(), lab.metadata.generation, error, Utc::now())
    else {
        return Ok(());
    };
    if let Some(e) = error {
        warn!(error = %e, "Lab not ready");
    }
    labs.patch_status(
        &lab.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": status })),
    )
    .await
    .map_err(ReconcileError::Kube)?;
    Ok(())
}
