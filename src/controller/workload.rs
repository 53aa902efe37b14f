//! Workload controllers
//!
//! One controller per workload kind (Deployment, StatefulSet, DaemonSet).
//! Each reconcile makes a binary decision: serve a VPA for the workload or
//! tear the served one down. Everything shape-related is left to the VPA
//! controller so shape changes do not depend on workload events.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument};

use crate::api::{
    equal_target, managed_by_butler, CrossVersionObjectReference, PodUpdatePolicy, TargetWorkload,
    TargetedWorkload, UpdateMode, VerticalPodAutoscaler, VerticalPodAutoscalerSpec,
    ANNOTATION_MANAGED_BY, ANNOTATION_VPA_BUTLER,
};
use crate::controller::delete_vpa;
use crate::error::{Error, Result};

const WORKLOAD_CONCURRENCY: u16 = 10;

/// Shared state for the workload controllers
pub struct WorkloadState {
    pub client: Client,
}

/// Runs the three workload controllers until shutdown.
pub async fn run_workload_controllers(client: Client) {
    tokio::join!(
        run_controller_for::<Deployment>(client.clone()),
        run_controller_for::<StatefulSet>(client.clone()),
        run_controller_for::<DaemonSet>(client),
    );
}

async fn run_controller_for<K: TargetWorkload>(client: Client) {
    let workloads: Api<K> = Api::all(client.clone());
    let state = Arc::new(WorkloadState { client });

    info!("starting {} controller", K::KIND);
    Controller::new(workloads, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(WORKLOAD_CONCURRENCY))
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, state)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!("reconciled {:?}", obj),
                Err(err) => error!(error = %err, "workload reconcile error"),
            }
        })
        .await;
}

#[instrument(skip_all, fields(kind = %K::KIND, namespace = %obj.namespace().unwrap_or_default(), name = %obj.name_any()))]
async fn reconcile<K: TargetWorkload>(obj: Arc<K>, state: Arc<WorkloadState>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_default();
    let api: Api<K> = Api::namespaced(state.client.clone(), &namespace);
    // a vanished workload is no work; its served VPA is reaped as an orphan
    let Some(workload) = api.get_opt(&obj.name_any()).await? else {
        return Ok(Action::await_change());
    };
    let target = workload.to_view()?;

    let vpas: Api<VerticalPodAutoscaler> = Api::namespaced(state.client.clone(), &namespace);
    let existing = vpas.list(&ListParams::default()).await?;
    if blocked_by_handcrafted(&target.cross_refs(), &existing.items) {
        if vpas.get_opt(&target.vpa_name()).await?.is_some() {
            info!("deleting vpa as a hand-crafted vpa is already in place");
            delete_vpa(&vpas, &target.vpa_name()).await?;
        }
        return Ok(Action::await_change());
    }

    if vpas.get_opt(&target.vpa_name()).await?.is_none() {
        info!("serving vpa");
        // mode Off here, the vpa controller fills in the full shape
        let skeleton = served_vpa_skeleton(&target);
        match vpas.create(&PostParams::default(), &skeleton).await {
            Ok(_) => {}
            Err(kube::Error::Api(ref response)) if response.code == 409 => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(Action::await_change())
}

fn error_policy<K: TargetWorkload>(obj: Arc<K>, error: &Error, _state: Arc<WorkloadState>) -> Action {
    error!(name = %obj.name_any(), error = %error, "workload reconciliation failed");
    if error.is_retriable() {
        Action::requeue(Duration::from_secs(15))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}

/// A hand-crafted VPA targeting the workload itself or anything owning it
/// suppresses the served VPA.
fn blocked_by_handcrafted(
    refs: &[CrossVersionObjectReference],
    vpas: &[VerticalPodAutoscaler],
) -> bool {
    vpas.iter().any(|vpa| {
        if managed_by_butler(vpa) {
            return false;
        }
        let Some(target_ref) = vpa.spec.target_ref.as_ref() else {
            return false;
        };
        refs.iter().any(|candidate| equal_target(target_ref, candidate))
    })
}

fn served_vpa_skeleton(target: &TargetedWorkload) -> VerticalPodAutoscaler {
    let mut vpa = VerticalPodAutoscaler::new(
        &target.vpa_name(),
        VerticalPodAutoscalerSpec {
            target_ref: Some(target.cross_ref()),
            update_policy: Some(PodUpdatePolicy {
                update_mode: Some(UpdateMode::Off),
                min_replicas: None,
            }),
            resource_policy: None,
        },
    );
    vpa.metadata.namespace = Some(target.namespace().to_string());
    vpa.metadata.annotations = Some(
        [(
            ANNOTATION_MANAGED_BY.to_string(),
            ANNOTATION_VPA_BUTLER.to_string(),
        )]
        .into_iter()
        .collect(),
    );
    vpa
}
