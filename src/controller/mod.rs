//! Controllers serving VerticalPodAutoscalers.
//!
//! Three workload controllers decide whether a served VPA should exist, the
//! VPA controller owns its shape and lifecycle, and the capacity runnable
//! periodically recomputes the maximum allowed resources from node capacity.

use kube::api::{Api, DeleteParams};
use kube::Client;

use crate::api::{
    CrossVersionObjectReference, TargetWorkload, TargetedWorkload, VerticalPodAutoscaler,
    WorkloadKind,
};
use crate::error::Result;

pub mod capacity;
pub mod metrics;
mod shape;
mod vpa;
mod workload;

pub use capacity::CapacityRunnable;
pub use shape::shape_vpa;
pub use vpa::{run_vpa_controller, VpaState};
pub use workload::run_workload_controllers;

/// Overrides the update mode of the served VPA.
pub const UPDATE_MODE_ANNOTATION_KEY: &str = "vpa-butler.cloud.sap/update-mode";
/// Overrides the controlled values of the served VPA.
pub const CONTROLLED_VALUES_ANNOTATION_KEY: &str = "vpa-butler.cloud.sap/controlled-values";
/// Names the resource-heavy container for asymmetric capacity distribution.
pub const MAIN_CONTAINER_ANNOTATION_KEY: &str = "vpa-butler.cloud.sap/main-container";

/// Outcome of resolving a VPA's target reference against the cluster.
pub(crate) enum TargetState {
    Found(TargetedWorkload),
    Missing,
    UnknownKind,
}

/// Fetches the workload a target reference points at and flattens it.
pub(crate) async fn extract_target(
    client: &Client,
    namespace: &str,
    target_ref: &CrossVersionObjectReference,
) -> Result<TargetState> {
    use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};

    match WorkloadKind::from_kind(&target_ref.kind) {
        None => Ok(TargetState::UnknownKind),
        Some(WorkloadKind::Deployment) => {
            fetch_view::<Deployment>(client, namespace, &target_ref.name).await
        }
        Some(WorkloadKind::StatefulSet) => {
            fetch_view::<StatefulSet>(client, namespace, &target_ref.name).await
        }
        Some(WorkloadKind::DaemonSet) => {
            fetch_view::<DaemonSet>(client, namespace, &target_ref.name).await
        }
    }
}

async fn fetch_view<K: TargetWorkload>(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<TargetState> {
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    match api.get_opt(name).await? {
        None => Ok(TargetState::Missing),
        Some(workload) => Ok(TargetState::Found(workload.to_view()?)),
    }
}

/// Deletes a VPA, treating a lost deletion race as success.
pub(crate) async fn delete_vpa(api: &Api<VerticalPodAutoscaler>, name: &str) -> Result<()> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ref response)) if response.code == 404 => Ok(()),
        Err(err) => Err(err.into()),
    }
}
