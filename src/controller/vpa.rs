//! VPA controller
//!
//! Owns the full lifecycle of served VPAs: deleting orphaned and legacy-named
//! ones, resolving conflicts with hand-crafted VPAs on the same target and
//! patching the served shape. Runs at concurrency 1 so the conflict
//! resolution stays linearizable.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument};

use crate::api::{
    equal_target, managed_by_butler, is_current_naming, CrossVersionObjectReference,
    TargetedWorkload, VerticalPodAutoscaler, VerticalPodAutoscalerSpec,
};
use crate::config::Defaults;
use crate::controller::{delete_vpa, extract_target, metrics, shape::shape_vpa, TargetState};
use crate::error::{Error, Result};

/// Shared state for the VPA controller
pub struct VpaState {
    pub client: Client,
    pub defaults: Arc<Defaults>,
}

/// Runs the VPA controller until shutdown.
pub async fn run_vpa_controller(client: Client, defaults: Arc<Defaults>) -> Result<()> {
    let vpas: Api<VerticalPodAutoscaler> = Api::all(client.clone());

    // fail early when the CRD is absent
    match vpas.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("VerticalPodAutoscaler CRD is available"),
        Err(err) => {
            error!(error = %err, "VerticalPodAutoscaler CRD not found. Please install the CRD first");
            return Err(Error::ConfigError(
                "VerticalPodAutoscaler CRD not installed".to_string(),
            ));
        }
    }

    let state = Arc::new(VpaState { client, defaults });
    Controller::new(vpas, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(1))
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!("reconciled {:?}", obj),
                Err(err) => error!(error = %err, "vpa reconcile error"),
            }
        })
        .await;
    Ok(())
}

#[instrument(skip_all, fields(namespace = %obj.namespace().unwrap_or_default(), name = %obj.name_any()))]
async fn reconcile(
    obj: Arc<VerticalPodAutoscaler>,
    state: Arc<VpaState>,
) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let api: Api<VerticalPodAutoscaler> = Api::namespaced(state.client.clone(), &namespace);
    let Some(vpa) = api.get_opt(&name).await? else {
        return Ok(Action::await_change());
    };

    let target_state = match vpa.spec.target_ref.as_ref() {
        None => None,
        Some(target_ref) => Some(extract_target(&state.client, &namespace, target_ref).await?),
    };

    if managed_by_butler(&vpa)
        && matches!(target_state, None | Some(TargetState::Missing))
    {
        info!("deleting vpa with orphaned target");
        delete_vpa(&api, &name).await?;
        return Ok(Action::await_change());
    }

    metrics::record_container_metrics(&vpa);

    let target = match target_state {
        None => {
            return Err(Error::TargetError(format!(
                "vpa {namespace}/{name} has nil target ref"
            )))
        }
        Some(TargetState::UnknownKind) => {
            info!("unknown target kind");
            return Ok(Action::await_change());
        }
        Some(TargetState::Missing) => {
            return Err(Error::TargetError(format!(
                "failed to fetch target of vpa {namespace}/{name}"
            )))
        }
        Some(TargetState::Found(target)) => target,
    };

    if cleanup_served_vpa(&api, &vpa, &target).await? {
        return Ok(Action::await_change());
    }
    if !managed_by_butler(&vpa) {
        return Ok(Action::await_change());
    }
    if !is_current_naming(&name) {
        info!("cleanup of old vpa successful");
        delete_vpa(&api, &name).await?;
        return Ok(Action::await_change());
    }

    reconcile_shape(&state, &api, &target).await?;
    Ok(Action::await_change())
}

fn error_policy(
    obj: Arc<VerticalPodAutoscaler>,
    error: &Error,
    _state: Arc<VpaState>,
) -> Action {
    error!(name = %obj.name_any(), error = %error, "vpa reconciliation failed");
    if error.is_retriable() {
        Action::requeue(Duration::from_secs(15))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}

/// Resolves duplicate VPAs on the same target. The served VPA always loses
/// against a hand-crafted one. Returns true when the currently reconciled
/// VPA itself has been deleted.
async fn cleanup_served_vpa(
    api: &Api<VerticalPodAutoscaler>,
    current: &VerticalPodAutoscaler,
    target: &TargetedWorkload,
) -> Result<bool> {
    if current.spec.target_ref.is_none() {
        return Ok(false);
    }
    let vpas = api.list(&ListParams::default()).await?;
    for other in &vpas.items {
        if !conflicts_with(other, current, target) {
            continue;
        }
        if managed_by_butler(other) {
            info!(
                other = %other.name_any(),
                "deleted served vpa as a custom vpa was created"
            );
            delete_vpa(api, &other.name_any()).await?;
            return Ok(false);
        }
        if managed_by_butler(current) {
            info!("deleted served vpa as a custom vpa was created");
            delete_vpa(api, &current.name_any()).await?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether `other` advises the same target as `current`, either directly or
/// through an owner of the target's workload.
fn conflicts_with(
    other: &VerticalPodAutoscaler,
    current: &VerticalPodAutoscaler,
    target: &TargetedWorkload,
) -> bool {
    if other.uid() == current.uid() {
        return false;
    }
    let Some(other_ref) = other.spec.target_ref.as_ref() else {
        return false;
    };
    if let Some(current_ref) = current.spec.target_ref.as_ref() {
        if equal_target(other_ref, current_ref) {
            return true;
        }
    }
    target.meta.owner_references.iter().flatten().any(|owner| {
        let owner_ref = CrossVersionObjectReference {
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            api_version: Some(owner.api_version.clone()),
        };
        equal_target(other_ref, &owner_ref)
    })
}

/// Fetches (or initializes) the served VPA for the target and patches it to
/// the desired shape.
async fn reconcile_shape(
    state: &VpaState,
    api: &Api<VerticalPodAutoscaler>,
    target: &TargetedWorkload,
) -> Result<()> {
    let name = target.vpa_name();
    let existing = api.get_opt(&name).await?;
    let mut vpa = match &existing {
        Some(found) => found.clone(),
        None => {
            let mut fresh =
                VerticalPodAutoscaler::new(&name, VerticalPodAutoscalerSpec::default());
            fresh.metadata.namespace = Some(target.namespace().to_string());
            fresh
        }
    };
    if vpa.metadata.deletion_timestamp.is_some() {
        return Err(Error::MarkedForDeletion(format!(
            "{}/{name}",
            target.namespace()
        )));
    }

    shape_vpa(&mut vpa, target, &state.defaults)?;

    let Some(before) = existing else {
        info!(vpa = %name, "creating vpa");
        match api.create(&PostParams::default(), &vpa).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ref response)) if response.code == 409 => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    };
    if before.spec == vpa.spec
        && before.metadata.annotations == vpa.metadata.annotations
        && before.metadata.owner_references == vpa.metadata.owner_references
    {
        return Ok(());
    }
    info!(vpa = %name, "patching vpa");
    let patch = shape_patch_body(&before, &vpa)?;
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Merge-patch body carrying the shaped spec and metadata. A removed
/// `minReplicas` must be serialized as an explicit null, otherwise the merge
/// patch leaves the stale value in place.
fn shape_patch_body(
    before: &VerticalPodAutoscaler,
    desired: &VerticalPodAutoscaler,
) -> Result<serde_json::Value> {
    let mut spec = serde_json::to_value(&desired.spec)?;
    let had_min_replicas = before
        .spec
        .update_policy
        .as_ref()
        .and_then(|policy| policy.min_replicas)
        .is_some();
    let wants_min_replicas = desired
        .spec
        .update_policy
        .as_ref()
        .and_then(|policy| policy.min_replicas)
        .is_some();
    if had_min_replicas && !wants_min_replicas {
        spec["updatePolicy"]["minReplicas"] = serde_json::Value::Null;
    }
    Ok(serde_json::json!({
        "metadata": {
            "annotations": desired.metadata.annotations,
            "ownerReferences": desired.metadata.owner_references,
        },
        "spec": spec,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        LabelSelector, ObjectMeta, OwnerReference,
    };

    use crate::api::{
        PodUpdatePolicy, UpdateMode, WorkloadKind, ANNOTATION_MANAGED_BY, ANNOTATION_VPA_BUTLER,
    };

    fn target() -> TargetedWorkload {
        TargetedWorkload {
            kind: WorkloadKind::Deployment,
            meta: ObjectMeta {
                name: Some("backend".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-target".to_string()),
                ..ObjectMeta::default()
            },
            pod_spec: PodSpec::default(),
            selector: LabelSelector::default(),
            replicas: Some(2),
        }
    }

    fn vpa(name: &str, uid: &str, target_kind: &str, target_name: &str, api_version: &str) -> VerticalPodAutoscaler {
        let mut vpa = VerticalPodAutoscaler::new(name, VerticalPodAutoscalerSpec::default());
        vpa.metadata.uid = Some(uid.to_string());
        vpa.metadata.namespace = Some("default".to_string());
        vpa.spec.target_ref = Some(CrossVersionObjectReference {
            kind: target_kind.to_string(),
            name: target_name.to_string(),
            api_version: Some(api_version.to_string()),
        });
        vpa
    }

    fn mark_served(vpa: &mut VerticalPodAutoscaler) {
        vpa.metadata.annotations = Some(
            [(
                ANNOTATION_MANAGED_BY.to_string(),
                ANNOTATION_VPA_BUTLER.to_string(),
            )]
            .into_iter()
            .collect(),
        );
    }

    #[test]
    fn conflict_on_the_same_target_ref() {
        let current = vpa("backend-deployment", "uid-1", "Deployment", "backend", "apps/v1");
        let other = vpa("custom", "uid-2", "Deployment", "backend", "v1");
        assert!(conflicts_with(&other, &current, &target()));
    }

    #[test]
    fn no_conflict_with_itself() {
        let current = vpa("backend-deployment", "uid-1", "Deployment", "backend", "apps/v1");
        let same = current.clone();
        assert!(!conflicts_with(&same, &current, &target()));
    }

    #[test]
    fn conflict_through_the_targets_owner() {
        let current = vpa("backend-deployment", "uid-1", "Deployment", "backend", "apps/v1");
        let other = vpa("custom", "uid-2", "Parent", "backend-parent", "example.com/v1");
        let mut owned = target();
        owned.meta.owner_references = Some(vec![OwnerReference {
            api_version: "example.com/v1".to_string(),
            kind: "Parent".to_string(),
            name: "backend-parent".to_string(),
            uid: "uid-parent".to_string(),
            ..OwnerReference::default()
        }]);
        assert!(conflicts_with(&other, &current, &owned));
        assert!(!conflicts_with(&other, &current, &target()));
    }

    #[test]
    fn no_conflict_on_unrelated_targets() {
        let current = vpa("backend-deployment", "uid-1", "Deployment", "backend", "apps/v1");
        let other = vpa("custom", "uid-2", "Deployment", "frontend", "apps/v1");
        assert!(!conflicts_with(&other, &current, &target()));
    }

    #[test]
    fn patch_body_clears_removed_min_replicas() {
        let mut before = vpa("backend-deployment", "uid-1", "Deployment", "backend", "apps/v1");
        before.spec.update_policy = Some(PodUpdatePolicy {
            update_mode: Some(UpdateMode::Recreate),
            min_replicas: Some(1),
        });
        let mut desired = before.clone();
        desired.spec.update_policy = Some(PodUpdatePolicy {
            update_mode: Some(UpdateMode::Recreate),
            min_replicas: None,
        });
        mark_served(&mut desired);

        let body = shape_patch_body(&before, &desired).unwrap();
        assert!(body["spec"]["updatePolicy"]["minReplicas"].is_null());
        assert_eq!(body["spec"]["updatePolicy"]["updateMode"], "Recreate");
        assert_eq!(
            body["metadata"]["annotations"][ANNOTATION_MANAGED_BY],
            ANNOTATION_VPA_BUTLER
        );
    }

    #[test]
    fn patch_body_keeps_present_min_replicas() {
        let before = vpa("backend-deployment", "uid-1", "Deployment", "backend", "apps/v1");
        let mut desired = before.clone();
        desired.spec.update_policy = Some(PodUpdatePolicy {
            update_mode: Some(UpdateMode::Auto),
            min_replicas: Some(1),
        });
        let body = shape_patch_body(&before, &desired).unwrap();
        assert_eq!(body["spec"]["updatePolicy"]["minReplicas"], 1);
    }

    #[test]
    fn served_loser_is_detected_by_marker() {
        let mut served = vpa("backend-deployment", "uid-1", "Deployment", "backend", "apps/v1");
        mark_served(&mut served);
        assert!(managed_by_butler(&served));
        let handcrafted = vpa("custom", "uid-2", "Deployment", "backend", "apps/v1");
        assert!(!managed_by_butler(&handcrafted));
    }
}
