//! The shape of a served VPA.
//!
//! [`shape_vpa`] mutates a VPA in place until it matches what the butler
//! wants to serve for a workload: target reference, update policy, container
//! policies, ownership annotations and the owner reference. The function is
//! idempotent so the controller can diff before patching.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::api::{
    ContainerControlledValues, ContainerResourcePolicy, PodResourcePolicy, PodUpdatePolicy,
    TargetedWorkload, UpdateMode, VerticalPodAutoscaler, ANNOTATION_BUTLER_VERSION,
    ANNOTATION_MANAGED_BY, ANNOTATION_VPA_BUTLER,
};
use crate::config::Defaults;
use crate::controller::{CONTROLLED_VALUES_ANNOTATION_KEY, UPDATE_MODE_ANNOTATION_KEY};
use crate::error::Result;

const WILDCARD_CONTAINER: &str = "*";

/// Brings `vpa` to the served shape for `target`.
pub fn shape_vpa(
    vpa: &mut VerticalPodAutoscaler,
    target: &TargetedWorkload,
    defaults: &Defaults,
) -> Result<()> {
    vpa.spec.target_ref = Some(target.cross_ref());
    vpa.spec.update_policy = Some(update_policy(target, defaults));
    apply_resource_policy(vpa, target, defaults);

    let annotations = vpa.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(
        ANNOTATION_MANAGED_BY.to_string(),
        ANNOTATION_VPA_BUTLER.to_string(),
    );
    annotations.insert(
        ANNOTATION_BUTLER_VERSION.to_string(),
        defaults.version.clone(),
    );

    set_owner_reference(vpa, target)?;
    Ok(())
}

fn update_policy(target: &TargetedWorkload, defaults: &Defaults) -> PodUpdatePolicy {
    let mut mode = defaults.update_mode;
    if let Some(mode_override) = target
        .annotation(UPDATE_MODE_ANNOTATION_KEY)
        .and_then(UpdateMode::from_name)
    {
        mode = mode_override;
    }
    // Evicting the only replica takes the workload offline, so modes that
    // evict must keep it alive. DaemonSets report no replica count.
    let min_replicas = match mode {
        UpdateMode::Auto | UpdateMode::Recreate => {
            target.replicas.filter(|replicas| *replicas <= 1).map(|_| 1)
        }
        UpdateMode::Off | UpdateMode::Initial => None,
    };
    PodUpdatePolicy {
        update_mode: Some(mode),
        min_replicas,
    }
}

fn apply_resource_policy(
    vpa: &mut VerticalPodAutoscaler,
    target: &TargetedWorkload,
    defaults: &Defaults,
) {
    let mut controlled_values = defaults.controlled_values;
    if let Some(values_override) = target
        .annotation(CONTROLLED_VALUES_ANNOTATION_KEY)
        .and_then(ContainerControlledValues::from_name)
    {
        controlled_values = values_override;
    }
    let controlled_resources = vec!["cpu".to_string(), "memory".to_string()];
    let min_allowed: BTreeMap<String, Quantity> = [
        ("cpu".to_string(), defaults.min_allowed_cpu.clone()),
        ("memory".to_string(), defaults.min_allowed_memory.clone()),
    ]
    .into_iter()
    .collect();

    let empty = vpa
        .spec
        .resource_policy
        .as_ref()
        .map_or(true, |policy| policy.container_policies.is_empty());
    if empty {
        vpa.spec.resource_policy = Some(PodResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: WILDCARD_CONTAINER.to_string(),
                controlled_resources: Some(controlled_resources),
                controlled_values: Some(controlled_values),
                min_allowed: Some(min_allowed),
                ..ContainerResourcePolicy::default()
            }],
        });
        return;
    }
    if let Some(policy) = vpa.spec.resource_policy.as_mut() {
        // keep per-container names and the max allowed set by the capacity
        // engine, overwrite the fields the butler owns
        for container_policy in &mut policy.container_policies {
            container_policy.controlled_resources = Some(controlled_resources.clone());
            container_policy.controlled_values = Some(controlled_values);
            container_policy.min_allowed = Some(min_allowed.clone());
        }
    }
}

fn set_owner_reference(vpa: &mut VerticalPodAutoscaler, target: &TargetedWorkload) -> Result<()> {
    let owner = target.owner_reference()?;
    let references = vpa.metadata.owner_references.get_or_insert_with(Vec::new);
    match references
        .iter_mut()
        .find(|existing| existing.uid == owner.uid || (existing.kind == owner.kind && existing.name == owner.name))
    {
        Some(existing) => *existing = owner,
        None => references.push(owner),
    }
    Ok(())
}
