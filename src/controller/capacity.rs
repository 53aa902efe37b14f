//! Capacity runnable
//!
//! Periodically derives the maximum allowed resources of every served VPA
//! from the pool of nodes its target could schedule on. All served VPAs are
//! evaluated against all nodes, so nodes and VPAs are fetched once per tick.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{error, info, warn};

use crate::api::{
    managed_by_butler, ContainerResourcePolicy, TargetedWorkload, VerticalPodAutoscaler,
    WorkloadKind,
};
use crate::controller::{extract_target, TargetState, MAIN_CONTAINER_ANNOTATION_KEY};
use crate::error::{Error, Result};
use crate::filter;
use crate::quantity;

/// Recomputes `maxAllowed` for all served VPAs on a jittered period.
pub struct CapacityRunnable {
    pub client: Client,
    pub period: Duration,
    pub jitter_factor: f64,
    pub capacity_percent: i64,
}

/// Max allowed resources for one container policy entry.
#[derive(Clone, Debug, PartialEq)]
struct NamedResources {
    container_name: String,
    resources: BTreeMap<String, Quantity>,
}

impl CapacityRunnable {
    pub async fn run(self) {
        info!(period = ?self.period, "starting capacity runnable");
        loop {
            let deadline = tokio::time::Instant::now() + self.jittered_period();
            self.tick().await;
            tokio::time::sleep_until(deadline).await;
        }
    }

    /// Uniform in `[period, period * (1 + jitter_factor))`.
    fn jittered_period(&self) -> Duration {
        self.period
            .mul_f64(1.0 + self.jitter_factor * rand::random::<f64>())
    }

    async fn tick(&self) {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let nodes = match nodes.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(err) => {
                error!(error = %err, "failed to list nodes to determine maximum allowed resources");
                return;
            }
        };
        let vpas: Api<VerticalPodAutoscaler> = Api::all(self.client.clone());
        let vpas = match vpas.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(err) => {
                error!(error = %err, "failed to list vpas to determine maximum allowed resources");
                return;
            }
        };
        let schedulable = filter::schedulable(nodes);
        for vpa in vpas.iter().filter(|vpa| managed_by_butler(vpa)) {
            if let Err(err) = self.reconcile_max_resources(vpa, &schedulable).await {
                error!(
                    namespace = %vpa.namespace().unwrap_or_default(),
                    name = %vpa.name_any(),
                    error = %err,
                    "failed to set maximum allowed resources for vpa"
                );
            }
        }
    }

    async fn reconcile_max_resources(
        &self,
        vpa: &VerticalPodAutoscaler,
        schedulable: &[Node],
    ) -> Result<()> {
        let namespace = vpa.namespace().unwrap_or_default();
        let name = vpa.name_any();
        let target_ref = vpa.spec.target_ref.as_ref().ok_or_else(|| {
            Error::TargetError(format!("vpa {namespace}/{name} has nil target ref"))
        })?;
        let target = match extract_target(&self.client, &namespace, target_ref).await? {
            TargetState::Found(target) => target,
            TargetState::Missing => {
                return Err(Error::TargetError(format!(
                    "failed to fetch target {namespace}/{} of kind {} for vpa",
                    target_ref.name, target_ref.kind
                )))
            }
            TargetState::UnknownKind => {
                return Err(Error::TargetError(format!(
                    "unknown target kind {} for vpa {namespace}/{name}",
                    target_ref.kind
                )))
            }
        };

        let viable = filter::evaluate(&target, schedulable.to_vec())?;
        let Some(node) = choose_node(target.kind, &viable) else {
            warn!(
                namespace = %namespace,
                name = %name,
                "no viable nodes for vpa target found"
            );
            return Ok(());
        };
        let named = distribute(&target, node, self.capacity_percent)?;
        self.patch_max_resources(vpa, named).await
    }

    async fn patch_max_resources(
        &self,
        vpa: &VerticalPodAutoscaler,
        named: Vec<NamedResources>,
    ) -> Result<()> {
        let namespace = vpa.namespace().unwrap_or_default();
        let name = vpa.name_any();
        let policies = vpa
            .spec
            .resource_policy
            .as_ref()
            .map(|policy| policy.container_policies.as_slice())
            .filter(|policies| !policies.is_empty())
            .ok_or_else(|| {
                Error::TargetError(format!("resource policy of vpa {namespace}/{name} is empty"))
            })?;
        let rebuilt = rebuild_policies(policies, named);
        if rebuilt == policies {
            return Ok(());
        }
        let api: Api<VerticalPodAutoscaler> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({
            "spec": { "resourcePolicy": { "containerPolicies": rebuilt } }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// One policy entry per produced name, carrying the shape fields of the
/// first existing policy and the computed max allowed.
fn rebuild_policies(
    policies: &[ContainerResourcePolicy],
    named: Vec<NamedResources>,
) -> Vec<ContainerResourcePolicy> {
    let first = &policies[0];
    named
        .into_iter()
        .map(|entry| ContainerResourcePolicy {
            container_name: entry.container_name,
            mode: first.mode,
            min_allowed: first.min_allowed.clone(),
            max_allowed: Some(entry.resources),
            controlled_resources: first.controlled_resources.clone(),
            controlled_values: first.controlled_values,
        })
        .collect()
}

/// DaemonSet pods need to fit onto all nodes they can be placed on, so the
/// smallest viable node bounds their recommendations. Other workloads get
/// the largest one.
fn choose_node(kind: WorkloadKind, nodes: &[Node]) -> Option<&Node> {
    match kind {
        WorkloadKind::DaemonSet => nodes.iter().min_by_key(|node| allocatable_memory(node)),
        _ => nodes.iter().max_by_key(|node| allocatable_memory(node)),
    }
}

fn allocatable_memory(node: &Node) -> i64 {
    node.status
        .as_ref()
        .and_then(|status| status.allocatable.as_ref())
        .and_then(|allocatable| allocatable.get("memory"))
        .and_then(|memory| quantity::value(memory).ok())
        .unwrap_or(0)
}

fn allocatable(node: &Node) -> Result<(&Quantity, &Quantity)> {
    let allocatable = node
        .status
        .as_ref()
        .and_then(|status| status.allocatable.as_ref())
        .ok_or_else(|| {
            Error::TargetError(format!("node {} reports no allocatable", node.name_any()))
        })?;
    let cpu = allocatable.get("cpu").ok_or_else(|| {
        Error::TargetError(format!("node {} reports no allocatable cpu", node.name_any()))
    })?;
    let memory = allocatable.get("memory").ok_or_else(|| {
        Error::TargetError(format!(
            "node {} reports no allocatable memory",
            node.name_any()
        ))
    })?;
    Ok((cpu, memory))
}

fn distribute(
    target: &TargetedWorkload,
    node: &Node,
    capacity_percent: i64,
) -> Result<Vec<NamedResources>> {
    match target.annotation(MAIN_CONTAINER_ANNOTATION_KEY) {
        Some(main) if target.pod_spec.containers.len() > 1 => {
            asymmetric_distribution(main, target, node, capacity_percent)
        }
        _ => uniform_distribution(target, node, capacity_percent),
    }
}

/// Spreads a fraction of the node's capacity evenly across all containers,
/// declared under the wildcard container name.
fn uniform_distribution(
    target: &TargetedWorkload,
    node: &Node,
    capacity_percent: i64,
) -> Result<Vec<NamedResources>> {
    let containers = target.pod_spec.containers.len() as i64;
    if containers == 0 {
        return Err(Error::TargetError(format!(
            "workload {}/{} has no containers",
            target.namespace(),
            target.name()
        )));
    }
    let (cpu, memory) = allocatable(node)?;
    let percent = capacity_percent / containers;
    Ok(vec![NamedResources {
        container_name: "*".to_string(),
        resources: scaled_resources(cpu, memory, percent, percent)?,
    }])
}

/// The main container gets three times the headroom of any sibling while the
/// whole pod still caps at `capacity_percent` of the node.
fn asymmetric_distribution(
    main_container: &str,
    target: &TargetedWorkload,
    node: &Node,
    capacity_percent: i64,
) -> Result<Vec<NamedResources>> {
    let containers = target.pod_spec.containers.len() as i64;
    let total_weight = 4 * (containers - 1);
    let main_weight = 3 * (containers - 1);
    let (cpu, memory) = allocatable(node)?;
    let main_percent = capacity_percent * main_weight / total_weight;
    let other_percent = capacity_percent / total_weight;
    Ok(vec![
        NamedResources {
            container_name: main_container.to_string(),
            resources: scaled_resources(cpu, memory, main_percent, main_percent)?,
        },
        NamedResources {
            container_name: "*".to_string(),
            resources: scaled_resources(cpu, memory, other_percent, other_percent)?,
        },
    ])
}

fn scaled_resources(
    cpu: &Quantity,
    memory: &Quantity,
    cpu_percent: i64,
    memory_percent: i64,
) -> Result<BTreeMap<String, Quantity>> {
    Ok([
        ("cpu".to_string(), quantity::scale_milli(cpu, cpu_percent)?),
        (
            "memory".to_string(),
            quantity::scale(memory, memory_percent)?,
        ),
    ]
    .into_iter()
    .collect())
}
