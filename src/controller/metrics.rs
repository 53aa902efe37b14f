//! Prometheus metrics for the vpa-butler operator
//!
//! # Exported metrics
//! The `/metrics` endpoint exports the following metrics:
//! - `vpa_butler_vpa_container_max_allowed` (gauge): current max allowed per
//!   container, labeled by namespace/verticalpodautoscaler/container/resource/unit.
//! - `vpa_butler_vpa_container_recommendation_excess` (gauge): uncapped target
//!   recommendation minus max allowed per container; negative values mean
//!   headroom remains.

use std::sync::atomic::AtomicU64;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::api::VerticalPodAutoscaler;
use crate::quantity;

/// Labels for the per-container gauges
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VpaContainerLabels {
    pub namespace: String,
    pub verticalpodautoscaler: String,
    pub container: String,
    pub resource: String,
    pub unit: String,
}

/// Gauge tracking the max allowed resources per container
pub static CONTAINER_MAX_ALLOWED: Lazy<Family<VpaContainerLabels, Gauge<f64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the uncapped recommendation excess per container
pub static CONTAINER_RECOMMENDATION_EXCESS: Lazy<Family<VpaContainerLabels, Gauge<f64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "vpa_butler_vpa_container_max_allowed",
        "Maximum allowed recommendation per container",
        CONTAINER_MAX_ALLOWED.clone(),
    );
    registry.register(
        "vpa_butler_vpa_container_recommendation_excess",
        "Subtracts the maximum allowed recommendation from the uncapped target recommendation per container",
        CONTAINER_RECOMMENDATION_EXCESS.clone(),
    );

    registry
});

/// Emits the per-container gauges for a VPA. Best-effort: a VPA without a
/// resource policy or recommendation produces no samples.
pub fn record_container_metrics(vpa: &VerticalPodAutoscaler) {
    let Some(policy) = vpa.spec.resource_policy.as_ref() else {
        return;
    };
    let Some(recommendation) = vpa
        .status
        .as_ref()
        .and_then(|status| status.recommendation.as_ref())
    else {
        return;
    };
    for container in &recommendation.container_recommendations {
        let max_allowed = policy
            .container_policies
            .iter()
            .find(|p| p.container_name == container.container_name)
            .or_else(|| {
                policy
                    .container_policies
                    .iter()
                    .find(|p| p.container_name == "*")
            })
            .and_then(|p| p.max_allowed.as_ref());
        let Some(max_allowed) = max_allowed else {
            continue;
        };
        for (resource, unit) in [("cpu", "core"), ("memory", "byte")] {
            let Some(max) = max_allowed.get(resource).and_then(|q| approximate(resource, q))
            else {
                continue;
            };
            let labels = VpaContainerLabels {
                namespace: vpa.namespace().unwrap_or_default(),
                verticalpodautoscaler: vpa.name_any(),
                container: container.container_name.clone(),
                resource: resource.to_string(),
                unit: unit.to_string(),
            };
            CONTAINER_MAX_ALLOWED.get_or_create(&labels).set(max);
            let uncapped = container
                .uncapped_target
                .as_ref()
                .and_then(|target| target.get(resource))
                .and_then(|q| approximate(resource, q));
            if let Some(uncapped) = uncapped {
                CONTAINER_RECOMMENDATION_EXCESS
                    .get_or_create(&labels)
                    .set(uncapped - max);
            }
        }
    }
}

/// CPU in cores, everything else in base units.
fn approximate(resource: &str, q: &Quantity) -> Option<f64> {
    match resource {
        "cpu" => quantity::milli_value(q).ok().map(|milli| milli as f64 / 1000.0),
        _ => quantity::value(q).ok().map(|value| value as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::api::{
        ContainerResourcePolicy, PodResourcePolicy, RecommendedContainerResources,
        RecommendedPodResources, VerticalPodAutoscalerSpec, VerticalPodAutoscalerStatus,
    };

    fn resources(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
        [
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ]
        .into_iter()
        .collect()
    }

    fn vpa_with_recommendation() -> VerticalPodAutoscaler {
        let mut vpa =
            VerticalPodAutoscaler::new("backend-deployment", VerticalPodAutoscalerSpec::default());
        vpa.metadata.namespace = Some("default".to_string());
        vpa.spec.resource_policy = Some(PodResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: "*".to_string(),
                max_allowed: Some(resources("900m", "1800")),
                ..ContainerResourcePolicy::default()
            }],
        });
        vpa.status = Some(VerticalPodAutoscalerStatus {
            recommendation: Some(RecommendedPodResources {
                container_recommendations: vec![RecommendedContainerResources {
                    container_name: "app".to_string(),
                    uncapped_target: Some(resources("1200m", "2000")),
                    ..RecommendedContainerResources::default()
                }],
            }),
        });
        vpa
    }

    fn labels(container: &str, resource: &str, unit: &str) -> VpaContainerLabels {
        VpaContainerLabels {
            namespace: "default".to_string(),
            verticalpodautoscaler: "backend-deployment".to_string(),
            container: container.to_string(),
            resource: resource.to_string(),
            unit: unit.to_string(),
        }
    }

    #[test]
    fn records_max_allowed_and_excess_via_wildcard_policy() {
        record_container_metrics(&vpa_with_recommendation());

        let cpu = labels("app", "cpu", "core");
        assert_eq!(CONTAINER_MAX_ALLOWED.get_or_create(&cpu).get(), 0.9);
        let cpu_excess = CONTAINER_RECOMMENDATION_EXCESS.get_or_create(&cpu).get();
        assert!((cpu_excess - 0.3).abs() < 1e-9, "got {cpu_excess}");

        let memory = labels("app", "memory", "byte");
        assert_eq!(CONTAINER_MAX_ALLOWED.get_or_create(&memory).get(), 1800.0);
        assert_eq!(
            CONTAINER_RECOMMENDATION_EXCESS.get_or_create(&memory).get(),
            200.0
        );
    }

    #[test]
    fn named_policy_wins_over_wildcard() {
        let mut vpa = vpa_with_recommendation();
        vpa.metadata.name = Some("named-deployment".to_string());
        vpa.spec
            .resource_policy
            .as_mut()
            .unwrap()
            .container_policies
            .push(ContainerResourcePolicy {
                container_name: "app".to_string(),
                max_allowed: Some(resources("500m", "1000")),
                ..ContainerResourcePolicy::default()
            });
        record_container_metrics(&vpa);

        let cpu = VpaContainerLabels {
            verticalpodautoscaler: "named-deployment".to_string(),
            ..labels("app", "cpu", "core")
        };
        assert_eq!(CONTAINER_MAX_ALLOWED.get_or_create(&cpu).get(), 0.5);
    }

    #[test]
    fn missing_policy_or_recommendation_records_nothing() {
        let mut no_policy = vpa_with_recommendation();
        no_policy.metadata.name = Some("no-policy-deployment".to_string());
        no_policy.spec.resource_policy = None;
        record_container_metrics(&no_policy);
        let untouched = labels("app", "cpu", "core");
        // different vpa name, so a fresh gauge would be zero
        let labels = VpaContainerLabels {
            verticalpodautoscaler: "no-policy-deployment".to_string(),
            ..untouched
        };
        assert_eq!(CONTAINER_MAX_ALLOWED.get_or_create(&labels).get(), 0.0);
    }
}
