//! VerticalPodAutoscaler resource model
//!
//! The VPA CRD lives in API group `autoscaling.k8s.io/v1` and is not part of
//! `k8s-openapi`, so the types are declared here with the `kube` derive. The
//! CRD itself is owned and installed by the upstream autoscaler; this process
//! only reads and writes instances of it.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation key marking ownership of a VPA.
pub const ANNOTATION_MANAGED_BY: &str = "managedBy";
/// Annotation value identifying this operator as the owner.
pub const ANNOTATION_VPA_BUTLER: &str = "vpa_butler";
/// Annotation recording which operator version shaped the VPA last.
pub const ANNOTATION_BUTLER_VERSION: &str = "cloud.sap/vpa-butler-version";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "autoscaling.k8s.io",
    version = "v1",
    kind = "VerticalPodAutoscaler",
    namespaced,
    status = "VerticalPodAutoscalerStatus",
    shortname = "vpa"
)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscalerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<CrossVersionObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<PodUpdatePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<PodResourcePolicy>,
}

/// Reference from a VPA to the workload it advises.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CrossVersionObjectReference {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodUpdatePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_mode: Option<UpdateMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
}

/// How the recommender is allowed to act on its recommendations.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateMode {
    #[default]
    Off,
    Initial,
    Recreate,
    Auto,
}

impl UpdateMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Off" => Some(UpdateMode::Off),
            "Initial" => Some(UpdateMode::Initial),
            "Recreate" => Some(UpdateMode::Recreate),
            "Auto" => Some(UpdateMode::Auto),
            _ => None,
        }
    }
}

impl std::fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateMode::Off => write!(f, "Off"),
            UpdateMode::Initial => write!(f, "Initial"),
            UpdateMode::Recreate => write!(f, "Recreate"),
            UpdateMode::Auto => write!(f, "Auto"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodResourcePolicy {
    #[serde(default)]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    #[serde(default)]
    pub container_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ContainerScalingMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_allowed: Option<BTreeMap<String, Quantity>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allowed: Option<BTreeMap<String, Quantity>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_resources: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_values: Option<ContainerControlledValues>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ContainerScalingMode {
    Auto,
    Off,
}

/// Whether the autoscaler adjusts requests only or requests and limits.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ContainerControlledValues {
    #[default]
    RequestsOnly,
    RequestsAndLimits,
}

impl ContainerControlledValues {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "RequestsOnly" => Some(ContainerControlledValues::RequestsOnly),
            "RequestsAndLimits" => Some(ContainerControlledValues::RequestsAndLimits),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscalerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<RecommendedPodResources>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedPodResources {
    #[serde(default)]
    pub container_recommendations: Vec<RecommendedContainerResources>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedContainerResources {
    #[serde(default)]
    pub container_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BTreeMap<String, Quantity>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<BTreeMap<String, Quantity>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<BTreeMap<String, Quantity>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncapped_target: Option<BTreeMap<String, Quantity>>,
}

/// Whether the VPA carries the ownership marker of this operator.
pub fn managed_by_butler(vpa: &VerticalPodAutoscaler) -> bool {
    vpa.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_MANAGED_BY))
        .is_some_and(|value| value == ANNOTATION_VPA_BUTLER)
}

/// Whether a VPA name follows the `<workload>-<kind>` naming. Marked VPAs
/// without such a suffix predate the rename and get deleted on reconcile.
pub fn is_current_naming(name: &str) -> bool {
    const SUFFIXES: [&str; 3] = ["-daemonset", "-statefulset", "-deployment"];
    SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Target-ref equality. The upstream autoscaler ignores the group prefix of
/// `apiVersion`, so `apps/v1` and `v1` must compare equal when only one side
/// carries a prefix.
pub fn equal_target(a: &CrossVersionObjectReference, b: &CrossVersionObjectReference) -> bool {
    let a_version = a.api_version.as_deref().unwrap_or_default();
    let b_version = b.api_version.as_deref().unwrap_or_default();
    let a_split: Vec<&str> = a_version.split('/').collect();
    let b_split: Vec<&str> = b_version.split('/').collect();
    let api_equal = if a_split.len() == b_split.len() {
        a_version == b_version
    } else {
        a_split.last() == b_split.last()
    };
    a.name == b.name && a.kind == b.kind && api_equal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cross_ref(kind: &str, name: &str, api_version: &str) -> CrossVersionObjectReference {
        CrossVersionObjectReference {
            kind: kind.to_string(),
            name: name.to_string(),
            api_version: Some(api_version.to_string()),
        }
    }

    #[test]
    fn managed_by_requires_the_exact_marker() {
        let mut vpa = VerticalPodAutoscaler::new("test", VerticalPodAutoscalerSpec::default());
        assert!(!managed_by_butler(&vpa));

        vpa.metadata.annotations = Some(
            [(ANNOTATION_MANAGED_BY.to_string(), "someone-else".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(!managed_by_butler(&vpa));

        vpa.metadata.annotations = Some(
            [(
                ANNOTATION_MANAGED_BY.to_string(),
                ANNOTATION_VPA_BUTLER.to_string(),
            )]
            .into_iter()
            .collect(),
        );
        assert!(managed_by_butler(&vpa));
    }

    #[test]
    fn naming_schema_requires_kind_suffix() {
        assert!(is_current_naming("backend-deployment"));
        assert!(is_current_naming("db-statefulset"));
        assert!(is_current_naming("agent-daemonset"));
        assert!(!is_current_naming("backend"));
        assert!(!is_current_naming("backend-vpa"));
    }

    #[test]
    fn equal_target_ignores_group_prefix_when_one_side_lacks_it() {
        let a = cross_ref("Deployment", "backend", "apps/v1");
        let b = cross_ref("Deployment", "backend", "v1");
        assert!(equal_target(&a, &b));
        assert!(equal_target(&b, &a));
    }

    #[test]
    fn equal_target_compares_full_version_when_both_have_prefixes() {
        let a = cross_ref("Deployment", "backend", "apps/v1");
        let b = cross_ref("Deployment", "backend", "batch/v1");
        assert!(!equal_target(&a, &b));
        assert!(equal_target(&a, &a.clone()));
    }

    #[test]
    fn equal_target_requires_matching_name_and_kind() {
        let a = cross_ref("Deployment", "backend", "apps/v1");
        assert!(!equal_target(&a, &cross_ref("StatefulSet", "backend", "apps/v1")));
        assert!(!equal_target(&a, &cross_ref("Deployment", "frontend", "apps/v1")));
    }

    #[test]
    fn update_mode_names_round_trip() {
        for name in ["Off", "Initial", "Recreate", "Auto"] {
            let mode = UpdateMode::from_name(name).unwrap();
            assert_eq!(mode.to_string(), name);
        }
        assert!(UpdateMode::from_name("off").is_none());
    }
}
