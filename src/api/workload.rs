//! Workload targets of served VPAs.
//!
//! The butler serves Deployments, StatefulSets and DaemonSets. The
//! [`TargetWorkload`] trait abstracts over the three `apps/v1` kinds;
//! [`TargetedWorkload`] is the flattened view (kind, metadata, pod spec,
//! selector, replicas) that the shaper, the node filters and the capacity
//! engine operate on.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;

use crate::api::vpa::CrossVersionObjectReference;
use crate::error::{Error, Result};

/// apiVersion shared by all supported workload kinds.
pub const APPS_V1: &str = "apps/v1";

/// Kubernetes object names top out at 63 characters for a served VPA.
const MAX_NAME_LENGTH: usize = 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
        }
    }

    pub fn lowercase(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::DaemonSet => "daemonset",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(WorkloadKind::Deployment),
            "StatefulSet" => Some(WorkloadKind::StatefulSet),
            "DaemonSet" => Some(WorkloadKind::DaemonSet),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workload kind the butler can serve a VPA for.
pub trait TargetWorkload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + std::fmt::Debug
    + Send
    + Sync
    + 'static
{
    const KIND: WorkloadKind;

    /// Desired replica count; DaemonSets have none.
    fn replicas(&self) -> Option<i32>;
    fn template(&self) -> Option<&PodTemplateSpec>;
    fn selector(&self) -> Option<&LabelSelector>;

    fn to_view(&self) -> Result<TargetedWorkload> {
        let template = self.template().ok_or_else(|| {
            Error::TargetError(format!(
                "{} {} has no pod template",
                Self::KIND,
                self.name_for_errors()
            ))
        })?;
        let pod_spec = template.spec.clone().ok_or_else(|| {
            Error::TargetError(format!(
                "{} {} has an empty pod spec",
                Self::KIND,
                self.name_for_errors()
            ))
        })?;
        Ok(TargetedWorkload {
            kind: Self::KIND,
            meta: self.meta().clone(),
            pod_spec,
            selector: self.selector().cloned().unwrap_or_default(),
            replicas: self.replicas(),
        })
    }

    fn name_for_errors(&self) -> String {
        let meta = self.meta();
        format!(
            "{}/{}",
            meta.namespace.as_deref().unwrap_or_default(),
            meta.name.as_deref().unwrap_or_default()
        )
    }
}

impl TargetWorkload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref().and_then(|spec| spec.replicas)
    }

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}

impl TargetWorkload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref().and_then(|spec| spec.replicas)
    }

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}

impl TargetWorkload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn replicas(&self) -> Option<i32> {
        None
    }

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}

/// Flattened view of a workload, detached from its concrete type.
#[derive(Clone, Debug)]
pub struct TargetedWorkload {
    pub kind: WorkloadKind,
    pub meta: ObjectMeta,
    pub pod_spec: PodSpec,
    pub selector: LabelSelector,
    pub replicas: Option<i32>,
}

impl TargetedWorkload {
    pub fn name(&self) -> &str {
        self.meta.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta.namespace.as_deref().unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    /// Name of the served VPA: `<workload>-<lowercase kind>`, trimmed on the
    /// workload side to stay within the object name limit.
    pub fn vpa_name(&self) -> String {
        let kind = self.kind.lowercase();
        let mut name = self.name().to_string();
        if name.len() + kind.len() + 1 > MAX_NAME_LENGTH {
            name.truncate(MAX_NAME_LENGTH - kind.len() - 1);
        }
        format!("{name}-{kind}")
    }

    /// Target reference pointing at this workload.
    pub fn cross_ref(&self) -> CrossVersionObjectReference {
        CrossVersionObjectReference {
            kind: self.kind.as_str().to_string(),
            name: self.name().to_string(),
            api_version: Some(APPS_V1.to_string()),
        }
    }

    /// This workload plus everything owning it, as target references. A
    /// hand-crafted VPA matching any of these suppresses the served VPA.
    pub fn cross_refs(&self) -> Vec<CrossVersionObjectReference> {
        let mut refs = vec![self.cross_ref()];
        for owner in self.meta.owner_references.iter().flatten() {
            refs.push(CrossVersionObjectReference {
                kind: owner.kind.clone(),
                name: owner.name.clone(),
                api_version: Some(owner.api_version.clone()),
            });
        }
        refs
    }

    /// Owner reference from the served VPA back to this workload.
    pub fn owner_reference(&self) -> Result<OwnerReference> {
        let uid = self.meta.uid.clone().ok_or_else(|| {
            Error::TargetError(format!(
                "{} {}/{} has no uid",
                self.kind,
                self.namespace(),
                self.name()
            ))
        })?;
        Ok(OwnerReference {
            api_version: APPS_V1.to_string(),
            kind: self.kind.as_str().to_string(),
            name: self.name().to_string(),
            uid,
            ..OwnerReference::default()
        })
    }
}
