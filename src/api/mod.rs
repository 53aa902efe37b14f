//! Typed models for the resources the butler reads and writes.

mod vpa;
mod workload;

pub use vpa::{
    equal_target, is_current_naming, managed_by_butler, ContainerControlledValues,
    ContainerResourcePolicy, ContainerScalingMode, CrossVersionObjectReference, PodResourcePolicy,
    PodUpdatePolicy, RecommendedContainerResources, RecommendedPodResources, UpdateMode,
    VerticalPodAutoscaler, VerticalPodAutoscalerSpec, VerticalPodAutoscalerStatus,
    ANNOTATION_BUTLER_VERSION, ANNOTATION_MANAGED_BY, ANNOTATION_VPA_BUTLER,
};
pub use workload::{TargetWorkload, TargetedWorkload, WorkloadKind, APPS_V1};
