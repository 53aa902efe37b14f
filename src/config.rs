//! Process configuration.
//!
//! All flags are optional and validated once at startup; the resulting
//! [`Defaults`] record is read-only for the rest of the process lifetime.

use clap::Parser;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::api::{ContainerControlledValues, UpdateMode};
use crate::error::{Error, Result};
use crate::quantity;

const SUPPORTED_UPDATE_MODES: &str = "Off,Initial,Recreate,Auto";
const SUPPORTED_CONTROLLED_VALUES: &str = "RequestsOnly,RequestsAndLimits";

#[derive(Parser, Debug)]
#[command(
    name = "vpa-butler",
    about = "Serves VerticalPodAutoscalers for workloads without hand-crafted ones"
)]
pub struct Settings {
    /// The default update mode for the served VPA instances.
    #[arg(long = "default-vpa-update-mode", default_value = "Off")]
    pub default_vpa_update_mode: String,

    /// Controls which resource values should be autoscaled.
    #[arg(long = "default-vpa-supported-values", default_value = "RequestsOnly")]
    pub default_vpa_supported_values: String,

    /// The default min allowed memory per container that the VPA can set.
    #[arg(long = "default-min-allowed-memory", default_value = "48Mi")]
    pub default_min_allowed_memory: String,

    /// The default min allowed CPU per container that the VPA can set.
    #[arg(long = "default-min-allowed-cpu", default_value = "50m")]
    pub default_min_allowed_cpu: String,

    /// Percentage of the chosen node's allocatable capacity to distribute
    /// across containers as max allowed resources. 72 divides evenly by
    /// 1, 2, 3 and 4 containers within a pod.
    #[arg(long = "capacity-percent", default_value_t = 72)]
    pub capacity_percent: i64,
}

/// Validated process-wide defaults.
#[derive(Clone, Debug)]
pub struct Defaults {
    pub update_mode: UpdateMode,
    pub controlled_values: ContainerControlledValues,
    pub min_allowed_cpu: Quantity,
    pub min_allowed_memory: Quantity,
    pub capacity_percent: i64,
    pub version: String,
}

impl Settings {
    pub fn defaults(&self, version: &str) -> Result<Defaults> {
        // Helm requires the 'Off' value to be quoted to avoid it being
        // interpreted as a boolean.
        let mode = self.default_vpa_update_mode.trim_matches('"');
        let update_mode = UpdateMode::from_name(mode).ok_or_else(|| {
            Error::ConfigError(format!(
                "unsupported update mode {mode}. Must be one of: {SUPPORTED_UPDATE_MODES}"
            ))
        })?;

        let controlled_values = ContainerControlledValues::from_name(
            &self.default_vpa_supported_values,
        )
        .ok_or_else(|| {
            Error::ConfigError(format!(
                "supported values must be one of: {SUPPORTED_CONTROLLED_VALUES}"
            ))
        })?;

        quantity::validate(&self.default_min_allowed_cpu)?;
        quantity::validate(&self.default_min_allowed_memory)?;

        if !(1..=100).contains(&self.capacity_percent) {
            return Err(Error::ConfigError(format!(
                "capacity percent must be between 1 and 100, got {}",
                self.capacity_percent
            )));
        }

        Ok(Defaults {
            update_mode,
            controlled_values,
            min_allowed_cpu: Quantity(self.default_min_allowed_cpu.clone()),
            min_allowed_memory: Quantity(self.default_min_allowed_memory.clone()),
            capacity_percent: self.capacity_percent,
            version: version.to_string(),
        })
    }
}
