use serde::{Deserialize, Serialize};

use crate::capability::GuidedCapability;
use crate::sizes::SizingPolicy;
use crate::units::GIB;

/// Knobs the guided planner reads. Usually embedded in the service config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannerConfig {
    #[serde(default = "default_minimum_root_size")]
    pub minimum_root_size: u64,
    #[serde(default = "default_capabilities")]
    pub default_capabilities: Vec<GuidedCapability>,
    #[serde(default)]
    pub supports_resilient_boot: bool,
    #[serde(default)]
    pub sizing_policy: SizingPolicy,
    /// Size of the image a DD install writes; `None` disables DD targets.
    #[serde(default)]
    pub dd_image_size: Option<u64>,
}

fn default_minimum_root_size() -> u64 {
    8 * GIB
}

fn default_capabilities() -> Vec<GuidedCapability> {
    vec![
        GuidedCapability::Direct,
        GuidedCapability::Lvm,
        GuidedCapability::LvmLuks,
        GuidedCapability::Zfs,
        GuidedCapability::ZfsLuksKeystore,
    ]
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            minimum_root_size: default_minimum_root_size(),
            default_capabilities: default_capabilities(),
            supports_resilient_boot: false,
            sizing_policy: SizingPolicy::Scaled,
            dd_image_size: None,
        }
    }
}
