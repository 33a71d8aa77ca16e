pub mod boot;
pub mod capability;
pub mod config;
pub mod error;
pub mod gadget;
pub mod gaps;
pub mod guided;
pub mod manipulator;
pub mod matcher;
pub mod model;
pub mod platform;
pub mod probe;
pub mod render;
pub mod sizes;
pub mod units;

pub use boot::{add_boot_disk, can_be_boot_device, is_boot_device, remove_boot_disk, BootPlan};
pub use capability::{
    evaluate_capabilities, validate_pin_pass, CoreBootSupport, DisallowedCapability,
    DisallowedReason, EncryptionSupport, GuidedCapability, PlatformInfo,
};
pub use config::PlannerConfig;
pub use error::{Result, StorageError};
pub use gadget::GadgetVolume;
pub use gaps::{largest_gap, Gap, GapUsable};
pub use guided::{
    apply as apply_guided, potential_boot_disks, targets as guided_targets, GuidedChoice,
    GuidedStorageTarget, Target,
};
pub use manipulator::{PartitionEdit, PartitionRequest, PartitionSpec, StorageObject};
pub use matcher::{disk_for_match, DiskMatch};
pub use model::{Bootloader, EntityId, EntityKind, PartitionTable, Secret, StorageModel};
pub use probe::{model_from_probe_data, ProbeData, ProbeKind};
pub use render::{model_from_actions, render, Action, StoragePlan};
pub use sizes::SizingPolicy;
