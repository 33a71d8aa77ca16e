//! Guided storage: the install targets offered for the probed disks and
//! the layouts built when one of them is chosen.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::boot;
use crate::capability::{
    evaluate_capabilities, validate_pin_pass, DisallowedCapability, DisallowedReason,
    GuidedCapability, PlatformInfo, TargetKind,
};
use crate::config::PlannerConfig;
use crate::error::{Result, StorageError};
use crate::gadget::{GadgetVolume, StructureRole, VolumeSchema};
use crate::gaps::{self, Gap};
use crate::manipulator::{self, PartitionSpec};
use crate::model::{
    Bootloader, EntityId, Partition, PartitionFlag, PartitionTable, RecoveryKey, Secret,
    StorageModel, Wipe, ZfsEncryption,
};
use crate::sizes::{
    bootfs_size, calculate_guided_resize, install_minimum, lvm_size_for_vg, SizingPolicy,
};
use crate::units::{align_down, align_up};

/// Filesystems the installer knows how to shrink.
const RESIZABLE_FSTYPES: &[&str] = &["ext2", "ext3", "ext4", "ntfs", "btrfs"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    Reformat {
        disk: EntityId,
    },
    UseGap {
        disk: EntityId,
        offset: u64,
        size: u64,
    },
    Resize {
        disk: EntityId,
        partition: EntityId,
        new_size: u64,
        minimum: u64,
        recommended: u64,
        maximum: u64,
    },
    EraseInstall {
        disk: EntityId,
        partition: EntityId,
    },
    Manual,
}

impl Target {
    pub fn disk(&self) -> Option<EntityId> {
        match self {
            Target::Reformat { disk }
            | Target::UseGap { disk, .. }
            | Target::Resize { disk, .. }
            | Target::EraseInstall { disk, .. } => Some(*disk),
            Target::Manual => None,
        }
    }

    /// Same disk and same space, ignoring the size a resize asks for.
    fn same_place(&self, other: &Target) -> bool {
        match (self, other) {
            (
                Target::Resize {
                    disk, partition, ..
                },
                Target::Resize {
                    disk: other_disk,
                    partition: other_partition,
                    ..
                },
            ) => disk == other_disk && partition == other_partition,
            (
                Target::UseGap { disk, offset, .. },
                Target::UseGap {
                    disk: other_disk,
                    offset: other_offset,
                    ..
                },
            ) => disk == other_disk && offset == other_offset,
            _ => self == other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidedStorageTarget {
    #[serde(flatten)]
    pub target: Target,
    #[serde(default)]
    pub allowed: Vec<GuidedCapability>,
    #[serde(default)]
    pub disallowed: Vec<DisallowedCapability>,
}

impl GuidedStorageTarget {
    pub fn manual() -> Self {
        Self {
            target: Target::Manual,
            allowed: vec![GuidedCapability::Manual],
            disallowed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuidedChoice {
    pub target: Target,
    pub capability: GuidedCapability,
    #[serde(default)]
    pub password: Option<Secret>,
    #[serde(default)]
    pub pin: Option<Secret>,
    #[serde(default)]
    pub recovery_key: Option<RecoveryKey>,
    #[serde(default)]
    pub sizing_policy: Option<SizingPolicy>,
}

impl GuidedChoice {
    pub fn new(target: Target, capability: GuidedCapability) -> Self {
        Self {
            target,
            capability,
            password: None,
            pin: None,
            recovery_key: None,
            sizing_policy: None,
        }
    }
}

/// Every guided target for the model, largest install space first, with
/// `Manual` last whenever there is at least one disk.
pub fn targets(
    model: &StorageModel,
    platform: &PlatformInfo,
    config: &PlannerConfig,
) -> Vec<GuidedStorageTarget> {
    let disks = model.all_disks();
    let mut scored = disks
        .iter()
        .flat_map(|disk| scored_targets_for_disk(model, disk.id, platform, config))
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    let mut out = scored.into_iter().map(|(_, target)| target).collect::<Vec<_>>();
    if !disks.is_empty() {
        out.push(GuidedStorageTarget::manual());
    }
    out
}

pub fn targets_for_disk(
    model: &StorageModel,
    disk: EntityId,
    platform: &PlatformInfo,
    config: &PlannerConfig,
) -> Vec<GuidedStorageTarget> {
    scored_targets_for_disk(model, disk, platform, config)
        .into_iter()
        .map(|(_, target)| target)
        .collect()
}

fn scored_targets_for_disk(
    model: &StorageModel,
    disk: EntityId,
    platform: &PlatformInfo,
    config: &PlannerConfig,
) -> Vec<(u64, GuidedStorageTarget)> {
    let Ok(entry) = model.disk(disk) else {
        return Vec::new();
    };
    let make = |target: Target, space: u64, kind: TargetKind| {
        let (allowed, disallowed) = evaluate_capabilities(space, kind, platform, config);
        (
            space,
            GuidedStorageTarget {
                target,
                allowed,
                disallowed,
            },
        )
    };
    let install_min = install_minimum(platform.bootloader, config.minimum_root_size);
    let part_align = model.alignment_of(disk).part_align;
    let mut out = Vec::new();

    if boot::can_be_boot_device(model, disk, None, true) {
        let in_use: u64 = model
            .partitions_of(disk)
            .iter()
            .filter(|part| part.is_in_use)
            .map(|part| part.size)
            .sum();
        let space = entry.size.saturating_sub(in_use);
        out.push(make(Target::Reformat { disk }, space, TargetKind::Reformat));
    }

    let parts = model.partitions_of(disk);
    if parts.is_empty() {
        return out;
    }

    if let Some(gap) = gaps::largest_gap(model, disk) {
        if gap.size >= install_min && boot::can_be_boot_device(model, disk, None, false) {
            let mut offered = make(
                Target::UseGap {
                    disk,
                    offset: gap.offset,
                    size: gap.size,
                },
                gap.size,
                TargetKind::UseGap,
            );
            if restrict_to_free_slots(model, &mut offered.1) {
                out.push(offered);
            }
        }
    }

    for part in &parts {
        if part.is_in_use || part.is_extended() || boot::is_bootloader_partition(model, part) {
            continue;
        }
        let Some(estimated_min) = part.estimated_min_size else {
            continue;
        };
        if !is_resizable(model, part) {
            continue;
        }
        let Some(values) = calculate_guided_resize(estimated_min, part.size, install_min, part_align)
        else {
            continue;
        };
        if !boot::can_be_boot_device(model, disk, Some(part.id), false) {
            continue;
        }
        let mut offered = make(
            Target::Resize {
                disk,
                partition: part.id,
                new_size: values.recommended,
                minimum: values.minimum,
                recommended: values.recommended,
                maximum: values.maximum,
            },
            values.install_max,
            TargetKind::Resize,
        );
        if restrict_to_free_slots(model, &mut offered.1) {
            out.push(offered);
        }
    }

    for part in parts.iter().filter(|part| part.os.is_some()) {
        if part.is_in_use || boot::is_bootloader_partition(model, part) {
            continue;
        }
        let mut scratch = model.clone();
        if manipulator::delete_partition(&mut scratch, part.id, true).is_err()
            || !boot::can_be_boot_device(&scratch, disk, None, false)
        {
            continue;
        }
        let mut offered = make(
            Target::EraseInstall {
                disk,
                partition: part.id,
            },
            part.size,
            TargetKind::EraseInstall,
        );
        if restrict_to_free_slots(model, &mut offered.1) {
            out.push(offered);
        }
    }
    out
}

/// Partitions a layout adds in the install gap; `None` for layouts that
/// take over the whole disk.
fn layout_partitions(capability: GuidedCapability) -> Option<usize> {
    match capability {
        GuidedCapability::Direct => Some(1),
        GuidedCapability::Lvm
        | GuidedCapability::LvmLuks
        | GuidedCapability::Zfs
        | GuidedCapability::ZfsLuksKeystore => Some(2),
        _ => None,
    }
}

/// Free the target's space on a scratch copy and move every capability
/// whose partitions could not all be numbered into `disallowed`. Returns
/// false when the freed space is not a usable gap at all.
fn restrict_to_free_slots(model: &StorageModel, offered: &mut GuidedStorageTarget) -> bool {
    let Some(disk) = offered.target.disk() else {
        return false;
    };
    let mut scratch = model.clone();
    let Ok(gap) = start_target(&mut scratch, &offered.target) else {
        return false;
    };
    let boot_partitions =
        if scratch.bootloader != Bootloader::None && !boot::is_boot_device(&scratch, disk) {
            match boot::boot_device_plan(&scratch, disk, None) {
                Some(plan) => plan.new_partitions(),
                None => return false,
            }
        } else {
            0
        };
    let primaries = gaps::free_partition_slots(&scratch, disk, false);
    // boot partitions are always primaries
    let available = match primaries.checked_sub(boot_partitions) {
        None => 0,
        Some(_) if gap.in_extended => gaps::free_partition_slots(&scratch, disk, true),
        Some(left) => left,
    };

    let mut allowed = Vec::new();
    for capability in std::mem::take(&mut offered.allowed) {
        match layout_partitions(capability) {
            Some(needed) if needed > available => {
                debug!(
                    "{capability:?} needs {needed} partitions on {}, {available} left",
                    model.label(disk)
                );
                offered.disallowed.push(DisallowedCapability {
                    capability,
                    reason: DisallowedReason::TooManyPartitions,
                    message: Some(format!(
                        "needs {needed} new partitions but only {available} can be added"
                    )),
                });
            }
            _ => allowed.push(capability),
        }
    }
    offered.allowed = allowed;
    true
}

fn is_resizable(model: &StorageModel, part: &Partition) -> bool {
    let fstype = model
        .filesystem_of(part.id)
        .map(|fs| fs.fstype.as_str())
        .or(part.original_fstype.as_deref());
    fstype.is_some_and(|fstype| RESIZABLE_FSTYPES.contains(&fstype))
}

/// Disks that could be made bootable but are not yet.
pub fn potential_boot_disks(model: &StorageModel, with_reformatting: bool) -> Vec<EntityId> {
    model
        .all_disks()
        .iter()
        .map(|disk| disk.id)
        .filter(|id| {
            !boot::is_boot_device(model, *id)
                && boot::can_be_boot_device(model, *id, None, with_reformatting)
        })
        .collect()
}

/// Lay out the chosen target. The target must be one `targets` currently
/// offers with the chosen capability allowed.
pub fn apply(
    model: &mut StorageModel,
    choice: &GuidedChoice,
    platform: &PlatformInfo,
    config: &PlannerConfig,
) -> Result<()> {
    let capability = choice.capability;
    validate_pin_pass(capability, choice.password.as_ref(), choice.pin.as_ref())?;
    if choice.target == Target::Manual {
        if capability != GuidedCapability::Manual {
            return Err(StorageError::invalid("the manual target only takes MANUAL"));
        }
        return Ok(());
    }

    let offered = targets(model, platform, config)
        .into_iter()
        .find(|offered| offered.target.same_place(&choice.target))
        .ok_or_else(|| StorageError::invalid("the chosen target is not on offer"))?;
    if !offered.allowed.contains(&capability) {
        let reason = offered
            .disallowed
            .iter()
            .find(|d| d.capability == capability)
            .map(|d| format!(": {:?}", d.reason))
            .unwrap_or_default();
        return Err(StorageError::invalid(format!(
            "{capability:?} is not allowed for this target{reason}"
        )));
    }
    let target = match (&offered.target, &choice.target) {
        (
            Target::Resize {
                disk,
                partition,
                minimum,
                recommended,
                maximum,
                ..
            },
            Target::Resize { new_size, .. },
        ) => Target::Resize {
            disk: *disk,
            partition: *partition,
            new_size: *new_size,
            minimum: *minimum,
            recommended: *recommended,
            maximum: *maximum,
        },
        (offered, _) => offered.clone(),
    };
    let disk = target
        .disk()
        .ok_or_else(|| StorageError::invalid("target has no disk"))?;
    info!("applying guided {capability:?} to {}", model.label(disk));

    if capability.is_core_boot() {
        let volume = platform
            .core_boot
            .as_ref()
            .and_then(|support| support.volume.clone())
            .unwrap_or_else(GadgetVolume::pc);
        guided_core_boot(
            model,
            disk,
            &volume,
            capability == GuidedCapability::CoreBootEncrypted,
        )?;
        return model.check_invariants();
    }
    if capability == GuidedCapability::Dd {
        let image_size = config.dd_image_size.unwrap_or(0);
        return guided_dd(model, disk, image_size);
    }

    let mut gap = start_target(model, &target)?;
    if model.bootloader != Bootloader::None && !boot::is_boot_device(model, disk) {
        boot::add_boot_disk(model, disk, config.supports_resilient_boot)?;
        gap = gap.within(model).ok_or_else(|| {
            StorageError::invalid("no space left for the install after adding a boot partition")
        })?;
    }

    match capability {
        GuidedCapability::Direct => guided_direct(model, gap)?,
        GuidedCapability::Lvm | GuidedCapability::LvmLuks => guided_lvm(
            model,
            gap,
            choice.password.clone(),
            choice.recovery_key.clone(),
            choice.sizing_policy.unwrap_or(config.sizing_policy),
        )?,
        GuidedCapability::Zfs | GuidedCapability::ZfsLuksKeystore => {
            guided_zfs(model, gap, choice.password.clone())?
        }
        other => {
            return Err(StorageError::invalid(format!(
                "{other:?} cannot be applied to a disk"
            )))
        }
    }
    model.check_invariants()
}

/// Free up the target's space and return the gap the install goes into.
fn start_target(model: &mut StorageModel, target: &Target) -> Result<Gap> {
    match target {
        Target::Reformat { disk } => {
            manipulator::reformat_keeping_in_use(model, *disk)?;
            gaps::largest_gap(model, *disk)
                .ok_or_else(|| StorageError::invalid("reformatted disk has no usable space"))
        }
        Target::UseGap { disk, offset, .. } => gaps::gap_at_offset(model, *disk, *offset)
            .ok_or_else(|| StorageError::invalid(format!("no gap at offset {offset}"))),
        Target::Resize {
            partition,
            new_size,
            minimum,
            maximum,
            ..
        } => {
            if new_size < minimum || new_size > maximum {
                return Err(StorageError::invalid(format!(
                    "new size {new_size} outside of [{minimum}, {maximum}]"
                )));
            }
            manipulator::resize_partition(model, *partition, *new_size)?;
            let part = model.partition(*partition)?.clone();
            gaps::gap_after(model, &part)
                .ok_or_else(|| StorageError::invalid("resize left no space after the partition"))
        }
        Target::EraseInstall { disk, partition } => {
            let part = model.partition(*partition)?.clone();
            manipulator::delete_partition(model, part.id, true)?;
            gaps::usable_gaps(model, *disk)
                .into_iter()
                .find(|gap| gap.offset < part.end() && part.offset < gap.end())
                .ok_or_else(|| StorageError::invalid("erased partition left no usable space"))
        }
        Target::Manual => Err(StorageError::invalid("manual target has no space")),
    }
}

pub fn guided_direct(model: &mut StorageModel, gap: Gap) -> Result<()> {
    manipulator::create_partition(
        model,
        gap.device,
        gap,
        &PartitionSpec::new(0, Some("ext4"), Some("/")),
    )?;
    Ok(())
}

fn unique_vg_name(model: &StorageModel, base: &str) -> String {
    let taken = model
        .all_volume_groups()
        .iter()
        .map(|vg| vg.name.clone())
        .collect::<BTreeSet<_>>();
    if !taken.contains(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}-{n}"))
        .find(|name| !taken.contains(name))
        .unwrap_or_else(|| base.to_string())
}

/// `/boot` partition, then one physical volume (optionally encrypted)
/// holding a volume group with a root logical volume.
pub fn guided_lvm(
    model: &mut StorageModel,
    gap: Gap,
    key: Option<Secret>,
    recovery_key: Option<RecoveryKey>,
    policy: SizingPolicy,
) -> Result<()> {
    let device = gap.device;
    let boot_size = bootfs_size(gap.size);
    let (boot_gap, rest) = gap.split(model, boot_size);
    let rest = rest.ok_or(StorageError::Capacity {
        requested: boot_size,
        available: gap.size,
    })?;
    manipulator::create_partition(
        model,
        device,
        boot_gap,
        &PartitionSpec::new(boot_size, Some("ext4"), Some("/boot")),
    )?;
    let pv = manipulator::create_partition(model, device, rest, &PartitionSpec::default())?;
    let name = unique_vg_name(model, "ubuntu-vg");
    let vg = manipulator::create_volume_group(model, &name, BTreeSet::from([pv]), key, recovery_key)?;
    let size = lvm_size_for_vg(model.size_of(vg), policy);
    debug!("root logical volume of {name}: {size} bytes");
    manipulator::create_logical_volume(
        model,
        vg,
        "ubuntu-lv",
        &PartitionSpec::new(size, Some("ext4"), Some("/")),
    )?;
    Ok(())
}

fn dataset_properties(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// A boot pool and a root pool, each on its own partition.
pub fn guided_zfs(model: &mut StorageModel, gap: Gap, key: Option<Secret>) -> Result<()> {
    let device = gap.device;
    let boot_size = bootfs_size(gap.size);
    let (boot_gap, rest) = gap.split(model, boot_size);
    let rest = rest.ok_or(StorageError::Capacity {
        requested: boot_size,
        available: gap.size,
    })?;
    let boot_part = manipulator::create_partition(
        model,
        device,
        boot_gap,
        &PartitionSpec::new(boot_size, None, None),
    )?;
    let root_part = manipulator::create_partition(model, device, rest, &PartitionSpec::default())?;
    let bpool = manipulator::create_zpool(model, boot_part, "bpool", "/boot", true, "off", None)?;
    let rpool = manipulator::create_zpool(
        model,
        root_part,
        "rpool",
        "/",
        false,
        "off",
        key.map(|key| (ZfsEncryption::LuksKeystore, key)),
    )?;
    model.add_zfs(
        rpool,
        "ROOT",
        dataset_properties(&[("canmount", "off"), ("mountpoint", "none")]),
    )?;
    model.add_zfs(rpool, "ROOT/ubuntu", dataset_properties(&[("mountpoint", "/")]))?;
    model.add_zfs(
        bpool,
        "BOOT",
        dataset_properties(&[("canmount", "off"), ("mountpoint", "none")]),
    )?;
    model.add_zfs(bpool, "BOOT/ubuntu", dataset_properties(&[("mountpoint", "/boot")]))?;
    Ok(())
}

/// Replace the disk's contents with the gadget's partitions. With
/// encryption the save and data partitions sit behind TPM-sealed
/// encrypted devices.
pub fn guided_core_boot(
    model: &mut StorageModel,
    disk: EntityId,
    volume: &GadgetVolume,
    encrypted: bool,
) -> Result<()> {
    let ptable = match volume.schema {
        VolumeSchema::Gpt => PartitionTable::Gpt,
        VolumeSchema::Mbr => PartitionTable::Msdos,
    };
    manipulator::reformat(model, disk, Some(ptable), None)?;
    let alignment = ptable.alignment();
    let end = align_down(model.size_of(disk), alignment.part_align)
        .saturating_sub(alignment.end_reserve);
    let last_data = volume
        .structures
        .iter()
        .rposition(|s| s.role == Some(StructureRole::SystemData));

    let mut cursor = alignment.min_start_offset;
    for (index, structure) in volume.structures.iter().enumerate() {
        if structure.role == Some(StructureRole::Mbr) {
            continue;
        }
        let offset = align_up(structure.offset.unwrap_or(cursor), alignment.part_align);
        let size = if Some(index) == last_data {
            end.checked_sub(offset)
                .filter(|room| *room >= structure.size)
                .ok_or(StorageError::Capacity {
                    requested: offset + structure.size,
                    available: end,
                })?
        } else {
            align_up(structure.size, alignment.part_align)
        };
        let seed = structure.role == Some(StructureRole::SystemSeed);
        let part = model.add_partition(Partition {
            device: disk,
            offset,
            size,
            flag: seed.then_some(PartitionFlag::Boot),
            wipe: Some(Wipe::Superblock),
            grub_device: seed,
            partition_type: structure.partition_type.clone(),
            partition_name: Some(structure.name.clone()),
            ..Partition::default()
        })?;
        cursor = offset + size;

        let Some(fstype) = &structure.filesystem else {
            continue;
        };
        let sealed = encrypted
            && matches!(
                structure.role,
                Some(StructureRole::SystemData | StructureRole::SystemSave)
            );
        let volume_id = if sealed {
            model.add_dm_crypt(part, None, None, None, vec!["tpm".to_string()])?
        } else {
            part
        };
        let fs = model.add_filesystem(volume_id, fstype, false, structure.label.clone())?;
        let mount = match structure.role {
            Some(StructureRole::SystemSeed) => Some("/boot/efi"),
            Some(StructureRole::SystemBoot) => Some("/boot"),
            Some(StructureRole::SystemData) if Some(index) == last_data => Some("/"),
            _ => None,
        };
        if let Some(path) = mount {
            model.add_mount(fs, path)?;
        }
    }
    Ok(())
}

/// Write an image over the whole disk.
pub fn guided_dd(model: &mut StorageModel, disk: EntityId, image_size: u64) -> Result<()> {
    let available = model.size_of(disk);
    if image_size > available {
        return Err(StorageError::Capacity {
            requested: image_size,
            available,
        });
    }
    manipulator::reformat(model, disk, None, None)?;
    model.dd_target = Some(disk);
    Ok(())
}
