//! Which devices can boot the installed system, and the steps that make
//! one of them do so.
//!
//! Checking whether a device *can* become a boot device and actually
//! making it one share the same code: both build a [`BootPlan`], the
//! latter then applies it.

use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::gaps::{self, Gap, GapUsable, PartOrGap};
use crate::manipulator::{self, PartitionSpec};
use crate::model::{
    Bootloader, EntityId, EntityKind, Partition, PartitionFlag, PartitionTable, StorageModel,
    Wipe, ESP_MOUNT_POINTS,
};
use crate::sizes::{efi_size, BIOS_GRUB_SIZE, PREP_GRUB_SIZE};
use crate::units::align_up;

#[derive(Debug, Clone, PartialEq)]
pub enum BootPlan {
    CreatePartition { gap: Gap, spec: PartitionSpec },
    /// Shrink a partition in place, keeping its offset.
    Resize {
        partition: EntityId,
        shrink_by: u64,
    },
    /// Move partitions towards the end of the device.
    Slide {
        partitions: Vec<EntityId>,
        offset_delta: u64,
    },
    SetGrubDevice { device: EntityId },
    SetWipe { device: EntityId, wipe: Wipe },
    MountEsp { partition: EntityId },
    NoOp,
    Multi(Vec<BootPlan>),
}

impl BootPlan {
    /// Partitions the plan adds to the device.
    pub fn new_partitions(&self) -> usize {
        match self {
            BootPlan::CreatePartition { .. } => 1,
            BootPlan::Multi(plans) => plans.iter().map(BootPlan::new_partitions).sum(),
            _ => 0,
        }
    }

    pub fn apply(&self, model: &mut StorageModel) -> Result<()> {
        match self {
            BootPlan::CreatePartition { gap, spec } => {
                manipulator::create_partition(model, gap.device, *gap, spec)?;
            }
            BootPlan::Resize {
                partition,
                shrink_by,
            } => {
                let part = model.partition_mut(*partition)?;
                part.size = part.size.checked_sub(*shrink_by).ok_or(StorageError::Capacity {
                    requested: *shrink_by,
                    available: part.size,
                })?;
                if part.preserve {
                    part.resize = true;
                }
            }
            BootPlan::Slide {
                partitions,
                offset_delta,
            } => {
                for id in partitions {
                    model.partition_mut(*id)?.offset += offset_delta;
                }
            }
            BootPlan::SetGrubDevice { device } => match model.kind_of(*device) {
                Some(EntityKind::Disk) => model.disk_mut(*device)?.grub_device = true,
                Some(EntityKind::Partition) => model.partition_mut(*device)?.grub_device = true,
                _ => {
                    return Err(StorageError::invalid(format!(
                        "{} cannot be a grub device",
                        model.label(*device)
                    )))
                }
            },
            BootPlan::SetWipe { device, wipe } => model.set_wipe(*device, Some(*wipe)),
            BootPlan::MountEsp { partition } => mount_esp(model, *partition)?,
            BootPlan::NoOp => {}
            BootPlan::Multi(plans) => {
                for plan in plans {
                    plan.apply(model)?;
                }
            }
        }
        Ok(())
    }
}

/// Mount an ESP at the first free ESP mount point, formatting it if needed.
pub fn mount_esp(model: &mut StorageModel, partition: EntityId) -> Result<()> {
    let fs = match model.filesystem_of(partition) {
        Some(fs) => fs.id,
        None => model.add_filesystem(partition, "fat32", false, None)?,
    };
    let path = first_free_esp_mount(model)
        .ok_or_else(|| StorageError::invalid("every ESP mount point is taken"))?;
    model.add_mount(fs, path)?;
    Ok(())
}

fn first_free_esp_mount(model: &StorageModel) -> Option<&'static str> {
    ESP_MOUNT_POINTS
        .iter()
        .copied()
        .find(|path| model.mount_for_path(path).is_none())
}

fn new_partition_gap(device: EntityId, offset: u64, size: u64) -> Gap {
    Gap {
        device,
        offset,
        size,
        in_extended: false,
        usable: GapUsable::Yes,
    }
}

fn bios_plan(model: &StorageModel, device: EntityId) -> Option<BootPlan> {
    let set_grub = BootPlan::SetGrubDevice { device };
    if model.ptable_of(device) == Some(PartitionTable::Msdos) {
        return Some(set_grub);
    }
    let items = gaps::parts_and_gaps(model, device);
    if let Some(PartOrGap::Part(first)) = items.first() {
        if first.flag == Some(PartitionFlag::BiosGrub) {
            return Some(set_grub);
        }
    }
    let create = BootPlan::CreatePartition {
        gap: new_partition_gap(
            device,
            model.alignment_of(device).min_start_offset,
            BIOS_GRUB_SIZE,
        ),
        spec: PartitionSpec {
            size: BIOS_GRUB_SIZE,
            flag: Some(PartitionFlag::BiosGrub),
            ..PartitionSpec::default()
        },
    };

    let mut movable: Vec<&Partition> = Vec::new();
    for item in &items {
        match item {
            PartOrGap::Gap(gap) => {
                if gap.size < BIOS_GRUB_SIZE {
                    return None;
                }
                return Some(BootPlan::Multi(vec![
                    BootPlan::Slide {
                        partitions: movable.iter().map(|p| p.id).collect(),
                        offset_delta: BIOS_GRUB_SIZE,
                    },
                    create,
                    set_grub,
                ]));
            }
            PartOrGap::Part(part) if part.preserve => break,
            PartOrGap::Part(part) => movable.push(part),
        }
    }

    // no gap to slide into; steal the space from the largest movable partition
    let (largest_index, largest) = movable
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, &&Partition)>, (i, part)| match best {
            Some((_, current)) if current.size >= part.size => best,
            _ => Some((i, part)),
        })?;
    Some(BootPlan::Multi(vec![
        BootPlan::Resize {
            partition: largest.id,
            shrink_by: BIOS_GRUB_SIZE,
        },
        BootPlan::Slide {
            partitions: movable[..=largest_index].iter().map(|p| p.id).collect(),
            offset_delta: BIOS_GRUB_SIZE,
        },
        create,
        set_grub,
    ]))
}

/// Find room for a new boot partition: a free gap, space at the end of
/// `resize_partition`, or half of the largest partition we may move.
/// Boot partitions never go on logical partitions.
fn add_part_plan(
    model: &StorageModel,
    device: EntityId,
    spec: PartitionSpec,
    resize_partition: Option<EntityId>,
) -> Option<BootPlan> {
    let size = spec.size;
    if let Some(gap) = gaps::first_gap_with_size(model, device, size, false) {
        return Some(BootPlan::CreatePartition {
            gap: gap.split(model, size).0,
            spec,
        });
    }
    if let Some(part) = resize_partition
        .and_then(|id| model.partition(id).ok())
        .filter(|part| !part.is_logical())
    {
        // a floor above the partition size leaves nothing to give up
        let spare = part
            .size
            .checked_sub(part.estimated_min_size.unwrap_or(part.size))
            .unwrap_or(0);
        if size > spare {
            return None;
        }
        return Some(BootPlan::Multi(vec![
            BootPlan::Resize {
                partition: part.id,
                shrink_by: size,
            },
            BootPlan::CreatePartition {
                gap: new_partition_gap(device, part.end() - size, size),
                spec,
            },
        ]));
    }
    let largest = model
        .partitions_of(device)
        .into_iter()
        .filter(|p| !p.preserve && !p.is_extended() && !p.is_logical())
        .fold(None, |best: Option<&Partition>, part| match best {
            Some(current) if current.size >= part.size => Some(current),
            _ => Some(part),
        })?;
    if size > largest.size / 2 {
        return None;
    }
    Some(BootPlan::Multi(vec![
        BootPlan::Resize {
            partition: largest.id,
            shrink_by: size,
        },
        BootPlan::Slide {
            partitions: vec![largest.id],
            offset_delta: size,
        },
        BootPlan::CreatePartition {
            gap: new_partition_gap(device, largest.offset, size),
            spec,
        },
    ]))
}

fn uefi_plan(
    model: &StorageModel,
    device: EntityId,
    resize_partition: Option<EntityId>,
) -> Option<BootPlan> {
    if let Some(esp) = model
        .partitions_of(device)
        .into_iter()
        .find(|part| is_esp(model, part))
    {
        let mut plans = vec![BootPlan::SetGrubDevice { device: esp.id }];
        if model.mount_of_volume(esp.id).is_none() {
            plans.push(BootPlan::MountEsp { partition: esp.id });
        }
        return Some(BootPlan::Multi(plans));
    }
    let part_align = model.alignment_of(device).part_align;
    let spec = PartitionSpec {
        size: align_up(efi_size(model.size_of(device)), part_align),
        fstype: Some("fat32".to_string()),
        mount: first_free_esp_mount(model).map(str::to_string),
        flag: Some(PartitionFlag::Boot),
        grub_device: true,
        wipe: None,
    };
    add_part_plan(model, device, spec, resize_partition)
}

fn prep_plan(
    model: &StorageModel,
    device: EntityId,
    resize_partition: Option<EntityId>,
) -> Option<BootPlan> {
    if let Some(prep) = model
        .partitions_of(device)
        .into_iter()
        .find(|part| part.flag == Some(PartitionFlag::Prep))
    {
        return Some(BootPlan::Multi(vec![
            BootPlan::SetGrubDevice { device: prep.id },
            BootPlan::SetWipe {
                device: prep.id,
                wipe: Wipe::Zero,
            },
        ]));
    }
    let spec = PartitionSpec {
        size: PREP_GRUB_SIZE,
        flag: Some(PartitionFlag::Prep),
        grub_device: true,
        wipe: Some(Wipe::Zero),
        ..PartitionSpec::default()
    };
    add_part_plan(model, device, spec, resize_partition)
}

/// Steps that would make `device` bootable, or `None` if it cannot be.
pub fn boot_device_plan(
    model: &StorageModel,
    device: EntityId,
    resize_partition: Option<EntityId>,
) -> Option<BootPlan> {
    if model.kind_of(device) != Some(EntityKind::Disk) {
        return None;
    }
    match model.bootloader {
        // resizing alone cannot make room at the start of the disk
        Bootloader::Bios => bios_plan(model, device),
        Bootloader::Uefi => uefi_plan(model, device, resize_partition),
        Bootloader::Prep => prep_plan(model, device, resize_partition),
        Bootloader::None => Some(BootPlan::NoOp),
    }
}

/// Whether `device` can become a boot device, optionally after the
/// partitions the running system does not use are wiped.
pub fn can_be_boot_device(
    model: &StorageModel,
    device: EntityId,
    resize_partition: Option<EntityId>,
    with_reformatting: bool,
) -> bool {
    if model.kind_of(device) != Some(EntityKind::Disk) {
        return false;
    }
    if with_reformatting {
        let mut scratch = model.clone();
        if manipulator::reformat_keeping_in_use(&mut scratch, device).is_err() {
            return false;
        }
        return boot_device_plan(&scratch, device, resize_partition).is_some();
    }
    boot_device_plan(model, device, resize_partition).is_some()
}

pub fn is_boot_device(model: &StorageModel, device: EntityId) -> bool {
    let Ok(disk) = model.disk(device) else {
        return false;
    };
    match model.bootloader {
        Bootloader::None => false,
        Bootloader::Bios => disk.grub_device,
        Bootloader::Uefi | Bootloader::Prep => model
            .partitions_of(device)
            .iter()
            .any(|part| part.grub_device),
    }
}

pub fn is_esp(model: &StorageModel, part: &Partition) -> bool {
    if model.kind_of(part.device) != Some(EntityKind::Disk) {
        return false;
    }
    match model.ptable_of(part.device) {
        Some(PartitionTable::Msdos) => match part.partition_type.as_deref() {
            Some(code) => u8::from_str_radix(code.trim_start_matches("0x"), 16) == Ok(0xef),
            None => !part.preserve && part.flag == Some(PartitionFlag::Boot),
        },
        _ => part.flag == Some(PartitionFlag::Boot),
    }
}

pub fn is_bootloader_partition(model: &StorageModel, part: &Partition) -> bool {
    match model.bootloader {
        Bootloader::Bios => part.flag == Some(PartitionFlag::BiosGrub),
        Bootloader::Uefi => is_esp(model, part),
        Bootloader::Prep => part.flag == Some(PartitionFlag::Prep),
        Bootloader::None => false,
    }
}

pub fn all_boot_devices(model: &StorageModel) -> Vec<EntityId> {
    model
        .all_disks()
        .iter()
        .map(|disk| disk.id)
        .filter(|id| is_boot_device(model, *id))
        .collect()
}

/// Make `device` a boot device. Unless resilient boot is supported,
/// every other device loses its boot role first.
pub fn add_boot_disk(
    model: &mut StorageModel,
    device: EntityId,
    supports_resilient_boot: bool,
) -> Result<()> {
    if !supports_resilient_boot {
        for other in all_boot_devices(model) {
            remove_boot_disk(model, other)?;
        }
    }
    let plan = boot_device_plan(model, device, None).ok_or_else(|| {
        StorageError::invalid(format!("{} cannot be made bootable", model.label(device)))
    })?;
    info!("making {} a boot device", model.label(device));
    debug!("boot plan: {plan:?}");
    plan.apply(model)
}

/// Strip the boot role from `device`. Boot partitions we created are
/// deleted; preexisting ones are kept but released.
pub fn remove_boot_disk(model: &mut StorageModel, device: EntityId) -> Result<()> {
    let bootloader = model.bootloader;
    let disk_preserve = model.disk(device)?.preserve;
    if bootloader == Bootloader::Bios {
        model.disk_mut(device)?.grub_device = false;
    }
    let boot_parts = model
        .partitions_of(device)
        .into_iter()
        .filter(|part| is_bootloader_partition(model, part))
        .cloned()
        .collect::<Vec<_>>();
    let mut remount = false;

    if disk_preserve {
        if bootloader == Bootloader::Bios {
            return Ok(());
        }
        for part in &boot_parts {
            model.partition_mut(part.id)?.grub_device = false;
            match bootloader {
                Bootloader::Prep => model.set_wipe(part.id, None),
                Bootloader::Uefi => {
                    let Some(fs) = model.filesystem_of(part.id).cloned() else {
                        continue;
                    };
                    if let Some(mount) = model.mount_of(fs.id).map(|m| m.id) {
                        manipulator::delete_mount(model, mount)?;
                        remount = true;
                    }
                    if !fs.preserve {
                        if let Some(original) = &part.original_fstype {
                            manipulator::delete_filesystem(model, fs.id)?;
                            model.add_filesystem(part.id, original, true, None)?;
                        }
                    }
                }
                _ => {}
            }
        }
    } else {
        let full = gaps::largest_gap_size(model, device) == 0;
        for part in &boot_parts {
            if model.mount_of_volume(part.id).is_some() {
                remount = true;
            }
            manipulator::delete_partition(model, part.id, true)?;
            if full {
                reclaim_space(model, device, part);
            }
        }
    }

    if bootloader == Bootloader::Uefi && remount {
        let orphan = model
            .all_partitions()
            .into_iter()
            .find(|part| part.grub_device && model.mount_of_volume(part.id).is_none())
            .map(|part| part.id);
        if let Some(esp) = orphan {
            mount_esp(model, esp)?;
        }
    }
    Ok(())
}

/// Let the partition that followed a removed one take over its space.
fn reclaim_space(model: &mut StorageModel, device: EntityId, removed: &Partition) {
    let follower = model
        .partitions_of(device)
        .into_iter()
        .find(|part| part.offset >= removed.end() && !part.preserve && !part.is_logical())
        .filter(|part| part.offset == align_up(removed.end(), model.alignment_of(device).part_align))
        .map(|part| part.id);
    if let Some(id) = follower {
        if let Ok(part) = model.partition_mut(id) {
            part.size += part.offset - removed.offset;
            part.offset = removed.offset;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{add_boot_disk, all_boot_devices, boot_device_plan, can_be_boot_device, BootPlan};
    use crate::gaps::largest_gap;
    use crate::manipulator::{create_partition, PartitionSpec};
    use crate::model::{
        Bootloader, Disk, EntityId, Partition, PartitionFlag, PartitionTable, StorageModel,
    };
    use crate::units::{GIB, MIB};

    fn disk(model: &mut StorageModel, path: &str, size: u64, ptable: Option<PartitionTable>) -> EntityId {
        model.add_disk(Disk {
            path: Some(path.to_string()),
            size,
            ptable,
            ..Disk::default()
        })
    }

    fn boot_partitions(model: &StorageModel, disk: EntityId) -> Vec<Partition> {
        model
            .partitions_of(disk)
            .into_iter()
            .filter(|p| p.grub_device)
            .cloned()
            .collect()
    }

    #[test]
    fn uefi_esp_is_512_mib_on_large_disks() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let d = disk(&mut model, "/dev/sda", 100 * GIB, None);
        add_boot_disk(&mut model, d, false).expect("bootable");
        let parts = boot_partitions(&model, d);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].size, 512 * MIB);
        assert_eq!(parts[0].flag, Some(PartitionFlag::Boot));
        assert!(model.mount_for_path("/boot/efi").is_some());
    }

    #[test]
    fn uefi_esp_is_half_of_a_small_disk() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let d = disk(&mut model, "/dev/sda", 800 * MIB, None);
        add_boot_disk(&mut model, d, false).expect("bootable");
        assert_eq!(boot_partitions(&model, d)[0].size, 400 * MIB);
    }

    #[test]
    fn prep_partition_is_8_mib_and_zeroed() {
        let mut model = StorageModel::new(Bootloader::Prep);
        let d = disk(&mut model, "/dev/sda", 100 * GIB, None);
        add_boot_disk(&mut model, d, false).expect("bootable");
        let parts = boot_partitions(&model, d);
        assert_eq!(parts[0].size, 8 * MIB);
        assert_eq!(parts[0].wipe, Some(crate::model::Wipe::Zero));
        assert!(model.filesystem_of(parts[0].id).is_none());
    }

    #[test]
    fn bios_gpt_gets_bios_grub_partition() {
        let mut model = StorageModel::new(Bootloader::Bios);
        let d = disk(&mut model, "/dev/sda", 100 * GIB, Some(PartitionTable::Gpt));
        add_boot_disk(&mut model, d, false).expect("bootable");
        let parts = model.partitions_of(d);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].size, MIB);
        assert_eq!(parts[0].flag, Some(PartitionFlag::BiosGrub));
        assert!(model.disk(d).expect("disk").grub_device);
    }

    #[test]
    fn bios_msdos_only_flags_the_disk() {
        let mut model = StorageModel::new(Bootloader::Bios);
        let d = disk(&mut model, "/dev/sda", 100 * GIB, Some(PartitionTable::Msdos));
        assert_eq!(
            boot_device_plan(&model, d, None),
            Some(BootPlan::SetGrubDevice { device: d })
        );
        add_boot_disk(&mut model, d, false).expect("bootable");
        assert!(model.partitions_of(d).is_empty());
        assert!(model.disk(d).expect("disk").grub_device);
    }

    #[test]
    fn bios_full_disk_shrinks_largest_partition() {
        let mut model = StorageModel::new(Bootloader::Bios);
        let d = disk(&mut model, "/dev/sda", 10 * GIB, Some(PartitionTable::Gpt));
        let gap = largest_gap(&model, d).expect("gap");
        let part = create_partition(&mut model, d, gap, &PartitionSpec::new(0, Some("ext4"), Some("/")))
            .expect("fills disk");
        let before = model.partition(part).expect("exists").clone();
        add_boot_disk(&mut model, d, false).expect("bootable");
        let after = model.partition(part).expect("exists");
        assert_eq!(after.offset, before.offset + MIB);
        assert_eq!(after.size, before.size - MIB);
        assert_eq!(after.end(), before.end());
        model.check_invariants().expect("consistent");
    }

    #[test]
    fn moving_boot_role_strips_the_previous_disk() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let a = disk(&mut model, "/dev/sda", 100 * GIB, None);
        let b = disk(&mut model, "/dev/sdb", 100 * GIB, None);
        add_boot_disk(&mut model, a, false).expect("first");
        add_boot_disk(&mut model, b, false).expect("second");
        assert_eq!(all_boot_devices(&model), vec![b]);
        assert!(model.partitions_of(a).is_empty());
        assert!(model.mount_for_path("/boot/efi").is_some());
    }

    #[test]
    fn resilient_boot_mounts_second_esp_elsewhere() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let a = disk(&mut model, "/dev/sda", 100 * GIB, None);
        let b = disk(&mut model, "/dev/sdb", 100 * GIB, None);
        add_boot_disk(&mut model, a, true).expect("first");
        add_boot_disk(&mut model, b, true).expect("second");
        assert_eq!(all_boot_devices(&model).len(), 2);
        assert!(model.mount_for_path("/boot/efi2").is_some());
    }

    #[test]
    fn full_preserved_disk_cannot_boot_without_reformatting() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let d = disk(&mut model, "/dev/sda", 10 * GIB, Some(PartitionTable::Gpt));
        model
            .add_partition(Partition {
                device: d,
                offset: MIB,
                size: 10 * GIB - 2 * MIB,
                preserve: true,
                ..Partition::default()
            })
            .expect("partition");
        assert!(!can_be_boot_device(&model, d, None, false));
        assert!(can_be_boot_device(&model, d, None, true));
    }

    fn preserved_full_partition(model: &mut StorageModel, d: EntityId, estimated_min: u64) -> EntityId {
        model
            .add_partition(Partition {
                device: d,
                offset: MIB,
                size: 10 * GIB - 2 * MIB,
                preserve: true,
                estimated_min_size: Some(estimated_min),
                ..Partition::default()
            })
            .expect("partition")
    }

    #[test]
    fn shrinking_below_the_filesystem_floor_is_refused() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let d = disk(&mut model, "/dev/sda", 10 * GIB, Some(PartitionTable::Gpt));
        let p = preserved_full_partition(&mut model, d, 11 * GIB);
        assert!(!can_be_boot_device(&model, d, Some(p), false));
        assert_eq!(boot_device_plan(&model, d, Some(p)), None);
    }

    #[test]
    fn resized_partition_gives_up_its_tail_for_the_esp() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let d = disk(&mut model, "/dev/sda", 10 * GIB, Some(PartitionTable::Gpt));
        let p = preserved_full_partition(&mut model, d, 4 * GIB);
        match boot_device_plan(&model, d, Some(p)) {
            Some(BootPlan::Multi(steps)) => assert_eq!(
                steps[0],
                BootPlan::Resize {
                    partition: p,
                    shrink_by: 512 * MIB
                }
            ),
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn logical_resize_target_falls_back_to_largest_primary() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let d = disk(&mut model, "/dev/sda", 10 * GIB, Some(PartitionTable::Msdos));
        let primary = model
            .add_partition(Partition {
                device: d,
                offset: MIB,
                size: 4 * GIB,
                ..Partition::default()
            })
            .expect("primary");
        let extended_offset = 4 * GIB + MIB;
        let extended_size = 10 * GIB - extended_offset - MIB;
        model
            .add_partition(Partition {
                device: d,
                offset: extended_offset,
                size: extended_size,
                flag: Some(PartitionFlag::Extended),
                preserve: true,
                ..Partition::default()
            })
            .expect("extended");
        let logical = model
            .add_partition(Partition {
                device: d,
                offset: extended_offset + MIB,
                size: extended_size - MIB,
                flag: Some(PartitionFlag::Logical),
                preserve: true,
                estimated_min_size: Some(GIB),
                ..Partition::default()
            })
            .expect("logical");

        match boot_device_plan(&model, d, Some(logical)) {
            Some(BootPlan::Multi(steps)) => assert_eq!(
                steps[0],
                BootPlan::Resize {
                    partition: primary,
                    shrink_by: 512 * MIB
                }
            ),
            other => panic!("unexpected plan {other:?}"),
        }
        assert!(can_be_boot_device(&model, d, Some(logical), false));
    }
}
