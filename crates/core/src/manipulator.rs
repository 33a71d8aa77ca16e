//! Higher-level edits built from the model's primitive mutators.
//!
//! Every function here is a pure mutation of a [`StorageModel`]; none of
//! them touch a real device.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::boot;
use crate::error::{Result, StorageError};
use crate::gaps::{self, Gap, GapUsable};
use crate::model::{
    EntityId, EntityKind, Partition, PartitionFlag, PartitionTable, RaidLevel, RecoveryKey,
    Secret, StorageModel, Wipe, ZfsEncryption,
};
use crate::units::{align_up, human_size};

/// The five kinds of object a user can delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageObject {
    Disk(EntityId),
    Partition(EntityId),
    Raid(EntityId),
    VolumeGroup(EntityId),
    LogicalVolume(EntityId),
}

impl StorageObject {
    pub fn classify(model: &StorageModel, id: EntityId) -> Result<Self> {
        match model.kind_of(id) {
            Some(EntityKind::Disk) => Ok(Self::Disk(id)),
            Some(EntityKind::Partition) => Ok(Self::Partition(id)),
            Some(EntityKind::Raid) => Ok(Self::Raid(id)),
            Some(EntityKind::VolumeGroup) => Ok(Self::VolumeGroup(id)),
            Some(EntityKind::LogicalVolume) => Ok(Self::LogicalVolume(id)),
            Some(kind) => Err(StorageError::invalid(format!("cannot delete a {kind} directly"))),
            None => Err(StorageError::invalid(format!("unknown object {id}"))),
        }
    }
}

/// What to put in a new partition or logical volume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionSpec {
    /// Requested size; 0 takes the whole gap.
    pub size: u64,
    pub fstype: Option<String>,
    pub mount: Option<String>,
    pub flag: Option<PartitionFlag>,
    pub grub_device: bool,
    pub wipe: Option<Wipe>,
}

impl PartitionSpec {
    pub fn new(size: u64, fstype: Option<&str>, mount: Option<&str>) -> Self {
        Self {
            size,
            fstype: fstype.map(str::to_string),
            mount: mount.map(str::to_string),
            ..Self::default()
        }
    }
}

/// Changes requested for an existing partition. `None` keeps a field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionEdit {
    pub size: Option<u64>,
    pub fstype: Option<String>,
    pub mount: Option<String>,
    pub wipe: Option<Wipe>,
    pub boot: Option<bool>,
}

pub fn delete(model: &mut StorageModel, object: StorageObject) -> Result<()> {
    match object {
        StorageObject::Disk(id) => reformat(model, id, None, None),
        StorageObject::Partition(id) => delete_partition(model, id, false),
        StorageObject::Raid(id) => delete_raid(model, id),
        StorageObject::VolumeGroup(id) => delete_volume_group(model, id),
        StorageObject::LogicalVolume(id) => delete_logical_volume(model, id),
    }
}

/// Delete anything stacked on `id`. Used by `clear` for filesystems and
/// constructed devices, which are not user-deletable on their own.
fn delete_stacked(model: &mut StorageModel, id: EntityId) -> Result<()> {
    match model.kind_of(id) {
        Some(EntityKind::Raid) => delete_raid(model, id),
        Some(EntityKind::VolumeGroup) => delete_volume_group(model, id),
        Some(EntityKind::DmCrypt) => delete_dm_crypt(model, id),
        Some(EntityKind::ZPool) => delete_zpool(model, id),
        Some(EntityKind::Filesystem) => delete_filesystem(model, id),
        Some(kind) => Err(StorageError::invariant(format!("{kind} {id} cannot sit on a volume"))),
        None => Ok(()),
    }
}

/// Drop the filesystem and constructed device on `id` and mark it for wiping.
pub fn clear(model: &mut StorageModel, id: EntityId, wipe: Option<Wipe>) -> Result<()> {
    if let Ok(disk) = model.disk_mut(id) {
        disk.preserve = false;
    }
    model.set_wipe(id, Some(wipe.unwrap_or(Wipe::Superblock)));
    if let Some(fs) = model.filesystem_of(id).map(|fs| fs.id) {
        delete_filesystem(model, fs)?;
    }
    if let Some(constructed) = model.constructed_device_of(id) {
        delete_stacked(model, constructed)?;
    }
    Ok(())
}

/// Create a partition in `gap` and put the requested filesystem and mount on it.
pub fn create_partition(
    model: &mut StorageModel,
    device: EntityId,
    gap: Gap,
    spec: &PartitionSpec,
) -> Result<EntityId> {
    match gap.usable {
        GapUsable::Yes => {}
        GapUsable::TooManyPrimaryPartitions => {
            return Err(StorageError::invalid(format!(
                "{} has no free primary partition slot",
                model.label(device)
            )))
        }
        GapUsable::Reserved => {
            return Err(StorageError::invalid("cannot allocate from reserved space"))
        }
    }
    if spec.size > gap.size {
        return Err(StorageError::Capacity {
            requested: spec.size,
            available: gap.size,
        });
    }
    let size = if spec.size == 0 {
        gap.size
    } else {
        gap.split(model, spec.size).0.size
    };
    let mut flag = spec.flag;
    if gap.in_extended {
        flag = Some(PartitionFlag::Logical);
    } else if flag.is_none() && spec.fstype.as_deref() == Some("swap") {
        flag = Some(PartitionFlag::Swap);
    }
    if model.partitions_of(device).is_empty() {
        if let Ok(disk) = model.disk_mut(device) {
            disk.preserve = false;
        }
    }
    let part = model.add_partition(Partition {
        device,
        offset: gap.offset,
        size,
        flag,
        wipe: Some(spec.wipe.unwrap_or(Wipe::Superblock)),
        grub_device: spec.grub_device,
        ..Partition::default()
    })?;
    info!(
        "created partition {} ({})",
        model.label(part),
        human_size(size)
    );
    if let Some(fstype) = &spec.fstype {
        let fs = create_filesystem(model, part, fstype)?;
        if fstype == "swap" {
            create_mount(model, fs, "")?;
        } else if let Some(path) = &spec.mount {
            create_mount(model, fs, path)?;
        }
    }
    Ok(part)
}

pub fn delete_partition(model: &mut StorageModel, id: EntityId, override_preserve: bool) -> Result<()> {
    let part = model.partition(id)?.clone();
    if part.is_in_use {
        return Err(StorageError::invalid(format!(
            "{} is in use by the running system",
            model.label(id)
        )));
    }
    if part.preserve && !override_preserve && boot::is_bootloader_partition(model, &part) {
        return Err(StorageError::invalid(format!(
            "{} is an existing boot partition",
            model.label(id)
        )));
    }
    if part.is_extended() {
        let logicals = model
            .partitions_of(part.device)
            .iter()
            .filter(|p| p.is_logical())
            .map(|p| p.id)
            .collect::<Vec<_>>();
        for logical in logicals {
            delete_partition(model, logical, override_preserve)?;
        }
    }
    clear(model, id, None)?;
    model.remove_partition(id)?;
    debug!("deleted partition {} of {}", part.number, model.label(part.device));
    Ok(())
}

pub fn create_filesystem(model: &mut StorageModel, volume: EntityId, fstype: &str) -> Result<EntityId> {
    if let Ok(part) = model.partition_mut(volume) {
        if fstype == "swap" {
            if part.flag.is_none() {
                part.flag = Some(PartitionFlag::Swap);
            }
        } else if part.flag == Some(PartitionFlag::Swap) {
            part.flag = None;
        }
    }
    model.add_filesystem(volume, fstype, false, None)
}

pub fn delete_filesystem(model: &mut StorageModel, id: EntityId) -> Result<()> {
    if let Some(mount) = model.mount_of(id).map(|m| m.id) {
        delete_mount(model, mount)?;
    }
    let volume = model.filesystem(id)?.volume;
    model.remove_filesystem(id)?;
    if let Ok(part) = model.partition_mut(volume) {
        if part.flag == Some(PartitionFlag::Swap) {
            part.flag = None;
        }
    }
    Ok(())
}

pub fn create_mount(model: &mut StorageModel, fs: EntityId, path: &str) -> Result<EntityId> {
    model.add_mount(fs, path)
}

pub fn delete_mount(model: &mut StorageModel, id: EntityId) -> Result<()> {
    model.remove_mount(id)
}

pub fn create_raid(
    model: &mut StorageModel,
    name: &str,
    level: RaidLevel,
    devices: BTreeSet<EntityId>,
    spare_devices: BTreeSet<EntityId>,
) -> Result<EntityId> {
    for member in devices.iter().chain(spare_devices.iter()) {
        clear(model, *member, None)?;
    }
    let raid = model.add_raid(name, level, devices, spare_devices)?;
    info!("created {level:?} array {name}");
    Ok(raid)
}

pub fn delete_raid(model: &mut StorageModel, id: EntityId) -> Result<()> {
    let raid = model.raid(id)?.clone();
    for part in model.partition_ids_of(id) {
        delete_partition(model, part, true)?;
    }
    clear(model, id, None)?;
    model.remove_raid(id)?;
    for member in raid.devices.iter().chain(raid.spare_devices.iter()) {
        model.set_wipe(*member, Some(Wipe::Superblock));
    }
    Ok(())
}

/// Create a volume group, encrypting each member first when a key is given.
pub fn create_volume_group(
    model: &mut StorageModel,
    name: &str,
    devices: BTreeSet<EntityId>,
    key: Option<Secret>,
    recovery_key: Option<RecoveryKey>,
) -> Result<EntityId> {
    let mut members = BTreeSet::new();
    for device in devices {
        clear(model, device, None)?;
        match &key {
            Some(key) => {
                members.insert(create_dm_crypt(
                    model,
                    device,
                    Some(key.clone()),
                    recovery_key.clone(),
                )?);
            }
            None => {
                members.insert(device);
            }
        }
    }
    model.add_volume_group(name, members)
}

pub fn delete_volume_group(model: &mut StorageModel, id: EntityId) -> Result<()> {
    let vg = model.volume_group(id)?.clone();
    let volumes = model
        .logical_volumes_of(id)
        .iter()
        .map(|lv| lv.id)
        .collect::<Vec<_>>();
    for lv in volumes {
        delete_logical_volume(model, lv)?;
    }
    model.remove_volume_group(id)?;
    for member in vg.devices {
        if model.kind_of(member) == Some(EntityKind::DmCrypt) {
            delete_dm_crypt(model, member)?;
        } else {
            model.set_wipe(member, Some(Wipe::Superblock));
        }
    }
    Ok(())
}

pub fn create_logical_volume(
    model: &mut StorageModel,
    vg: EntityId,
    name: &str,
    spec: &PartitionSpec,
) -> Result<EntityId> {
    let available = gaps::largest_gap_size(model, vg);
    let size = if spec.size == 0 { available } else { spec.size };
    let lv = model.add_logical_volume(vg, name, size)?;
    model.set_wipe(lv, Some(spec.wipe.unwrap_or(Wipe::Superblock)));
    if let Some(fstype) = &spec.fstype {
        let fs = create_filesystem(model, lv, fstype)?;
        if let Some(path) = &spec.mount {
            create_mount(model, fs, path)?;
        }
    }
    Ok(lv)
}

pub fn delete_logical_volume(model: &mut StorageModel, id: EntityId) -> Result<()> {
    clear(model, id, None)?;
    model.remove_logical_volume(id)
}

pub fn create_dm_crypt(
    model: &mut StorageModel,
    volume: EntityId,
    key: Option<Secret>,
    recovery_key: Option<RecoveryKey>,
) -> Result<EntityId> {
    model.add_dm_crypt(volume, key, None, recovery_key, Vec::new())
}

pub fn delete_dm_crypt(model: &mut StorageModel, id: EntityId) -> Result<()> {
    clear(model, id, None)?;
    model.remove_dm_crypt(id)
}

/// Swap on a volume encrypted with a throwaway key at every boot.
pub fn create_cryptoswap(model: &mut StorageModel, volume: EntityId) -> Result<EntityId> {
    let dm = model.add_dm_crypt(
        volume,
        None,
        Some("/dev/urandom".to_string()),
        None,
        vec!["swap".to_string(), "initramfs".to_string()],
    )?;
    let fs = model.add_filesystem(dm, "swap", false, None)?;
    model.add_mount(fs, "")?;
    Ok(dm)
}

const ZFS_BOOT_FEATURES: &[&str] = &[
    "async_destroy",
    "bookmarks",
    "embedded_data",
    "empty_bpobj",
    "enabled_txg",
    "extensible_dataset",
    "filesystem_limits",
    "hole_birth",
    "large_blocks",
    "lz4_compress",
    "spacemap_histogram",
];

/// Create a pool on `device`. A boot pool only gets the features GRUB can read.
pub fn create_zpool(
    model: &mut StorageModel,
    device: EntityId,
    pool: &str,
    mountpoint: &str,
    boot: bool,
    canmount: &str,
    encryption: Option<(ZfsEncryption, Secret)>,
) -> Result<EntityId> {
    clear(model, device, None)?;
    let fs_properties = BTreeMap::from([
        ("acltype".to_string(), "posixacl".to_string()),
        ("relatime".to_string(), "on".to_string()),
        ("canmount".to_string(), canmount.to_string()),
        ("compression".to_string(), "gzip".to_string()),
        ("devices".to_string(), "off".to_string()),
        ("xattr".to_string(), "sa".to_string()),
    ]);
    let mut pool_properties = BTreeMap::from([
        ("ashift".to_string(), "12".to_string()),
        ("autotrim".to_string(), "on".to_string()),
    ]);
    if boot {
        for feature in ZFS_BOOT_FEATURES {
            pool_properties.insert(format!("feature@{feature}"), "enabled".to_string());
        }
    }
    let (encryption_style, key) = match encryption {
        Some((style, key)) => (Some(style), Some(key)),
        None => (None, None),
    };
    model.add_zpool(
        BTreeSet::from([device]),
        pool,
        mountpoint,
        pool_properties,
        fs_properties,
        !boot,
        encryption_style,
        key,
    )
}

pub fn delete_zpool(model: &mut StorageModel, id: EntityId) -> Result<()> {
    let devices = model.zpool(id)?.devices.clone();
    model.remove_zpool(id)?;
    for device in devices {
        model.set_wipe(device, Some(Wipe::Superblock));
    }
    Ok(())
}

/// Wipe a disk's partition table and everything on it.
pub fn reformat(
    model: &mut StorageModel,
    disk: EntityId,
    ptable: Option<PartitionTable>,
    wipe: Option<Wipe>,
) -> Result<()> {
    if model.has_in_use_partition(disk) {
        return Err(StorageError::invalid(format!(
            "{} has partitions in use by the running system",
            model.label(disk)
        )));
    }
    for part in model.partition_ids_of(disk) {
        // logicals go with their extended partition
        if model.contains(part) {
            delete_partition(model, part, true)?;
        }
    }
    clear(model, disk, Some(wipe.unwrap_or(Wipe::SuperblockRecursive)))?;
    model.set_ptable(disk, ptable)?;
    if let Ok(d) = model.disk_mut(disk) {
        d.grub_device = false;
    }
    Ok(())
}

/// Delete every partition the running system is not using. Falls back
/// to a full reformat when nothing is in use.
pub fn reformat_keeping_in_use(model: &mut StorageModel, disk: EntityId) -> Result<()> {
    if !model.has_in_use_partition(disk) {
        return reformat(model, disk, None, None);
    }
    let removable = model
        .partitions_of(disk)
        .iter()
        .filter(|p| !p.is_in_use && !p.is_extended())
        .map(|p| p.id)
        .collect::<Vec<_>>();
    for part in removable {
        delete_partition(model, part, true)?;
    }
    Ok(())
}

/// Add a partition to a disk, making the disk bootable first when it is
/// the first partition and nothing boots yet.
pub fn add_partition_in_gap(
    model: &mut StorageModel,
    gap: Gap,
    spec: &PartitionSpec,
    supports_resilient_boot: bool,
) -> Result<EntityId> {
    let device = gap.device;
    let mut gap = gap;
    let mut spec = spec.clone();
    if model.partitions_of(device).is_empty() {
        if let Ok(disk) = model.disk_mut(device) {
            disk.preserve = false;
            disk.wipe = Some(Wipe::SuperblockRecursive);
        }
        if model.needs_bootloader_partition()
            && boot::can_be_boot_device(model, device, None, false)
        {
            boot::add_boot_disk(model, device, supports_resilient_boot)?;
            gap = gap
                .within(model)
                .ok_or_else(|| StorageError::invalid("no space left after adding a boot partition"))?;
            spec.size = spec.size.min(gap.size);
        }
    }
    create_partition(model, device, gap, &spec)
}

/// An add-or-edit request against one disk, as the partitioning screen
/// sends it.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionRequest {
    /// `offset` picks the gap; the largest gap otherwise.
    Add {
        offset: Option<u64>,
        spec: PartitionSpec,
    },
    Edit {
        partition: EntityId,
        edit: PartitionEdit,
    },
}

/// Dispatch a [`PartitionRequest`]. Returns the partition added or edited.
pub fn partition_disk(
    model: &mut StorageModel,
    disk: EntityId,
    request: &PartitionRequest,
    supports_resilient_boot: bool,
) -> Result<EntityId> {
    match request {
        PartitionRequest::Add { offset, spec } => {
            let gap = match offset {
                Some(offset) => gaps::gap_at_offset(model, disk, *offset),
                None => gaps::largest_gap(model, disk),
            }
            .ok_or_else(|| StorageError::NoMatch {
                what: "gap".to_string(),
                detail: format!("{} at {offset:?}", model.label(disk)),
            })?;
            add_partition_in_gap(model, gap, spec, supports_resilient_boot)
        }
        PartitionRequest::Edit { partition, edit } => {
            if model.partition(*partition)?.device != disk {
                return Err(StorageError::invalid(format!(
                    "{} is not on {}",
                    model.label(*partition),
                    model.label(disk)
                )));
            }
            edit_partition(model, *partition, edit)?;
            Ok(*partition)
        }
    }
}

/// Apply a user edit to an existing partition.
pub fn edit_partition(model: &mut StorageModel, id: EntityId, edit: &PartitionEdit) -> Result<()> {
    let part = model.partition(id)?.clone();
    if let Some(boot) = edit.boot {
        if boot != boot::is_bootloader_partition(model, &part) {
            return Err(StorageError::invalid("editing a partition cannot change its boot role"));
        }
    }
    if let Some(fstype) = &edit.fstype {
        if part.original_fstype.as_deref() != Some(fstype.as_str()) && edit.wipe.is_none() {
            return Err(StorageError::invalid(
                "changing partition format requires a wipe value",
            ));
        }
    }
    if let Some(size) = edit.size {
        resize_partition(model, id, size)?;
    }

    let current_fs = model.filesystem_of(id).map(|fs| (fs.id, fs.fstype.clone()));
    let current_mount = current_fs
        .as_ref()
        .and_then(|(fs, _)| model.mount_of(*fs).map(|m| m.path.clone()));

    let fstype_changed = match (&edit.fstype, &current_fs) {
        (Some(wanted), Some((_, have))) => wanted != have || edit.wipe.is_some(),
        (Some(_), None) => true,
        _ => false,
    };
    if fstype_changed {
        if let Some((fs, _)) = current_fs {
            delete_filesystem(model, fs)?;
        }
        if let Some(wipe) = edit.wipe {
            model.set_wipe(id, Some(wipe));
        }
        model.partition_mut(id)?.preserve = part.preserve && edit.wipe.is_none();
        if let Some(fstype) = &edit.fstype {
            create_filesystem(model, id, fstype)?;
        }
    }

    let mount = edit.mount.clone().or(if fstype_changed { current_mount.clone() } else { None });
    if let Some(path) = mount {
        let fs = model
            .filesystem_of(id)
            .map(|fs| fs.id)
            .ok_or_else(|| StorageError::invalid("cannot mount a partition without a filesystem"))?;
        if let Some(existing) = model.mount_of(fs).map(|m| m.id) {
            delete_mount(model, existing)?;
        }
        let path = if model.filesystem(fs)?.fstype == "swap" { String::new() } else { path };
        create_mount(model, fs, &path)?;
    }
    Ok(())
}

/// Change a partition's size, sliding movable followers when it grows.
pub fn resize_partition(model: &mut StorageModel, id: EntityId, new_size: u64) -> Result<()> {
    let part = model.partition(id)?.clone();
    let alignment = model.alignment_of(part.device);
    let new_size = align_up(new_size, alignment.part_align);
    if new_size == part.size {
        return Ok(());
    }
    if new_size == 0 {
        return Err(StorageError::invalid("partition size must be non-zero"));
    }
    if new_size > part.size {
        let (trailing, gap_size) = gaps::movable_trailing_partitions_and_gap_size(model, &part);
        let growth = new_size - part.size;
        if growth > gap_size {
            return Err(StorageError::Capacity {
                requested: new_size,
                available: part.size + gap_size,
            });
        }
        for follower in trailing {
            model.partition_mut(follower)?.offset += growth;
        }
    } else if let Some(min) = part.estimated_min_size {
        if part.preserve && new_size < min {
            return Err(StorageError::Capacity {
                requested: new_size,
                available: min,
            });
        }
    }
    let entry = model.partition_mut(id)?;
    entry.size = new_size;
    if entry.preserve {
        entry.resize = true;
    }
    debug!("resized {} to {}", model.label(id), human_size(new_size));
    Ok(())
}
