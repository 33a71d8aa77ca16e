use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::units::{align_down, MIB};

/// Space LVM keeps for its own metadata on every physical volume.
pub const LVM_OVERHEAD: u64 = MIB;
pub const LVM_CHUNK_SIZE: u64 = 4 * MIB;
/// LUKS2 header size subtracted from every encrypted volume.
pub const LUKS_OVERHEAD: u64 = 16 * MIB;
/// mdadm superblock and bitmap reservation per member.
pub const RAID_OVERHEAD: u64 = MIB;

/// Mount points an ESP may occupy, in order of preference.
pub const ESP_MOUNT_POINTS: &[&str] = &["/boot/efi", "/boot/efi2", "/boot/efi3", "/boot/efi4"];
pub const PRIMARY_ESP_MOUNT: &str = "/boot/efi";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Disk,
    Partition,
    Raid,
    VolumeGroup,
    LogicalVolume,
    DmCrypt,
    ZPool,
    Zfs,
    Filesystem,
    Mount,
    Arbitrary,
}

impl EntityKind {
    /// Name used for action identifiers in rendered plans.
    pub fn action_type(self) -> &'static str {
        match self {
            EntityKind::Disk => "disk",
            EntityKind::Partition => "partition",
            EntityKind::Raid => "raid",
            EntityKind::VolumeGroup => "lvm_volgroup",
            EntityKind::LogicalVolume => "lvm_partition",
            EntityKind::DmCrypt => "dm_crypt",
            EntityKind::ZPool => "zpool",
            EntityKind::Zfs => "zfs",
            EntityKind::Filesystem => "format",
            EntityKind::Mount => "mount",
            EntityKind::Arbitrary => "device",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action_type())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bootloader {
    /// Firmware loads the kernel itself (s390x).
    None,
    Bios,
    Uefi,
    Prep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionTable {
    Gpt,
    #[serde(alias = "dos")]
    Msdos,
}

/// Alignment and capacity rules of a partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentData {
    pub part_align: u64,
    pub min_start_offset: u64,
    /// Bytes at the end of the device the table keeps for itself.
    pub end_reserve: u64,
    /// Space in front of every logical partition for its EBR.
    pub ebr_space: u64,
    pub primary_part_limit: Option<usize>,
    pub max_partitions: u32,
}

impl PartitionTable {
    pub fn alignment(self) -> AlignmentData {
        match self {
            PartitionTable::Gpt => AlignmentData {
                part_align: MIB,
                min_start_offset: MIB,
                end_reserve: MIB,
                ebr_space: 0,
                primary_part_limit: None,
                max_partitions: 128,
            },
            PartitionTable::Msdos => AlignmentData {
                part_align: MIB,
                min_start_offset: MIB,
                end_reserve: MIB,
                ebr_space: MIB,
                primary_part_limit: Some(4),
                max_partitions: 128,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionFlag {
    Boot,
    BiosGrub,
    Prep,
    Swap,
    Extended,
    Logical,
    Msftres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Wipe {
    Superblock,
    SuperblockRecursive,
    Zero,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidLevel {
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
}

impl RaidLevel {
    pub fn min_devices(self) -> usize {
        match self {
            RaidLevel::Raid0 | RaidLevel::Raid1 => 2,
            RaidLevel::Raid5 => 3,
            RaidLevel::Raid6 | RaidLevel::Raid10 => 4,
        }
    }

    pub fn data_size(self, member_count: usize, member_size: u64) -> u64 {
        let n = member_count as u64;
        match self {
            RaidLevel::Raid0 => n * member_size,
            RaidLevel::Raid1 => member_size,
            RaidLevel::Raid5 => n.saturating_sub(1) * member_size,
            RaidLevel::Raid6 => n.saturating_sub(2) * member_size,
            RaidLevel::Raid10 => n * member_size / 2,
        }
    }
}

/// Key material. Never printed, never serialized.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecoveryKey {
    #[serde(default)]
    pub live_location: Option<String>,
    #[serde(default)]
    pub backup_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub long: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Disk {
    pub id: EntityId,
    pub path: Option<String>,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub vendor: Option<String>,
    pub rotational: Option<bool>,
    pub size: u64,
    pub ptable: Option<PartitionTable>,
    pub preserve: bool,
    pub wipe: Option<Wipe>,
    pub grub_device: bool,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Partition {
    pub id: EntityId,
    pub device: EntityId,
    pub number: u32,
    pub offset: u64,
    pub size: u64,
    pub flag: Option<PartitionFlag>,
    pub wipe: Option<Wipe>,
    pub preserve: bool,
    pub grub_device: bool,
    /// Mounted by the running live system.
    pub is_in_use: bool,
    pub resize: bool,
    pub estimated_min_size: Option<u64>,
    /// Raw type code from the partition table (GUID or MBR byte).
    pub partition_type: Option<String>,
    pub partition_name: Option<String>,
    pub path: Option<String>,
    pub os: Option<OsInfo>,
    /// Filesystem found on the partition when it was probed.
    pub original_fstype: Option<String>,
}

impl Partition {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn is_logical(&self) -> bool {
        self.flag == Some(PartitionFlag::Logical)
    }

    pub fn is_extended(&self) -> bool {
        self.flag == Some(PartitionFlag::Extended)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Raid {
    pub id: EntityId,
    pub name: String,
    pub level: RaidLevel,
    pub devices: BTreeSet<EntityId>,
    pub spare_devices: BTreeSet<EntityId>,
    pub ptable: Option<PartitionTable>,
    pub preserve: bool,
    pub wipe: Option<Wipe>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGroup {
    pub id: EntityId,
    pub name: String,
    pub devices: BTreeSet<EntityId>,
    pub preserve: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalVolume {
    pub id: EntityId,
    pub volume_group: EntityId,
    pub name: String,
    pub size: u64,
    pub preserve: bool,
    pub wipe: Option<Wipe>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DmCrypt {
    pub id: EntityId,
    pub volume: EntityId,
    pub key: Option<Secret>,
    pub keyfile: Option<String>,
    pub recovery_key: Option<RecoveryKey>,
    pub options: Vec<String>,
    pub preserve: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZfsEncryption {
    LuksKeystore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZPool {
    pub id: EntityId,
    pub devices: BTreeSet<EntityId>,
    pub pool: String,
    pub mountpoint: String,
    pub pool_properties: BTreeMap<String, String>,
    pub fs_properties: BTreeMap<String, String>,
    pub default_features: bool,
    pub encryption_style: Option<ZfsEncryption>,
    pub key: Option<Secret>,
    pub preserve: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Zfs {
    pub id: EntityId,
    pub pool: EntityId,
    pub volume: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filesystem {
    pub id: EntityId,
    pub volume: EntityId,
    pub fstype: String,
    pub preserve: bool,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub id: EntityId,
    pub filesystem: EntityId,
    /// Empty for swap.
    pub path: String,
}

/// A block device that only exists once the installer runs, such as
/// an encrypted volume handed back by the encryption service.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbitraryDevice {
    pub id: EntityId,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Disk(Disk),
    Partition(Partition),
    Raid(Raid),
    VolumeGroup(VolumeGroup),
    LogicalVolume(LogicalVolume),
    DmCrypt(DmCrypt),
    ZPool(ZPool),
    Zfs(Zfs),
    Filesystem(Filesystem),
    Mount(Mount),
    Arbitrary(ArbitraryDevice),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Disk(_) => EntityKind::Disk,
            Entity::Partition(_) => EntityKind::Partition,
            Entity::Raid(_) => EntityKind::Raid,
            Entity::VolumeGroup(_) => EntityKind::VolumeGroup,
            Entity::LogicalVolume(_) => EntityKind::LogicalVolume,
            Entity::DmCrypt(_) => EntityKind::DmCrypt,
            Entity::ZPool(_) => EntityKind::ZPool,
            Entity::Zfs(_) => EntityKind::Zfs,
            Entity::Filesystem(_) => EntityKind::Filesystem,
            Entity::Mount(_) => EntityKind::Mount,
            Entity::Arbitrary(_) => EntityKind::Arbitrary,
        }
    }

    pub fn preserve(&self) -> bool {
        match self {
            Entity::Disk(d) => d.preserve,
            Entity::Partition(p) => p.preserve,
            Entity::Raid(r) => r.preserve,
            Entity::VolumeGroup(vg) => vg.preserve,
            Entity::LogicalVolume(lv) => lv.preserve,
            Entity::DmCrypt(dm) => dm.preserve,
            Entity::ZPool(zp) => zp.preserve,
            Entity::Filesystem(fs) => fs.preserve,
            Entity::Zfs(_) | Entity::Mount(_) | Entity::Arbitrary(_) => false,
        }
    }

    fn wipe_mut(&mut self) -> Option<&mut Option<Wipe>> {
        match self {
            Entity::Disk(d) => Some(&mut d.wipe),
            Entity::Partition(p) => Some(&mut p.wipe),
            Entity::Raid(r) => Some(&mut r.wipe),
            Entity::LogicalVolume(lv) => Some(&mut lv.wipe),
            _ => None,
        }
    }
}

macro_rules! typed_access {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty, $kind:expr) => {
        pub fn $get(&self, id: EntityId) -> Result<&$ty> {
            match self.entities.get(&id) {
                Some(Entity::$variant(value)) => Ok(value),
                _ => Err(StorageError::NotFound { kind: $kind, id }),
            }
        }

        pub fn $get_mut(&mut self, id: EntityId) -> Result<&mut $ty> {
            match self.entities.get_mut(&id) {
                Some(Entity::$variant(value)) => Ok(value),
                _ => Err(StorageError::NotFound { kind: $kind, id }),
            }
        }
    };
}

/// Arena of every storage entity plus the reverse indexes the
/// manipulator keeps in step with it.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageModel {
    pub bootloader: Bootloader,
    /// Disk an image is written to verbatim instead of being partitioned.
    pub dd_target: Option<EntityId>,
    next_id: u64,
    entities: BTreeMap<EntityId, Entity>,
    filesystem_of: HashMap<EntityId, EntityId>,
    mount_of: HashMap<EntityId, EntityId>,
    constructed_device_of: HashMap<EntityId, EntityId>,
}

impl StorageModel {
    pub fn new(bootloader: Bootloader) -> Self {
        Self {
            bootloader,
            dd_target: None,
            next_id: 0,
            entities: BTreeMap::new(),
            filesystem_of: HashMap::new(),
            mount_of: HashMap::new(),
            constructed_device_of: HashMap::new(),
        }
    }

    typed_access!(disk, disk_mut, Disk, Disk, EntityKind::Disk);
    typed_access!(partition, partition_mut, Partition, Partition, EntityKind::Partition);
    typed_access!(raid, raid_mut, Raid, Raid, EntityKind::Raid);
    typed_access!(volume_group, volume_group_mut, VolumeGroup, VolumeGroup, EntityKind::VolumeGroup);
    typed_access!(logical_volume, logical_volume_mut, LogicalVolume, LogicalVolume, EntityKind::LogicalVolume);
    typed_access!(dm_crypt, dm_crypt_mut, DmCrypt, DmCrypt, EntityKind::DmCrypt);
    typed_access!(zpool, zpool_mut, ZPool, ZPool, EntityKind::ZPool);
    typed_access!(filesystem, filesystem_mut, Filesystem, Filesystem, EntityKind::Filesystem);
    typed_access!(mount, mount_mut, Mount, Mount, EntityKind::Mount);

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn kind_of(&self, id: EntityId) -> Option<EntityKind> {
        self.entities.get(&id).map(Entity::kind)
    }

    /// Entities in creation order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn allocate_id(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, build: impl FnOnce(EntityId) -> Entity) -> EntityId {
        let id = self.allocate_id();
        self.entities.insert(id, build(id));
        id
    }

    // ---- queries -------------------------------------------------------

    pub fn all_disks(&self) -> Vec<&Disk> {
        let mut disks = self
            .entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Disk(disk) => Some(disk),
                _ => None,
            })
            .collect::<Vec<_>>();
        disks.sort_by(|a, b| self.label_of_disk(a).cmp(&self.label_of_disk(b)));
        disks
    }

    pub fn all_raids(&self) -> Vec<&Raid> {
        self.entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Raid(raid) => Some(raid),
                _ => None,
            })
            .collect()
    }

    pub fn all_volume_groups(&self) -> Vec<&VolumeGroup> {
        self.entities
            .values()
            .filter_map(|entity| match entity {
                Entity::VolumeGroup(vg) => Some(vg),
                _ => None,
            })
            .collect()
    }

    pub fn all_partitions(&self) -> Vec<&Partition> {
        self.entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Partition(part) => Some(part),
                _ => None,
            })
            .collect()
    }

    pub fn all_filesystems(&self) -> Vec<&Filesystem> {
        self.entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Filesystem(fs) => Some(fs),
                _ => None,
            })
            .collect()
    }

    pub fn all_mounts(&self) -> Vec<&Mount> {
        self.entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Mount(mount) => Some(mount),
                _ => None,
            })
            .collect()
    }

    pub fn zfs_datasets_of(&self, pool: EntityId) -> Vec<&Zfs> {
        self.entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Zfs(zfs) if zfs.pool == pool => Some(zfs),
                _ => None,
            })
            .collect()
    }

    fn label_of_disk(&self, disk: &Disk) -> String {
        disk.path
            .clone()
            .or_else(|| disk.serial.clone())
            .unwrap_or_else(|| format!("disk-{}", disk.id.0))
    }

    pub fn label(&self, id: EntityId) -> String {
        match self.entities.get(&id) {
            Some(Entity::Disk(disk)) => self.label_of_disk(disk),
            Some(Entity::Partition(part)) => {
                format!("partition {} of {}", part.number, self.label(part.device))
            }
            Some(Entity::Raid(raid)) => raid.name.clone(),
            Some(Entity::VolumeGroup(vg)) => vg.name.clone(),
            Some(Entity::LogicalVolume(lv)) => lv.name.clone(),
            Some(Entity::DmCrypt(dm)) => format!("encrypted {}", self.label(dm.volume)),
            Some(Entity::ZPool(pool)) => pool.pool.clone(),
            Some(entity) => format!("{}-{}", entity.kind(), id.0),
            None => format!("missing {id}"),
        }
    }

    /// Partitions (primary, extended and logical) of a disk or RAID, by offset.
    pub fn partitions_of(&self, device: EntityId) -> Vec<&Partition> {
        let mut parts = self
            .entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Partition(part) if part.device == device => Some(part),
                _ => None,
            })
            .collect::<Vec<_>>();
        parts.sort_by_key(|part| (part.offset, part.number));
        parts
    }

    pub fn partition_ids_of(&self, device: EntityId) -> Vec<EntityId> {
        self.partitions_of(device).iter().map(|part| part.id).collect()
    }

    pub fn partition_by_number(&self, device: EntityId, number: u32) -> Result<&Partition> {
        self.partitions_of(device)
            .into_iter()
            .find(|part| part.number == number)
            .ok_or_else(|| StorageError::NoMatch {
                what: "partition".to_string(),
                detail: format!("number {number} on {}", self.label(device)),
            })
    }

    pub fn logical_volumes_of(&self, vg: EntityId) -> Vec<&LogicalVolume> {
        self.entities
            .values()
            .filter_map(|entity| match entity {
                Entity::LogicalVolume(lv) if lv.volume_group == vg => Some(lv),
                _ => None,
            })
            .collect()
    }

    pub fn filesystem_of(&self, volume: EntityId) -> Option<&Filesystem> {
        self.filesystem_of
            .get(&volume)
            .and_then(|fs| self.filesystem(*fs).ok())
    }

    pub fn mount_of(&self, filesystem: EntityId) -> Option<&Mount> {
        self.mount_of
            .get(&filesystem)
            .and_then(|mount| self.mount(*mount).ok())
    }

    /// Mount of the filesystem directly on `volume`, if any.
    pub fn mount_of_volume(&self, volume: EntityId) -> Option<&Mount> {
        self.filesystem_of(volume)
            .and_then(|fs| self.mount_of(fs.id))
    }

    pub fn constructed_device_of(&self, id: EntityId) -> Option<EntityId> {
        self.constructed_device_of.get(&id).copied()
    }

    pub fn mount_for_path(&self, path: &str) -> Option<&Mount> {
        self.all_mounts().into_iter().find(|mount| mount.path == path)
    }

    pub fn is_partitionable(&self, id: EntityId) -> bool {
        matches!(self.kind_of(id), Some(EntityKind::Disk | EntityKind::Raid))
    }

    pub fn ptable_of(&self, device: EntityId) -> Option<PartitionTable> {
        match self.entities.get(&device) {
            Some(Entity::Disk(disk)) => disk.ptable,
            Some(Entity::Raid(raid)) => raid.ptable,
            _ => None,
        }
    }

    pub fn set_ptable(&mut self, device: EntityId, ptable: Option<PartitionTable>) -> Result<()> {
        match self.entities.get_mut(&device) {
            Some(Entity::Disk(disk)) => disk.ptable = ptable,
            Some(Entity::Raid(raid)) => raid.ptable = ptable,
            _ => return Err(StorageError::invalid(format!("{device} cannot hold a partition table"))),
        }
        Ok(())
    }

    pub fn alignment_of(&self, device: EntityId) -> AlignmentData {
        self.ptable_of(device)
            .unwrap_or(PartitionTable::Gpt)
            .alignment()
    }

    pub fn preserve_of(&self, id: EntityId) -> bool {
        self.entities.get(&id).map(Entity::preserve).unwrap_or(false)
    }

    pub fn set_preserve(&mut self, id: EntityId, preserve: bool) {
        match self.entities.get_mut(&id) {
            Some(Entity::Disk(d)) => d.preserve = preserve,
            Some(Entity::Partition(p)) => p.preserve = preserve,
            Some(Entity::Raid(r)) => r.preserve = preserve,
            Some(Entity::VolumeGroup(vg)) => vg.preserve = preserve,
            Some(Entity::LogicalVolume(lv)) => lv.preserve = preserve,
            Some(Entity::DmCrypt(dm)) => dm.preserve = preserve,
            Some(Entity::ZPool(zp)) => zp.preserve = preserve,
            Some(Entity::Filesystem(fs)) => fs.preserve = preserve,
            _ => {}
        }
    }

    pub fn wipe_of(&self, id: EntityId) -> Option<Wipe> {
        match self.entities.get(&id) {
            Some(Entity::Disk(d)) => d.wipe,
            Some(Entity::Partition(p)) => p.wipe,
            Some(Entity::Raid(r)) => r.wipe,
            Some(Entity::LogicalVolume(lv)) => lv.wipe,
            _ => None,
        }
    }

    pub fn set_wipe(&mut self, id: EntityId, wipe: Option<Wipe>) {
        if let Some(slot) = self.entities.get_mut(&id).and_then(Entity::wipe_mut) {
            *slot = wipe;
        }
    }

    /// Usable bytes of any volume-like entity.
    pub fn size_of(&self, id: EntityId) -> u64 {
        match self.entities.get(&id) {
            Some(Entity::Disk(disk)) => disk.size,
            Some(Entity::Partition(part)) => part.size,
            Some(Entity::Raid(raid)) => self.raid_size(raid),
            Some(Entity::VolumeGroup(vg)) => self.volume_group_size(vg),
            Some(Entity::LogicalVolume(lv)) => lv.size,
            Some(Entity::DmCrypt(dm)) => self.size_of(dm.volume).saturating_sub(LUKS_OVERHEAD),
            Some(Entity::ZPool(pool)) => pool.devices.iter().map(|d| self.size_of(*d)).sum(),
            _ => 0,
        }
    }

    fn raid_size(&self, raid: &Raid) -> u64 {
        let Some(smallest) = raid.devices.iter().map(|d| self.size_of(*d)).min() else {
            return 0;
        };
        let per_member = align_down(smallest, MIB).saturating_sub(RAID_OVERHEAD);
        raid.level.data_size(raid.devices.len(), per_member)
    }

    fn volume_group_size(&self, vg: &VolumeGroup) -> u64 {
        vg.devices
            .iter()
            .map(|d| align_down(self.size_of(*d).saturating_sub(LVM_OVERHEAD), LVM_CHUNK_SIZE))
            .sum()
    }

    pub fn has_preexisting_partition(&self, device: EntityId) -> bool {
        self.partitions_of(device).iter().any(|part| part.preserve)
    }

    pub fn has_in_use_partition(&self, device: EntityId) -> bool {
        self.partitions_of(device).iter().any(|part| part.is_in_use)
    }

    /// A volume that can take a filesystem or join a constructed device.
    pub fn is_available(&self, id: EntityId) -> bool {
        if self.filesystem_of.contains_key(&id) || self.constructed_device_of.contains_key(&id) {
            return false;
        }
        match self.entities.get(&id) {
            Some(Entity::Partition(part)) => !matches!(
                part.flag,
                Some(PartitionFlag::Extended | PartitionFlag::BiosGrub | PartitionFlag::Prep)
            ),
            Some(Entity::Disk(_)) | Some(Entity::Raid(_)) => self.partitions_of(id).is_empty(),
            Some(Entity::LogicalVolume(_)) | Some(Entity::DmCrypt(_)) => true,
            Some(Entity::Arbitrary(_)) => true,
            _ => false,
        }
    }

    pub fn is_root_mounted(&self) -> bool {
        if self.mount_for_path("/").is_some() {
            return true;
        }
        self.entities.values().any(|entity| match entity {
            Entity::ZPool(pool) => pool.mountpoint == "/",
            Entity::Zfs(zfs) => zfs.properties.get("mountpoint").is_some_and(|m| m == "/"),
            _ => false,
        })
    }

    /// True when no device yet carries the bootloader and one is required.
    pub fn needs_bootloader_partition(&self) -> bool {
        match self.bootloader {
            Bootloader::None => false,
            Bootloader::Bios => !self
                .all_disks()
                .iter()
                .any(|disk| disk.grub_device)
                && !self.all_partitions().iter().any(|part| {
                    part.grub_device && part.flag == Some(PartitionFlag::BiosGrub)
                }),
            Bootloader::Uefi => !self.all_partitions().iter().any(|part| {
                part.grub_device
                    && self
                        .mount_of_volume(part.id)
                        .is_some_and(|mount| mount.path == PRIMARY_ESP_MOUNT)
            }),
            Bootloader::Prep => !self.all_partitions().iter().any(|part| part.grub_device),
        }
    }

    pub fn can_install(&self) -> bool {
        if self.dd_target.is_some() {
            return true;
        }
        self.is_root_mounted() && !self.needs_bootloader_partition()
    }

    /// A swap mount or a btrfs root makes the installer skip the swap file.
    pub fn swap_file_suppressed(&self) -> bool {
        if let Some(root) = self.mount_for_path("/") {
            if self
                .filesystem(root.filesystem)
                .is_ok_and(|fs| fs.fstype == "btrfs")
            {
                return true;
            }
        }
        self.all_filesystems()
            .iter()
            .any(|fs| fs.fstype == "swap" && self.mount_of(fs.id).is_some())
    }

    // ---- primitive mutators -------------------------------------------

    pub fn add_disk(&mut self, disk: Disk) -> EntityId {
        self.insert(|id| Entity::Disk(Disk { id, ..disk }))
    }

    pub fn add_partition(&mut self, mut part: Partition) -> Result<EntityId> {
        let device = part.device;
        if !self.is_partitionable(device) {
            return Err(StorageError::invalid(format!(
                "{} cannot hold partitions",
                self.label(device)
            )));
        }
        if self.filesystem_of.contains_key(&device) {
            return Err(StorageError::invalid(format!(
                "{} is already formatted",
                self.label(device)
            )));
        }
        if part.size == 0 {
            return Err(StorageError::invalid("partition size must be non-zero"));
        }
        let device_size = self.size_of(device);
        if part.end() > device_size {
            return Err(StorageError::Capacity {
                requested: part.end(),
                available: device_size,
            });
        }
        if self.ptable_of(device).is_none() {
            self.set_ptable(device, Some(PartitionTable::Gpt))?;
        }
        let ptable = self.ptable_of(device).unwrap_or(PartitionTable::Gpt);
        if ptable != PartitionTable::Msdos
            && matches!(part.flag, Some(PartitionFlag::Extended | PartitionFlag::Logical))
        {
            return Err(StorageError::invalid(
                "extended and logical partitions need an msdos partition table",
            ));
        }
        self.check_placement(device, &part)?;
        if part.number == 0 {
            part.number = self.next_partition_number(device, part.is_logical())?;
        } else if self
            .partitions_of(device)
            .iter()
            .any(|existing| existing.number == part.number)
        {
            return Err(StorageError::invariant(format!(
                "partition number {} already used on {}",
                part.number,
                self.label(device)
            )));
        }
        debug!(
            "add_partition: {} number={} offset={} size={} flag={:?}",
            self.label(device),
            part.number,
            part.offset,
            part.size,
            part.flag
        );
        Ok(self.insert(|id| Entity::Partition(Partition { id, ..part })))
    }

    /// Rejects a partition that overlaps a sibling at the same nesting level.
    fn check_placement(&self, device: EntityId, part: &Partition) -> Result<()> {
        let siblings = self.partitions_of(device);
        if part.is_logical() {
            let Some(extended) = siblings.iter().find(|p| p.is_extended()) else {
                return Err(StorageError::invalid("logical partition without extended partition"));
            };
            if part.offset < extended.offset || part.end() > extended.end() {
                return Err(StorageError::invariant(
                    "logical partition outside of the extended partition",
                ));
            }
        } else if part.is_extended() && siblings.iter().any(|p| p.is_extended()) {
            return Err(StorageError::invariant("device already has an extended partition"));
        }
        let overlapping = siblings.iter().any(|other| {
            other.id != part.id
                && other.is_logical() == part.is_logical()
                && other.offset < part.end()
                && part.offset < other.end()
        });
        if overlapping {
            return Err(StorageError::invariant(format!(
                "partition at offset {} overlaps an existing partition on {}",
                part.offset,
                self.label(device)
            )));
        }
        Ok(())
    }

    fn next_partition_number(&self, device: EntityId, logical: bool) -> Result<u32> {
        let ptable = self.ptable_of(device).unwrap_or(PartitionTable::Gpt);
        let used = self
            .partitions_of(device)
            .iter()
            .map(|part| part.number)
            .collect::<BTreeSet<_>>();
        let alignment = ptable.alignment();
        let candidates = match (ptable, logical) {
            (PartitionTable::Msdos, true) => 5..=alignment.max_partitions,
            (PartitionTable::Msdos, false) => 1..=4,
            (PartitionTable::Gpt, _) => 1..=alignment.max_partitions,
        };
        if ptable == PartitionTable::Msdos && logical {
            let next = used.iter().copied().filter(|n| *n >= 5).max().unwrap_or(4) + 1;
            if next <= alignment.max_partitions {
                return Ok(next);
            }
        } else if let Some(free) = candidates.clone().find(|n| !used.contains(n)) {
            return Ok(free);
        }
        Err(StorageError::Invariant(format!(
            "no free partition number left on {}",
            self.label(device)
        )))
    }

    pub fn remove_partition(&mut self, id: EntityId) -> Result<()> {
        let device = self.partition(id)?.device;
        if self.filesystem_of.contains_key(&id) || self.constructed_device_of.contains_key(&id) {
            return Err(StorageError::invariant("can only remove an empty partition"));
        }
        self.entities.remove(&id);
        if self.partitions_of(device).is_empty() {
            self.set_ptable(device, None)?;
        }
        Ok(())
    }

    pub fn add_raid(
        &mut self,
        name: &str,
        level: RaidLevel,
        devices: BTreeSet<EntityId>,
        spare_devices: BTreeSet<EntityId>,
    ) -> Result<EntityId> {
        if devices.len() < level.min_devices() {
            return Err(StorageError::invalid(format!(
                "{level:?} needs at least {} devices, got {}",
                level.min_devices(),
                devices.len()
            )));
        }
        self.claim_members(devices.iter().chain(spare_devices.iter()))?;
        let id = self.insert(|id| {
            Entity::Raid(Raid {
                id,
                name: name.to_string(),
                level,
                devices: devices.clone(),
                spare_devices: spare_devices.clone(),
                ptable: None,
                preserve: false,
                wipe: None,
                path: None,
            })
        });
        for member in devices.iter().chain(spare_devices.iter()) {
            self.constructed_device_of.insert(*member, id);
        }
        Ok(id)
    }

    fn claim_members<'a>(&self, members: impl Iterator<Item = &'a EntityId>) -> Result<()> {
        for member in members {
            if !self.contains(*member) {
                return Err(StorageError::invalid(format!("unknown device {member}")));
            }
            if !self.is_available(*member) {
                return Err(StorageError::invalid(format!(
                    "{} is not available",
                    self.label(*member)
                )));
            }
        }
        Ok(())
    }

    pub fn remove_raid(&mut self, id: EntityId) -> Result<()> {
        let raid = self.raid(id)?.clone();
        if self.filesystem_of.contains_key(&id)
            || self.constructed_device_of.contains_key(&id)
            || !self.partitions_of(id).is_empty()
        {
            return Err(StorageError::invariant("can only remove an empty RAID"));
        }
        for member in raid.devices.iter().chain(raid.spare_devices.iter()) {
            self.constructed_device_of.remove(member);
        }
        self.entities.remove(&id);
        Ok(())
    }

    /// Re-point a RAID at a new member set.
    pub fn replace_raid_members(
        &mut self,
        id: EntityId,
        devices: BTreeSet<EntityId>,
        spare_devices: BTreeSet<EntityId>,
    ) -> Result<()> {
        let old = self.raid(id)?.clone();
        for member in old.devices.iter().chain(old.spare_devices.iter()) {
            self.constructed_device_of.remove(member);
        }
        if let Err(err) = self.claim_members(devices.iter().chain(spare_devices.iter())) {
            for member in old.devices.iter().chain(old.spare_devices.iter()) {
                self.constructed_device_of.insert(*member, id);
            }
            return Err(err);
        }
        for member in devices.iter().chain(spare_devices.iter()) {
            self.constructed_device_of.insert(*member, id);
        }
        let raid = self.raid_mut(id)?;
        raid.devices = devices;
        raid.spare_devices = spare_devices;
        Ok(())
    }

    pub fn add_volume_group(&mut self, name: &str, devices: BTreeSet<EntityId>) -> Result<EntityId> {
        if devices.is_empty() {
            return Err(StorageError::invalid("a volume group needs at least one device"));
        }
        if self.all_volume_groups().iter().any(|vg| vg.name == name) {
            return Err(StorageError::invalid(format!("volume group {name} already exists")));
        }
        self.claim_members(devices.iter())?;
        let id = self.insert(|id| {
            Entity::VolumeGroup(VolumeGroup {
                id,
                name: name.to_string(),
                devices: devices.clone(),
                preserve: false,
            })
        });
        for member in &devices {
            self.constructed_device_of.insert(*member, id);
        }
        Ok(id)
    }

    pub fn remove_volume_group(&mut self, id: EntityId) -> Result<()> {
        let vg = self.volume_group(id)?.clone();
        if !self.logical_volumes_of(id).is_empty() {
            return Err(StorageError::invariant("can only remove an empty volume group"));
        }
        for member in &vg.devices {
            self.constructed_device_of.remove(member);
        }
        self.entities.remove(&id);
        Ok(())
    }

    /// Free bytes left in a volume group.
    pub fn volume_group_free(&self, vg: EntityId) -> u64 {
        let used: u64 = self.logical_volumes_of(vg).iter().map(|lv| lv.size).sum();
        self.size_of(vg).saturating_sub(used)
    }

    pub fn add_logical_volume(&mut self, vg: EntityId, name: &str, size: u64) -> Result<EntityId> {
        self.volume_group(vg)?;
        let available = self.volume_group_free(vg);
        if size > available {
            return Err(StorageError::Capacity {
                requested: size,
                available,
            });
        }
        if self.logical_volumes_of(vg).iter().any(|lv| lv.name == name) {
            return Err(StorageError::invalid(format!("logical volume {name} already exists")));
        }
        Ok(self.insert(|id| {
            Entity::LogicalVolume(LogicalVolume {
                id,
                volume_group: vg,
                name: name.to_string(),
                size,
                preserve: false,
                wipe: None,
            })
        }))
    }

    pub fn remove_logical_volume(&mut self, id: EntityId) -> Result<()> {
        self.logical_volume(id)?;
        if self.filesystem_of.contains_key(&id) || self.constructed_device_of.contains_key(&id) {
            return Err(StorageError::invariant("can only remove an empty logical volume"));
        }
        self.entities.remove(&id);
        Ok(())
    }

    pub fn add_dm_crypt(
        &mut self,
        volume: EntityId,
        key: Option<Secret>,
        keyfile: Option<String>,
        recovery_key: Option<RecoveryKey>,
        options: Vec<String>,
    ) -> Result<EntityId> {
        self.claim_members(std::iter::once(&volume))?;
        let id = self.insert(|id| {
            Entity::DmCrypt(DmCrypt {
                id,
                volume,
                key,
                keyfile,
                recovery_key,
                options,
                preserve: false,
            })
        });
        self.constructed_device_of.insert(volume, id);
        Ok(id)
    }

    pub fn remove_dm_crypt(&mut self, id: EntityId) -> Result<()> {
        let volume = self.dm_crypt(id)?.volume;
        if self.filesystem_of.contains_key(&id) || self.constructed_device_of.contains_key(&id) {
            return Err(StorageError::invariant("can only remove an unused encrypted volume"));
        }
        self.constructed_device_of.remove(&volume);
        self.entities.remove(&id);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_zpool(
        &mut self,
        devices: BTreeSet<EntityId>,
        pool: &str,
        mountpoint: &str,
        pool_properties: BTreeMap<String, String>,
        fs_properties: BTreeMap<String, String>,
        default_features: bool,
        encryption_style: Option<ZfsEncryption>,
        key: Option<Secret>,
    ) -> Result<EntityId> {
        if devices.is_empty() {
            return Err(StorageError::invalid("a zpool needs at least one device"));
        }
        self.claim_members(devices.iter())?;
        let id = self.insert(|id| {
            Entity::ZPool(ZPool {
                id,
                devices: devices.clone(),
                pool: pool.to_string(),
                mountpoint: mountpoint.to_string(),
                pool_properties,
                fs_properties,
                default_features,
                encryption_style,
                key,
                preserve: false,
            })
        });
        for member in &devices {
            self.constructed_device_of.insert(*member, id);
        }
        Ok(id)
    }

    pub fn add_zfs(
        &mut self,
        pool: EntityId,
        volume: &str,
        properties: BTreeMap<String, String>,
    ) -> Result<EntityId> {
        self.zpool(pool)?;
        Ok(self.insert(|id| {
            Entity::Zfs(Zfs {
                id,
                pool,
                volume: volume.to_string(),
                properties,
            })
        }))
    }

    pub fn remove_zpool(&mut self, id: EntityId) -> Result<()> {
        let pool = self.zpool(id)?.clone();
        let datasets = self
            .zfs_datasets_of(id)
            .iter()
            .map(|zfs| zfs.id)
            .collect::<Vec<_>>();
        for dataset in datasets {
            self.entities.remove(&dataset);
        }
        for member in &pool.devices {
            self.constructed_device_of.remove(member);
        }
        self.entities.remove(&id);
        Ok(())
    }

    pub fn add_filesystem(
        &mut self,
        volume: EntityId,
        fstype: &str,
        preserve: bool,
        label: Option<String>,
    ) -> Result<EntityId> {
        if self.filesystem_of.contains_key(&volume) {
            return Err(StorageError::invalid(format!(
                "{} is already formatted",
                self.label(volume)
            )));
        }
        if let Ok(part) = self.partition(volume) {
            if part.flag == Some(PartitionFlag::Prep)
                || (part.flag == Some(PartitionFlag::BiosGrub) && fstype == "fat32")
                || part.is_extended()
            {
                return Err(StorageError::invalid(format!(
                    "{} cannot hold a filesystem",
                    self.label(volume)
                )));
            }
        } else if !self.is_available(volume) {
            return Err(StorageError::invalid(format!(
                "{} is not available",
                self.label(volume)
            )));
        }
        if self.constructed_device_of.contains_key(&volume) {
            return Err(StorageError::invalid(format!(
                "{} is part of another device",
                self.label(volume)
            )));
        }
        debug!("adding {} to {}", fstype, self.label(volume));
        let id = self.insert(|id| {
            Entity::Filesystem(Filesystem {
                id,
                volume,
                fstype: fstype.to_string(),
                preserve,
                label,
            })
        });
        self.filesystem_of.insert(volume, id);
        Ok(id)
    }

    pub fn remove_filesystem(&mut self, id: EntityId) -> Result<()> {
        let volume = self.filesystem(id)?.volume;
        if self.mount_of.contains_key(&id) {
            return Err(StorageError::invariant("can only remove an unmounted filesystem"));
        }
        self.filesystem_of.remove(&volume);
        self.entities.remove(&id);
        Ok(())
    }

    /// Move a filesystem onto another volume (used when an encrypted
    /// device replaces the partition it was planned on).
    pub fn retarget_filesystem(&mut self, id: EntityId, volume: EntityId) -> Result<()> {
        if self.filesystem_of.contains_key(&volume) {
            return Err(StorageError::invalid(format!(
                "{} is already formatted",
                self.label(volume)
            )));
        }
        let old = self.filesystem(id)?.volume;
        self.filesystem_mut(id)?.volume = volume;
        self.filesystem_of.remove(&old);
        self.filesystem_of.insert(volume, id);
        Ok(())
    }

    pub fn add_mount(&mut self, filesystem: EntityId, path: &str) -> Result<EntityId> {
        self.filesystem(filesystem)?;
        if self.mount_of.contains_key(&filesystem) {
            return Err(StorageError::invalid("filesystem is already mounted"));
        }
        if !path.is_empty() && self.mount_for_path(path).is_some() {
            return Err(StorageError::invariant(format!("{path} is already mounted")));
        }
        let id = self.insert(|id| {
            Entity::Mount(Mount {
                id,
                filesystem,
                path: path.to_string(),
            })
        });
        self.mount_of.insert(filesystem, id);
        Ok(id)
    }

    pub fn remove_mount(&mut self, id: EntityId) -> Result<()> {
        let filesystem = self.mount(id)?.filesystem;
        self.mount_of.remove(&filesystem);
        self.entities.remove(&id);
        Ok(())
    }

    pub fn add_arbitrary_device(&mut self, path: &str) -> EntityId {
        self.insert(|id| {
            Entity::Arbitrary(ArbitraryDevice {
                id,
                path: path.to_string(),
            })
        })
    }

    /// Verifies the structural invariants every mutation must keep.
    pub fn check_invariants(&self) -> Result<()> {
        let devices = self
            .entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Disk(disk) => Some(disk.id),
                Entity::Raid(raid) => Some(raid.id),
                _ => None,
            })
            .collect::<Vec<_>>();
        for device in devices {
            let size = self.size_of(device);
            let parts = self.partitions_of(device);
            let mut numbers = BTreeSet::new();
            for part in &parts {
                if part.end() > size {
                    return Err(StorageError::invariant(format!(
                        "partition {} ends past the end of {}",
                        part.number,
                        self.label(device)
                    )));
                }
                if !numbers.insert(part.number) {
                    return Err(StorageError::invariant(format!(
                        "duplicate partition number {} on {}",
                        part.number,
                        self.label(device)
                    )));
                }
            }
            for (index, part) in parts.iter().enumerate() {
                for other in &parts[index + 1..] {
                    if other.is_logical() == part.is_logical()
                        && other.offset < part.end()
                        && part.offset < other.end()
                    {
                        return Err(StorageError::invariant(format!(
                            "partitions {} and {} overlap on {}",
                            part.number,
                            other.number,
                            self.label(device)
                        )));
                    }
                }
            }
        }
        let mut paths = BTreeSet::new();
        for mount in self.all_mounts() {
            if !mount.path.is_empty() && !paths.insert(mount.path.as_str()) {
                return Err(StorageError::invariant(format!(
                    "{} is mounted twice",
                    mount.path
                )));
            }
        }
        for vg in self.all_volume_groups() {
            let used: u64 = self.logical_volumes_of(vg.id).iter().map(|lv| lv.size).sum();
            if used > self.size_of(vg.id) {
                return Err(StorageError::invariant(format!(
                    "logical volumes of {} exceed its size",
                    vg.name
                )));
            }
        }
        for (volume, fs) in &self.filesystem_of {
            if self.filesystem(*fs)?.volume != *volume {
                return Err(StorageError::invariant("filesystem index out of step"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{
        Bootloader, Disk, EntityKind, Partition, PartitionFlag, PartitionTable, RaidLevel,
        StorageModel, LVM_CHUNK_SIZE, LVM_OVERHEAD,
    };
    use crate::error::StorageError;
    use crate::units::{align_down, GIB, MIB};

    fn disk(model: &mut StorageModel, size: u64) -> super::EntityId {
        model.add_disk(Disk {
            path: Some(format!("/dev/vd{}", model.all_disks().len())),
            size,
            ..Disk::default()
        })
    }

    #[test]
    fn assigns_lowest_free_gpt_number() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let d = disk(&mut model, 10 * GIB);
        let first = model
            .add_partition(Partition {
                device: d,
                offset: MIB,
                size: GIB,
                ..Partition::default()
            })
            .expect("first partition");
        model
            .add_partition(Partition {
                device: d,
                offset: GIB + MIB,
                size: GIB,
                ..Partition::default()
            })
            .expect("second partition");
        model.remove_partition(first).expect("remove");
        let third = model
            .add_partition(Partition {
                device: d,
                offset: MIB,
                size: GIB,
                ..Partition::default()
            })
            .expect("third partition");
        assert_eq!(model.partition(third).expect("exists").number, 1);
        assert_eq!(model.ptable_of(d), Some(PartitionTable::Gpt));
    }

    #[test]
    fn rejects_overlapping_partitions() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let d = disk(&mut model, 10 * GIB);
        model
            .add_partition(Partition {
                device: d,
                offset: MIB,
                size: GIB,
                ..Partition::default()
            })
            .expect("partition");
        let err = model
            .add_partition(Partition {
                device: d,
                offset: 512 * MIB,
                size: GIB,
                ..Partition::default()
            })
            .expect_err("overlap rejected");
        assert!(matches!(err, StorageError::Invariant(_)));
    }

    #[test]
    fn msdos_logicals_are_numbered_from_five() {
        let mut model = StorageModel::new(Bootloader::Bios);
        let d = disk(&mut model, 10 * GIB);
        model.set_ptable(d, Some(PartitionTable::Msdos)).expect("ptable");
        model
            .add_partition(Partition {
                device: d,
                offset: MIB,
                size: 8 * GIB,
                flag: Some(PartitionFlag::Extended),
                ..Partition::default()
            })
            .expect("extended");
        let logical = model
            .add_partition(Partition {
                device: d,
                offset: 2 * MIB,
                size: GIB,
                flag: Some(PartitionFlag::Logical),
                ..Partition::default()
            })
            .expect("logical");
        assert_eq!(model.partition(logical).expect("exists").number, 5);
    }

    #[test]
    fn volume_group_size_accounts_for_lvm_overhead() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let d = disk(&mut model, 10 * GIB);
        let part = model
            .add_partition(Partition {
                device: d,
                offset: MIB,
                size: 5 * GIB,
                ..Partition::default()
            })
            .expect("partition");
        let vg = model
            .add_volume_group("vg0", BTreeSet::from([part]))
            .expect("vg");
        assert_eq!(
            model.size_of(vg),
            align_down(5 * GIB - LVM_OVERHEAD, LVM_CHUNK_SIZE)
        );
        assert_eq!(model.constructed_device_of(part), Some(vg));
        let err = model
            .add_logical_volume(vg, "lv0", 6 * GIB)
            .expect_err("too large");
        assert!(matches!(err, StorageError::Capacity { .. }));
    }

    #[test]
    fn raid_needs_minimum_member_count() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let a = disk(&mut model, 10 * GIB);
        let err = model
            .add_raid("md0", RaidLevel::Raid5, BTreeSet::from([a]), BTreeSet::new())
            .expect_err("too few members");
        assert!(matches!(err, StorageError::InvalidTransition(_)));
    }

    #[test]
    fn refuses_second_mount_on_same_path() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let a = disk(&mut model, 10 * GIB);
        let b = disk(&mut model, 10 * GIB);
        let fs_a = model.add_filesystem(a, "ext4", false, None).expect("fs a");
        let fs_b = model.add_filesystem(b, "ext4", false, None).expect("fs b");
        model.add_mount(fs_a, "/").expect("mount a");
        assert!(model.add_mount(fs_b, "/").is_err());
        assert!(model.is_root_mounted());
    }

    #[test]
    fn missing_entity_reports_kind() {
        let model = StorageModel::new(Bootloader::Uefi);
        let err = model.disk(super::EntityId(42)).expect_err("missing");
        assert_eq!(
            err,
            StorageError::NotFound {
                kind: EntityKind::Disk,
                id: super::EntityId(42)
            }
        );
    }
}
