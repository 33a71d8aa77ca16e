//! Rendering the model into the ordered action list the execution tool
//! consumes, and reading such a list back.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::model::{
    Bootloader, Disk, Entity, EntityId, Partition, PartitionFlag, PartitionTable,
    RaidLevel, RecoveryKey, StorageModel, Wipe, ZfsEncryption,
};

pub const PLAN_VERSION: u32 = 2;

/// One step of a rendered plan. Later actions refer to earlier ones by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Disk {
        id: String,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        serial: Option<String>,
        #[serde(default)]
        name: Option<String>,
        size: u64,
        #[serde(default)]
        ptable: Option<PartitionTable>,
        #[serde(default)]
        preserve: bool,
        #[serde(default)]
        wipe: Option<Wipe>,
        #[serde(default)]
        grub_device: bool,
    },
    Partition {
        id: String,
        device: String,
        number: u32,
        offset: u64,
        size: u64,
        #[serde(default)]
        flag: Option<PartitionFlag>,
        #[serde(default)]
        wipe: Option<Wipe>,
        #[serde(default)]
        preserve: bool,
        #[serde(default)]
        grub_device: bool,
        #[serde(default)]
        resize: bool,
        #[serde(default)]
        partition_type: Option<String>,
        #[serde(default)]
        partition_name: Option<String>,
    },
    Raid {
        id: String,
        name: String,
        raidlevel: RaidLevel,
        devices: Vec<String>,
        #[serde(default)]
        spare_devices: Vec<String>,
        #[serde(default)]
        ptable: Option<PartitionTable>,
        #[serde(default)]
        preserve: bool,
        #[serde(default)]
        wipe: Option<Wipe>,
    },
    LvmVolgroup {
        id: String,
        name: String,
        devices: Vec<String>,
        #[serde(default)]
        preserve: bool,
    },
    LvmPartition {
        id: String,
        volgroup: String,
        name: String,
        size: u64,
        #[serde(default)]
        preserve: bool,
        #[serde(default)]
        wipe: Option<Wipe>,
    },
    /// Key material is handed to the executor separately and never
    /// appears in a plan.
    DmCrypt {
        id: String,
        volume: String,
        #[serde(default)]
        keyfile: Option<String>,
        #[serde(default)]
        recovery_key: Option<RecoveryKey>,
        #[serde(default)]
        options: Vec<String>,
        #[serde(default)]
        preserve: bool,
    },
    Zpool {
        id: String,
        vdevs: Vec<String>,
        pool: String,
        mountpoint: String,
        #[serde(default)]
        pool_properties: BTreeMap<String, String>,
        #[serde(default)]
        fs_properties: BTreeMap<String, String>,
        #[serde(default)]
        default_features: bool,
        #[serde(default)]
        encryption_style: Option<ZfsEncryption>,
        #[serde(default)]
        preserve: bool,
    },
    Zfs {
        id: String,
        pool: String,
        volume: String,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
    Format {
        id: String,
        volume: String,
        fstype: String,
        #[serde(default)]
        preserve: bool,
        #[serde(default)]
        label: Option<String>,
    },
    Mount {
        id: String,
        device: String,
        /// Empty for swap.
        #[serde(default)]
        path: String,
    },
    Device {
        id: String,
        path: String,
    },
    /// Write the install image over `device` verbatim.
    Image { id: String, device: String },
}

impl Action {
    pub fn id(&self) -> &str {
        match self {
            Action::Disk { id, .. }
            | Action::Partition { id, .. }
            | Action::Raid { id, .. }
            | Action::LvmVolgroup { id, .. }
            | Action::LvmPartition { id, .. }
            | Action::DmCrypt { id, .. }
            | Action::Zpool { id, .. }
            | Action::Zfs { id, .. }
            | Action::Format { id, .. }
            | Action::Mount { id, .. }
            | Action::Device { id, .. }
            | Action::Image { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapSettings {
    /// 0 disables the swap file.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePlan {
    pub version: u32,
    pub config: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<SwapSettings>,
}

fn action_id(model: &StorageModel, id: EntityId) -> String {
    match model.kind_of(id) {
        Some(kind) => format!("{}-{}", kind.action_type(), id.0),
        None => format!("missing-{}", id.0),
    }
}

fn ids(model: &StorageModel, members: &BTreeSet<EntityId>) -> Vec<String> {
    members.iter().map(|id| action_id(model, *id)).collect()
}

/// Entities that must be rendered before `entity`.
fn dependencies(model: &StorageModel, entity: &Entity) -> Vec<EntityId> {
    match entity {
        Entity::Disk(_) | Entity::Arbitrary(_) => Vec::new(),
        Entity::Partition(part) => {
            let mut deps = vec![part.device];
            let previous = model
                .partitions_of(part.device)
                .into_iter()
                .filter(|other| other.number < part.number)
                .max_by_key(|other| other.number);
            deps.extend(previous.map(|other| other.id));
            deps
        }
        Entity::Raid(raid) => raid
            .devices
            .iter()
            .chain(raid.spare_devices.iter())
            .copied()
            .collect(),
        Entity::VolumeGroup(vg) => vg.devices.iter().copied().collect(),
        Entity::LogicalVolume(lv) => vec![lv.volume_group],
        Entity::DmCrypt(dm) => vec![dm.volume],
        Entity::ZPool(pool) => pool.devices.iter().copied().collect(),
        Entity::Zfs(zfs) => {
            let mut deps = vec![zfs.pool];
            deps.extend(
                model
                    .zfs_datasets_of(zfs.pool)
                    .into_iter()
                    .filter(|other| zfs.volume.starts_with(&format!("{}/", other.volume)))
                    .map(|other| other.id),
            );
            deps
        }
        Entity::Filesystem(fs) => vec![fs.volume],
        Entity::Mount(mount) => {
            let mut deps = vec![mount.filesystem];
            if !mount.path.is_empty() {
                deps.extend(
                    model
                        .all_mounts()
                        .into_iter()
                        .filter(|other| {
                            other.id != mount.id
                                && !other.path.is_empty()
                                && is_parent_path(&other.path, &mount.path)
                        })
                        .map(|other| other.id),
                );
            }
            deps
        }
    }
}

fn is_parent_path(parent: &str, child: &str) -> bool {
    if parent == "/" {
        return child != "/";
    }
    child
        .strip_prefix(parent)
        .is_some_and(|rest| rest.starts_with('/'))
}

fn to_action(model: &StorageModel, entity: &Entity) -> Action {
    let id = |entity_id| action_id(model, entity_id);
    match entity {
        Entity::Disk(disk) => Action::Disk {
            id: id(disk.id),
            path: disk.path.clone(),
            serial: disk.serial.clone(),
            name: disk.name.clone(),
            size: disk.size,
            ptable: disk.ptable,
            preserve: disk.preserve,
            wipe: disk.wipe,
            grub_device: disk.grub_device,
        },
        Entity::Partition(part) => Action::Partition {
            id: id(part.id),
            device: id(part.device),
            number: part.number,
            offset: part.offset,
            size: part.size,
            flag: part.flag,
            wipe: part.wipe,
            preserve: part.preserve,
            grub_device: part.grub_device,
            resize: part.resize,
            partition_type: part.partition_type.clone(),
            partition_name: part.partition_name.clone(),
        },
        Entity::Raid(raid) => Action::Raid {
            id: id(raid.id),
            name: raid.name.clone(),
            raidlevel: raid.level,
            devices: ids(model, &raid.devices),
            spare_devices: ids(model, &raid.spare_devices),
            ptable: raid.ptable,
            preserve: raid.preserve,
            wipe: raid.wipe,
        },
        Entity::VolumeGroup(vg) => Action::LvmVolgroup {
            id: id(vg.id),
            name: vg.name.clone(),
            devices: ids(model, &vg.devices),
            preserve: vg.preserve,
        },
        Entity::LogicalVolume(lv) => Action::LvmPartition {
            id: id(lv.id),
            volgroup: id(lv.volume_group),
            name: lv.name.clone(),
            size: lv.size,
            preserve: lv.preserve,
            wipe: lv.wipe,
        },
        Entity::DmCrypt(dm) => Action::DmCrypt {
            id: id(dm.id),
            volume: id(dm.volume),
            keyfile: dm.keyfile.clone(),
            recovery_key: dm.recovery_key.clone(),
            options: dm.options.clone(),
            preserve: dm.preserve,
        },
        Entity::ZPool(pool) => Action::Zpool {
            id: id(pool.id),
            vdevs: ids(model, &pool.devices),
            pool: pool.pool.clone(),
            mountpoint: pool.mountpoint.clone(),
            pool_properties: pool.pool_properties.clone(),
            fs_properties: pool.fs_properties.clone(),
            default_features: pool.default_features,
            encryption_style: pool.encryption_style,
            preserve: pool.preserve,
        },
        Entity::Zfs(zfs) => Action::Zfs {
            id: id(zfs.id),
            pool: id(zfs.pool),
            volume: zfs.volume.clone(),
            properties: zfs.properties.clone(),
        },
        Entity::Filesystem(fs) => Action::Format {
            id: id(fs.id),
            volume: id(fs.volume),
            fstype: fs.fstype.clone(),
            preserve: fs.preserve,
            label: fs.label.clone(),
        },
        Entity::Mount(mount) => Action::Mount {
            id: id(mount.id),
            device: id(mount.filesystem),
            path: mount.path.clone(),
        },
        Entity::Arbitrary(device) => Action::Device {
            id: id(device.id),
            path: device.path.clone(),
        },
    }
}

/// Every entity as an action, each after everything it depends on.
pub fn render_actions(model: &StorageModel) -> Result<Vec<Action>> {
    let mut pending = model
        .entities()
        .map(|entity| (entity, dependencies(model, entity)))
        .collect::<Vec<_>>();
    for (entity, deps) in &pending {
        if let Some(missing) = deps.iter().find(|dep| !model.contains(**dep)) {
            return Err(StorageError::Render(format!(
                "{} refers to missing entity {missing}",
                action_id(model, entity_id(entity))
            )));
        }
    }

    let mut emitted = BTreeSet::new();
    let mut actions = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let before = pending.len();
        let mut blocked = Vec::new();
        for (entity, deps) in pending {
            if deps.iter().all(|dep| emitted.contains(dep)) {
                emitted.insert(entity_id(entity));
                actions.push(to_action(model, entity));
            } else {
                blocked.push((entity, deps));
            }
        }
        if blocked.len() == before {
            let stuck = blocked
                .iter()
                .map(|(entity, _)| action_id(model, entity_id(entity)))
                .collect::<Vec<_>>();
            return Err(StorageError::Render(format!(
                "dependency cycle between {}",
                stuck.join(", ")
            )));
        }
        pending = blocked;
    }
    if let Some(target) = model.dd_target {
        actions.push(Action::Image {
            id: format!("image-{}", target.0),
            device: action_id(model, target),
        });
    }
    debug!("rendered {} actions", actions.len());
    Ok(actions)
}

/// The full plan handed to the execution tool.
pub fn render(model: &StorageModel) -> Result<StoragePlan> {
    Ok(StoragePlan {
        version: PLAN_VERSION,
        config: render_actions(model)?,
        swap: model
            .swap_file_suppressed()
            .then_some(SwapSettings { size: 0 }),
    })
}

fn entity_id(entity: &Entity) -> EntityId {
    match entity {
        Entity::Disk(e) => e.id,
        Entity::Partition(e) => e.id,
        Entity::Raid(e) => e.id,
        Entity::VolumeGroup(e) => e.id,
        Entity::LogicalVolume(e) => e.id,
        Entity::DmCrypt(e) => e.id,
        Entity::ZPool(e) => e.id,
        Entity::Zfs(e) => e.id,
        Entity::Filesystem(e) => e.id,
        Entity::Mount(e) => e.id,
        Entity::Arbitrary(e) => e.id,
    }
}

struct IdMap(HashMap<String, EntityId>);

impl IdMap {
    fn get(&self, id: &str) -> Result<EntityId> {
        self.0
            .get(id)
            .copied()
            .ok_or_else(|| StorageError::Render(format!("reference to unknown action {id}")))
    }

    fn set(&self, ids: &[String]) -> Result<BTreeSet<EntityId>> {
        ids.iter().map(|id| self.get(id)).collect()
    }
}

/// Rebuild a model from a rendered action list.
pub fn model_from_actions(actions: &[Action], bootloader: Bootloader) -> Result<StorageModel> {
    let mut model = StorageModel::new(bootloader);
    let mut map = IdMap(HashMap::new());
    for action in actions {
        let created = match action {
            Action::Disk {
                path,
                serial,
                name,
                size,
                ptable,
                preserve,
                wipe,
                grub_device,
                ..
            } => model.add_disk(Disk {
                path: path.clone(),
                serial: serial.clone(),
                name: name.clone(),
                size: *size,
                ptable: *ptable,
                preserve: *preserve,
                wipe: *wipe,
                grub_device: *grub_device,
                ..Disk::default()
            }),
            Action::Partition {
                device,
                number,
                offset,
                size,
                flag,
                wipe,
                preserve,
                grub_device,
                resize,
                partition_type,
                partition_name,
                ..
            } => model.add_partition(Partition {
                device: map.get(device)?,
                number: *number,
                offset: *offset,
                size: *size,
                flag: *flag,
                wipe: *wipe,
                preserve: *preserve,
                grub_device: *grub_device,
                resize: *resize,
                partition_type: partition_type.clone(),
                partition_name: partition_name.clone(),
                ..Partition::default()
            })?,
            Action::Raid {
                name,
                raidlevel,
                devices,
                spare_devices,
                ptable,
                preserve,
                wipe,
                ..
            } => {
                let raid = model.add_raid(
                    name,
                    *raidlevel,
                    map.set(devices)?,
                    map.set(spare_devices)?,
                )?;
                model.raid_mut(raid)?.ptable = *ptable;
                model.set_preserve(raid, *preserve);
                model.set_wipe(raid, *wipe);
                raid
            }
            Action::LvmVolgroup {
                name,
                devices,
                preserve,
                ..
            } => {
                let vg = model.add_volume_group(name, map.set(devices)?)?;
                model.set_preserve(vg, *preserve);
                vg
            }
            Action::LvmPartition {
                volgroup,
                name,
                size,
                preserve,
                wipe,
                ..
            } => {
                let lv = model.add_logical_volume(map.get(volgroup)?, name, *size)?;
                model.set_preserve(lv, *preserve);
                model.set_wipe(lv, *wipe);
                lv
            }
            Action::DmCrypt {
                volume,
                keyfile,
                recovery_key,
                options,
                preserve,
                ..
            } => {
                let dm = model.add_dm_crypt(
                    map.get(volume)?,
                    None,
                    keyfile.clone(),
                    recovery_key.clone(),
                    options.clone(),
                )?;
                model.set_preserve(dm, *preserve);
                dm
            }
            Action::Zpool {
                vdevs,
                pool,
                mountpoint,
                pool_properties,
                fs_properties,
                default_features,
                encryption_style,
                preserve,
                ..
            } => {
                let zpool = model.add_zpool(
                    map.set(vdevs)?,
                    pool,
                    mountpoint,
                    pool_properties.clone(),
                    fs_properties.clone(),
                    *default_features,
                    *encryption_style,
                    None,
                )?;
                model.set_preserve(zpool, *preserve);
                zpool
            }
            Action::Zfs {
                pool,
                volume,
                properties,
                ..
            } => model.add_zfs(map.get(pool)?, volume, properties.clone())?,
            Action::Format {
                volume,
                fstype,
                preserve,
                label,
                ..
            } => model.add_filesystem(map.get(volume)?, fstype, *preserve, label.clone())?,
            Action::Mount { device, path, .. } => model.add_mount(map.get(device)?, path)?,
            Action::Device { path, .. } => model.add_arbitrary_device(path),
            Action::Image { device, .. } => {
                let target = map.get(device)?;
                model.dd_target = Some(target);
                target
            }
        };
        if map.0.insert(action.id().to_string(), created).is_some() {
            return Err(StorageError::Render(format!(
                "duplicate action id {}",
                action.id()
            )));
        }
    }
    model.check_invariants()?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::{model_from_actions, render, render_actions, Action};
    use crate::error::StorageError;
    use crate::gaps::largest_gap;
    use crate::manipulator::{create_partition, PartitionSpec};
    use crate::model::{Bootloader, Disk, EntityId, StorageModel};
    use crate::units::{GIB, MIB};

    fn disk_with_parts() -> (StorageModel, EntityId) {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let disk = model.add_disk(Disk {
            path: Some("/dev/vda".to_string()),
            size: 20 * GIB,
            ..Disk::default()
        });
        for (size, mount) in [(GIB, "/boot"), (4 * GIB, "/"), (2 * GIB, "/home")] {
            let gap = largest_gap(&model, disk).expect("gap");
            create_partition(
                &mut model,
                disk,
                gap,
                &PartitionSpec::new(size, Some("ext4"), Some(mount)),
            )
            .expect("partition");
        }
        (model, disk)
    }

    fn position(actions: &[Action], pred: impl Fn(&Action) -> bool) -> usize {
        actions.iter().position(pred).expect("action present")
    }

    #[test]
    fn parent_mounts_come_first() {
        let (model, _) = disk_with_parts();
        let actions = render_actions(&model).expect("renders");
        let root = position(&actions, |a| matches!(a, Action::Mount { path, .. } if path == "/"));
        let boot =
            position(&actions, |a| matches!(a, Action::Mount { path, .. } if path == "/boot"));
        let home =
            position(&actions, |a| matches!(a, Action::Mount { path, .. } if path == "/home"));
        assert!(root < boot);
        assert!(root < home);
    }

    #[test]
    fn partitions_render_by_number_after_their_disk() {
        let (model, _) = disk_with_parts();
        let actions = render_actions(&model).expect("renders");
        assert!(matches!(actions[0], Action::Disk { .. }));
        let numbers = actions
            .iter()
            .filter_map(|a| match a {
                Action::Partition { number, .. } => Some(*number),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn round_trip_keeps_offsets_sizes_and_flags() {
        let (model, disk) = disk_with_parts();
        let plan = render(&model).expect("renders");
        let json = serde_json::to_string(&plan.config).expect("serializes");
        let actions: Vec<Action> = serde_json::from_str(&json).expect("parses");
        let rebuilt = model_from_actions(&actions, Bootloader::Uefi).expect("rebuilds");
        let before = model
            .partitions_of(disk)
            .iter()
            .map(|p| (p.number, p.offset, p.size, p.flag))
            .collect::<Vec<_>>();
        let rebuilt_disk = rebuilt.all_disks()[0].id;
        let after = rebuilt
            .partitions_of(rebuilt_disk)
            .iter()
            .map(|p| (p.number, p.offset, p.size, p.flag))
            .collect::<Vec<_>>();
        assert_eq!(before, after);
        assert!(rebuilt.mount_for_path("/home").is_some());
    }

    #[test]
    fn dm_crypt_key_never_rendered() {
        let mut model = StorageModel::new(Bootloader::None);
        let disk = model.add_disk(Disk {
            size: 10 * GIB,
            ..Disk::default()
        });
        model
            .add_dm_crypt(
                disk,
                Some(crate::model::Secret::new("hunter22")),
                None,
                None,
                Vec::new(),
            )
            .expect("dm_crypt");
        let json = serde_json::to_string(&render(&model).expect("renders")).expect("json");
        assert!(!json.contains("hunter22"));
        assert!(json.contains("\"type\":\"dm_crypt\""));
    }

    #[test]
    fn swap_mount_disables_swap_file() {
        let mut model = StorageModel::new(Bootloader::None);
        let disk = model.add_disk(Disk {
            size: 10 * GIB,
            ..Disk::default()
        });
        let gap = largest_gap(&model, disk).expect("gap");
        create_partition(&mut model, disk, gap, &PartitionSpec::new(512 * MIB, Some("swap"), None))
            .expect("swap");
        let plan = render(&model).expect("renders");
        assert_eq!(plan.swap.map(|s| s.size), Some(0));
    }

    #[test]
    fn dangling_reference_is_a_render_error() {
        let actions = vec![Action::Format {
            id: "format-1".to_string(),
            volume: "partition-9".to_string(),
            fstype: "ext4".to_string(),
            preserve: false,
            label: None,
        }];
        let err = model_from_actions(&actions, Bootloader::None).expect_err("unknown volume");
        assert!(matches!(err, StorageError::Render(_)));
    }

    #[test]
    fn dd_target_renders_image_action() {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let disk = model.add_disk(Disk {
            size: 10 * GIB,
            ..Disk::default()
        });
        model.dd_target = Some(disk);
        let actions = render_actions(&model).expect("renders");
        assert!(matches!(actions.last(), Some(Action::Image { .. })));
        let rebuilt = model_from_actions(&actions, Bootloader::Uefi).expect("rebuilds");
        assert!(rebuilt.dd_target.is_some());
    }
}
