//! Probe data as reported by the hardware prober, and the preserved model
//! built from it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::model::{
    Bootloader, Disk, EntityId, OsInfo, Partition, PartitionFlag, PartitionTable, StorageModel,
};

/// What a probe run collects. A restricted run only lists block devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Blockdev,
    Defaults,
    FilesystemSizing,
    Os,
}

pub fn restricted_kinds() -> BTreeSet<ProbeKind> {
    BTreeSet::from([ProbeKind::Blockdev])
}

pub fn full_kinds(use_os_prober: bool) -> BTreeSet<ProbeKind> {
    let mut kinds = BTreeSet::from([ProbeKind::Defaults, ProbeKind::FilesystemSizing]);
    if use_os_prober {
        kinds.insert(ProbeKind::Os);
    }
    kinds
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProbeData {
    /// Keyed by device node.
    #[serde(default)]
    pub blockdev: BTreeMap<String, BlockDevice>,
    #[serde(default)]
    pub filesystem: BTreeMap<String, FilesystemInfo>,
    #[serde(default)]
    pub os: BTreeMap<String, OsInfo>,
    /// Mounts of the running system.
    #[serde(default)]
    pub mount: Vec<MountInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDevice {
    #[serde(rename = "DEVTYPE")]
    pub devtype: String,
    /// Bytes.
    pub size: u64,
    #[serde(default, rename = "ID_SERIAL")]
    pub serial: Option<String>,
    #[serde(default, rename = "ID_MODEL")]
    pub model: Option<String>,
    #[serde(default, rename = "ID_VENDOR")]
    pub vendor: Option<String>,
    #[serde(default)]
    pub rotational: Option<bool>,
    #[serde(default)]
    pub partitiontable: Option<SfdiskTable>,
}

/// A partition table in `sfdisk --json` form; offsets are in sectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SfdiskTable {
    pub label: String,
    #[serde(default = "default_sector_size")]
    pub sectorsize: u64,
    #[serde(default)]
    pub partitions: Vec<SfdiskPartition>,
}

fn default_sector_size() -> u64 {
    512
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SfdiskPartition {
    pub node: String,
    pub start: u64,
    pub size: u64,
    #[serde(rename = "type")]
    pub partition_type: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    #[serde(rename = "TYPE")]
    pub fstype: String,
    #[serde(default, rename = "LABEL")]
    pub label: Option<String>,
    /// Bytes the filesystem could shrink to.
    #[serde(default, rename = "ESTIMATED_MIN_SIZE")]
    pub estimated_min_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountInfo {
    pub source: String,
    pub target: String,
}

const GPT_ESP: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";
const GPT_BIOS_BOOT: &str = "21686148-6449-6e6f-744e-656564454649";
const GPT_PREP: &str = "9e1a2d38-c612-4316-aa26-8b49521e5a8b";
const GPT_SWAP: &str = "0657fd6d-a4ab-43c4-84e5-0933c84b4f4f";
const GPT_MSFT_RESERVED: &str = "e3c9e316-0b5c-4db8-817d-f92df00215ae";

fn gpt_flag(code: &str) -> Option<PartitionFlag> {
    match code.to_ascii_lowercase().as_str() {
        GPT_ESP => Some(PartitionFlag::Boot),
        GPT_BIOS_BOOT => Some(PartitionFlag::BiosGrub),
        GPT_PREP => Some(PartitionFlag::Prep),
        GPT_SWAP => Some(PartitionFlag::Swap),
        GPT_MSFT_RESERVED => Some(PartitionFlag::Msftres),
        _ => None,
    }
}

fn msdos_flag(code: &str, number: u32) -> Option<PartitionFlag> {
    let byte = u8::from_str_radix(code.trim_start_matches("0x"), 16).ok()?;
    match byte {
        0x05 | 0x0f | 0x85 => Some(PartitionFlag::Extended),
        _ if number >= 5 => Some(PartitionFlag::Logical),
        0xef => Some(PartitionFlag::Boot),
        0x41 => Some(PartitionFlag::Prep),
        0x82 => Some(PartitionFlag::Swap),
        _ => None,
    }
}

/// `/dev/nvme0n1p3` -> 3.
fn partition_number(node: &str) -> Option<u32> {
    let digits = node
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    digits.chars().rev().collect::<String>().parse().ok()
}

fn ptable_for_label(label: &str) -> Option<PartitionTable> {
    match label {
        "gpt" => Some(PartitionTable::Gpt),
        "dos" | "msdos" => Some(PartitionTable::Msdos),
        other => {
            warn!("ignoring unsupported partition table {other}");
            None
        }
    }
}

/// Build the model of what is on the disks right now: every entity is
/// preserved, partitions mounted by the live system are in use.
pub fn model_from_probe_data(data: &ProbeData, bootloader: Bootloader) -> Result<StorageModel> {
    let mut model = StorageModel::new(bootloader);
    let in_use = data
        .mount
        .iter()
        .map(|mount| mount.source.as_str())
        .collect::<BTreeSet<_>>();

    for (path, device) in data.blockdev.iter().filter(|(_, dev)| dev.devtype == "disk") {
        let table = device.partitiontable.as_ref();
        let ptable = table.and_then(|table| ptable_for_label(&table.label));
        let disk = model.add_disk(Disk {
            path: Some(path.clone()),
            serial: device.serial.clone(),
            model: device.model.clone(),
            vendor: device.vendor.clone(),
            rotational: device.rotational,
            size: device.size,
            ptable,
            preserve: true,
            ..Disk::default()
        });
        match (table, ptable) {
            (Some(table), Some(ptable)) => {
                add_probed_partitions(&mut model, data, disk, table, ptable, &in_use)?
            }
            _ => {
                if let Some(fs) = data.filesystem.get(path) {
                    model.add_filesystem(disk, &fs.fstype, true, fs.label.clone())?;
                }
            }
        }
    }
    model.check_invariants()?;
    debug!(
        "loaded {} disks from probe data",
        model.all_disks().len()
    );
    Ok(model)
}

fn add_probed_partitions(
    model: &mut StorageModel,
    data: &ProbeData,
    disk: EntityId,
    table: &SfdiskTable,
    ptable: PartitionTable,
    in_use: &BTreeSet<&str>,
) -> Result<()> {
    let mut partitions = table.partitions.iter().collect::<Vec<_>>();
    partitions.sort_by_key(|part| part.start);
    for probed in partitions {
        let number = partition_number(&probed.node).ok_or_else(|| {
            StorageError::invalid(format!("cannot number partition {}", probed.node))
        })?;
        let flag = match ptable {
            PartitionTable::Gpt => gpt_flag(&probed.partition_type),
            PartitionTable::Msdos => msdos_flag(&probed.partition_type, number),
        };
        let fs = data.filesystem.get(&probed.node);
        let part = model.add_partition(Partition {
            device: disk,
            number,
            offset: probed.start * table.sectorsize,
            size: probed.size * table.sectorsize,
            flag,
            preserve: true,
            is_in_use: in_use.contains(probed.node.as_str()),
            estimated_min_size: fs.and_then(|fs| fs.estimated_min_size),
            partition_type: Some(probed.partition_type.clone()),
            partition_name: probed.name.clone(),
            path: Some(probed.node.clone()),
            os: data.os.get(&probed.node).cloned(),
            original_fstype: fs.map(|fs| fs.fstype.clone()),
            ..Partition::default()
        })?;
        let holds_filesystem = !matches!(
            flag,
            Some(PartitionFlag::Extended | PartitionFlag::Prep | PartitionFlag::BiosGrub)
        );
        if let (Some(fs), true) = (fs, holds_filesystem) {
            model.add_filesystem(part, &fs.fstype, true, fs.label.clone())?;
        }
    }
    Ok(())
}
