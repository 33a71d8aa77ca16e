use serde::{Deserialize, Serialize};

use crate::model::{Bootloader, LVM_CHUNK_SIZE};
use crate::units::{align_down, align_up, GIB, MIB};

pub const BIOS_GRUB_SIZE: u64 = MIB;
pub const PREP_GRUB_SIZE: u64 = 8 * MIB;
pub const UEFI_GRUB_MAX_SIZE: u64 = 512 * MIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingPolicy {
    /// Leave room in the volume group for snapshots and later growth.
    #[default]
    Scaled,
    /// Give the root logical volume the whole volume group.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeValues {
    /// Largest install the shrunk partition leaves room for.
    pub install_max: u64,
    pub minimum: u64,
    pub recommended: u64,
    pub maximum: u64,
}

/// ESP size for a disk: half the disk, capped at 512 MiB.
pub fn efi_size(disk_size: u64) -> u64 {
    UEFI_GRUB_MAX_SIZE.min(disk_size / 2)
}

pub fn bootloader_partition_size(bootloader: Bootloader, disk_size: u64) -> u64 {
    match bootloader {
        Bootloader::None => 0,
        Bootloader::Bios => BIOS_GRUB_SIZE,
        Bootloader::Prep => PREP_GRUB_SIZE,
        Bootloader::Uefi => efi_size(disk_size),
    }
}

fn boot_reserve(bootloader: Bootloader) -> u64 {
    match bootloader {
        Bootloader::None => 0,
        Bootloader::Bios => BIOS_GRUB_SIZE,
        Bootloader::Prep => PREP_GRUB_SIZE,
        Bootloader::Uefi => UEFI_GRUB_MAX_SIZE,
    }
}

/// Smallest space a guided install is offered in.
pub fn install_minimum(bootloader: Bootloader, minimum_root_size: u64) -> u64 {
    align_up(boot_reserve(bootloader) + minimum_root_size, MIB)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionScaleFactors {
    pub minimum: u64,
    pub priority: u64,
    /// `None` takes whatever the other partitions leave.
    pub maximum: Option<u64>,
}

pub const UEFI_SCALE: PartitionScaleFactors = PartitionScaleFactors {
    minimum: 538 * MIB,
    priority: 538,
    maximum: Some(1075 * MIB),
};

pub const BOOTFS_SCALE: PartitionScaleFactors = PartitionScaleFactors {
    minimum: 1792 * MIB,
    priority: 1024,
    maximum: Some(2048 * MIB),
};

pub const ROOTFS_SCALE: PartitionScaleFactors = PartitionScaleFactors {
    minimum: 900 * MIB,
    priority: 10000,
    maximum: None,
};

/// Share `available` between partitions by priority, clamped to each
/// partition's bounds. The unbounded partition takes the remainder.
pub fn scale_partitions(factors: &[PartitionScaleFactors], available: u64) -> Vec<u64> {
    let total_priority: u64 = factors.iter().map(|f| f.priority).sum();
    if total_priority == 0 {
        return factors.iter().map(|f| f.minimum).collect();
    }
    let mut sizes = factors
        .iter()
        .map(|factor| {
            let scaled = (available as u128 * factor.priority as u128 / total_priority as u128) as u64;
            match factor.maximum {
                Some(maximum) => scaled.clamp(factor.minimum, maximum.max(factor.minimum)),
                None => scaled.max(factor.minimum),
            }
        })
        .collect::<Vec<_>>();
    if let Some(index) = factors.iter().position(|f| f.maximum.is_none()) {
        let used: u64 = sizes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, size)| *size)
            .sum();
        sizes[index] = available.saturating_sub(used).max(factors[index].minimum);
    }
    sizes
}

/// Size of a dedicated `/boot` for a guided layout with `available` bytes.
pub fn bootfs_size(available: u64) -> u64 {
    align_up(
        scale_partitions(&[UEFI_SCALE, BOOTFS_SCALE, ROOTFS_SCALE], available)[1],
        MIB,
    )
}

/// Root logical volume size for a fresh volume group.
pub fn lvm_size_for_vg(vg_size: u64, policy: SizingPolicy) -> u64 {
    if policy == SizingPolicy::All {
        return align_down(vg_size, LVM_CHUNK_SIZE);
    }
    let size = if vg_size < 10 * GIB {
        vg_size
    } else if vg_size < 20 * GIB {
        10 * GIB
    } else if vg_size < 200 * GIB {
        vg_size / 2
    } else {
        100 * GIB
    };
    align_down(size, LVM_CHUNK_SIZE)
}

/// Bounds for shrinking a partition to make room for an install.
/// Returns `None` when the partition cannot give up enough space.
pub fn calculate_guided_resize(
    estimated_min: u64,
    part_size: u64,
    install_min: u64,
    part_align: u64,
) -> Option<ResizeValues> {
    let minimum = align_up(estimated_min.max(install_min), part_align).min(part_size);
    let maximum = align_down(part_size.checked_sub(install_min)?, part_align);
    if minimum > maximum {
        return None;
    }
    let recommended = if part_size - minimum <= 2 * install_min {
        maximum
    } else {
        align_up(part_size / 2, part_align).clamp(minimum, maximum)
    };
    Some(ResizeValues {
        install_max: part_size - minimum,
        minimum,
        recommended,
        maximum,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        bootfs_size, bootloader_partition_size, calculate_guided_resize, efi_size,
        install_minimum, lvm_size_for_vg, SizingPolicy, BOOTFS_SCALE,
    };
    use crate::model::Bootloader;
    use crate::units::{GIB, MIB};

    #[test]
    fn lvm_ladder_thresholds() {
        assert_eq!(lvm_size_for_vg(5 * GIB, SizingPolicy::Scaled), 5 * GIB);
        assert_eq!(lvm_size_for_vg(15 * GIB, SizingPolicy::Scaled), 10 * GIB);
        assert_eq!(lvm_size_for_vg(100 * GIB, SizingPolicy::Scaled), 50 * GIB);
        assert_eq!(lvm_size_for_vg(500 * GIB, SizingPolicy::Scaled), 100 * GIB);
        assert_eq!(lvm_size_for_vg(500 * GIB, SizingPolicy::All), 500 * GIB);
    }

    #[test]
    fn efi_partition_sizes() {
        assert_eq!(efi_size(100 * GIB), 512 * MIB);
        assert_eq!(efi_size(800 * MIB), 400 * MIB);
        assert_eq!(bootloader_partition_size(Bootloader::Prep, 100 * GIB), 8 * MIB);
        assert_eq!(bootloader_partition_size(Bootloader::Bios, 100 * GIB), MIB);
        assert_eq!(bootloader_partition_size(Bootloader::None, 100 * GIB), 0);
    }

    #[test]
    fn bootfs_grows_with_the_disk_up_to_its_cap() {
        assert_eq!(bootfs_size(10 * GIB), BOOTFS_SCALE.minimum);
        assert_eq!(bootfs_size(1000 * GIB), 2048 * MIB);
    }

    #[test]
    fn resize_recommends_half_of_a_roomy_partition() {
        let install_min = install_minimum(Bootloader::Uefi, 8 * GIB);
        let values =
            calculate_guided_resize(10 * GIB, 100 * GIB, install_min, MIB).expect("resizable");
        assert_eq!(values.minimum, 10 * GIB);
        assert_eq!(values.maximum, 100 * GIB - install_min);
        assert_eq!(values.recommended, 50 * GIB);
        assert!(values.minimum <= values.recommended && values.recommended <= values.maximum);
    }

    #[test]
    fn resize_recommends_maximum_when_space_is_tight() {
        let install_min = install_minimum(Bootloader::Uefi, 8 * GIB);
        let values =
            calculate_guided_resize(GIB, 20 * GIB, install_min, MIB).expect("resizable");
        assert_eq!(values.recommended, values.maximum);
    }

    #[test]
    fn resize_rejected_when_partition_is_too_full() {
        let install_min = install_minimum(Bootloader::Uefi, 8 * GIB);
        assert!(calculate_guided_resize(15 * GIB, 20 * GIB, install_min, MIB).is_none());
    }
}
