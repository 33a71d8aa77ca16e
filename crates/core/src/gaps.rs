//! Free-space accounting for partitionable devices and volume groups.
//!
//! Gaps are derived on demand from the model and never stored.

use serde::Serialize;

use crate::model::{EntityId, EntityKind, Partition, PartitionTable, StorageModel, LVM_CHUNK_SIZE};
use crate::units::{align_down, align_up};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GapUsable {
    Yes,
    TooManyPrimaryPartitions,
    /// Alignment slack, the partition table head or its tail reserve.
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub device: EntityId,
    pub offset: u64,
    pub size: u64,
    pub in_extended: bool,
    pub usable: GapUsable,
}

impl Gap {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn is_usable(&self) -> bool {
        self.usable == GapUsable::Yes
    }

    /// Split off a leading gap of `size` bytes (rounded up to the
    /// device alignment, but never past the end of this gap).
    pub fn split(&self, model: &StorageModel, size: u64) -> (Gap, Option<Gap>) {
        let alignment = model.alignment_of(self.device);
        let first_size = align_up(size, alignment.part_align).min(self.size);
        if first_size >= self.size {
            return (*self, None);
        }
        let first = Gap {
            size: first_size,
            ..*self
        };
        let lead = if self.in_extended { alignment.ebr_space } else { 0 };
        let rest_offset = self.offset + first_size + lead;
        if rest_offset + alignment.part_align > self.end() {
            return (first, None);
        }
        let rest = Gap {
            offset: rest_offset,
            size: self.end() - rest_offset,
            ..*self
        };
        (first, Some(rest))
    }

    /// First current gap lying wholly inside this (possibly stale) gap.
    pub fn within(&self, model: &StorageModel) -> Option<Gap> {
        gaps(model, self.device)
            .into_iter()
            .filter(|gap| gap.usable != GapUsable::Reserved)
            .find(|gap| gap.offset >= self.offset && gap.end() <= self.end())
    }
}

/// A partition or a gap, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartOrGap<'a> {
    Part(&'a Partition),
    Gap(Gap),
}

/// Every free extent of `device`, covering exactly the bytes not taken
/// by partitions. Formatted devices and members of constructed devices
/// have no gaps.
pub fn gaps(model: &StorageModel, device: EntityId) -> Vec<Gap> {
    match model.kind_of(device) {
        Some(EntityKind::Disk | EntityKind::Raid) => disk_gaps(model, device),
        Some(EntityKind::VolumeGroup) => volume_group_gaps(model, device),
        _ => Vec::new(),
    }
}

fn disk_gaps(model: &StorageModel, device: EntityId) -> Vec<Gap> {
    if model.filesystem_of(device).is_some() || model.constructed_device_of(device).is_some() {
        return Vec::new();
    }
    let size = model.size_of(device);
    let ptable = model.ptable_of(device).unwrap_or(PartitionTable::Gpt);
    let alignment = ptable.alignment();
    let parts = model.partitions_of(device);

    let primaries = parts.iter().filter(|p| !p.is_logical()).collect::<Vec<_>>();
    let usable = match alignment.primary_part_limit {
        Some(limit) if primaries.len() >= limit => GapUsable::TooManyPrimaryPartitions,
        _ if parts.len() >= alignment.max_partitions as usize => GapUsable::TooManyPrimaryPartitions,
        _ => GapUsable::Yes,
    };

    let mut out = Vec::new();
    let top = Carver {
        device,
        lower: alignment.min_start_offset,
        upper: align_down(size, alignment.part_align).saturating_sub(alignment.end_reserve),
        lead: 0,
        align: alignment.part_align,
        usable,
        in_extended: false,
    };
    let mut cursor = 0;
    for part in &primaries {
        top.carve(cursor, part.offset, &mut out);
        cursor = cursor.max(part.end());
    }
    top.carve(cursor, size, &mut out);

    if let Some(extended) = primaries.iter().find(|p| p.is_extended()) {
        let inner = Carver {
            device,
            lower: extended.offset,
            upper: extended.end(),
            lead: alignment.ebr_space,
            align: alignment.part_align,
            usable: GapUsable::Yes,
            in_extended: true,
        };
        let mut cursor = extended.offset;
        for logical in parts.iter().filter(|p| p.is_logical()) {
            inner.carve(cursor, logical.offset, &mut out);
            cursor = cursor.max(logical.end());
        }
        inner.carve(cursor, extended.end(), &mut out);
    }
    out.sort_by_key(|gap| gap.offset);
    out
}

struct Carver {
    device: EntityId,
    lower: u64,
    upper: u64,
    lead: u64,
    align: u64,
    usable: GapUsable,
    in_extended: bool,
}

impl Carver {
    /// Split the free extent `[from, to)` into an aligned usable piece and
    /// reserved slack on either side of it.
    fn carve(&self, from: u64, to: u64, out: &mut Vec<Gap>) {
        if to <= from {
            return;
        }
        let start = align_up((from + self.lead).max(self.lower), self.align);
        let end = align_down(to.min(self.upper), self.align);
        let gap = |offset: u64, size: u64, usable: GapUsable| Gap {
            device: self.device,
            offset,
            size,
            in_extended: self.in_extended,
            usable,
        };
        if end > start && end - start >= self.align {
            if start > from {
                out.push(gap(from, start - from, GapUsable::Reserved));
            }
            out.push(gap(start, end - start, self.usable));
            if to > end {
                out.push(gap(end, to - end, GapUsable::Reserved));
            }
        } else {
            out.push(gap(from, to - from, GapUsable::Reserved));
        }
    }
}

fn volume_group_gaps(model: &StorageModel, vg: EntityId) -> Vec<Gap> {
    let used: u64 = model.logical_volumes_of(vg).iter().map(|lv| lv.size).sum();
    let remaining = align_down(model.size_of(vg).saturating_sub(used), LVM_CHUNK_SIZE);
    if remaining < LVM_CHUNK_SIZE {
        return Vec::new();
    }
    vec![Gap {
        device: vg,
        offset: used,
        size: remaining,
        in_extended: false,
        usable: GapUsable::Yes,
    }]
}

pub fn usable_gaps(model: &StorageModel, device: EntityId) -> Vec<Gap> {
    gaps(model, device)
        .into_iter()
        .filter(Gap::is_usable)
        .collect()
}

/// Partitions and non-reserved gaps interleaved by offset.
pub fn parts_and_gaps(model: &StorageModel, device: EntityId) -> Vec<PartOrGap<'_>> {
    let mut items = model
        .partitions_of(device)
        .into_iter()
        .map(PartOrGap::Part)
        .chain(
            gaps(model, device)
                .into_iter()
                .filter(|gap| gap.usable != GapUsable::Reserved)
                .map(PartOrGap::Gap),
        )
        .collect::<Vec<_>>();
    items.sort_by_key(|item| match item {
        PartOrGap::Part(part) => (part.offset, 0),
        PartOrGap::Gap(gap) => (gap.offset, 1),
    });
    items
}

/// Largest usable gap; ties go to the lowest offset.
pub fn largest_gap(model: &StorageModel, device: EntityId) -> Option<Gap> {
    usable_gaps(model, device)
        .into_iter()
        .fold(None, |best: Option<Gap>, gap| match best {
            Some(current) if current.size >= gap.size => Some(current),
            _ => Some(gap),
        })
}

pub fn largest_gap_size(model: &StorageModel, device: EntityId) -> u64 {
    largest_gap(model, device).map(|gap| gap.size).unwrap_or(0)
}

pub fn gap_at_offset(model: &StorageModel, device: EntityId, offset: u64) -> Option<Gap> {
    usable_gaps(model, device)
        .into_iter()
        .find(|gap| gap.offset == offset)
}

/// The usable gap directly following `part`, if nothing sits between them.
pub fn gap_after(model: &StorageModel, part: &Partition) -> Option<Gap> {
    let items = parts_and_gaps(model, part.device);
    let index = items
        .iter()
        .position(|item| matches!(item, PartOrGap::Part(p) if p.id == part.id))?;
    match items.get(index + 1) {
        Some(PartOrGap::Gap(gap)) if gap.in_extended == part.is_logical() && gap.is_usable() => {
            Some(*gap)
        }
        _ => None,
    }
}

pub fn first_gap_with_size(
    model: &StorageModel,
    device: EntityId,
    size: u64,
    in_extended: bool,
) -> Option<Gap> {
    usable_gaps(model, device)
        .into_iter()
        .find(|gap| gap.in_extended == in_extended && gap.size >= size)
}

/// How many more partitions `device` can number: primaries, or logicals
/// when `in_extended`.
pub fn free_partition_slots(model: &StorageModel, device: EntityId, in_extended: bool) -> usize {
    let alignment = model.alignment_of(device);
    let parts = model.partitions_of(device);
    let max = alignment.max_partitions as usize;
    if in_extended {
        let highest = parts
            .iter()
            .filter(|p| p.is_logical())
            .map(|p| p.number as usize)
            .max()
            .unwrap_or(4);
        return max.saturating_sub(highest);
    }
    let left = max.saturating_sub(parts.len());
    match alignment.primary_part_limit {
        Some(limit) => limit
            .saturating_sub(parts.iter().filter(|p| !p.is_logical()).count())
            .min(left),
        None => left,
    }
}

/// Partitions after `part` that could slide out of the way, and the size
/// of the gap that ends the run (0 if a preserved partition ends it).
pub fn movable_trailing_partitions_and_gap_size(
    model: &StorageModel,
    part: &Partition,
) -> (Vec<EntityId>, u64) {
    let items = parts_and_gaps(model, part.device);
    let Some(index) = items
        .iter()
        .position(|item| matches!(item, PartOrGap::Part(p) if p.id == part.id))
    else {
        return (Vec::new(), 0);
    };
    let in_extended = part.is_logical();
    let mut trailing = Vec::new();
    for item in &items[index + 1..] {
        match item {
            PartOrGap::Part(next) => {
                if next.preserve || (in_extended && !next.is_logical()) {
                    break;
                }
                trailing.push(next.id);
            }
            PartOrGap::Gap(gap) => {
                let size = if gap.in_extended == in_extended && gap.is_usable() {
                    gap.size
                } else {
                    0
                };
                return (trailing, size);
            }
        }
    }
    (trailing, 0)
}

#[cfg(test)]
mod tests {
    use super::{
        first_gap_with_size, free_partition_slots, gap_after, gaps, largest_gap,
        movable_trailing_partitions_and_gap_size, GapUsable,
    };
    use crate::model::{
        Bootloader, Disk, EntityId, Partition, PartitionFlag, PartitionTable, StorageModel,
    };
    use crate::units::{GIB, MIB};

    fn model_with_disk(size: u64, ptable: Option<PartitionTable>) -> (StorageModel, EntityId) {
        let mut model = StorageModel::new(Bootloader::Uefi);
        let disk = model.add_disk(Disk {
            path: Some("/dev/sda".to_string()),
            size,
            ptable,
            ..Disk::default()
        });
        (model, disk)
    }

    fn add(model: &mut StorageModel, device: EntityId, offset: u64, size: u64) -> EntityId {
        model
            .add_partition(Partition {
                device,
                offset,
                size,
                ..Partition::default()
            })
            .expect("partition fits")
    }

    fn assert_covers(model: &StorageModel, device: EntityId) {
        let mut extents = model
            .partitions_of(device)
            .iter()
            .filter(|p| !p.is_logical())
            .map(|p| (p.offset, p.end()))
            .chain(
                gaps(model, device)
                    .iter()
                    .filter(|g| !g.in_extended)
                    .map(|g| (g.offset, g.end())),
            )
            .collect::<Vec<_>>();
        extents.sort();
        let mut cursor = 0;
        for (start, end) in extents {
            assert_eq!(start, cursor, "hole or overlap at {cursor}");
            cursor = end;
        }
        assert_eq!(cursor, model.size_of(device));
    }

    #[test]
    fn empty_disk_has_one_aligned_usable_gap() {
        let (model, disk) = model_with_disk(1024 * MIB, None);
        let gap = largest_gap(&model, disk).expect("usable gap");
        assert_eq!(gap.offset, MIB);
        assert_eq!(gap.end(), 1023 * MIB);
        assert_covers(&model, disk);
    }

    #[test]
    fn partition_filling_the_gap_ends_one_mib_before_the_end() {
        let (mut model, disk) = model_with_disk(1024 * MIB, None);
        let gap = largest_gap(&model, disk).expect("usable gap");
        let part = add(&mut model, disk, gap.offset, gap.size);
        assert_eq!(model.partition(part).expect("exists").end(), 1024 * MIB - MIB);
        assert!(largest_gap(&model, disk).is_none());
        assert_covers(&model, disk);
    }

    #[test]
    fn gaps_cover_free_space_between_partitions() {
        let (mut model, disk) = model_with_disk(20 * GIB, None);
        add(&mut model, disk, MIB, GIB);
        add(&mut model, disk, 5 * GIB, GIB);
        let usable = gaps(&model, disk)
            .into_iter()
            .filter(|gap| gap.is_usable())
            .collect::<Vec<_>>();
        assert_eq!(usable.len(), 2);
        assert_eq!(usable[0].offset, GIB + MIB);
        assert_eq!(usable[0].end(), 5 * GIB);
        assert_covers(&model, disk);
    }

    #[test]
    fn unaligned_partition_leaves_reserved_slack() {
        let (mut model, disk) = model_with_disk(4 * GIB, None);
        add(&mut model, disk, MIB, GIB + 4096);
        let all = gaps(&model, disk);
        assert!(all
            .iter()
            .any(|gap| gap.usable == GapUsable::Reserved && gap.offset == GIB + MIB + 4096));
        assert_eq!(
            largest_gap(&model, disk).expect("gap").offset,
            GIB + 2 * MIB
        );
        assert_covers(&model, disk);
    }

    #[test]
    fn largest_gap_prefers_lowest_offset_on_ties() {
        let (mut model, disk) = model_with_disk(3 * GIB + 2 * MIB, None);
        add(&mut model, disk, GIB + MIB, GIB);
        let gap = largest_gap(&model, disk).expect("gap");
        assert_eq!(gap.offset, MIB);
        assert_eq!(gap.size, GIB);
    }

    #[test]
    fn msdos_disk_with_four_primaries_reports_too_many() {
        let (mut model, disk) = model_with_disk(10 * GIB, Some(PartitionTable::Msdos));
        for i in 0..4 {
            add(&mut model, disk, MIB + i * GIB, GIB);
        }
        let all = gaps(&model, disk);
        assert!(all
            .iter()
            .any(|gap| gap.usable == GapUsable::TooManyPrimaryPartitions));
        assert!(largest_gap(&model, disk).is_none());
    }

    #[test]
    fn partition_slots_follow_the_table_limits() {
        let (mut model, disk) = model_with_disk(10 * GIB, Some(PartitionTable::Msdos));
        add(&mut model, disk, MIB, GIB);
        add(&mut model, disk, GIB + MIB, GIB);
        add(&mut model, disk, 2 * GIB + MIB, GIB);
        assert_eq!(free_partition_slots(&model, disk, false), 1);
        assert_eq!(free_partition_slots(&model, disk, true), 124);
        add(&mut model, disk, 3 * GIB + MIB, GIB);
        assert_eq!(free_partition_slots(&model, disk, false), 0);

        let (mut gpt, disk) = model_with_disk(10 * GIB, None);
        add(&mut gpt, disk, MIB, GIB);
        assert_eq!(free_partition_slots(&gpt, disk, false), 127);
    }

    #[test]
    fn logical_gaps_leave_room_for_the_ebr() {
        let (mut model, disk) = model_with_disk(10 * GIB, Some(PartitionTable::Msdos));
        model
            .add_partition(Partition {
                device: disk,
                offset: MIB,
                size: 4 * GIB,
                flag: Some(PartitionFlag::Extended),
                ..Partition::default()
            })
            .expect("extended");
        let inner = first_gap_with_size(&model, disk, MIB, true).expect("logical gap");
        assert_eq!(inner.offset, 2 * MIB);
        assert_eq!(inner.end(), 4 * GIB + MIB);
        assert_covers(&model, disk);
    }

    #[test]
    fn formatted_disk_has_no_gaps() {
        let (mut model, disk) = model_with_disk(10 * GIB, None);
        model
            .add_filesystem(disk, "ext4", true, None)
            .expect("filesystem");
        assert!(gaps(&model, disk).is_empty());
    }

    #[test]
    fn split_never_rounds_past_the_gap() {
        let (model, disk) = model_with_disk(10 * MIB, None);
        let gap = largest_gap(&model, disk).expect("gap");
        let (first, rest) = gap.split(&model, gap.size - 1);
        assert_eq!(first, gap);
        assert!(rest.is_none());
        let (first, rest) = gap.split(&model, MIB + 1);
        assert_eq!(first.size, 2 * MIB);
        assert_eq!(rest.expect("remainder").offset, 3 * MIB);
    }

    #[test]
    fn trailing_partitions_stop_at_the_next_gap() {
        let (mut model, disk) = model_with_disk(10 * GIB, None);
        let first = add(&mut model, disk, MIB, GIB);
        let second = add(&mut model, disk, GIB + MIB, GIB);
        let part = model.partition(first).expect("exists").clone();
        let (movable, gap_size) = movable_trailing_partitions_and_gap_size(&model, &part);
        assert_eq!(movable, vec![second]);
        assert_eq!(gap_size, 10 * GIB - 2 * GIB - 2 * MIB);
        assert!(gap_after(&model, &part).is_none());
    }

    #[test]
    fn volume_group_gap_is_chunk_aligned() {
        let (mut model, disk) = model_with_disk(10 * GIB, None);
        let part = add(&mut model, disk, MIB, 5 * GIB);
        let vg = model
            .add_volume_group("vg0", [part].into())
            .expect("vg");
        model
            .add_logical_volume(vg, "lv0", GIB + 3 * MIB)
            .expect("lv");
        let gap = largest_gap(&model, vg).expect("vg gap");
        assert_eq!(gap.size % (4 * MIB), 0);
    }
}
