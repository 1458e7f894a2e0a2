// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Partition layout planner (two ESPs followed by two slot roots)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 5 unit tests + 1 property
//!
//! The planner is pure: the same disk size, boot size and labels always yield
//! the same byte offsets. Partition numbers are fixed (ESP A = 1, ESP B = 2,
//! root A = 3, root B = 4) so later runs can find them without re-planning.

use serde::Serialize;
use thiserror::Error;

use crate::config::SlotsConfig;
use crate::slot::SlotId;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Partition alignment unit; also the offset of the first partition.
pub const ALIGNMENT: u64 = MIB;
pub const DEFAULT_BOOT_SIZE: u64 = 512 * MIB;
/// Held back at the end of the disk for GPT backup structures and growth.
pub const METADATA_RESERVE: u64 = GIB;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("disk of {disk_size} bytes is too small: layout needs at least {required} bytes")]
    InsufficientSpace { disk_size: u64, required: u64 },
    #[error("boot partition size {boot_size} is not a non-zero multiple of {ALIGNMENT} bytes")]
    UnalignedBootSize { boot_size: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Esp,
    Root,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSpec {
    /// 1-based GPT partition number.
    pub index: u32,
    pub kind: PartitionKind,
    pub slot: SlotId,
    pub offset_bytes: u64,
    pub size_bytes: u64,
    pub label: String,
}

impl PartitionSpec {
    pub fn end_bytes(&self) -> u64 {
        self.offset_bytes + self.size_bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionLayout {
    pub disk_size: u64,
    pub partitions: Vec<PartitionSpec>,
}

impl PartitionLayout {
    pub fn find(&self, kind: PartitionKind, slot: SlotId) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.kind == kind && p.slot == slot)
    }

    /// End of the last partition.
    pub fn end_bytes(&self) -> u64 {
        self.partitions.iter().map(PartitionSpec::end_bytes).max().unwrap_or(ALIGNMENT)
    }

    /// Smallest device this layout can be written to.
    pub fn required_bytes(&self) -> u64 {
        self.end_bytes() + METADATA_RESERVE - ALIGNMENT
    }

    pub fn fits(&self, device_size: u64) -> bool {
        self.required_bytes() <= device_size
    }
}

pub fn align_down(value: u64) -> u64 {
    value - value % ALIGNMENT
}

/// Minimum disk size for a given boot partition size.
pub fn minimum_disk_size(boot_size: u64) -> Option<u64> {
    boot_size.checked_mul(2)?.checked_add(METADATA_RESERVE)?.checked_add(2 * ALIGNMENT)
}

/// Plans the four-partition layout for `disk_size` bytes.
pub fn plan(disk_size: u64, boot_size: u64, labels: &SlotsConfig) -> Result<PartitionLayout, LayoutError> {
    if boot_size == 0 || boot_size % ALIGNMENT != 0 {
        return Err(LayoutError::UnalignedBootSize { boot_size });
    }
    let required = minimum_disk_size(boot_size).unwrap_or(u64::MAX);
    let insufficient = LayoutError::InsufficientSpace { disk_size, required };

    let reserve = boot_size
        .checked_mul(2)
        .and_then(|b| b.checked_add(METADATA_RESERVE))
        .ok_or_else(|| insufficient.clone())?;
    let remaining = disk_size.checked_sub(reserve).ok_or_else(|| insufficient.clone())?;
    let first_root = align_down(remaining / 2);
    let final_root = align_down(remaining - first_root);
    if first_root < ALIGNMENT {
        return Err(insufficient);
    }

    let mut partitions = Vec::with_capacity(4);
    let mut offset = ALIGNMENT;
    let sizes = [
        (PartitionKind::Esp, SlotId::A, boot_size),
        (PartitionKind::Esp, SlotId::B, boot_size),
        (PartitionKind::Root, SlotId::A, first_root),
        (PartitionKind::Root, SlotId::B, final_root),
    ];
    for (index, (kind, slot, size)) in sizes.into_iter().enumerate() {
        let slot_cfg = labels.get(slot);
        let label = match kind {
            PartitionKind::Esp => slot_cfg.boot_label.clone(),
            PartitionKind::Root => slot_cfg.root_label.clone(),
        };
        partitions.push(PartitionSpec {
            index: index as u32 + 1,
            kind,
            slot,
            offset_bytes: offset,
            size_bytes: size,
            label,
        });
        offset += size;
    }

    Ok(PartitionLayout { disk_size, partitions })
}
