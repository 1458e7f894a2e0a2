// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: GPT writer/scanner over a block device or disk image file
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 6 unit tests (sparse image files)
//!
//! Writes the protective MBR, the primary header and entry array, then the
//! backup entry array and header at the end of the device. Sector size is
//! fixed at 512 bytes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use gpt_disk_io::{BlockIo, Disk};
use gpt_disk_types::{
    guid, BlockSize, GptHeader, GptHeaderSignature, GptPartitionEntryArray, GptPartitionName,
    GptPartitionType, Guid, Lba, LbaLe, U32Le,
};
use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::layout::{PartitionKind, PartitionLayout};

const SECTOR: u64 = 512;
const ENTRY_COUNT: u32 = 128;
const ENTRY_SIZE: u32 = 128;
/// Sectors taken by one entry array copy.
const ENTRY_SECTORS: u64 = (ENTRY_COUNT as u64 * ENTRY_SIZE as u64) / SECTOR;

pub const LINUX_FILESYSTEM: GptPartitionType =
    GptPartitionType(guid!("0fc63daf-8483-4772-8e79-3d69d8477de4"));

#[derive(Debug, Error)]
pub enum GptError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("GPT access failed on {path}: {reason}")]
    Disk { path: PathBuf, reason: String },
    #[error("no valid GPT on {path}")]
    NoTable { path: PathBuf },
    #[error("{path} has {blocks} sectors; layout needs {required}")]
    TooSmall { path: PathBuf, blocks: u64, required: u64 },
    #[error("partition name {label:?} cannot be encoded in GPT")]
    InvalidLabel { label: String },
}

/// One used entry of a partition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GptPartition {
    /// 1-based partition number.
    pub index: u32,
    pub type_guid: String,
    pub unique_guid: String,
    pub name: String,
    pub first_lba: u64,
    pub last_lba: u64,
}

impl GptPartition {
    pub fn is_esp(&self) -> bool {
        self.type_guid == GptPartitionType::EFI_SYSTEM.0.to_string()
    }
}

/// `BlockIo` over a regular file or block device node.
pub struct FileBlockIo {
    file: File,
}

impl FileBlockIo {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl BlockIo for FileBlockIo {
    type Error = io::Error;

    fn block_size(&self) -> BlockSize {
        BlockSize::BS_512
    }

    fn num_blocks(&mut self) -> Result<u64, Self::Error> {
        Ok(self.file.seek(SeekFrom::End(0))? / SECTOR)
    }

    fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> Result<(), Self::Error> {
        self.file.seek(SeekFrom::Start(start_lba.0 * SECTOR))?;
        self.file.read_exact(dst)
    }

    fn write_blocks(&mut self, start_lba: Lba, src: &[u8]) -> Result<(), Self::Error> {
        self.file.seek(SeekFrom::Start(start_lba.0 * SECTOR))?;
        self.file.write_all(src)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.file.sync_all()
    }
}

/// Size of a disk or image in bytes.
pub fn disk_size(path: &Path) -> Result<u64, GptError> {
    let mut file = File::open(path).map_err(|source| io_err(path, source))?;
    file.seek(SeekFrom::End(0)).map_err(|source| io_err(path, source))
}

fn io_err(path: &Path, source: io::Error) -> GptError {
    GptError::Io { path: path.to_path_buf(), source }
}

fn disk_err<E: core::fmt::Debug>(path: &Path, err: E) -> GptError {
    GptError::Disk { path: path.to_path_buf(), reason: format!("{err:?}") }
}

/// Random version-4 GUID.
fn random_guid() -> Guid {
    let mut bytes: [u8; 16] = rand::random();
    bytes[7] = (bytes[7] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Guid::from_bytes(bytes)
}

/// Encodes `label` as a GPT partition name: at most 35 UCS-2 characters.
pub fn partition_name(label: &str) -> Result<GptPartitionName, GptError> {
    label.parse().map_err(|_| GptError::InvalidLabel { label: label.to_string() })
}

/// Encodes every partition name of `layout` without touching a device.
pub fn check_names(layout: &PartitionLayout) -> Result<(), GptError> {
    layout.partitions.iter().try_for_each(|spec| partition_name(&spec.label).map(drop))
}

/// Writes a fresh GPT holding `layout`, replacing whatever table was there.
pub fn write_layout(path: &Path, layout: &PartitionLayout) -> Result<Vec<GptPartition>, GptError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| io_err(path, source))?;
    let mut io = FileBlockIo::new(file);
    let num_blocks = io.num_blocks().map_err(|source| io_err(path, source))?;

    // primary: LBA 0 MBR, LBA 1 header, LBA 2.. entries
    let first_usable = 2 + ENTRY_SECTORS;
    let reserved_tail = 1 + ENTRY_SECTORS;
    let required = layout.end_bytes() / SECTOR + reserved_tail;
    if num_blocks < required.max(first_usable + reserved_tail + 1) {
        return Err(GptError::TooSmall { path: path.to_path_buf(), blocks: num_blocks, required });
    }
    let last_lba = num_blocks - 1;

    let mut disk = Disk::new(io).map_err(|err| disk_err(path, err))?;
    let mut header = GptHeader {
        my_lba: LbaLe::from_u64(1),
        alternate_lba: LbaLe::from_u64(last_lba),
        first_usable_lba: LbaLe::from_u64(first_usable),
        last_usable_lba: LbaLe::from_u64(last_lba - reserved_tail),
        disk_guid: random_guid(),
        partition_entry_lba: LbaLe::from_u64(2),
        number_of_partition_entries: U32Le::from_u32(ENTRY_COUNT),
        size_of_partition_entry: U32Le::from_u32(ENTRY_SIZE),
        ..Default::default()
    };

    disk.write_protective_mbr(&mut [0u8; 512]).map_err(|err| disk_err(path, err))?;

    let entry_layout = header
        .get_partition_entry_array_layout()
        .map_err(|err| disk_err(path, err))?;
    let mut entry_buf = [0u8; (ENTRY_COUNT * ENTRY_SIZE) as usize];
    let mut entries = GptPartitionEntryArray::new(entry_layout, BlockSize::BS_512, &mut entry_buf)
        .map_err(|err| disk_err(path, err))?;

    for spec in &layout.partitions {
        let name = partition_name(&spec.label)?;
        let entry = entries
            .get_partition_entry_mut(spec.index - 1)
            .ok_or_else(|| disk_err(path, format!("no entry slot {}", spec.index)))?;
        entry.partition_type_guid = match spec.kind {
            PartitionKind::Esp => GptPartitionType::EFI_SYSTEM,
            PartitionKind::Root => LINUX_FILESYSTEM,
        };
        entry.unique_partition_guid = random_guid();
        entry.starting_lba = LbaLe::from_u64(spec.offset_bytes / SECTOR);
        entry.ending_lba = LbaLe::from_u64(spec.end_bytes() / SECTOR - 1);
        entry.attributes = Default::default();
        entry.name = name;
        debug!(
            "gpt: {} #{} {} sectors {}..{}",
            path.display(),
            spec.index,
            spec.label,
            spec.offset_bytes / SECTOR,
            spec.end_bytes() / SECTOR - 1
        );
    }

    header.partition_entry_array_crc32 = entries.calculate_crc32();
    header.update_header_crc32();
    disk.write_primary_gpt_header(&header, &mut [0u8; 512])
        .map_err(|err| disk_err(path, err))?;
    disk.write_gpt_partition_entry_array(&entries)
        .map_err(|err| disk_err(path, err))?;

    // backup copy: entry array directly before the header in the last sector
    let mut backup = header.clone();
    backup.my_lba = header.alternate_lba;
    backup.alternate_lba = header.my_lba;
    backup.partition_entry_lba = LbaLe::from_u64(last_lba - ENTRY_SECTORS);
    backup.update_header_crc32();
    let backup_layout = backup
        .get_partition_entry_array_layout()
        .map_err(|err| disk_err(path, err))?;
    let mut backup_buf = [0u8; (ENTRY_COUNT * ENTRY_SIZE) as usize];
    backup_buf.copy_from_slice(entries.storage());
    let backup_entries = GptPartitionEntryArray::new(backup_layout, BlockSize::BS_512, &mut backup_buf)
        .map_err(|err| disk_err(path, err))?;
    disk.write_gpt_partition_entry_array(&backup_entries)
        .map_err(|err| disk_err(path, err))?;
    disk.write_secondary_gpt_header(&backup, &mut [0u8; 512])
        .map_err(|err| disk_err(path, err))?;
    disk.flush().map_err(|err| disk_err(path, err))?;
    drop(disk);

    read_partitions(path)
}

/// Lists used entries of the primary GPT on `path`.
pub fn read_partitions(path: &Path) -> Result<Vec<GptPartition>, GptError> {
    let file = File::open(path).map_err(|source| io_err(path, source))?;
    let mut disk = Disk::new(FileBlockIo::new(file)).map_err(|err| disk_err(path, err))?;
    let header = disk
        .read_primary_gpt_header(&mut [0u8; 512])
        .map_err(|_| GptError::NoTable { path: path.to_path_buf() })?;
    if header.signature != GptHeaderSignature::EFI_COMPATIBLE_PARTITION_TABLE_HEADER {
        return Err(GptError::NoTable { path: path.to_path_buf() });
    }
    let layout = header
        .get_partition_entry_array_layout()
        .map_err(|_| GptError::NoTable { path: path.to_path_buf() })?;

    let mut block = [0u8; 512];
    let iter = disk
        .gpt_partition_entry_array_iter(layout, &mut block)
        .map_err(|err| disk_err(path, err))?;
    let mut partitions = Vec::new();
    for (index, entry) in iter.enumerate() {
        let entry = entry.map_err(|err| disk_err(path, err))?;
        if !entry.is_used() {
            continue;
        }
        // copy out of the packed entry before formatting
        let type_guid = entry.partition_type_guid;
        let unique_guid = entry.unique_partition_guid;
        let name = entry.name;
        partitions.push(GptPartition {
            index: index as u32 + 1,
            type_guid: type_guid.0.to_string(),
            unique_guid: unique_guid.to_string(),
            name: name.to_string(),
            first_lba: entry.starting_lba.to_u64(),
            last_lba: entry.ending_lba.to_u64(),
        });
    }
    Ok(partitions)
}

/// Finds a partition by its GPT name.
pub fn find_by_name<'a>(partitions: &'a [GptPartition], name: &str) -> Option<&'a GptPartition> {
    partitions.iter().find(|p| p.name == name)
}
