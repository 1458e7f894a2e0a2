// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Disk provisioner (wipe, GPT, FAT32 ESPs, btrfs roots)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: Integration tests (tests/updates_host) + 4 unit tests
//!
//! Destructive. Callers confirm intent before calling `provision`.

use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

use crate::gpt::{self, GptError, GptPartition};
use crate::layout::{PartitionKind, PartitionLayout};
use crate::mount;
use crate::volume::{CowProfile, VolumeError, VolumeManager};

/// External tools the provisioner shells out to.
pub const REQUIRED_TOOLS: &[&str] = &["wipefs", "mkfs.vfat", "mkfs.btrfs", "blockdev", "udevadm", "umount"];

/// Everything checked before the wipe: the provisioner's tools and those of
/// the slot mounter, which runs on the fresh file systems right after.
pub fn preflight_tools() -> Vec<&'static str> {
    let mut tools: Vec<&'static str> = REQUIRED_TOOLS.to_vec();
    for tool in mount::REQUIRED_TOOLS {
        if !tools.contains(tool) {
            tools.push(*tool);
        }
    }
    tools
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("required tools not found in PATH: {}", .tools.join(", "))]
    ToolMissing { tools: Vec<String> },
    #[error("{disk} holds {disk_size} bytes but the layout needs {required}")]
    InsufficientSpace { disk: PathBuf, disk_size: u64, required: u64 },
    #[error("{device} is busy: could not unmount {mount_point}: {reason}")]
    DeviceBusy { device: PathBuf, mount_point: PathBuf, reason: String },
    #[error("failed to {step} {device}: {source}")]
    Volume {
        step: &'static str,
        device: PathBuf,
        #[source]
        source: VolumeError,
    },
    #[error(transparent)]
    Gpt(#[from] GptError),
}

#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub disk: PathBuf,
    pub partitions: Vec<GptPartition>,
    /// Mount points that were released before wiping.
    pub unmounted: Vec<PathBuf>,
}

pub struct Provisioner<'a> {
    volumes: &'a dyn VolumeManager,
}

impl<'a> Provisioner<'a> {
    pub fn new(volumes: &'a dyn VolumeManager) -> Self {
        Self { volumes }
    }

    pub fn provision(&self, disk: &Path, layout: &PartitionLayout) -> Result<ProvisionReport, ProvisionError> {
        let missing = self.volumes.missing_tools(&preflight_tools());
        if !missing.is_empty() {
            return Err(ProvisionError::ToolMissing { tools: missing });
        }
        gpt::check_names(layout)?;

        let disk_size = gpt::disk_size(disk)?;
        if !layout.fits(disk_size) {
            return Err(ProvisionError::InsufficientSpace {
                disk: disk.to_path_buf(),
                disk_size,
                required: layout.required_bytes(),
            });
        }

        let unmounted = self.release_mounts(disk)?;

        info!("provision: wiping signatures on {}", disk.display());
        self.volumes
            .wipe_signatures(disk)
            .map_err(|source| volume_err("wipe", disk, source))?;

        info!("provision: writing GPT ({} partitions) to {}", layout.partitions.len(), disk.display());
        let partitions = gpt::write_layout(disk, layout)?;

        self.volumes
            .reread_partition_table(disk)
            .map_err(|source| volume_err("reread partition table of", disk, source))?;

        for spec in &layout.partitions {
            let device = self.volumes.partition_path(disk, spec.index);
            match spec.kind {
                PartitionKind::Esp => {
                    info!("provision: FAT32 {} label={}", device.display(), spec.label);
                    self.volumes
                        .format_fat(&device, &spec.label)
                        .map_err(|source| volume_err("format", &device, source))?;
                }
                PartitionKind::Root => {
                    info!("provision: btrfs(dup) {} label={}", device.display(), spec.label);
                    self.volumes
                        .format_cow(&device, &spec.label, CowProfile::Dup)
                        .map_err(|source| volume_err("format", &device, source))?;
                }
            }
        }

        Ok(ProvisionReport { disk: disk.to_path_buf(), partitions, unmounted })
    }

    /// Unmounts everything on `disk`, deepest mount point first.
    fn release_mounts(&self, disk: &Path) -> Result<Vec<PathBuf>, ProvisionError> {
        let busy = |mount_point: &Path, reason: String| ProvisionError::DeviceBusy {
            device: disk.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            reason,
        };

        let mounts = self
            .volumes
            .mounts_on(disk)
            .map_err(|source| volume_err("list mounts of", disk, source))?;
        let mut released = Vec::with_capacity(mounts.len());
        for entry in mounts {
            // a recursive unmount of a parent may already have taken this one
            match self.volumes.is_mounted(&entry.target) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(err) => return Err(busy(&entry.target, err.to_string())),
            }
            warn!("provision: unmounting {} ({})", entry.target.display(), entry.source.display());
            self.volumes
                .unmount(&entry.target, false)
                .map_err(|err| busy(&entry.target, err.to_string()))?;
            released.push(entry.target);
        }

        let remaining = self
            .volumes
            .mounts_on(disk)
            .map_err(|source| volume_err("list mounts of", disk, source))?;
        if let Some(entry) = remaining.first() {
            return Err(busy(&entry.target, "still mounted after unmount".to_string()));
        }
        Ok(released)
    }
}

fn volume_err(step: &'static str, device: &Path, source: VolumeError) -> ProvisionError {
    ProvisionError::Volume { step, device: device.to_path_buf(), source }
}
