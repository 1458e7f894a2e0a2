// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Slot mount manager (root subvolume + ESP) with scoped unmount
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 6 unit tests
//!   - mount/release sequence
//!   - boot mount failure unwinds root
//!   - held slot yields a non-owning handle
//!   - stale mount adoption
//!   - subvolume created only when absent
//!
//! A slot is mounted at `<work_dir>/slot-<id>` with its ESP at `boot/`
//! beneath it. Every mount this process makes is released by the
//! `ScopedMount` that owns it, including on early return.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::UpdaterConfig;
use crate::slot::SlotId;
use crate::volume::{VolumeError, VolumeManager};

/// External tools behind `mount_slot` and `ScopedMount` release.
pub const REQUIRED_TOOLS: &[&str] = &["mount", "umount", "btrfs"];

#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to mount root {device} at {target}: {source}")]
    Root {
        device: PathBuf,
        target: PathBuf,
        #[source]
        source: VolumeError,
    },
    #[error("failed to create subvolume {path}: {source}")]
    Subvolume {
        path: PathBuf,
        #[source]
        source: VolumeError,
    },
    #[error("failed to mount boot {device} at {target}: {source}")]
    Boot {
        device: PathBuf,
        target: PathBuf,
        #[source]
        source: VolumeError,
    },
    #[error("failed to unmount {target}: {source}")]
    Unmount {
        target: PathBuf,
        #[source]
        source: VolumeError,
    },
}

pub struct SlotMounter<'a> {
    config: &'a UpdaterConfig,
    volumes: &'a dyn VolumeManager,
    held: Mutex<HashSet<SlotId>>,
}

impl<'a> SlotMounter<'a> {
    pub fn new(config: &'a UpdaterConfig, volumes: &'a dyn VolumeManager) -> Self {
        Self { config, volumes, held: Mutex::new(HashSet::new()) }
    }

    pub fn mount_point(&self, slot: SlotId) -> PathBuf {
        self.config.work_dir.join(format!("slot-{slot}"))
    }

    pub fn mount_slot(&self, slot: SlotId) -> Result<ScopedMount<'_>, MountError> {
        let root = self.mount_point(slot);
        let boot = root.join("boot");

        if self.held.lock().contains(&slot) {
            debug!("mount: slot {slot} already held at {}", root.display());
            return Ok(ScopedMount::new(self, slot, root, boot, false));
        }

        let slot_cfg = self.config.slots.get(slot);
        let root_dev = self.volumes.label_device(&slot_cfg.root_label);
        let boot_dev = self.volumes.label_device(&slot_cfg.boot_label);

        if self.is_mounted(&root)? {
            warn!("mount: adopting stale mount of slot {slot} at {}", root.display());
            self.held.lock().insert(slot);
            let handle = ScopedMount::new(self, slot, root, boot, true);
            if !self.is_mounted(&handle.boot)? {
                self.mount_boot(&boot_dev, &handle.boot)?;
            }
            return Ok(handle);
        }

        self.prepare_subvolume(&root_dev, &root)?;

        let options = self.config.mount.root_options(&self.config.subvolume);
        info!("mount: slot {slot} {} -> {} ({})", root_dev.display(), root.display(), options.join(","));
        self.volumes
            .mount(&root_dev, &root, &options)
            .map_err(|source| MountError::Root { device: root_dev.clone(), target: root.clone(), source })?;

        if let Err(err) = self.mount_boot(&boot_dev, &boot) {
            if let Err(unwind) = self.volumes.unmount(&root, true) {
                error!("mount: failed to unwind {} after boot mount error: {unwind}", root.display());
            }
            return Err(err);
        }

        self.held.lock().insert(slot);
        Ok(ScopedMount::new(self, slot, root, boot, true))
    }

    /// Releases `mount`, reporting unmount errors.
    pub fn unmount(&self, mount: ScopedMount<'_>) -> Result<(), MountError> {
        mount.release()
    }

    /// Mounts the top level and creates the primary subvolume if absent.
    fn prepare_subvolume(&self, device: &Path, target: &Path) -> Result<(), MountError> {
        let top_level = ["subvolid=5".to_string()];
        self.volumes.mount(device, target, &top_level).map_err(|source| MountError::Root {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            source,
        })?;

        let subvolume = target.join(&self.config.subvolume);
        let created = if subvolume.exists() {
            Ok(())
        } else {
            info!("mount: creating subvolume {}", subvolume.display());
            self.volumes
                .create_subvolume(&subvolume)
                .map_err(|source| MountError::Subvolume { path: subvolume.clone(), source })
        };

        let unmounted = self
            .volumes
            .unmount(target, false)
            .map_err(|source| MountError::Unmount { target: target.to_path_buf(), source });
        created.and(unmounted)
    }

    fn mount_boot(&self, device: &Path, target: &Path) -> Result<(), MountError> {
        debug!("mount: boot {} -> {}", device.display(), target.display());
        self.volumes
            .mount(device, target, &self.config.mount.boot_options)
            .map_err(|source| MountError::Boot {
                device: device.to_path_buf(),
                target: target.to_path_buf(),
                source,
            })
    }

    fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        self.volumes
            .is_mounted(target)
            .map_err(|source| MountError::Unmount { target: target.to_path_buf(), source })
    }
}

/// A mounted slot. Owning handles unmount recursively on release or drop.
pub struct ScopedMount<'m> {
    mounter: &'m SlotMounter<'m>,
    slot: SlotId,
    root: PathBuf,
    boot: PathBuf,
    owned: bool,
    released: bool,
}

impl<'m> ScopedMount<'m> {
    fn new(mounter: &'m SlotMounter<'m>, slot: SlotId, root: PathBuf, boot: PathBuf, owned: bool) -> Self {
        Self { mounter, slot, root, boot, owned, released: false }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn boot(&self) -> &Path {
        &self.boot
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn release(mut self) -> Result<(), MountError> {
        self.unmount_once()
    }

    fn unmount_once(&mut self) -> Result<(), MountError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if !self.owned {
            return Ok(());
        }
        self.mounter.held.lock().remove(&self.slot);
        if !self.mounter.is_mounted(&self.root)? {
            debug!("mount: {} already unmounted", self.root.display());
            return Ok(());
        }
        info!("mount: releasing slot {} at {}", self.slot, self.root.display());
        self.mounter
            .volumes
            .unmount(&self.root, true)
            .map_err(|source| MountError::Unmount { target: self.root.clone(), source })
    }
}

impl Drop for ScopedMount<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.unmount_once() {
            error!("mount: {err}");
        }
    }
}
