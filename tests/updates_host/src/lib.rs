// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Host rig for end-to-end A/B update flows
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable (test support)
//!
//! The rig runs the real orchestrator against a sparse disk image, with
//! mounts, image builds and NVRAM replaced by in-memory fakes. Mount points
//! are plain directories under a temp dir, so a slot's files survive
//! unmount and remount the way a real file system would.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::Mutex;
use tempfile::TempDir;
use updates::config::SlotConfig;
use updates::firmware::{to_efi_path, OptionPartition};
use updates::install::BuildError;
use updates::volume::{mounts_for_disk, CowProfile, MountEntry, VolumeError};
use updates::{
    gpt, BootNumber, BootOption, Firmware, FirmwareError, ImageBuilder, NvramState, Orchestrator, SlotId,
    UpdaterConfig, VolumeManager,
};

pub const DISK_SIZE: u64 = 2 << 30;
pub const BOOT_SIZE: u64 = 1 << 20;

/// One call made against [`FakeVolumes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeCall {
    Mount { source: PathBuf, target: PathBuf, options: Vec<String> },
    Unmount { target: PathBuf, recursive: bool },
    Wipe(PathBuf),
    Reread(PathBuf),
    FormatFat { device: PathBuf, label: String },
    FormatCow { device: PathBuf, label: String, profile: CowProfile },
    CreateSubvolume(PathBuf),
}

#[derive(Default)]
pub struct FakeVolumes {
    pub missing: Mutex<Vec<String>>,
    pub mounted: Mutex<Vec<MountEntry>>,
    pub calls: Mutex<Vec<VolumeCall>>,
    pub root_label: Mutex<Option<String>>,
}

impl FakeVolumes {
    pub fn calls(&self) -> Vec<VolumeCall> {
        self.calls.lock().clone()
    }

    pub fn mounted_targets(&self) -> Vec<PathBuf> {
        self.mounted.lock().iter().map(|m| m.target.clone()).collect()
    }

    fn record(&self, call: VolumeCall) {
        debug!("fake volumes: {call:?}");
        self.calls.lock().push(call);
    }
}

impl VolumeManager for FakeVolumes {
    fn missing_tools(&self, tools: &[&str]) -> Vec<String> {
        let missing = self.missing.lock();
        tools
            .iter()
            .filter(|tool| missing.iter().any(|m| m == *tool))
            .map(|tool| tool.to_string())
            .collect()
    }

    fn mounts_on(&self, disk: &Path) -> Result<Vec<MountEntry>, VolumeError> {
        Ok(mounts_for_disk(self.mounted.lock().clone(), disk))
    }

    fn is_mounted(&self, target: &Path) -> Result<bool, VolumeError> {
        Ok(self.mounted.lock().iter().any(|m| m.target == target))
    }

    fn mount(&self, source: &Path, target: &Path, options: &[String]) -> Result<(), VolumeError> {
        fs::create_dir_all(target).map_err(|source| VolumeError::Io { path: target.to_path_buf(), source })?;
        self.mounted.lock().push(MountEntry {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fstype: "fake".to_string(),
            options: options.join(","),
        });
        self.record(VolumeCall::Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            options: options.to_vec(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path, recursive: bool) -> Result<(), VolumeError> {
        self.mounted
            .lock()
            .retain(|m| !(m.target == target || (recursive && m.target.starts_with(target))));
        self.record(VolumeCall::Unmount { target: target.to_path_buf(), recursive });
        Ok(())
    }

    fn wipe_signatures(&self, device: &Path) -> Result<(), VolumeError> {
        self.record(VolumeCall::Wipe(device.to_path_buf()));
        Ok(())
    }

    fn reread_partition_table(&self, disk: &Path) -> Result<(), VolumeError> {
        self.record(VolumeCall::Reread(disk.to_path_buf()));
        Ok(())
    }

    fn format_fat(&self, device: &Path, label: &str) -> Result<(), VolumeError> {
        self.record(VolumeCall::FormatFat { device: device.to_path_buf(), label: label.to_string() });
        Ok(())
    }

    fn format_cow(&self, device: &Path, label: &str, profile: CowProfile) -> Result<(), VolumeError> {
        self.record(VolumeCall::FormatCow { device: device.to_path_buf(), label: label.to_string(), profile });
        Ok(())
    }

    fn create_subvolume(&self, path: &Path) -> Result<(), VolumeError> {
        fs::create_dir_all(path).map_err(|source| VolumeError::Io { path: path.to_path_buf(), source })?;
        self.record(VolumeCall::CreateSubvolume(path.to_path_buf()));
        Ok(())
    }

    fn snapshot(&self, _source: &Path, _dest: &Path, _readonly: bool) -> Result<(), VolumeError> {
        Ok(())
    }

    fn root_label(&self) -> Result<Option<String>, VolumeError> {
        Ok(self.root_label.lock().clone())
    }
}

/// How the next build misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildFault {
    /// The build program exits non-zero.
    Exit,
    /// Entry written, kernel forgotten.
    NoKernel,
}

/// Writes a loader, kernel, initrd and one entry per build, numbering
/// generations from a shared counter.
#[derive(Default)]
pub struct FakeBuilder {
    pub generation: Mutex<u64>,
    pub fault: Mutex<Option<BuildFault>>,
    pub builds: Mutex<Vec<(SlotId, String)>>,
}

impl FakeBuilder {
    pub fn builds(&self) -> Vec<(SlotId, String)> {
        self.builds.lock().clone()
    }
}

fn write(path: &Path, contents: &[u8]) -> Result<(), BuildError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| BuildError::Other(err.to_string()))?;
    }
    fs::write(path, contents).map_err(|err| BuildError::Other(err.to_string()))
}

impl ImageBuilder for FakeBuilder {
    fn build(&self, slot: SlotId, config_ref: &str, root: &Path, boot: &Path) -> Result<(), BuildError> {
        self.builds.lock().push((slot, config_ref.to_string()));
        let fault = *self.fault.lock();
        if fault == Some(BuildFault::Exit) {
            return Err(BuildError::Other(format!("{config_ref}: package resolution failed")));
        }

        let generation = {
            let mut counter = self.generation.lock();
            *counter += 1;
            *counter
        };
        write(&root.join("etc/image-ref"), config_ref.as_bytes())?;
        write(&boot.join("EFI/systemd/systemd-bootx64.efi"), format!("MZ loader {generation}").as_bytes())?;
        if fault != Some(BuildFault::NoKernel) {
            write(&boot.join(format!("{slot}/{generation}/linux")), b"kernel")?;
        }
        write(&boot.join(format!("{slot}/{generation}/initrd")), b"initrd")?;
        let entry = format!(
            "title {config_ref} ({generation})\nlinux /{slot}/{generation}/linux\ninitrd /{slot}/{generation}/initrd\noptions root=LABEL=ROOT_{} rootflags=subvol=@\n",
            slot.as_str().to_ascii_uppercase()
        );
        write(&boot.join(format!("loader/entries/slot-{slot}-{generation}.conf")), entry.as_bytes())
    }
}

/// NVRAM held in memory. New options get the lowest free number and go to
/// the front of the order, like efibootmgr does.
pub struct FakeFirmware {
    pub state: Mutex<NvramState>,
    pub available: Mutex<bool>,
    pub selected: Mutex<Option<String>>,
    pub writes: Mutex<usize>,
}

impl Default for FakeFirmware {
    fn default() -> Self {
        Self {
            state: Mutex::new(NvramState::default()),
            available: Mutex::new(true),
            selected: Mutex::new(None),
            writes: Mutex::new(0),
        }
    }
}

impl FakeFirmware {
    pub fn state(&self) -> NvramState {
        self.state.lock().clone()
    }

    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }

    pub fn label_of(&self, id: BootNumber) -> Option<String> {
        self.state.lock().get(id).map(|o| o.label.clone())
    }

    /// Adds an option by hand, appended to the boot order.
    pub fn push_option(&self, label: &str, partition: Option<OptionPartition>, loader: &str) -> BootNumber {
        let mut state = self.state.lock();
        let id = lowest_free(&state);
        state.options.push(BootOption {
            id,
            label: label.to_string(),
            active: true,
            partition,
            loader_path: Some(to_efi_path(loader)),
        });
        state.boot_order.push(id);
        id
    }

    fn check(&self) -> Result<(), FirmwareError> {
        if *self.available.lock() {
            Ok(())
        } else {
            Err(FirmwareError::Unavailable { reason: "efivarfs not mounted".to_string() })
        }
    }
}

fn lowest_free(state: &NvramState) -> BootNumber {
    (0..=u16::MAX)
        .map(BootNumber)
        .find(|id| state.get(*id).is_none())
        .unwrap_or(BootNumber(u16::MAX))
}

impl Firmware for FakeFirmware {
    fn list(&self) -> Result<NvramState, FirmwareError> {
        self.check()?;
        Ok(self.state())
    }

    fn create_entry(&self, disk: &Path, partition_index: u32, label: &str, loader_path: &str) -> Result<(), FirmwareError> {
        self.check()?;
        let guid = gpt::read_partitions(disk)
            .ok()
            .and_then(|parts| parts.into_iter().find(|p| p.index == partition_index))
            .map(|p| p.unique_guid.to_ascii_lowercase());
        let mut state = self.state.lock();
        let id = lowest_free(&state);
        state.options.push(BootOption {
            id,
            label: label.to_string(),
            active: true,
            partition: Some(OptionPartition { index: partition_index, guid }),
            loader_path: Some(to_efi_path(loader_path)),
        });
        state.boot_order.insert(0, id);
        *self.writes.lock() += 1;
        Ok(())
    }

    fn delete_entry(&self, id: BootNumber) -> Result<(), FirmwareError> {
        self.check()?;
        let mut state = self.state.lock();
        state.options.retain(|o| o.id != id);
        state.boot_order.retain(|o| *o != id);
        *self.writes.lock() += 1;
        Ok(())
    }

    fn set_boot_order(&self, order: &[BootNumber]) -> Result<(), FirmwareError> {
        self.check()?;
        self.state.lock().boot_order = order.to_vec();
        *self.writes.lock() += 1;
        Ok(())
    }

    fn selected_loader_entry(&self) -> Result<Option<String>, FirmwareError> {
        self.check()?;
        Ok(self.selected.lock().clone())
    }
}

/// A disk image, a work directory and the three fakes.
pub struct Rig {
    pub dir: TempDir,
    pub config: UpdaterConfig,
    pub volumes: FakeVolumes,
    pub builder: FakeBuilder,
    pub firmware: FakeFirmware,
}

impl Rig {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let disk = dir.path().join("disk.img");
        File::create(&disk).unwrap().set_len(DISK_SIZE).unwrap();

        let mut config = UpdaterConfig {
            disk,
            boot_size_bytes: BOOT_SIZE,
            work_dir: dir.path().join("mnt"),
            ..Default::default()
        };
        for slot in SlotId::ALL {
            let cfg: &mut SlotConfig = match slot {
                SlotId::A => &mut config.slots.a,
                SlotId::B => &mut config.slots.b,
            };
            cfg.config_ref = Some(format!("images/slot-{slot}.toml"));
        }

        let mut rig = Self {
            dir,
            config,
            volumes: FakeVolumes::default(),
            builder: FakeBuilder::default(),
            firmware: FakeFirmware::default(),
        };
        rig.boot_into(SlotId::A);
        rig
    }

    pub fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(&self.config, &self.volumes, &self.builder, &self.firmware)
    }

    /// ESP of `slot` as the updater leaves it on disk.
    pub fn esp(&self, slot: SlotId) -> PathBuf {
        self.config.work_dir.join(format!("slot-{slot}")).join("boot")
    }

    /// Pretends the machine is running from `slot`: `/` carries its root
    /// label and its ESP is the one at `esp_mount`.
    pub fn boot_into(&mut self, slot: SlotId) {
        *self.volumes.root_label.lock() = Some(self.config.slots.get(slot).root_label.clone());
        self.config.esp_mount = self.esp(slot);
    }

    /// Entry file names on the ESP of `slot`, sorted.
    pub fn entry_files(&self, slot: SlotId) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(self.esp(slot).join("loader/entries")) {
            Ok(read) => read
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// Label of the NVRAM option first in the boot order.
    pub fn first_boot_label(&self) -> Option<String> {
        let first = *self.firmware.state().boot_order.first()?;
        self.firmware.label_of(first)
    }
}

impl Default for Rig {
    fn default() -> Self {
        Self::new()
    }
}
