// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Update orchestrator (first install, standby update, slot switch, boot health hooks)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: Integration tests (tests/updates_host/tests/ota_flow.rs)
//!
//! Strictly sequential; the caller serializes invocations per disk. Every
//! step after a mount runs while a `ScopedMount` is alive, so an early
//! return unmounts before the error reaches the caller.

use std::path::PathBuf;

use log::{info, warn};
use serde::Serialize;

use crate::arbiter::{Arbiter, ArbiterError, EspTarget, ReconcileReport};
use crate::config::UpdaterConfig;
use crate::entries::GenerationId;
use crate::error::UpdateError;
use crate::firmware::{Firmware, NvramState};
use crate::gpt::{self, GptPartition};
use crate::health::{BootEntry, EntryStore, HealthError};
use crate::install::{ImageBuilder, Installer, TrialPolicy};
use crate::layout::{self, PartitionLayout};
use crate::mount::SlotMounter;
use crate::provision::{ProvisionError, Provisioner};
use crate::slot::SlotId;
use crate::volume::VolumeManager;

/// Result of the NVRAM step. Firmware trouble degrades to the firmware's
/// default-path boot instead of failing the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ArbiterOutcome {
    Reconciled(ReconcileReport),
    Degraded { reason: String },
}

impl ArbiterOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, ArbiterOutcome::Degraded { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FirstInstallOutcome {
    pub partitions: Vec<GptPartition>,
    pub installed: Vec<(SlotId, GenerationId)>,
    pub arbiter: ArbiterOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub slot: SlotId,
    pub generation: GenerationId,
    pub arbiter: ArbiterOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub slot: SlotId,
    pub root_label: String,
    pub boot_label: String,
    pub nvram_label: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub disk: PathBuf,
    pub active: Option<SlotId>,
    pub slots: Vec<SlotStatus>,
    pub selected_entry: Option<String>,
    pub entries: Vec<BootEntry>,
    pub partitions: Option<Vec<GptPartition>>,
    pub nvram: Option<NvramState>,
}

pub struct Orchestrator<'a> {
    config: &'a UpdaterConfig,
    volumes: &'a dyn VolumeManager,
    builder: &'a dyn ImageBuilder,
    firmware: &'a dyn Firmware,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a UpdaterConfig,
        volumes: &'a dyn VolumeManager,
        builder: &'a dyn ImageBuilder,
        firmware: &'a dyn Firmware,
    ) -> Self {
        Self { config, volumes, builder, firmware }
    }

    /// Plans the layout for `disk_size`, or for the configured disk.
    pub fn plan(&self, disk_size: Option<u64>) -> Result<PartitionLayout, UpdateError> {
        let disk_size = match disk_size {
            Some(size) => size,
            None => gpt::disk_size(&self.config.disk)?,
        };
        Ok(layout::plan(disk_size, self.config.boot_size_bytes, &self.config.slots)?)
    }

    /// Destroys the disk and installs both slots, slot A active.
    pub fn first_install(&self) -> Result<FirstInstallOutcome, UpdateError> {
        let refs = SlotId::ALL
            .iter()
            .map(|slot| self.config_ref(*slot, None).map(|r| (*slot, r)))
            .collect::<Result<Vec<_>, _>>()?;

        let missing = self.builder.missing_tools();
        if !missing.is_empty() {
            return Err(ProvisionError::ToolMissing { tools: missing }.into());
        }

        let layout = self.plan(None)?;
        info!("first install on {}", self.config.disk.display());
        let report = Provisioner::new(self.volumes).provision(&self.config.disk, &layout)?;

        let mounter = SlotMounter::new(self.config, self.volumes);
        let installer = Installer::new(self.config, self.builder);
        let mut mounts = Vec::with_capacity(refs.len());
        let mut installed = Vec::with_capacity(refs.len());
        for (slot, config_ref) in &refs {
            let mount = mounter.mount_slot(*slot)?;
            let generation = installer.install(&mount, config_ref, TrialPolicy::Blessed)?;
            installed.push((*slot, generation));
            mounts.push(mount);
        }

        let targets = self.esp_targets(&report.partitions)?;
        let arbiter = self.arbitrate(&targets, SlotId::A)?;
        for mount in mounts {
            mounter.unmount(mount)?;
        }
        Ok(FirstInstallOutcome { partitions: report.partitions, installed, arbiter })
    }

    /// Installs `config_ref` into the standby slot `target` on trial.
    pub fn update(&self, target: SlotId, config_ref: Option<&str>) -> Result<UpdateOutcome, UpdateError> {
        let active = self.detect_active(target);
        if target == active {
            return Err(UpdateError::TargetIsActive { slot: target });
        }
        let config_ref = self.config_ref(target, config_ref)?;
        let targets = self.esp_targets(&gpt::read_partitions(&self.config.disk)?)?;

        info!("update: slot {target} from {config_ref} (active slot {active})");
        let mounter = SlotMounter::new(self.config, self.volumes);
        let mount = mounter.mount_slot(target)?;
        let generation = Installer::new(self.config, self.builder).install(
            &mount,
            &config_ref,
            TrialPolicy::Trial(self.config.boot.trial_tries),
        )?;
        let arbiter = self.arbitrate(&targets, active)?;
        mounter.unmount(mount)?;
        Ok(UpdateOutcome { slot: target, generation, arbiter })
    }

    /// Puts `new_slot` first in the firmware boot order. File systems are untouched.
    pub fn switch_active(&self, new_slot: SlotId) -> Result<ArbiterOutcome, UpdateError> {
        let targets = self.esp_targets(&gpt::read_partitions(&self.config.disk)?)?;
        info!("switch: slot {new_slot} becomes active");
        self.arbitrate(&targets, new_slot)
    }

    /// Blesses the entry that booted. Without an explicit id, the boot
    /// loader's `LoaderEntrySelected` is used, then the selected entry.
    pub fn boot_completed(&self, entry_id: Option<&str>) -> Result<BootEntry, UpdateError> {
        let store = self.running_store()?;
        let entry_id = match entry_id {
            Some(id) => Some(id.to_string()),
            None => self.selected_entry(),
        };
        let entry_id = match entry_id {
            Some(id) => id,
            None => store
                .select()?
                .map(|e| e.id)
                .ok_or_else(|| HealthError::UnknownEntry {
                    entry: "(none selected)".to_string(),
                    dir: store.dir().to_path_buf(),
                })?,
        };
        Ok(store.mark_boot_completed(&entry_id)?)
    }

    /// Boot-loader side counting for loaders without native support.
    pub fn boot_attempt(&self) -> Result<Option<BootEntry>, UpdateError> {
        Ok(self.running_store()?.record_boot_attempt()?)
    }

    pub fn gc(&self) -> Result<Vec<BootEntry>, UpdateError> {
        Ok(self.running_store()?.collect_garbage(self.config.boot.retention)?)
    }

    pub fn status(&self) -> Result<Status, UpdateError> {
        let active = self.active_slot();
        let slots = SlotId::ALL
            .iter()
            .map(|slot| {
                let cfg = self.config.slots.get(*slot);
                SlotStatus {
                    slot: *slot,
                    root_label: cfg.root_label.clone(),
                    boot_label: cfg.boot_label.clone(),
                    nvram_label: cfg.nvram_label.clone(),
                    active: active == Some(*slot),
                }
            })
            .collect();
        let partitions = gpt::read_partitions(&self.config.disk)
            .map_err(|err| warn!("status: {err}"))
            .ok();
        let nvram = self.firmware.list().map_err(|err| warn!("status: {err}")).ok();
        Ok(Status {
            disk: self.config.disk.clone(),
            active,
            slots,
            selected_entry: self.selected_entry(),
            entries: EntryStore::new(&self.config.esp_mount).entries()?,
            partitions,
            nvram,
        })
    }

    /// Slot whose root file system is mounted at `/`, if recognisable.
    pub fn active_slot(&self) -> Option<SlotId> {
        match self.volumes.root_label() {
            Ok(Some(label)) => self.config.slots.slot_for_root_label(&label),
            Ok(None) => None,
            Err(err) => {
                warn!("cannot read root file system label: {err}");
                None
            }
        }
    }

    /// Entries of the running ESP, after retiring what an interrupted install left there.
    fn running_store(&self) -> Result<EntryStore, UpdateError> {
        let store = EntryStore::new(&self.config.esp_mount);
        store.recover_interrupted_install()?;
        Ok(store)
    }

    fn detect_active(&self, target: SlotId) -> SlotId {
        self.active_slot().unwrap_or_else(|| {
            warn!("active slot unknown; assuming slot {}", target.other());
            target.other()
        })
    }

    fn config_ref(&self, slot: SlotId, given: Option<&str>) -> Result<String, UpdateError> {
        given
            .map(str::to_string)
            .or_else(|| self.config.slots.get(slot).config_ref.clone())
            .ok_or(UpdateError::MissingConfigRef { slot })
    }

    fn selected_entry(&self) -> Option<String> {
        self.firmware
            .selected_loader_entry()
            .map_err(|err| warn!("cannot read LoaderEntrySelected: {err}"))
            .ok()
            .flatten()
    }

    /// ESP partitions found by GPT name, one per slot.
    fn esp_targets(&self, partitions: &[GptPartition]) -> Result<Vec<EspTarget>, UpdateError> {
        SlotId::ALL
            .iter()
            .map(|slot| {
                let cfg = self.config.slots.get(*slot);
                let part = gpt::find_by_name(partitions, &cfg.boot_label).ok_or_else(|| {
                    UpdateError::PartitionNotFound { disk: self.config.disk.clone(), label: cfg.boot_label.clone() }
                })?;
                Ok(EspTarget {
                    slot: *slot,
                    partition_index: part.index,
                    partition_guid: Some(part.unique_guid.to_ascii_lowercase()),
                    label: cfg.nvram_label.clone(),
                })
            })
            .collect()
    }

    fn arbitrate(&self, targets: &[EspTarget], active: SlotId) -> Result<ArbiterOutcome, UpdateError> {
        match Arbiter::new(self.firmware, self.config).reconcile(&self.config.disk, targets, active) {
            Ok(report) => Ok(ArbiterOutcome::Reconciled(report)),
            Err(ArbiterError::Unavailable { reason }) => {
                warn!("NVRAM not updated ({reason}); firmware will fall back to its default loader path");
                Ok(ArbiterOutcome::Degraded { reason })
            }
            Err(err) => Err(err.into()),
        }
    }
}
