// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Firmware boot-order arbiter (one NVRAM option per ESP, active slot first)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 6 unit tests + integration tests (tests/updates_host)
//!
//! Reconciliation steps:
//! 1. keep the first consistent option per ESP, delete other options owned by this disk
//! 2. create options for ESPs that have none
//! 3. resolve ids by unique label, else by partition index/GUID/loader
//! 4. write `[active, standby, rest...]` only if it differs

use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::{SlotsConfig, UpdaterConfig};
use crate::firmware::{BootNumber, BootOption, Firmware, FirmwareError, NvramState};
use crate::slot::SlotId;

#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("firmware boot manager unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("no NVRAM option could be resolved for slot {slot} ({label})")]
    Unresolved { slot: SlotId, label: String },
    #[error("firmware update failed: {source}")]
    Firmware {
        #[source]
        source: FirmwareError,
    },
}

impl From<FirmwareError> for ArbiterError {
    fn from(err: FirmwareError) -> Self {
        match err {
            FirmwareError::Unavailable { reason } => ArbiterError::Unavailable { reason },
            source => ArbiterError::Firmware { source },
        }
    }
}

/// An ESP that must have exactly one NVRAM option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EspTarget {
    pub slot: SlotId,
    pub partition_index: u32,
    /// Lowercase unique partition GUID, when known.
    pub partition_guid: Option<String>,
    /// NVRAM option label.
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub deleted: Vec<BootNumber>,
    pub created: Vec<SlotId>,
    pub resolved: Vec<(SlotId, BootNumber)>,
    pub boot_order: Vec<BootNumber>,
    pub order_changed: bool,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.deleted.is_empty() && self.created.is_empty() && !self.order_changed
    }

    pub fn id_for(&self, slot: SlotId) -> Option<BootNumber> {
        self.resolved.iter().find(|(s, _)| *s == slot).map(|(_, id)| *id)
    }
}

pub struct Arbiter<'a> {
    firmware: &'a dyn Firmware,
    slots: SlotsConfig,
    loader_path: String,
}

impl<'a> Arbiter<'a> {
    pub fn new(firmware: &'a dyn Firmware, config: &UpdaterConfig) -> Self {
        Self {
            firmware,
            slots: config.slots.clone(),
            loader_path: config.loader.fallback_path.clone(),
        }
    }

    pub fn reconcile(&self, disk: &Path, targets: &[EspTarget], active: SlotId) -> Result<ReconcileReport, ArbiterError> {
        let mut report = ReconcileReport::default();
        let mut state = self.firmware.list()?;

        let disk_guids: HashSet<&str> = targets.iter().filter_map(|t| t.partition_guid.as_deref()).collect();
        let owned: Vec<&BootOption> = state
            .options
            .iter()
            .filter(|o| {
                self.slots.is_managed_nvram_label(&o.label)
                    || o.partition
                        .as_ref()
                        .and_then(|p| p.guid.as_deref())
                        .is_some_and(|guid| disk_guids.contains(guid))
            })
            .collect();

        let mut kept: HashMap<SlotId, BootNumber> = HashMap::new();
        for target in targets {
            let keep = owned
                .iter()
                .find(|o| !kept.values().any(|id| *id == o.id) && self.is_consistent(o, target));
            if let Some(option) = keep {
                debug!("arbiter: keeping Boot{} for slot {}", option.id, target.slot);
                kept.insert(target.slot, option.id);
            }
        }

        let stale: Vec<BootNumber> = owned
            .iter()
            .map(|o| o.id)
            .filter(|id| !kept.values().any(|k| k == id))
            .collect();
        for id in stale {
            warn!("arbiter: deleting stale NVRAM option Boot{id}");
            self.firmware.delete_entry(id)?;
            report.deleted.push(id);
        }

        for target in targets.iter().filter(|t| !kept.contains_key(&t.slot)) {
            info!(
                "arbiter: creating NVRAM option {:?} for {} partition {}",
                target.label,
                disk.display(),
                target.partition_index
            );
            self.firmware
                .create_entry(disk, target.partition_index, &target.label, &self.loader_path)?;
            report.created.push(target.slot);
        }

        if !report.deleted.is_empty() || !report.created.is_empty() {
            state = self.firmware.list()?;
        }

        for target in targets {
            let id = match kept.get(&target.slot) {
                Some(id) => *id,
                None => self
                    .resolve(&state, target)
                    .ok_or_else(|| ArbiterError::Unresolved { slot: target.slot, label: target.label.clone() })?,
            };
            report.resolved.push((target.slot, id));
        }

        let mut order: Vec<BootNumber> = [active, active.other()]
            .iter()
            .filter_map(|slot| report.id_for(*slot))
            .collect();
        let ours: HashSet<BootNumber> = order.iter().copied().collect();
        order.extend(
            state
                .boot_order
                .iter()
                .copied()
                .filter(|id| !ours.contains(id) && !report.deleted.contains(id)),
        );
        if order != state.boot_order {
            info!(
                "arbiter: boot order {} (slot {active} first)",
                order.iter().map(BootNumber::to_string).collect::<Vec<_>>().join(",")
            );
            self.firmware.set_boot_order(&order)?;
            report.order_changed = true;
        }
        report.boot_order = order;
        Ok(report)
    }

    fn is_consistent(&self, option: &BootOption, target: &EspTarget) -> bool {
        let Some(partition) = option.partition.as_ref() else {
            return false;
        };
        let guid_ok = match (&partition.guid, &target.partition_guid) {
            (Some(have), Some(want)) => have == want,
            _ => true,
        };
        option.label == target.label
            && partition.index == target.partition_index
            && guid_ok
            && option.loads(&self.loader_path)
    }

    /// Unique label match, else partition index (+ GUID and loader).
    fn resolve(&self, state: &NvramState, target: &EspTarget) -> Option<BootNumber> {
        let by_label: Vec<_> = state.options.iter().filter(|o| o.label == target.label).collect();
        if let [only] = by_label.as_slice() {
            return Some(only.id);
        }
        debug!("arbiter: {} options labelled {:?}, matching by partition", by_label.len(), target.label);
        state
            .options
            .iter()
            .find(|o| {
                o.partition.as_ref().is_some_and(|p| {
                    p.index == target.partition_index
                        && match (&p.guid, &target.partition_guid) {
                            (Some(have), Some(want)) => have == want,
                            _ => true,
                        }
                }) && o.loads(&self.loader_path)
            })
            .map(|o| o.id)
    }
}
