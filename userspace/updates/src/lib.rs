// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Update domain library (A/B slot provisioning, install, boot health, NVRAM order)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: Unit tests per module + integration tests (via tests/updates_host)
//!   - layout planning invariants (proptest)
//!   - GPT write/scan against sparse disk images
//!   - scoped mount unwinding and idempotence
//!   - install verification and trial marking
//!   - boot health state machine and entry file encoding
//!   - efibootmgr parsing and boot-order reconciliation
//!
//! PUBLIC API:
//!   - layout::plan: two-ESP + two-root partition layout
//!   - Provisioner: wipe, partition, format a disk
//!   - SlotMounter / ScopedMount: slot mounts with unmount-on-release
//!   - Installer: build a slot image, verify and put it on trial
//!   - BootHealth / EntryStore: trial/blessed/discarded bootloader entries
//!   - Arbiter: NVRAM entry cleanup and boot order
//!   - Orchestrator: first_install / update / switch_active
//!
//! DEPENDENCIES:
//!   - gpt_disk_io/gpt_disk_types: GPT table encoding
//!   - serde/toml: configuration
//!   - sha2: loader copy verification
//!   - log: protocol step logging

#![forbid(unsafe_code)]

pub mod arbiter;
pub mod config;
pub mod entries;
pub mod error;
pub mod firmware;
pub mod gpt;
pub mod health;
pub mod install;
pub mod layout;
pub mod mount;
pub mod orchestrator;
pub mod provision;
pub mod slot;
pub mod volume;

pub use arbiter::{Arbiter, ArbiterError, EspTarget, ReconcileReport};
pub use config::{ConfigError, UpdaterConfig};
pub use entries::{EntryContents, EntryName, GenerationId};
pub use error::{ErrorKind, UpdateError};
pub use firmware::{BootNumber, BootOption, EfiBootMgr, Firmware, FirmwareError, NvramState};
pub use health::{BootEntry, BootHealth, EntryStore, HealthError};
pub use install::{CommandImageBuilder, ImageBuilder, InstallError, Installer, TrialPolicy};
pub use layout::{PartitionKind, PartitionLayout, PartitionSpec};
pub use mount::{MountError, ScopedMount, SlotMounter};
pub use orchestrator::{ArbiterOutcome, Orchestrator};
pub use provision::{ProvisionError, Provisioner};
pub use slot::SlotId;
pub use volume::{SystemVolumes, VolumeError, VolumeManager};
