// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Top-level update error and its coarse classification
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 2 unit tests

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::arbiter::ArbiterError;
use crate::config::ConfigError;
use crate::firmware::FirmwareError;
use crate::gpt::GptError;
use crate::health::HealthError;
use crate::install::InstallError;
use crate::layout::LayoutError;
use crate::mount::MountError;
use crate::provision::ProvisionError;
use crate::slot::SlotId;
use crate::volume::VolumeError;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Gpt(#[from] GptError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Health(#[from] HealthError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error(transparent)]
    Arbiter(#[from] ArbiterError),
    /// Updating the running slot would overwrite the system in use.
    #[error("slot {slot} is the active slot; update the standby slot {} instead", .slot.other())]
    TargetIsActive { slot: SlotId },
    #[error("no config_ref given and none configured for slot {slot}")]
    MissingConfigRef { slot: SlotId },
    #[error("partition {label:?} not found in the GPT of {disk}")]
    PartitionNotFound { disk: PathBuf, label: String },
}

/// Failure classes; the host binary maps each to an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ToolMissing,
    InsufficientSpace,
    DeviceBusy,
    BuildFailed,
    VerificationFailed,
    ArbiterUnavailable,
    TargetIsActive,
    Config,
    Other,
}

impl ErrorKind {
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Other => 1,
            ErrorKind::Config => 2,
            ErrorKind::ToolMissing => 3,
            ErrorKind::InsufficientSpace => 4,
            ErrorKind::DeviceBusy => 5,
            ErrorKind::BuildFailed => 6,
            ErrorKind::VerificationFailed => 7,
            ErrorKind::ArbiterUnavailable => 8,
            ErrorKind::TargetIsActive => 9,
        }
    }
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Config(_) | UpdateError::MissingConfigRef { .. } => ErrorKind::Config,
            UpdateError::Layout(LayoutError::InsufficientSpace { .. }) => ErrorKind::InsufficientSpace,
            UpdateError::Layout(LayoutError::UnalignedBootSize { .. }) => ErrorKind::Config,
            UpdateError::Gpt(GptError::TooSmall { .. }) => ErrorKind::InsufficientSpace,
            UpdateError::Provision(err) => match err {
                ProvisionError::ToolMissing { .. } => ErrorKind::ToolMissing,
                ProvisionError::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
                ProvisionError::DeviceBusy { .. } => ErrorKind::DeviceBusy,
                ProvisionError::Gpt(GptError::TooSmall { .. }) => ErrorKind::InsufficientSpace,
                _ => ErrorKind::Other,
            },
            UpdateError::Mount(MountError::Unmount { .. }) => ErrorKind::DeviceBusy,
            UpdateError::Install(err) => match err {
                InstallError::BuildFailed { .. } => ErrorKind::BuildFailed,
                InstallError::VerificationFailed { .. } => ErrorKind::VerificationFailed,
                _ => ErrorKind::Other,
            },
            UpdateError::Firmware(FirmwareError::Unavailable { .. })
            | UpdateError::Arbiter(ArbiterError::Unavailable { .. }) => ErrorKind::ArbiterUnavailable,
            UpdateError::TargetIsActive { .. } => ErrorKind::TargetIsActive,
            _ => ErrorKind::Other,
        }
    }
}
