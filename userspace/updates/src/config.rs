// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Updater configuration (TOML), passed explicitly to every component
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 8 unit tests
//!
//! Every field carries a default, so a minimal file only names the disk:
//!
//! ```toml
//! disk = "/dev/nvme0n1"
//!
//! [slots.a]
//! config_ref = "images/base.conf"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::gpt;
use crate::layout::MIB;
use crate::slot::SlotId;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/updated/slots.toml";

/// FAT volume labels are limited to 11 bytes.
const FAT_LABEL_MAX: usize = 11;
const BTRFS_LABEL_MAX: usize = 255;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdaterConfig {
    /// Block device holding both slots.
    pub disk: PathBuf,
    pub boot_size_bytes: u64,
    /// Scratch directory for `slot-<id>` mount points.
    pub work_dir: PathBuf,
    /// Where the running system mounts its own ESP.
    pub esp_mount: PathBuf,
    /// Primary btrfs subvolume inside each root.
    pub subvolume: String,
    pub mount: MountConfig,
    pub loader: LoaderConfig,
    pub boot: BootConfig,
    pub builder: BuilderConfig,
    pub slots: SlotsConfig,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            disk: PathBuf::new(),
            boot_size_bytes: crate::layout::DEFAULT_BOOT_SIZE,
            work_dir: PathBuf::from("/run/updated/mnt"),
            esp_mount: PathBuf::from("/boot"),
            subvolume: "@".to_string(),
            mount: MountConfig::default(),
            loader: LoaderConfig::default(),
            boot: BootConfig::default(),
            builder: BuilderConfig::default(),
            slots: SlotsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountConfig {
    /// btrfs `compress=` algorithm; empty disables compression.
    pub compression: String,
    pub ssd: bool,
    /// btrfs `discard=` mode; empty leaves the kernel default.
    pub discard: String,
    pub boot_options: Vec<String>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            compression: "zstd".to_string(),
            ssd: true,
            discard: "async".to_string(),
            boot_options: vec!["umask=0077".to_string()],
        }
    }
}

impl MountConfig {
    /// Options for the slot root, ending with the subvolume selector.
    pub fn root_options(&self, subvolume: &str) -> Vec<String> {
        let mut options = Vec::new();
        if !self.compression.is_empty() {
            options.push(format!("compress={}", self.compression));
        }
        if self.ssd {
            options.push("ssd".to_string());
        }
        if !self.discard.is_empty() {
            options.push(format!("discard={}", self.discard));
        }
        options.push(format!("subvol={subvolume}"));
        options
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// Loader binary the image build installs, relative to the ESP root.
    pub primary_path: String,
    /// Firmware default path both NVRAM options point at.
    pub fallback_path: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            primary_path: "EFI/systemd/systemd-bootx64.efi".to_string(),
            fallback_path: "EFI/BOOT/BOOTX64.EFI".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootConfig {
    pub trial_tries: u8,
    /// Blessed generations kept per ESP by garbage collection.
    pub retention: usize,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self { trial_tries: 2, retention: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    pub program: PathBuf,
    /// Arguments with `{config}`, `{root}`, `{boot}` and `{slot}` placeholders.
    pub args: Vec<String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/usr/lib/updated/build-image"),
            args: ["--config", "{config}", "--root", "{root}", "--boot", "{boot}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotConfig {
    pub root_label: String,
    pub boot_label: String,
    pub nvram_label: String,
    pub config_ref: Option<String>,
}

impl SlotConfig {
    pub fn default_for(slot: SlotId) -> Self {
        let upper = slot.as_str().to_ascii_uppercase();
        Self {
            root_label: format!("ROOT_{upper}"),
            boot_label: format!("ESP_{upper}"),
            nvram_label: format!("Slot {upper}"),
            config_ref: None,
        }
    }
}

/// A `[slots.<id>]` table as written; absent labels take the slot's defaults.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SlotTable {
    root_label: Option<String>,
    boot_label: Option<String>,
    nvram_label: Option<String>,
    config_ref: Option<String>,
}

impl SlotTable {
    fn resolve(self, slot: SlotId) -> SlotConfig {
        let defaults = SlotConfig::default_for(slot);
        SlotConfig {
            root_label: self.root_label.unwrap_or(defaults.root_label),
            boot_label: self.boot_label.unwrap_or(defaults.boot_label),
            nvram_label: self.nvram_label.unwrap_or(defaults.nvram_label),
            config_ref: self.config_ref,
        }
    }
}

fn slot_a<'de, D: Deserializer<'de>>(de: D) -> Result<SlotConfig, D::Error> {
    SlotTable::deserialize(de).map(|table| table.resolve(SlotId::A))
}

fn slot_b<'de, D: Deserializer<'de>>(de: D) -> Result<SlotConfig, D::Error> {
    SlotTable::deserialize(de).map(|table| table.resolve(SlotId::B))
}

fn default_slot_a() -> SlotConfig {
    SlotConfig::default_for(SlotId::A)
}

fn default_slot_b() -> SlotConfig {
    SlotConfig::default_for(SlotId::B)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotsConfig {
    #[serde(default = "default_slot_a", deserialize_with = "slot_a")]
    pub a: SlotConfig,
    #[serde(default = "default_slot_b", deserialize_with = "slot_b")]
    pub b: SlotConfig,
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self { a: default_slot_a(), b: default_slot_b() }
    }
}

impl SlotsConfig {
    pub fn get(&self, slot: SlotId) -> &SlotConfig {
        match slot {
            SlotId::A => &self.a,
            SlotId::B => &self.b,
        }
    }

    /// Maps a filesystem label back to the slot whose root carries it.
    pub fn slot_for_root_label(&self, label: &str) -> Option<SlotId> {
        SlotId::ALL.into_iter().find(|slot| self.get(*slot).root_label == label)
    }

    pub fn is_managed_nvram_label(&self, label: &str) -> bool {
        SlotId::ALL.iter().any(|slot| self.get(*slot).nvram_label == label)
    }
}

impl UpdaterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::parse(&text, path)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, Path::new("<inline>"))
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate().map_err(|reason| ConfigError::Invalid { path: path.to_path_buf(), reason })?;
        Ok(config)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.disk.as_os_str().is_empty() {
            return Err("`disk` must name a block device".to_string());
        }
        if self.boot_size_bytes == 0 || self.boot_size_bytes % MIB != 0 {
            return Err(format!(
                "`boot_size_bytes` = {} is not a non-zero multiple of 1 MiB",
                self.boot_size_bytes
            ));
        }
        if self.subvolume.is_empty() || self.subvolume.contains('/') {
            return Err(format!("`subvolume` = {:?} must be a single path component", self.subvolume));
        }
        if self.boot.trial_tries == 0 {
            return Err("`boot.trial_tries` must be at least 1".to_string());
        }
        if self.boot.retention == 0 {
            return Err("`boot.retention` must be at least 1".to_string());
        }
        if self.loader.primary_path.trim_matches(['/', '\\']).is_empty()
            || self.loader.fallback_path.trim_matches(['/', '\\']).is_empty()
        {
            return Err("loader paths must not be empty".to_string());
        }

        let mut fs_labels = HashSet::new();
        let mut nvram_labels = HashSet::new();
        for slot in SlotId::ALL {
            let cfg = self.slots.get(slot);
            for (field, label, max) in [
                ("root_label", &cfg.root_label, BTRFS_LABEL_MAX),
                ("boot_label", &cfg.boot_label, FAT_LABEL_MAX),
            ] {
                if label.is_empty() {
                    return Err(format!("`slots.{slot}.{field}` must not be empty"));
                }
                if label.len() > max {
                    return Err(format!("`slots.{slot}.{field}` = {label:?} exceeds {max} bytes"));
                }
                // both labels also name the GPT partition
                if gpt::partition_name(label).is_err() {
                    return Err(format!(
                        "`slots.{slot}.{field}` = {label:?} does not fit a GPT partition name (35 UCS-2 characters)"
                    ));
                }
                if !fs_labels.insert(label.as_str()) {
                    return Err(format!("filesystem label {label:?} is used twice"));
                }
            }
            if cfg.nvram_label.is_empty() {
                return Err(format!("`slots.{slot}.nvram_label` must not be empty"));
            }
            if !nvram_labels.insert(cfg.nvram_label.as_str()) {
                return Err(format!("NVRAM label {:?} is used twice", cfg.nvram_label));
            }
        }
        Ok(())
    }
}
