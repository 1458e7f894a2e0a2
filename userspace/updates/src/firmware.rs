// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: UEFI NVRAM boot options (typed efibootmgr front end + efivarfs reads)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 6 unit tests (verbose output parsing, efivar decoding)

use core::fmt;
use core::str::FromStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::entries::esp_relative;

pub const EFIVARS_DIR: &str = "/sys/firmware/efi/efivars";
/// systemd-boot loader interface vendor GUID.
pub const LOADER_VENDOR_GUID: &str = "4a67b082-0a4c-41cf-b6c7-440b29bb8c4f";

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("firmware boot manager unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("efibootmgr {args} exited with {status}: {stderr}")]
    Command { args: String, status: String, stderr: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// NVRAM `BootXXXX` number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BootNumber(pub u16);

impl fmt::Display for BootNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for BootNumber {
    type Err = core::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("Boot").unwrap_or(s);
        u16::from_str_radix(s, 16).map(BootNumber)
    }
}

impl Serialize for BootNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// GPT partition a boot option points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionPartition {
    pub index: u32,
    /// Lowercase partition GUID.
    pub guid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootOption {
    pub id: BootNumber,
    pub label: String,
    pub active: bool,
    pub partition: Option<OptionPartition>,
    /// Loader path as stored in NVRAM (`\EFI\...`).
    pub loader_path: Option<String>,
}

impl BootOption {
    pub fn loads(&self, loader: &str) -> bool {
        self.loader_path.as_deref().is_some_and(|path| same_loader(path, loader))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NvramState {
    pub options: Vec<BootOption>,
    pub boot_order: Vec<BootNumber>,
    pub boot_current: Option<BootNumber>,
}

impl NvramState {
    pub fn get(&self, id: BootNumber) -> Option<&BootOption> {
        self.options.iter().find(|o| o.id == id)
    }
}

pub trait Firmware {
    fn list(&self) -> Result<NvramState, FirmwareError>;
    fn create_entry(&self, disk: &Path, partition_index: u32, label: &str, loader_path: &str)
        -> Result<(), FirmwareError>;
    fn delete_entry(&self, id: BootNumber) -> Result<(), FirmwareError>;
    fn set_boot_order(&self, order: &[BootNumber]) -> Result<(), FirmwareError>;
    /// Entry id the boot loader reported for the current boot.
    fn selected_loader_entry(&self) -> Result<Option<String>, FirmwareError>;
}

/// `EFI/BOOT/x.EFI` -> `\EFI\BOOT\x.EFI`.
pub fn to_efi_path(path: &str) -> String {
    let mut out = String::new();
    for part in esp_relative(path).iter() {
        out.push('\\');
        out.push_str(&part.to_string_lossy());
    }
    out
}

/// Loader path equality on a FAT file system (separator and case blind).
pub fn same_loader(a: &str, b: &str) -> bool {
    to_efi_path(a).eq_ignore_ascii_case(&to_efi_path(b))
}

/// Parses `efibootmgr -v` output.
pub fn parse_verbose(text: &str) -> NvramState {
    let mut state = NvramState::default();
    for line in text.lines() {
        if let Some(current) = line.strip_prefix("BootCurrent:") {
            state.boot_current = current.parse().ok();
        } else if let Some(order) = line.strip_prefix("BootOrder:") {
            state.boot_order = order
                .split(',')
                .filter_map(|id| id.parse().ok())
                .collect();
        } else if let Some(option) = parse_option_line(line) {
            state.options.push(option);
        }
    }
    state
}

fn parse_option_line(line: &str) -> Option<BootOption> {
    let rest = line.strip_prefix("Boot")?;
    let number = rest.get(..4)?;
    if !number.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let id: BootNumber = number.parse().ok()?;
    let rest = &rest[4..];
    let active = rest.starts_with('*');
    let rest = rest.trim_start_matches('*').trim_start();
    let (label, device_path) = match rest.split_once('\t') {
        Some((label, path)) => (label.trim_end(), path.trim()),
        None => (rest.trim_end(), ""),
    };

    let mut partition = None;
    let mut loader_path = None;
    for node in device_path.split(")/") {
        let node = node.trim_end_matches(')');
        if let Some(args) = node.strip_prefix("HD(") {
            let fields: Vec<_> = args.split(',').collect();
            if let Some(index) = fields.first().and_then(|i| i.trim().parse().ok()) {
                let guid = match fields.get(1) {
                    Some(kind) if kind.eq_ignore_ascii_case("GPT") => fields.get(2).map(|g| g.to_ascii_lowercase()),
                    _ => None,
                };
                partition = Some(OptionPartition { index, guid });
            }
        } else if let Some(file) = node.strip_prefix("File(") {
            loader_path = Some(file.to_string());
        } else if node.starts_with('\\') {
            loader_path = Some(node.to_string());
        }
    }

    Some(BootOption { id, label: label.to_string(), active, partition, loader_path })
}

/// Decodes an efivarfs file: 4 attribute bytes, then NUL-terminated UTF-16LE.
pub fn decode_efivar_string(raw: &[u8]) -> Option<String> {
    let payload = raw.get(4..)?;
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16(&units).ok()
}

/// `Firmware` backed by `efibootmgr` and efivarfs.
#[derive(Debug, Clone)]
pub struct EfiBootMgr {
    program: PathBuf,
    efivars: PathBuf,
}

impl Default for EfiBootMgr {
    fn default() -> Self {
        Self { program: PathBuf::from("efibootmgr"), efivars: PathBuf::from(EFIVARS_DIR) }
    }
}

impl EfiBootMgr {
    pub fn new(program: impl Into<PathBuf>, efivars: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), efivars: efivars.into() }
    }

    fn run(&self, args: &[String]) -> Result<String, FirmwareError> {
        if !self.efivars.is_dir() {
            return Err(FirmwareError::Unavailable {
                reason: format!("{} not present (not booted via UEFI?)", self.efivars.display()),
            });
        }
        debug!("firmware: {} {}", self.program.display(), args.join(" "));
        let output = Command::new(&self.program).args(args).output().map_err(|err| {
            FirmwareError::Unavailable { reason: format!("cannot run {}: {err}", self.program.display()) }
        })?;
        if !output.status.success() {
            return Err(FirmwareError::Command {
                args: args.join(" "),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Firmware for EfiBootMgr {
    fn list(&self) -> Result<NvramState, FirmwareError> {
        Ok(parse_verbose(&self.run(&["-v".to_string()])?))
    }

    fn create_entry(&self, disk: &Path, partition_index: u32, label: &str, loader_path: &str) -> Result<(), FirmwareError> {
        let args = [
            "-c".to_string(),
            "-d".to_string(),
            disk.to_string_lossy().into_owned(),
            "-p".to_string(),
            partition_index.to_string(),
            "-L".to_string(),
            label.to_string(),
            "-l".to_string(),
            to_efi_path(loader_path),
        ];
        self.run(&args).map(drop)
    }

    fn delete_entry(&self, id: BootNumber) -> Result<(), FirmwareError> {
        self.run(&["-b".to_string(), id.to_string(), "-B".to_string()]).map(drop)
    }

    fn set_boot_order(&self, order: &[BootNumber]) -> Result<(), FirmwareError> {
        let order = order.iter().map(BootNumber::to_string).collect::<Vec<_>>().join(",");
        self.run(&["-o".to_string(), order]).map(drop)
    }

    fn selected_loader_entry(&self) -> Result<Option<String>, FirmwareError> {
        let path = self.efivars.join(format!("LoaderEntrySelected-{LOADER_VENDOR_GUID}"));
        match fs::read(&path) {
            Ok(raw) => Ok(decode_efivar_string(&raw).filter(|s| !s.is_empty())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(FirmwareError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: &str = "\
BootCurrent: 0001
Timeout: 1 seconds
BootOrder: 0001,0000,0003
Boot0000* Slot A\tHD(1,GPT,0a1b2c3d-0000-4000-8000-00000000000A,0x800,0x100000)/File(\\EFI\\BOOT\\BOOTX64.EFI)
Boot0001* Slot B\tHD(2,GPT,0A1B2C3D-0000-4000-8000-00000000000B,0x100800,0x100000)/File(\\EFI\\BOOT\\BOOTX64.EFI)
Boot0003  UEFI Shell\tFvVol(7cb8bdc9-f8eb-4f34-aaea-3ee4af6516a1)/FvFile(7c04a583-9e3e-4f1c-ad65-e05268d0b4d1)
";

    #[test]
    fn parses_legacy_verbose_output() {
        let state = parse_verbose(LEGACY);
        assert_eq!(state.boot_current, Some(BootNumber(1)));
        assert_eq!(state.boot_order, vec![BootNumber(1), BootNumber(0), BootNumber(3)]);
        assert_eq!(state.options.len(), 3);

        let b = state.get(BootNumber(1)).unwrap();
        assert_eq!(b.label, "Slot B");
        assert!(b.active);
        let part = b.partition.as_ref().unwrap();
        assert_eq!(part.index, 2);
        assert_eq!(part.guid.as_deref(), Some("0a1b2c3d-0000-4000-8000-00000000000b"));
        assert!(b.loads("EFI/BOOT/BOOTX64.EFI"));

        let shell = state.get(BootNumber(3)).unwrap();
        assert!(!shell.active);
        assert!(shell.partition.is_none());
        assert!(shell.loader_path.is_none());
    }

    #[test]
    fn parses_bare_path_output() {
        let text = "Boot000A* Slot A\tHD(1,GPT,11111111-2222-4333-8444-555555555555,0x800,0x100000)/\\EFI\\BOOT\\BOOTX64.EFI\n      dp: 04 01 2a 00\n";
        let state = parse_verbose(text);
        assert_eq!(state.options.len(), 1);
        let option = &state.options[0];
        assert_eq!(option.id, BootNumber(10));
        assert_eq!(option.loader_path.as_deref(), Some("\\EFI\\BOOT\\BOOTX64.EFI"));
    }

    #[test]
    fn boot_numbers_are_four_hex_digits() {
        assert_eq!(BootNumber(0x1a).to_string(), "001A");
        assert_eq!("Boot001A".parse::<BootNumber>().unwrap(), BootNumber(0x1a));
        assert!("zz".parse::<BootNumber>().is_err());
    }

    #[test]
    fn efi_paths_use_backslashes() {
        assert_eq!(to_efi_path("EFI/BOOT/BOOTX64.EFI"), "\\EFI\\BOOT\\BOOTX64.EFI");
        assert_eq!(to_efi_path("/EFI//BOOT/"), "\\EFI\\BOOT");
        assert!(same_loader("\\efi\\boot\\bootx64.efi", "EFI/BOOT/BOOTX64.EFI"));
    }

    #[test]
    fn decodes_loader_entry_selected() {
        let mut raw = vec![0x06, 0x00, 0x00, 0x00];
        for unit in "slot-b-4.conf".encode_utf16().chain([0]) {
            raw.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_efivar_string(&raw).as_deref(), Some("slot-b-4.conf"));
        assert_eq!(decode_efivar_string(&[0, 0]), None);
    }

    #[test]
    fn missing_efivars_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let firmware = EfiBootMgr::new("efibootmgr", dir.path().join("efivars"));
        assert!(matches!(firmware.list(), Err(FirmwareError::Unavailable { .. })));
        assert_eq!(firmware.selected_loader_entry().unwrap(), None);
    }
}
