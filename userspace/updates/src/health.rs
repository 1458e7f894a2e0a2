// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Boot health state machine and the per-ESP entry store
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 13 unit tests
//!   - transitions (trial/bless/discard)
//!   - Trial(0) never bootable
//!   - trial countdown falls back to the previous blessed generation
//!   - repeated boot-complete is a no-op
//!   - garbage collection with retention
//!   - failed-install cleanup
//!   - interrupted install discarded on recovery
//!
//! State lives only in entry file names. Each transition is one rename in
//! `loader/entries/` followed by an fsync of the directory.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::entries::{EntryName, GenerationId, CONF_SUFFIX};

pub const ENTRIES_DIR: &str = "loader/entries";
/// Present in the entries directory while an install writes to the ESP.
/// Holds the newest generation from before the build, or `none`.
pub const INSTALL_MARKER: &str = ".install-pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "tries_left", rename_all = "lowercase")]
pub enum BootHealth {
    /// New generation with this many boot attempts left.
    Trial(u8),
    /// Survived a complete boot.
    Blessed,
    /// Ran out of tries; kept for inspection only.
    Discarded,
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("entry {entry} was discarded and cannot be blessed")]
    Discarded { entry: String },
    #[error("no boot entry {entry} in {dir}")]
    UnknownEntry { entry: String, dir: PathBuf },
    #[error("no generation {generation} in {dir}")]
    UnknownGeneration { generation: GenerationId, dir: PathBuf },
    #[error("entry store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BootHealth {
    /// A clean boot reached the completion target.
    pub fn on_boot_completed(self) -> Result<Self, HealthError> {
        match self {
            BootHealth::Trial(_) | BootHealth::Blessed => Ok(BootHealth::Blessed),
            BootHealth::Discarded => Err(HealthError::Discarded { entry: String::new() }),
        }
    }

    /// The boot loader is about to try this entry.
    pub fn on_boot_attempt(self) -> Self {
        match self {
            BootHealth::Trial(0) => BootHealth::Discarded,
            BootHealth::Trial(n) => BootHealth::Trial(n - 1),
            other => other,
        }
    }

    pub fn is_bootable(self) -> bool {
        matches!(self, BootHealth::Blessed) || matches!(self, BootHealth::Trial(n) if n > 0)
    }
}

/// An entry file found on an ESP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootEntry {
    pub id: String,
    pub file_name: String,
    pub generation: GenerationId,
    pub health: BootHealth,
    pub attempts: u8,
    #[serde(skip)]
    name: EntryName,
}

impl BootEntry {
    fn from_name(name: EntryName) -> Self {
        Self {
            id: name.id(),
            file_name: name.file_name(),
            generation: name.generation(),
            health: name.health,
            attempts: name.attempts,
            name,
        }
    }

    pub fn name(&self) -> &EntryName {
        &self.name
    }
}

/// Boot entries of one ESP.
pub struct EntryStore {
    dir: PathBuf,
}

impl EntryStore {
    /// Store rooted at an ESP mount point.
    pub fn new(esp_root: &Path) -> Self {
        Self { dir: esp_root.join(ENTRIES_DIR) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All entries, oldest generation first.
    pub fn entries(&self) -> Result<Vec<BootEntry>, HealthError> {
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_err(&self.dir, source)),
        };
        let mut entries = Vec::new();
        for item in read {
            let item = item.map_err(|source| self.io_err(&self.dir, source))?;
            let file_name = item.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = EntryName::parse(file_name) {
                entries.push(BootEntry::from_name(name));
            }
        }
        entries.sort_by(|a, b| a.generation.cmp(&b.generation).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Entries the boot loader may pick, newest first.
    pub fn bootable_entries(&self) -> Result<Vec<BootEntry>, HealthError> {
        let mut entries: Vec<_> = self.entries()?.into_iter().filter(|e| e.health.is_bootable()).collect();
        entries.reverse();
        Ok(entries)
    }

    /// The entry the boot loader picks next.
    pub fn select(&self) -> Result<Option<BootEntry>, HealthError> {
        Ok(self.bootable_entries()?.into_iter().next())
    }

    pub fn newest_generation(&self) -> Result<Option<GenerationId>, HealthError> {
        Ok(self.entries()?.iter().map(|e| e.generation).max())
    }

    /// Puts a verified generation on trial with `tries` attempts.
    pub fn begin_trial(&self, generation: GenerationId, tries: u8) -> Result<BootEntry, HealthError> {
        let entry = self.find_generation(generation)?;
        let mut next = entry.name.clone();
        next.health = BootHealth::Trial(tries);
        next.attempts = 0;
        info!("health: generation {generation} on trial ({tries} tries) in {}", self.dir.display());
        self.transition(&entry, next)
    }

    /// Discards every live entry newer than `generation` (all of them for
    /// `None`). Used to retire what a failed build left behind.
    pub fn discard_newer_than(&self, generation: Option<GenerationId>) -> Result<Vec<BootEntry>, HealthError> {
        let mut discarded = Vec::new();
        for entry in self.entries()? {
            if entry.health == BootHealth::Discarded || generation.is_some_and(|g| entry.generation <= g) {
                continue;
            }
            let mut next = entry.name.clone();
            next.health = BootHealth::Discarded;
            warn!("health: discarding unverified {}", entry.id);
            discarded.push(self.transition(&entry, next)?);
        }
        Ok(discarded)
    }

    /// Records that entries newer than `before` are about to be written. They
    /// count as unverified until `finish_install`.
    pub fn begin_install(&self, before: Option<GenerationId>) -> Result<(), HealthError> {
        fs::create_dir_all(&self.dir).map_err(|source| self.io_err(&self.dir, source))?;
        let marker = self.dir.join(INSTALL_MARKER);
        let tmp = self.dir.join(format!("{INSTALL_MARKER}.tmp"));
        let text = before.map_or_else(|| "none".to_string(), |g| g.to_string());
        {
            let mut file = File::create(&tmp).map_err(|source| self.io_err(&tmp, source))?;
            file.write_all(text.as_bytes()).map_err(|source| self.io_err(&tmp, source))?;
            file.sync_all().map_err(|source| self.io_err(&tmp, source))?;
        }
        fs::rename(&tmp, &marker).map_err(|source| self.io_err(&marker, source))?;
        debug!("health: install pending in {} (before {text})", self.dir.display());
        self.sync_dir()
    }

    pub fn finish_install(&self) -> Result<(), HealthError> {
        let marker = self.dir.join(INSTALL_MARKER);
        match fs::remove_file(&marker) {
            Ok(()) => self.sync_dir(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_err(&marker, source)),
        }
    }

    /// Discards whatever an interrupted install wrote, then clears its marker.
    pub fn recover_interrupted_install(&self) -> Result<Vec<BootEntry>, HealthError> {
        let marker = self.dir.join(INSTALL_MARKER);
        let text = match fs::read_to_string(&marker) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_err(&marker, source)),
        };
        let before = match text.trim() {
            "none" => None,
            digits => match digits.parse() {
                Ok(generation) => Some(GenerationId(generation)),
                Err(_) => {
                    warn!("health: unreadable install marker {text:?} in {}; dropping it", self.dir.display());
                    return self.finish_install().map(|()| Vec::new());
                }
            },
        };
        warn!("health: install into {} was interrupted", self.dir.display());
        let discarded = self.discard_newer_than(before)?;
        self.finish_install()?;
        Ok(discarded)
    }

    /// Boot loader side of a boot: retires exhausted trials, then spends
    /// one try of the selected entry. Returns the selected entry.
    pub fn record_boot_attempt(&self) -> Result<Option<BootEntry>, HealthError> {
        for entry in self.entries()? {
            if entry.health == BootHealth::Trial(0) {
                let mut next = entry.name.clone();
                next.health = entry.health.on_boot_attempt();
                warn!("health: {} exhausted its tries, discarding", entry.id);
                self.transition(&entry, next)?;
            }
        }

        let Some(selected) = self.select()? else {
            warn!("health: no bootable entry in {}", self.dir.display());
            return Ok(None);
        };
        if let BootHealth::Trial(_) = selected.health {
            let mut next = selected.name.clone();
            next.health = selected.health.on_boot_attempt();
            next.attempts = next.attempts.saturating_add(1);
            debug!("health: boot attempt on {} -> {:?}", selected.id, next.health);
            return self.transition(&selected, next).map(Some);
        }
        Ok(Some(selected))
    }

    /// Consumes the boot-completion signal for `entry_id`. Repeats are no-ops.
    pub fn mark_boot_completed(&self, entry_id: &str) -> Result<BootEntry, HealthError> {
        let wanted = entry_id.strip_suffix(CONF_SUFFIX).unwrap_or(entry_id);
        let entry = self
            .entries()?
            .into_iter()
            .find(|e| e.name.stem == wanted)
            .ok_or_else(|| HealthError::UnknownEntry { entry: entry_id.to_string(), dir: self.dir.clone() })?;
        let health = entry
            .health
            .on_boot_completed()
            .map_err(|_| HealthError::Discarded { entry: entry.id.clone() })?;
        if health == entry.health {
            debug!("health: {} already blessed", entry.id);
            return Ok(entry);
        }
        let mut next = entry.name.clone();
        next.health = health;
        next.attempts = 0;
        info!("health: blessing {}", entry.id);
        self.transition(&entry, next)
    }

    /// Removes blessed entries beyond `retention` and discarded entries older
    /// than the newest blessed one. Never removes the selected entry.
    pub fn collect_garbage(&self, retention: usize) -> Result<Vec<BootEntry>, HealthError> {
        let entries = self.entries()?;
        let selected = self.select()?.map(|e| e.id);
        let newest_blessed = entries
            .iter()
            .filter(|e| e.health == BootHealth::Blessed)
            .map(|e| e.generation)
            .max();

        let blessed: Vec<_> = entries.iter().filter(|e| e.health == BootHealth::Blessed).collect();
        let keep_from = blessed.len().saturating_sub(retention.max(1));
        let mut doomed: Vec<&BootEntry> = blessed[..keep_from].to_vec();
        if let Some(newest) = newest_blessed {
            doomed.extend(
                entries
                    .iter()
                    .filter(|e| e.health == BootHealth::Discarded && e.generation < newest),
            );
        }

        let mut removed = Vec::new();
        for entry in doomed {
            if selected.as_deref() == Some(entry.id.as_str()) {
                continue;
            }
            let path = self.dir.join(&entry.file_name);
            info!("health: removing {}", path.display());
            fs::remove_file(&path).map_err(|source| self.io_err(&path, source))?;
            removed.push(entry.clone());
        }
        if !removed.is_empty() {
            self.sync_dir()?;
        }
        Ok(removed)
    }

    fn find_generation(&self, generation: GenerationId) -> Result<BootEntry, HealthError> {
        self.entries()?
            .into_iter()
            .rev()
            .find(|e| e.generation == generation)
            .ok_or(HealthError::UnknownGeneration { generation, dir: self.dir.clone() })
    }

    fn transition(&self, entry: &BootEntry, next: EntryName) -> Result<BootEntry, HealthError> {
        let from = self.dir.join(&entry.file_name);
        let to = self.dir.join(next.file_name());
        if from != to {
            fs::rename(&from, &to).map_err(|source| self.io_err(&from, source))?;
            self.sync_dir()?;
        }
        Ok(BootEntry::from_name(next))
    }

    fn sync_dir(&self) -> Result<(), HealthError> {
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(|source| self.io_err(&self.dir, source))
    }

    fn io_err(&self, path: &Path, source: io::Error) -> HealthError {
        HealthError::Io { path: path.to_path_buf(), source }
    }
}
