// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Image installer (build into a mounted slot, verify, put on trial)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 9 unit tests
//!   - happy path puts newest generation on trial
//!   - blessed policy leaves entry permanent
//!   - missing loader/kernel/initrd named in the error, new entries discarded
//!   - a build without a new generation fails verification
//!   - interrupted install discarded before the next build
//!   - command builder placeholder substitution and program lookup

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{BuilderConfig, UpdaterConfig};
use crate::entries::{esp_relative, EntryContents, EntryName, GenerationId};
use crate::health::{BootHealth, EntryStore, HealthError};
use crate::mount::ScopedMount;
use crate::slot::SlotId;
use crate::volume::find_in_path;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Exit { program: PathBuf, status: String, stderr: String },
    #[error("{0}")]
    Other(String),
}

/// Produces a complete system image into a mounted slot.
pub trait ImageBuilder {
    fn build(&self, slot: SlotId, config_ref: &str, root: &Path, boot: &Path) -> Result<(), BuildError>;

    /// Programs `build` needs that are not installed.
    fn missing_tools(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Runs an external build program with `{config}`, `{root}`, `{boot}` and
/// `{slot}` substituted into its arguments.
#[derive(Debug, Clone)]
pub struct CommandImageBuilder {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandImageBuilder {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    pub fn from_config(config: &BuilderConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    fn render_args(&self, slot: SlotId, config_ref: &str, root: &Path, boot: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{config}", config_ref)
                    .replace("{root}", &root.to_string_lossy())
                    .replace("{boot}", &boot.to_string_lossy())
                    .replace("{slot}", slot.as_str())
            })
            .collect()
    }
}

impl ImageBuilder for CommandImageBuilder {
    fn build(&self, slot: SlotId, config_ref: &str, root: &Path, boot: &Path) -> Result<(), BuildError> {
        let args = self.render_args(slot, config_ref, root, boot);
        info!("install: running {} {}", self.program.display(), args.join(" "));
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| BuildError::Spawn { program: self.program.clone(), source })?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("build: {line}");
        }
        if !output.status.success() {
            return Err(BuildError::Exit {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn missing_tools(&self) -> Vec<String> {
        let found = if self.program.components().count() > 1 {
            self.program.is_file()
        } else {
            find_in_path(&self.program.to_string_lossy())
        };
        if found {
            Vec::new()
        } else {
            vec![self.program.display().to_string()]
        }
    }
}

/// Post-condition that did not hold after a build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyFailure {
    #[error("boot loader {0} is missing")]
    LoaderMissing(PathBuf),
    #[error("fallback loader {path} digest {actual} does not match {expected}")]
    LoaderDigestMismatch { path: PathBuf, expected: String, actual: String },
    #[error("no boot entries in {0}")]
    NoEntries(PathBuf),
    #[error("build produced no generation newer than {previous}")]
    NoNewGeneration { previous: GenerationId },
    #[error("entry {entry} names no kernel")]
    EntryWithoutKernel { entry: String },
    #[error("entry {entry} references missing kernel {path}")]
    KernelMissing { entry: String, path: PathBuf },
    #[error("entry {entry} references missing initrd {path}")]
    InitrdMissing { entry: String, path: PathBuf },
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("image build for {config_ref} failed: {reason}")]
    BuildFailed { config_ref: String, reason: String },
    #[error("slot {slot} failed verification: {reason}")]
    VerificationFailed { slot: SlotId, reason: VerifyFailure },
    #[error("install I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Health(#[from] HealthError),
}

/// What happens to a freshly built generation once it verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPolicy {
    Trial(u8),
    /// No known-good fallback exists yet (first install).
    Blessed,
}

pub struct Installer<'a> {
    config: &'a UpdaterConfig,
    builder: &'a dyn ImageBuilder,
}

impl<'a> Installer<'a> {
    pub fn new(config: &'a UpdaterConfig, builder: &'a dyn ImageBuilder) -> Self {
        Self { config, builder }
    }

    pub fn install(
        &self,
        mount: &ScopedMount<'_>,
        config_ref: &str,
        policy: TrialPolicy,
    ) -> Result<GenerationId, InstallError> {
        self.install_into(mount.slot(), mount.root(), mount.boot(), config_ref, policy)
    }

    pub fn install_into(
        &self,
        slot: SlotId,
        root: &Path,
        boot: &Path,
        config_ref: &str,
        policy: TrialPolicy,
    ) -> Result<GenerationId, InstallError> {
        let store = EntryStore::new(boot);
        let recovered = store.recover_interrupted_install()?;
        if !recovered.is_empty() {
            warn!("install: slot {slot}: discarded {} entries of an interrupted install", recovered.len());
        }
        let before = store.newest_generation()?;
        // until the marker is cleared, anything newer than `before` is unverified
        store.begin_install(before)?;

        info!("install: building {config_ref} into slot {slot}");
        let newest = match self.build_verified(slot, root, boot, config_ref, &store, before) {
            Ok(newest) => newest,
            Err(err) => {
                match store
                    .discard_newer_than(before)
                    .and_then(|discarded| store.finish_install().map(|()| discarded))
                {
                    Ok(discarded) if !discarded.is_empty() => {
                        warn!("install: discarded {} entries after failed install", discarded.len())
                    }
                    Ok(_) => {}
                    Err(cleanup) => error!("install: cleanup after failed install: {cleanup}"),
                }
                return Err(err);
            }
        };

        match policy {
            TrialPolicy::Trial(tries) => {
                store.begin_trial(newest, tries)?;
            }
            TrialPolicy::Blessed => {
                info!("install: generation {newest} installed as blessed");
            }
        }
        store.finish_install()?;
        Ok(newest)
    }

    /// Builds, copies the fallback loader and verifies. Returns the new
    /// generation, which must be newer than `before`.
    fn build_verified(
        &self,
        slot: SlotId,
        root: &Path,
        boot: &Path,
        config_ref: &str,
        store: &EntryStore,
        before: Option<GenerationId>,
    ) -> Result<GenerationId, InstallError> {
        self.builder
            .build(slot, config_ref, root, boot)
            .map_err(|err| InstallError::BuildFailed { config_ref: config_ref.to_string(), reason: err.to_string() })?;
        self.copy_fallback_loader(slot, boot)?;
        self.verify(slot, boot, store)?;

        let newest = store
            .newest_generation()?
            .ok_or_else(|| verify_err(slot, VerifyFailure::NoEntries(store.dir().to_path_buf())))?;
        match before {
            Some(previous) if newest <= previous => {
                Err(verify_err(slot, VerifyFailure::NoNewGeneration { previous }))
            }
            _ => Ok(newest),
        }
    }

    /// Copies the primary loader to the firmware fallback path.
    fn copy_fallback_loader(&self, slot: SlotId, boot: &Path) -> Result<(), InstallError> {
        let primary = boot.join(esp_relative(&self.config.loader.primary_path));
        let fallback = boot.join(esp_relative(&self.config.loader.fallback_path));
        let image = match fs::read(&primary) {
            Ok(image) => image,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(verify_err(slot, VerifyFailure::LoaderMissing(primary)));
            }
            Err(source) => return Err(InstallError::Io { path: primary, source }),
        };
        let expected = hex::encode(Sha256::digest(&image));

        let parent = fallback.parent().unwrap_or(boot);
        fs::create_dir_all(parent).map_err(|source| io_err(parent, source))?;
        let tmp = fallback.with_extension("tmp");
        {
            let mut file = File::create(&tmp).map_err(|source| io_err(&tmp, source))?;
            file.write_all(&image).map_err(|source| io_err(&tmp, source))?;
            file.sync_all().map_err(|source| io_err(&tmp, source))?;
        }
        fs::rename(&tmp, &fallback).map_err(|source| io_err(&fallback, source))?;

        let written = fs::read(&fallback).map_err(|source| io_err(&fallback, source))?;
        let actual = hex::encode(Sha256::digest(&written));
        if actual != expected {
            return Err(verify_err(slot, VerifyFailure::LoaderDigestMismatch { path: fallback, expected, actual }));
        }
        debug!("install: {} -> {} sha256={expected}", primary.display(), fallback.display());
        Ok(())
    }

    fn verify(&self, slot: SlotId, boot: &Path, store: &EntryStore) -> Result<(), InstallError> {
        for loader in [&self.config.loader.primary_path, &self.config.loader.fallback_path] {
            let path = boot.join(esp_relative(loader));
            if !path.is_file() {
                return Err(verify_err(slot, VerifyFailure::LoaderMissing(path)));
            }
        }

        let entries: Vec<_> = store
            .entries()?
            .into_iter()
            .filter(|e| e.health != BootHealth::Discarded)
            .collect();
        if entries.is_empty() {
            return Err(verify_err(slot, VerifyFailure::NoEntries(store.dir().to_path_buf())));
        }

        for entry in &entries {
            let path = store.dir().join(&entry.file_name);
            let text = fs::read_to_string(&path).map_err(|source| io_err(&path, source))?;
            check_entry(boot, entry.name(), &EntryContents::parse(&text)).map_err(|reason| verify_err(slot, reason))?;
        }
        info!("install: slot {slot} verified ({} entries)", entries.len());
        Ok(())
    }
}

fn check_entry(boot: &Path, name: &EntryName, contents: &EntryContents) -> Result<(), VerifyFailure> {
    let entry = name.file_name();
    let kernel = contents
        .kernel()
        .ok_or_else(|| VerifyFailure::EntryWithoutKernel { entry: entry.clone() })?;
    let kernel = boot.join(esp_relative(kernel));
    if !kernel.is_file() {
        return Err(VerifyFailure::KernelMissing { entry, path: kernel });
    }
    for initrd in &contents.initrd {
        let path = boot.join(esp_relative(initrd));
        if !path.is_file() {
            return Err(VerifyFailure::InitrdMissing { entry, path });
        }
    }
    Ok(())
}

fn verify_err(slot: SlotId, reason: VerifyFailure) -> InstallError {
    InstallError::VerificationFailed { slot, reason }
}

fn io_err(path: &Path, source: io::Error) -> InstallError {
    InstallError::Io { path: path.to_path_buf(), source }
}
