// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: updated command line

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use updates::config::DEFAULT_CONFIG_PATH;
use updates::SlotId;

#[derive(Debug, Parser)]
#[command(name = "updated", version, about = "A/B boot-slot update orchestrator")]
pub struct Cli {
    /// Slot configuration file.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(long, short, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the partition layout for the configured disk.
    Plan {
        /// Plan for this many bytes instead of probing the disk.
        #[arg(long)]
        disk_size: Option<u64>,
    },
    /// Erase the disk and install both slots (slot A active).
    FirstInstall {
        /// Confirm that every partition on the disk is destroyed.
        #[arg(long)]
        yes: bool,
    },
    /// Install a new image into the standby slot on trial.
    Update {
        #[arg(long)]
        slot: SlotId,
        /// Image build configuration; defaults to the slot's `config_ref`.
        #[arg(long)]
        config_ref: Option<String>,
    },
    /// Boot `slot` first from now on.
    Switch {
        #[arg(long)]
        slot: SlotId,
    },
    /// Bless the running boot entry (run once per boot after boot-complete.target).
    BootComplete {
        /// Entry id; defaults to LoaderEntrySelected.
        #[arg(long)]
        entry: Option<String>,
    },
    /// Spend one try of the selected trial entry (loaders without boot counting).
    BootAttempt,
    /// Remove old and discarded entries from the running ESP.
    Gc,
    /// Print slots, entries and NVRAM state as JSON.
    Status,
}
