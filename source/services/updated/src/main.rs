// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: updated entrypoint

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    updated::daemon_main(updated::Cli::parse())
}
