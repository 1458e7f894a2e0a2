#![forbid(unsafe_code)]
// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: updated host tool – A/B slot provisioning, standby updates and boot health hooks
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v2.0)
//! TEST_COVERAGE: 5 unit tests (argument parsing, exit codes, plan output)
//!
//! PUBLIC API: Cli, daemon_main(), execute()
//! DEPENDS_ON: updates domain library

mod cli;
mod std_server;

pub use cli::{Cli, Command};
pub use std_server::*;
