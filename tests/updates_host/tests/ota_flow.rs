// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: End-to-end A/B flows through the orchestrator
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 14 tests
//!
//! TEST_SCENARIOS:
//!   - first_install_provisions_both_slots(): layout, formats, blessed entries, slot A first
//!   - first_install_stops_before_wipe_without_tools(): preflight covers provisioner and mounter
//!   - first_install_stops_before_wipe_on_long_label(): GPT names encoded before the wipe
//!   - update_refuses_active_slot(): running system is never overwritten
//!   - update_puts_standby_on_trial(): active slot stays first, new entry Trial(2)
//!   - unconfirmed_trial_falls_back(): three boots without completion discard the trial
//!   - completion_on_first_boot_blesses(): Trial entry blessed via LoaderEntrySelected
//!   - failed_verification_unmounts_and_discards(): no mounts left, other slot untouched
//!   - failed_build_reports_config_ref(): BuildFailed exit class
//!   - rebuild_without_new_generation_is_rejected(): nothing boots unverified content untried
//!   - interrupted_update_is_discarded_on_fallback_boot(): crash between build and trial
//!   - reconcile_twice_is_a_no_op(): stale NVRAM from an old install cleaned once
//!   - update_without_firmware_is_degraded(): entries written, NVRAM untouched
//!   - switch_and_status(): switch moves the boot order only

use updates::error::ErrorKind;
use updates::firmware::OptionPartition;
use updates::gpt::{self, GptError};
use updates::install::{InstallError, VerifyFailure};
use updates::volume::{CowProfile, VolumeManager};
use updates::{ArbiterOutcome, BootHealth, EntryStore, GenerationId, ImageBuilder, SlotId, UpdateError};
use updates_host::{BuildFault, Rig, VolumeCall};

fn installed() -> Rig {
    let rig = Rig::new();
    rig.orchestrator().first_install().expect("first install");
    rig
}

#[test]
fn first_install_provisions_both_slots() {
    let rig = Rig::new();
    let outcome = rig.orchestrator().first_install().expect("first install");

    let names: Vec<_> = outcome.partitions.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["ESP_A", "ESP_B", "ROOT_A", "ROOT_B"]);
    assert!(outcome.partitions[0].is_esp());
    assert!(!outcome.partitions[2].is_esp());
    assert_eq!(outcome.installed, vec![(SlotId::A, GenerationId(1)), (SlotId::B, GenerationId(2))]);

    let calls = rig.volumes.calls();
    let wipe = calls.iter().position(|c| matches!(c, VolumeCall::Wipe(_))).expect("wiped");
    let first_format = calls
        .iter()
        .position(|c| matches!(c, VolumeCall::FormatFat { .. } | VolumeCall::FormatCow { .. }))
        .expect("formatted");
    assert!(wipe < first_format);
    let cow: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            VolumeCall::FormatCow { label, profile, .. } => Some((label.as_str(), *profile)),
            _ => None,
        })
        .collect();
    assert_eq!(cow, [("ROOT_A", CowProfile::Dup), ("ROOT_B", CowProfile::Dup)]);
    assert!(calls.iter().any(|c| matches!(
        c,
        VolumeCall::Mount { options, .. } if options.join(",") == "compress=zstd,ssd,discard=async,subvol=@"
    )));

    assert!(rig.volumes.mounted_targets().is_empty());
    assert_eq!(rig.entry_files(SlotId::A), ["slot-a-1.conf"]);
    assert_eq!(rig.entry_files(SlotId::B), ["slot-b-2.conf"]);
    for slot in SlotId::ALL {
        assert!(rig.esp(slot).join("EFI/BOOT/BOOTX64.EFI").is_file());
    }

    assert!(!outcome.arbiter.is_degraded());
    assert_eq!(rig.firmware.state().options.len(), 2);
    assert_eq!(rig.first_boot_label().as_deref(), Some("Slot A"));
}

#[test]
fn first_install_stops_before_wipe_without_tools() {
    // `mount` and `btrfs` are only needed after the wipe
    for tool in ["mkfs.btrfs", "mount", "btrfs"] {
        let rig = Rig::new();
        *rig.volumes.missing.lock() = vec![tool.to_string()];
        let err = rig.orchestrator().first_install().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolMissing, "{tool}");
        assert!(err.to_string().contains(tool), "{err}");
        assert!(rig.volumes.calls().is_empty());
        assert!(rig.builder.builds().is_empty());
        assert!(rig.firmware.state().options.is_empty());
    }
}

#[test]
fn first_install_stops_before_wipe_on_long_label() {
    let mut rig = Rig::new();
    rig.config.slots.b.root_label = format!("ROOT_B_{}", "x".repeat(33));
    let err = rig.orchestrator().first_install().unwrap_err();
    assert!(
        matches!(&err, UpdateError::Provision(updates::ProvisionError::Gpt(GptError::InvalidLabel { .. }))),
        "{err}"
    );
    assert!(!rig.volumes.calls().iter().any(|c| matches!(c, VolumeCall::Wipe(_))));
    assert!(matches!(gpt::read_partitions(&rig.config.disk), Err(GptError::NoTable { .. })));
}

#[test]
fn update_refuses_active_slot() {
    let rig = installed();
    let err = rig.orchestrator().update(SlotId::A, None).unwrap_err();
    assert!(matches!(err, UpdateError::TargetIsActive { slot: SlotId::A }));
    assert_eq!(err.kind().exit_code(), ErrorKind::TargetIsActive.exit_code());
    assert_eq!(rig.builder.builds().len(), 2);
}

#[test]
fn update_puts_standby_on_trial() {
    let rig = installed();
    let outcome = rig.orchestrator().update(SlotId::B, Some("images/hotfix.toml")).expect("update");

    assert_eq!(outcome.slot, SlotId::B);
    assert_eq!(outcome.generation, GenerationId(3));
    assert!(!outcome.arbiter.is_degraded());
    assert_eq!(rig.builder.builds().last(), Some(&(SlotId::B, "images/hotfix.toml".to_string())));
    assert_eq!(rig.entry_files(SlotId::B), ["slot-b-2.conf", "slot-b-3+2-0.conf"]);
    assert_eq!(rig.entry_files(SlotId::A), ["slot-a-1.conf"]);
    assert_eq!(rig.first_boot_label().as_deref(), Some("Slot A"));
    assert!(rig.volumes.mounted_targets().is_empty());
}

#[test]
fn unconfirmed_trial_falls_back() {
    let mut rig = installed();
    rig.orchestrator().update(SlotId::B, None).expect("update");
    rig.orchestrator().switch_active(SlotId::B).expect("switch");
    rig.boot_into(SlotId::B);

    let first = rig.orchestrator().boot_attempt().unwrap().unwrap();
    assert_eq!(first.health, BootHealth::Trial(1));
    let second = rig.orchestrator().boot_attempt().unwrap().unwrap();
    assert_eq!(second.health, BootHealth::Trial(0));
    let third = rig.orchestrator().boot_attempt().unwrap().unwrap();
    assert_eq!(third.id, "slot-b-2.conf");
    assert_eq!(third.health, BootHealth::Blessed);

    assert_eq!(rig.entry_files(SlotId::B), ["slot-b-2.conf", "slot-b-3.discarded"]);

    // completion on the fallback boot blesses nothing new
    let blessed = rig.orchestrator().boot_completed(None).unwrap();
    assert_eq!(blessed.id, "slot-b-2.conf");
    assert_eq!(rig.entry_files(SlotId::B), ["slot-b-2.conf", "slot-b-3.discarded"]);
}

#[test]
fn completion_on_first_boot_blesses() {
    let mut rig = installed();
    rig.orchestrator().update(SlotId::B, None).expect("update");
    rig.boot_into(SlotId::B);
    rig.orchestrator().boot_attempt().unwrap();
    *rig.firmware.selected.lock() = Some("slot-b-3.conf".to_string());

    let entry = rig.orchestrator().boot_completed(None).unwrap();
    assert_eq!(entry.health, BootHealth::Blessed);
    assert_eq!(entry.file_name, "slot-b-3.conf");
    assert_eq!(rig.entry_files(SlotId::B), ["slot-b-2.conf", "slot-b-3.conf"]);

    // systemd may run the hook again on the same boot
    rig.orchestrator().boot_completed(None).unwrap();
    assert_eq!(rig.entry_files(SlotId::B), ["slot-b-2.conf", "slot-b-3.conf"]);
}

#[test]
fn failed_verification_unmounts_and_discards() {
    let rig = installed();
    let writes = rig.firmware.writes();
    *rig.builder.fault.lock() = Some(BuildFault::NoKernel);

    let err = rig.orchestrator().update(SlotId::B, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VerificationFailed);
    assert!(err.to_string().contains("slot-b-3.conf"), "{err}");

    assert!(rig.volumes.mounted_targets().is_empty());
    assert_eq!(rig.entry_files(SlotId::B), ["slot-b-2.conf", "slot-b-3.discarded"]);
    assert_eq!(rig.entry_files(SlotId::A), ["slot-a-1.conf"]);
    assert_eq!(rig.firmware.writes(), writes);
}

#[test]
fn failed_build_reports_config_ref() {
    let rig = installed();
    *rig.builder.fault.lock() = Some(BuildFault::Exit);
    let err = rig.orchestrator().update(SlotId::B, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BuildFailed);
    assert!(err.to_string().contains("images/slot-b.toml"), "{err}");
    assert!(rig.volumes.mounted_targets().is_empty());
    assert_eq!(rig.entry_files(SlotId::B), ["slot-b-2.conf"]);
}

#[test]
fn rebuild_without_new_generation_is_rejected() {
    let rig = installed();
    let writes = rig.firmware.writes();
    // the next build writes generation 2 again over the blessed one
    *rig.builder.generation.lock() = 1;

    let err = rig.orchestrator().update(SlotId::B, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VerificationFailed);
    assert!(matches!(
        err,
        UpdateError::Install(InstallError::VerificationFailed {
            slot: SlotId::B,
            reason: VerifyFailure::NoNewGeneration { previous: GenerationId(2) },
        })
    ));
    assert_eq!(rig.entry_files(SlotId::B), ["slot-b-2.conf"]);
    assert!(rig.volumes.mounted_targets().is_empty());
    assert_eq!(rig.firmware.writes(), writes);
}

#[test]
fn interrupted_update_is_discarded_on_fallback_boot() {
    let mut rig = installed();
    let esp = rig.esp(SlotId::B);
    let root = rig.config.work_dir.join("slot-b");
    // power lost after the build wrote generation 3, before it went on trial
    EntryStore::new(&esp).begin_install(Some(GenerationId(2))).unwrap();
    rig.builder.build(SlotId::B, "images/slot-b.toml", &root, &esp).unwrap();
    assert_eq!(rig.entry_files(SlotId::B), [".install-pending", "slot-b-2.conf", "slot-b-3.conf"]);

    // firmware falls back to slot B
    rig.boot_into(SlotId::B);
    let selected = rig.orchestrator().boot_attempt().unwrap().unwrap();
    assert_eq!(selected.id, "slot-b-2.conf");
    assert_eq!(selected.health, BootHealth::Blessed);
    assert_eq!(rig.entry_files(SlotId::B), ["slot-b-2.conf", "slot-b-3.discarded"]);
}

#[test]
fn reconcile_twice_is_a_no_op() {
    let rig = Rig::new();
    // leftovers of an earlier provisioning: a duplicate label and a dead partition GUID
    rig.firmware.push_option(
        "Slot A",
        Some(OptionPartition { index: 1, guid: Some("00000000-dead-beef-0000-000000000000".into()) }),
        "EFI/BOOT/BOOTX64.EFI",
    );
    rig.firmware.push_option("Slot B", None, "EFI/systemd/systemd-bootx64.efi");
    rig.firmware.push_option("UEFI Shell", None, "EFI/tools/shell.efi");
    rig.orchestrator().first_install().expect("first install");

    let state = rig.firmware.state();
    let labels: Vec<_> = state.options.iter().map(|o| o.label.as_str()).collect();
    assert_eq!(labels.iter().filter(|l| **l == "Slot A").count(), 1);
    assert_eq!(labels.iter().filter(|l| **l == "Slot B").count(), 1);
    assert!(labels.contains(&"UEFI Shell"));

    let writes = rig.firmware.writes();
    let again = rig.orchestrator().switch_active(SlotId::A).expect("reconcile");
    match again {
        ArbiterOutcome::Reconciled(report) => assert!(report.is_noop(), "{report:?}"),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(rig.firmware.writes(), writes);
    assert_eq!(rig.firmware.state(), state);
}

#[test]
fn update_without_firmware_is_degraded() {
    let rig = installed();
    let before = rig.firmware.state();
    *rig.firmware.available.lock() = false;

    let outcome = rig.orchestrator().update(SlotId::B, None).expect("update still succeeds");
    assert!(outcome.arbiter.is_degraded());
    assert_eq!(rig.entry_files(SlotId::B), ["slot-b-2.conf", "slot-b-3+2-0.conf"]);
    assert_eq!(rig.firmware.state(), before);
}

#[test]
fn switch_and_status() {
    let rig = installed();
    rig.orchestrator().switch_active(SlotId::B).expect("switch");
    assert_eq!(rig.first_boot_label().as_deref(), Some("Slot B"));
    assert_eq!(rig.builder.builds().len(), 2);

    let status = rig.orchestrator().status().expect("status");
    assert_eq!(status.active, Some(SlotId::A));
    assert!(status.slots.iter().any(|s| s.slot == SlotId::A && s.active));
    assert_eq!(status.entries.len(), 1);
    assert_eq!(status.partitions.map(|p| p.len()), Some(4));
    assert_eq!(rig.volumes.root_label().unwrap().as_deref(), Some("ROOT_A"));
}
