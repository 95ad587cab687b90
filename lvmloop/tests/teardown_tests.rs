use lvmloop::config::{PartialConfig, ProvisionConfig};
use lvmloop::{Outcome, ProvisionError, Provisioner, Stage};
use lvmloop_hal::{FakeHal, LvmOps, LvmOptions, MountOps, Operation};
use std::path::Path;
use tempfile::tempdir;

fn config(dir: &Path) -> ProvisionConfig {
    PartialConfig {
        backing_file_path: Some(dir.join("disk.img")),
        size_bytes: Some(512 * 1024 * 1024),
        vg_name: Some("vg_data".to_string()),
        lv_name: Some("lv_storage".to_string()),
        lv_size_bytes: Some(256 * 1024 * 1024),
        fs_type: Some("xfs".to_string()),
        mount_point: Some(dir.join("mnt")),
        idempotent: Some(true),
        ..Default::default()
    }
    .resolve()
    .unwrap()
}

#[test]
fn teardown_removes_every_layer_in_reverse() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let hal = FakeHal::new();
    Provisioner::new(&hal, false).provision(&config).unwrap();
    hal.clear_operations();

    let report = Provisioner::new(&hal, false)
        .teardown(&config, false)
        .unwrap();

    assert!(hal.mounted_targets().is_empty());
    assert!(hal.vg_names().is_empty());
    assert!(hal.pv_devices().is_empty());
    assert!(hal.loop_devices().is_empty());
    assert!(config.backing_file_path.exists());

    let ops = hal.operations();
    assert!(matches!(ops[0], Operation::Unmount { .. }));
    assert!(matches!(ops[1], Operation::LvRemove { .. }));
    assert!(matches!(ops[2], Operation::VgRemove { .. }));
    assert!(matches!(ops[3], Operation::PvRemove { .. }));
    assert!(matches!(ops[4], Operation::LosetupDetach { .. }));
    assert_eq!(ops.len(), 5);
    assert!(report
        .steps
        .iter()
        .all(|step| step.stage == Stage::Teardown && step.outcome == Outcome::Removed));
}

#[test]
fn teardown_can_delete_the_backing_file() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let hal = FakeHal::new();
    Provisioner::new(&hal, false).provision(&config).unwrap();

    Provisioner::new(&hal, false)
        .teardown(&config, true)
        .unwrap();

    assert!(!config.backing_file_path.exists());
}

#[test]
fn teardown_of_nothing_reports_absent() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let hal = FakeHal::new();

    let report = Provisioner::new(&hal, false)
        .teardown(&config, true)
        .unwrap();

    assert_eq!(hal.operation_count(), 0);
    assert!(report.steps.iter().all(|step| step.outcome == Outcome::Absent));
}

#[test]
fn teardown_is_repeatable() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let hal = FakeHal::new();
    Provisioner::new(&hal, false).provision(&config).unwrap();
    Provisioner::new(&hal, false)
        .teardown(&config, false)
        .unwrap();
    hal.clear_operations();

    Provisioner::new(&hal, false)
        .teardown(&config, false)
        .unwrap();
    assert_eq!(hal.operation_count(), 0);
}

#[test]
fn provision_after_teardown_reuses_the_backing_file() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let hal = FakeHal::new();
    Provisioner::new(&hal, false).provision(&config).unwrap();
    Provisioner::new(&hal, false)
        .teardown(&config, false)
        .unwrap();

    let again = Provisioner::new(&hal, false).provision(&config).unwrap();
    assert!(!again.binding.reused);
    assert_eq!(
        again.report.steps[0].outcome,
        Outcome::Reused,
        "backing file should be kept"
    );
    assert!(hal.is_mounted(&config.mount_point).unwrap());
}

#[test]
fn dry_run_teardown_removes_nothing() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let hal = FakeHal::new();
    Provisioner::new(&hal, false).provision(&config).unwrap();
    hal.clear_operations();

    let report = Provisioner::new(&hal, true)
        .teardown(&config, true)
        .unwrap();

    assert_eq!(hal.operation_count(), 0);
    assert!(config.backing_file_path.exists());
    assert_eq!(hal.vg_names(), vec!["vg_data".to_string()]);
    assert!(report
        .steps
        .iter()
        .all(|step| step.outcome == Outcome::Planned));
}

#[test]
fn vg_on_someone_elses_device_is_not_removed() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let hal = FakeHal::new();
    hal.seed_volume_group("vg_data", "/dev/sdc", 1024 * 1024 * 1024, 4 * 1024 * 1024);
    hal.lv_create("vg_data", "lv_storage", 10, &LvmOptions::new(false))
        .unwrap();
    hal.seed_mount("/dev/mapper/vg_data-lv_storage", &config.mount_point, "xfs");
    hal.clear_operations();

    let err = Provisioner::new(&hal, false)
        .teardown(&config, false)
        .unwrap_err();

    assert!(matches!(err, ProvisionError::NameConflict { .. }));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(hal.operation_count(), 0);
    assert_eq!(hal.vg_names(), vec!["vg_data".to_string()]);
    assert_eq!(hal.lv_names("vg_data"), vec!["lv_storage".to_string()]);
    assert!(hal.is_mounted(&config.mount_point).unwrap());
}

#[test]
fn teardown_requires_root() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let hal = FakeHal::new();
    Provisioner::new(&hal, false).provision(&config).unwrap();
    hal.set_root(false);

    let err = Provisioner::new(&hal, false)
        .teardown(&config, false)
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::PermissionDenied {
            stage: Stage::Preflight,
            ..
        }
    ));
    assert!(hal.is_mounted(&config.mount_point).unwrap());
}
