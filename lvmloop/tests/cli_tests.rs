use clap::Parser;
use lvmloop::cli::Cli;
use lvmloop::{exit_code_for, load_config, run_with, ProvisionError};
use lvmloop_hal::FakeHal;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let path = dir.join("lvmloop.toml");
    let text = format!(
        r#"
backing_file_path = "{dir}/disk.img"
size_bytes = "1GiB"
vg_name = "vg_data"
lv_name = "lv_storage"
lv_size_bytes = 524288000
fs_type = "ext4"
mount_point = "{dir}/mnt"
idempotent = true
{extra}
"#,
        dir = dir.display()
    );
    fs::write(&path, text).unwrap();
    path
}

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("lvmloop").chain(args.iter().copied())).unwrap()
}

fn setup(extra: &str) -> (TempDir, String) {
    let dir = tempdir().unwrap();
    let path = write_config(dir.path(), extra);
    let path = path.to_string_lossy().into_owned();
    (dir, path)
}

#[test]
fn flags_override_the_config_file() {
    let (dir, path) = setup("namespace = \"ci\"");
    let cli = parse(&[
        "provision",
        "-c",
        &path,
        "--lv",
        "lv_cache",
        "--lv-size",
        "64MiB",
        "--force",
    ]);

    let config = load_config(&cli).unwrap();

    assert_eq!(config.lv_name, "lv_cache");
    assert_eq!(config.lv_size_bytes, 64 * 1024 * 1024);
    assert_eq!(config.size_bytes, 1024 * 1024 * 1024);
    assert_eq!(config.effective_vg_name(), "ci_vg_data");
    assert!(config.force);
    assert!(config.idempotent);
    assert_eq!(config.mount_point, dir.path().join("mnt"));
}

#[test]
fn negated_flags_switch_off_config_file_settings() {
    let (_dir, path) = setup("force = true");
    let cli = parse(&["provision", "-c", &path, "--no-idempotent", "--no-force"]);

    let config = load_config(&cli).unwrap();

    assert!(!config.idempotent);
    assert!(!config.force);
}

#[test]
fn flags_alone_are_enough() {
    let dir = tempdir().unwrap();
    let backing = dir.path().join("disk.img");
    let mount = dir.path().join("mnt");
    let cli = parse(&[
        "status",
        "--backing-file",
        backing.to_str().unwrap(),
        "--size",
        "10G",
        "--vg",
        "vg0",
        "--lv",
        "lv0",
        "--lv-size",
        "1G",
        "--fs-type",
        "xfs",
        "--mount-point",
        mount.to_str().unwrap(),
    ]);

    let config = load_config(&cli).unwrap();
    assert_eq!(config.size_bytes, 10 * 1024 * 1024 * 1024);
    assert!(!config.idempotent);
}

#[test]
fn provision_then_status_then_teardown() {
    let (dir, path) = setup("");
    let hal = FakeHal::new();

    run_with(&hal, &parse(&["provision", "-c", &path])).unwrap();
    assert_eq!(hal.mounted_targets(), vec![dir.path().join("mnt")]);

    run_with(&hal, &parse(&["status", "-c", &path, "--json"])).unwrap();

    run_with(
        &hal,
        &parse(&["teardown", "-c", &path, "--remove-backing-file"]),
    )
    .unwrap();
    assert!(hal.mounted_targets().is_empty());
    assert!(hal.vg_names().is_empty());
    assert!(!dir.path().join("disk.img").exists());
}

#[test]
fn dry_run_flag_reaches_the_provisioner() {
    let (dir, path) = setup("");
    let hal = FakeHal::new();

    run_with(&hal, &parse(&["provision", "-c", &path, "--dry-run", "--json"])).unwrap();

    assert_eq!(hal.operation_count(), 0);
    assert!(!dir.path().join("disk.img").exists());
}

#[test]
fn unknown_config_key_exits_with_invalid_config() {
    let (_dir, path) = setup("stripes = 2");
    let hal = FakeHal::new();

    let err = run_with(&hal, &parse(&["provision", "-c", &path])).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ProvisionError>(),
        Some(ProvisionError::InvalidConfig(_))
    ));
    assert_eq!(exit_code_for(&err), 2);
    assert_eq!(hal.operation_count(), 0);
}

#[test]
fn missing_key_is_named_in_the_error() {
    let cli = parse(&["provision", "--vg", "vg0"]);

    let err = load_config(&cli).unwrap_err();
    assert!(err.to_string().contains("missing required key"));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn unreadable_config_file_is_invalid_config() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let cli = parse(&["status", "-c", missing.to_str().unwrap()]);

    let err = run_with(&FakeHal::new(), &cli).unwrap_err();
    assert_eq!(exit_code_for(&err), 2);
    assert!(err.to_string().contains("nope.toml"));
}

#[test]
fn failures_map_to_their_exit_codes() {
    let (_dir, path) = setup("");
    let hal = FakeHal::new();
    hal.set_loop_slots(0);
    let err = run_with(&hal, &parse(&["provision", "-c", &path])).unwrap_err();
    assert_eq!(exit_code_for(&err), 3);

    let hal = FakeHal::new();
    hal.set_root(false);
    let err = run_with(&hal, &parse(&["provision", "-c", &path])).unwrap_err();
    assert_eq!(exit_code_for(&err), 5);

    let hal = FakeHal::new();
    hal.fail_command("lvcreate", 5, "  Volume group \"vg_data\" has insufficient free space");
    let err = run_with(&hal, &parse(&["provision", "-c", &path])).unwrap_err();
    assert_eq!(exit_code_for(&err), 6);

    assert_eq!(exit_code_for(&anyhow::anyhow!("something else")), 1);
}
