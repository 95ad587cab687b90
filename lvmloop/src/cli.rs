//! CLI argument parsing for lvmloop

use crate::config::PartialConfig;
use crate::size::parse_size;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lvmloop")]
#[command(version, about = "Declarative loop-backed LVM provisioner")]
#[command(long_about = "Declarative loop-backed LVM provisioner\n\n\
    Creates a sparse backing file, binds it to a free loop device and builds one \
    PV -> VG -> LV chain on it, then formats and mounts the LV. Re-running with \
    --idempotent leaves an existing chain untouched.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file; flags override its keys
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log every change instead of making it
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Print the report as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create (or confirm) backing file, loop device, PV/VG/LV, filesystem and mount
    Provision {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Unmount and remove the LV, VG and PV, then detach the loop device
    Teardown {
        #[command(flatten)]
        config: ConfigArgs,

        /// Also delete the backing file
        #[arg(long)]
        remove_backing_file: bool,
    },

    /// Show which layers of the chain exist (read-only)
    Status {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

impl Command {
    pub fn config_args(&self) -> &ConfigArgs {
        match self {
            Command::Provision { config }
            | Command::Teardown { config, .. }
            | Command::Status { config } => config,
        }
    }
}

/// Per-key overrides for the configuration file.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Backing file path
    #[arg(long = "backing-file")]
    pub backing_file_path: Option<PathBuf>,

    /// Backing file size (bytes, or e.g. 1GiB, 500MiB, 10G)
    #[arg(long = "size", value_parser = parse_size)]
    pub size_bytes: Option<u64>,

    /// Volume group name
    #[arg(long = "vg")]
    pub vg_name: Option<String>,

    /// Logical volume name
    #[arg(long = "lv")]
    pub lv_name: Option<String>,

    /// Logical volume size, rounded up to whole extents
    #[arg(long = "lv-size", value_parser = parse_size)]
    pub lv_size_bytes: Option<u64>,

    /// Filesystem type (ext2, ext3, ext4, xfs, btrfs, vfat)
    #[arg(long)]
    pub fs_type: Option<String>,

    /// Where to mount the LV
    #[arg(long)]
    pub mount_point: Option<PathBuf>,

    /// Prefix for the VG name (<namespace>_<vg>)
    #[arg(long)]
    pub namespace: Option<String>,

    /// LVM extent size (power of two, default 4MiB)
    #[arg(long = "extent-size", value_parser = parse_size)]
    pub extent_size_bytes: Option<u64>,

    /// Comma-separated mount options
    #[arg(long)]
    pub mount_options: Option<String>,

    /// Filesystem label
    #[arg(long)]
    pub label: Option<String>,

    /// Retries when another process grabs the loop device first
    #[arg(long)]
    pub attach_retries: Option<u32>,

    /// Treat already-present pieces as success
    #[arg(long, overrides_with = "no_idempotent")]
    pub idempotent: bool,

    /// Fail on already-present pieces even if the config file sets idempotent
    #[arg(long)]
    pub no_idempotent: bool,

    /// Replace a different filesystem signature on the LV
    #[arg(long, overrides_with = "no_force")]
    pub force: bool,

    /// Never replace a filesystem signature, even if the config file sets force
    #[arg(long)]
    pub no_force: bool,

    /// Do not wait for udev; create device nodes with vgmknodes
    #[arg(long)]
    pub no_udev_sync: bool,
}

impl ConfigArgs {
    pub fn to_partial(&self) -> PartialConfig {
        PartialConfig {
            backing_file_path: self.backing_file_path.clone(),
            size_bytes: self.size_bytes,
            vg_name: self.vg_name.clone(),
            lv_name: self.lv_name.clone(),
            lv_size_bytes: self.lv_size_bytes,
            fs_type: self.fs_type.clone(),
            mount_point: self.mount_point.clone(),
            idempotent: toggle(self.idempotent, self.no_idempotent),
            force: toggle(self.force, self.no_force),
            namespace: self.namespace.clone(),
            extent_size_bytes: self.extent_size_bytes,
            mount_options: self.mount_options.clone(),
            label: self.label.clone(),
            attach_retries: self.attach_retries,
            udev_sync: self.no_udev_sync.then_some(false),
        }
    }
}

/// `--x` / `--no-x` pair; the later flag wins, neither leaves the config file's value.
fn toggle(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_work_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "lvmloop",
            "provision",
            "--config",
            "/etc/lvmloop.toml",
            "--dry-run",
            "-vv",
            "--lv-size",
            "500MiB",
            "--idempotent",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/lvmloop.toml")));

        let partial = cli.command.config_args().to_partial();
        assert_eq!(partial.lv_size_bytes, Some(500 * 1024 * 1024));
        assert_eq!(partial.idempotent, Some(true));
        assert_eq!(partial.force, None);
        assert_eq!(partial.udev_sync, None);
    }

    #[test]
    fn teardown_takes_remove_backing_file() {
        let cli = Cli::try_parse_from(["lvmloop", "teardown", "--remove-backing-file", "--no-udev-sync"])
            .unwrap();
        match &cli.command {
            Command::Teardown {
                remove_backing_file,
                config,
            } => {
                assert!(remove_backing_file);
                assert_eq!(config.to_partial().udev_sync, Some(false));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn negated_flags_override_and_the_last_one_wins() {
        let cli = Cli::try_parse_from(["lvmloop", "provision", "--no-idempotent", "--no-force"])
            .unwrap();
        let partial = cli.command.config_args().to_partial();
        assert_eq!(partial.idempotent, Some(false));
        assert_eq!(partial.force, Some(false));

        let cli = Cli::try_parse_from(["lvmloop", "provision", "--no-force", "--force"]).unwrap();
        assert_eq!(cli.command.config_args().to_partial().force, Some(true));

        let cli = Cli::try_parse_from(["lvmloop", "provision", "--idempotent", "--no-idempotent"])
            .unwrap();
        assert_eq!(cli.command.config_args().to_partial().idempotent, Some(false));
    }

    #[test]
    fn bad_sizes_are_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["lvmloop", "status", "--size", "lots"]).is_err());
    }
}
