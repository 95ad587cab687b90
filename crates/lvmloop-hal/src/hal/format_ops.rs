//! Filesystem formatting operations trait.

use crate::{HalError, HalResult};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Filesystems the provisioner knows how to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsKind {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Vfat,
}

impl FsKind {
    pub const ALL: [FsKind; 6] = [
        FsKind::Ext2,
        FsKind::Ext3,
        FsKind::Ext4,
        FsKind::Xfs,
        FsKind::Btrfs,
        FsKind::Vfat,
    ];

    /// Name as understood by `mount -t` and reported by `blkid`.
    pub fn as_str(&self) -> &'static str {
        match self {
            FsKind::Ext2 => "ext2",
            FsKind::Ext3 => "ext3",
            FsKind::Ext4 => "ext4",
            FsKind::Xfs => "xfs",
            FsKind::Btrfs => "btrfs",
            FsKind::Vfat => "vfat",
        }
    }

    /// The `mkfs.*` program for this filesystem.
    pub fn program(&self) -> String {
        format!("mkfs.{}", self.as_str())
    }

    /// Flag that makes the format tool overwrite an existing signature.
    fn force_flag(&self) -> Option<&'static str> {
        match self {
            FsKind::Ext2 | FsKind::Ext3 | FsKind::Ext4 => Some("-F"),
            FsKind::Xfs | FsKind::Btrfs => Some("-f"),
            FsKind::Vfat => None,
        }
    }

    fn label_flag(&self) -> &'static str {
        match self {
            FsKind::Vfat => "-n",
            _ => "-L",
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsKind {
    type Err = HalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FsKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| HalError::Parse(format!("unsupported filesystem type: {s}")))
    }
}

/// Trait for formatting block devices.
pub trait FormatOps {
    /// Create a filesystem of `kind` on `device`; outside a dry run `opts.confirmed` is required.
    fn mkfs(&self, device: &Path, kind: FsKind, opts: &FormatOptions) -> HalResult<()>;
}

/// Options for formatting operations.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// If true, log the operation but don't execute it
    pub dry_run: bool,
    /// If true, the caller has confirmed the destructive operation
    pub confirmed: bool,
    /// If true, overwrite an existing filesystem signature
    pub force: bool,
    /// Optional filesystem label
    pub label: Option<String>,
}

impl FormatOptions {
    pub fn new(dry_run: bool, confirmed: bool) -> Self {
        Self {
            dry_run,
            confirmed,
            force: false,
            label: None,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Build the `mkfs.*` invocation for `device`.
pub fn mkfs_command_spec(device: &Path, kind: FsKind, opts: &FormatOptions) -> CommandSpec {
    let mut args = Vec::new();
    if opts.force {
        if let Some(flag) = kind.force_flag() {
            args.push(flag.to_string());
        }
    }
    if let Some(label) = &opts.label {
        args.push(kind.label_flag().to_string());
        args.push(label.clone());
    }
    args.push(device.display().to_string());
    CommandSpec {
        program: kind.program(),
        args,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext4_command_is_constructed() {
        let opts = FormatOptions::new(false, true);
        let spec = mkfs_command_spec(Path::new("/dev/vg/lv"), FsKind::Ext4, &opts);
        assert_eq!(spec.program, "mkfs.ext4");
        assert_eq!(spec.args, vec!["/dev/vg/lv".to_string()]);
    }

    #[test]
    fn force_and_label_flags_follow_the_tool() {
        let opts = FormatOptions::new(false, true)
            .with_force(true)
            .with_label(Some("data".to_string()));

        let xfs = mkfs_command_spec(Path::new("/dev/vg/lv"), FsKind::Xfs, &opts);
        assert_eq!(xfs.args, vec!["-f", "-L", "data", "/dev/vg/lv"]);

        let vfat = mkfs_command_spec(Path::new("/dev/vg/lv"), FsKind::Vfat, &opts);
        assert_eq!(vfat.program, "mkfs.vfat");
        assert_eq!(vfat.args, vec!["-n", "data", "/dev/vg/lv"]);

        let ext4 = mkfs_command_spec(Path::new("/dev/vg/lv"), FsKind::Ext4, &opts);
        assert_eq!(ext4.to_string(), "mkfs.ext4 -F -L data /dev/vg/lv");
    }

    #[test]
    fn fs_kind_parses_case_insensitively() {
        assert_eq!("EXT4".parse::<FsKind>().unwrap(), FsKind::Ext4);
        assert_eq!(" btrfs ".parse::<FsKind>().unwrap(), FsKind::Btrfs);
        assert!("zfs".parse::<FsKind>().is_err());
    }
}
