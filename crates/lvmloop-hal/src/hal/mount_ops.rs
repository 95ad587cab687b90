//! Mounting the provisioned LV and reading the mount table.

use crate::HalResult;
use std::path::Path;

pub use crate::procfs::mountinfo::MountEntry;

pub trait MountOps {
    /// Mount `device` (an LV node) at `target`. `fstype` is passed through as `mount -t`.
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()>;

    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()>;

    /// Topmost mount table entry at exactly `path`.
    fn mount_entry(&self, path: &Path) -> HalResult<Option<MountEntry>>;

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        Ok(self.mount_entry(path)?.is_some())
    }
}

/// Filesystem-specific mount data, e.g. `noatime,discard`.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub options: Option<String>,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: impl Into<String>) -> Self {
        Self {
            options: Some(options.into()),
        }
    }
}
