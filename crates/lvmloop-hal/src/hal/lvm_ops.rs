//! LVM metadata operations (pvcreate/vgcreate/lvcreate and their reports).

use crate::HalResult;
use std::path::PathBuf;

/// A physical volume as reported by `pvs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvInfo {
    pub device: String,
    pub vg_name: Option<String>,
    pub size_bytes: u64,
    /// Offset of the first physical extent (metadata area precedes it).
    pub pe_start_bytes: u64,
}

impl PvInfo {
    /// Whole extents of `extent_size_bytes` that fit after the metadata area.
    pub fn usable_extents(&self, extent_size_bytes: u64) -> u64 {
        if extent_size_bytes == 0 {
            return 0;
        }
        self.size_bytes.saturating_sub(self.pe_start_bytes) / extent_size_bytes
    }
}

/// A volume group as reported by `vgs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VgInfo {
    pub name: String,
    pub extent_size_bytes: u64,
    pub extent_count: u64,
    pub free_extents: u64,
    pub lv_count: u64,
}

impl VgInfo {
    pub fn capacity_bytes(&self) -> u64 {
        self.extent_count.saturating_mul(self.extent_size_bytes)
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_extents.saturating_mul(self.extent_size_bytes)
    }
}

/// A logical volume as reported by `lvs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvInfo {
    pub vg_name: String,
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Options shared by the mutating LVM commands.
#[derive(Debug, Clone)]
pub struct LvmOptions {
    /// If true, log the operation but don't execute it
    pub dry_run: bool,
    /// If false, LVM does not wait for udev (`--noudevsync`); needed in containers without udevd
    pub udev_sync: bool,
}

impl LvmOptions {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            udev_sync: true,
        }
    }

    pub fn with_udev_sync(mut self, udev_sync: bool) -> Self {
        self.udev_sync = udev_sync;
        self
    }
}

pub trait LvmOps {
    /// Initialize `device` as a physical volume.
    fn pv_create(&self, device: &str, opts: &LvmOptions) -> HalResult<()>;

    /// Wipe PV metadata from `device`.
    fn pv_remove(&self, device: &str, opts: &LvmOptions) -> HalResult<()>;

    /// All physical volumes visible to LVM.
    fn pv_list(&self) -> HalResult<Vec<PvInfo>>;

    /// Create volume group `name` over `devices`.
    fn vg_create(
        &self,
        name: &str,
        devices: &[&str],
        extent_size_bytes: u64,
        opts: &LvmOptions,
    ) -> HalResult<()>;

    /// Remove volume group `name`.
    fn vg_remove(&self, name: &str, opts: &LvmOptions) -> HalResult<()>;

    /// All volume groups visible to LVM.
    fn vg_list(&self) -> HalResult<Vec<VgInfo>>;

    /// Create logical volume `lv` of `extents` extents in `vg`.
    fn lv_create(&self, vg: &str, lv: &str, extents: u64, opts: &LvmOptions) -> HalResult<()>;

    /// Remove logical volume `vg/lv`.
    fn lv_remove(&self, vg: &str, lv: &str, opts: &LvmOptions) -> HalResult<()>;

    /// All logical volumes visible to LVM.
    fn lv_list(&self) -> HalResult<Vec<LvInfo>>;

    /// Create missing `/dev/<vg>/<lv>` nodes (`vgmknodes`).
    fn vg_mknodes(&self, vg: &str, opts: &LvmOptions) -> HalResult<()>;

    fn pv_info(&self, device: &str) -> HalResult<Option<PvInfo>> {
        Ok(self.pv_list()?.into_iter().find(|pv| pv.device == device))
    }

    fn vg_info(&self, name: &str) -> HalResult<Option<VgInfo>> {
        Ok(self.vg_list()?.into_iter().find(|vg| vg.name == name))
    }

    /// Devices of the PVs that belong to `vg`.
    fn vg_members(&self, vg: &str) -> HalResult<Vec<String>> {
        Ok(self
            .pv_list()?
            .into_iter()
            .filter(|pv| pv.vg_name.as_deref() == Some(vg))
            .map(|pv| pv.device)
            .collect())
    }

    fn lv_info(&self, vg: &str, lv: &str) -> HalResult<Option<LvInfo>> {
        Ok(self
            .lv_list()?
            .into_iter()
            .find(|info| info.vg_name == vg && info.name == lv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_extents_skip_metadata_area() {
        let pv = PvInfo {
            device: "/dev/loop0".to_string(),
            vg_name: None,
            size_bytes: 1024 * 1024 * 1024,
            pe_start_bytes: 1024 * 1024,
        };
        assert_eq!(pv.usable_extents(4 * 1024 * 1024), 255);
        assert_eq!(pv.usable_extents(0), 0);
    }
}
