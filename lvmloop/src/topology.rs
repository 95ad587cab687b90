//! LVM topology builder: one PV, one VG over it, one LV in the VG.
//!
//! The chain is an explicit state machine (`Unbound -> PvCreated -> VgCreated -> LvCreated`).
//! Each step verifies the host before acting and any failure stops the chain where it is;
//! nothing already created is rolled back.

use crate::errors::{ProvisionError, Result, Stage};
use crate::report::{Outcome, StepReport};
use crate::size::format_size;
use log::{debug, info, warn};
use lvmloop_hal::{LvmOps, LvmOptions, PvInfo, SystemOps, VgInfo};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyState {
    Unbound,
    PvCreated,
    VgCreated,
    LvCreated,
}

impl fmt::Display for TopologyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopologyState::Unbound => "unbound",
            TopologyState::PvCreated => "pv-created",
            TopologyState::VgCreated => "vg-created",
            TopologyState::LvCreated => "lv-created",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeGroup {
    pub name: String,
    pub devices: Vec<String>,
    pub extent_size_bytes: u64,
    /// `None` while the VG only exists in a dry-run plan
    pub extent_count: Option<u64>,
    pub free_extents: Option<u64>,
}

impl VolumeGroup {
    fn from_info(info: VgInfo, devices: Vec<String>) -> Self {
        Self {
            name: info.name,
            devices,
            extent_size_bytes: info.extent_size_bytes,
            extent_count: Some(info.extent_count),
            free_extents: Some(info.free_extents),
        }
    }

    pub fn capacity_bytes(&self) -> Option<u64> {
        self.extent_count
            .map(|count| count.saturating_mul(self.extent_size_bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogicalVolume {
    pub name: String,
    pub vg_name: String,
    pub size_bytes: u64,
    /// Block device, `/dev/<vg>/<lv>`
    pub path: PathBuf,
}

impl LogicalVolume {
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.vg_name, self.name)
    }
}

/// Device path LVM gives an LV.
pub fn lv_device_path(vg: &str, lv: &str) -> PathBuf {
    PathBuf::from(format!("/dev/{vg}/{lv}"))
}

/// Device-mapper name of an LV; hyphens inside names are doubled.
pub fn lv_mapper_path(vg: &str, lv: &str) -> PathBuf {
    PathBuf::from(format!(
        "/dev/mapper/{}-{}",
        vg.replace('-', "--"),
        lv.replace('-', "--")
    ))
}

/// True if `source` (as shown in the mount table) is the block device of `vg/lv`.
///
/// The kernel reports LV mounts by their mapper name, so both spellings are accepted and
/// symlinks are resolved when the nodes exist.
pub fn is_lv_device(vg: &str, lv: &str, source: &Path) -> bool {
    let dev_path = lv_device_path(vg, lv);
    if source == dev_path || source == lv_mapper_path(vg, lv) {
        return true;
    }
    match (fs::canonicalize(&dev_path), fs::canonicalize(source)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct TopologyOptions {
    pub idempotent: bool,
    pub dry_run: bool,
    pub extent_size_bytes: u64,
    pub udev_sync: bool,
}

impl TopologyOptions {
    pub fn new(extent_size_bytes: u64) -> Self {
        Self {
            idempotent: false,
            dry_run: false,
            extent_size_bytes,
            udev_sync: true,
        }
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn udev_sync(mut self, udev_sync: bool) -> Self {
        self.udev_sync = udev_sync;
        self
    }
}

pub struct TopologyBuilder<'a, H: LvmOps + SystemOps + ?Sized> {
    hal: &'a H,
    opts: TopologyOptions,
    state: TopologyState,
    steps: Vec<StepReport>,
}

impl<'a, H: LvmOps + SystemOps + ?Sized> TopologyBuilder<'a, H> {
    pub fn new(hal: &'a H, opts: TopologyOptions) -> Self {
        Self {
            hal,
            opts,
            state: TopologyState::Unbound,
            steps: Vec::new(),
        }
    }

    pub fn state(&self) -> TopologyState {
        self.state
    }

    pub fn steps(&self) -> &[StepReport] {
        &self.steps
    }

    /// Build (or, in idempotent mode, confirm) `device -> vg_name -> lv_name`.
    ///
    /// `lv_size_bytes` must already be a whole number of extents.
    pub fn build_topology(
        &mut self,
        device: &str,
        vg_name: &str,
        lv_name: &str,
        lv_size_bytes: u64,
    ) -> Result<LogicalVolume> {
        self.check_alignment(vg_name, lv_name, lv_size_bytes, self.opts.extent_size_bytes)?;

        let pv = self.ensure_pv(device, vg_name)?;
        self.advance(TopologyState::PvCreated);

        let vg = self.ensure_vg(device, vg_name, lv_name, lv_size_bytes, pv.as_ref())?;
        self.advance(TopologyState::VgCreated);

        let lv = self.ensure_lv(&vg, lv_name, lv_size_bytes)?;
        self.advance(TopologyState::LvCreated);
        Ok(lv)
    }

    fn advance(&mut self, next: TopologyState) {
        debug!("topology: {} -> {}", self.state, next);
        self.state = next;
    }

    fn lvm_options(&self) -> LvmOptions {
        LvmOptions::new(self.opts.dry_run).with_udev_sync(self.opts.udev_sync)
    }

    fn created(&self) -> Outcome {
        if self.opts.dry_run {
            Outcome::Planned
        } else {
            Outcome::Created
        }
    }

    fn record(&mut self, stage: Stage, resource: impl fmt::Display, outcome: Outcome, detail: String) {
        self.steps.push(StepReport {
            stage,
            resource: resource.to_string(),
            outcome,
            detail: Some(detail),
        });
    }

    fn check_alignment(&self, vg: &str, lv: &str, size_bytes: u64, extent: u64) -> Result<()> {
        if extent == 0 || size_bytes % extent != 0 {
            return Err(ProvisionError::UnalignedSize {
                lv: format!("{vg}/{lv}"),
                size_bytes,
                extent_size_bytes: extent,
            });
        }
        Ok(())
    }

    fn ensure_pv(&mut self, device: &str, vg_name: &str) -> Result<Option<PvInfo>> {
        let stage = Stage::PhysicalVolume;
        let existing = self
            .hal
            .pv_info(device)
            .map_err(|e| ProvisionError::tool(stage, device, e))?;

        if let Some(pv) = existing {
            match pv.vg_name.as_deref() {
                Some(owner) if owner != vg_name => {
                    return Err(ProvisionError::AlreadyInitialized {
                        device: device.to_string(),
                        vg: pv.vg_name.clone(),
                    });
                }
                _ if !self.opts.idempotent => {
                    return Err(ProvisionError::AlreadyInitialized {
                        device: device.to_string(),
                        vg: pv.vg_name.clone(),
                    });
                }
                _ => {}
            }
            info!("{} is already a physical volume; reusing it", device);
            self.record(stage, device, Outcome::Reused, format_size(pv.size_bytes));
            return Ok(Some(pv));
        }

        self.hal
            .pv_create(device, &self.lvm_options())
            .map_err(|e| ProvisionError::tool(stage, device, e))?;
        info!("Initialized physical volume {}", device);

        let pv = if self.opts.dry_run {
            None
        } else {
            let pv = self
                .hal
                .pv_info(device)
                .map_err(|e| ProvisionError::tool(stage, device, e))?;
            if pv.is_none() {
                return Err(ProvisionError::tool(
                    stage,
                    device,
                    lvmloop_hal::HalError::Parse(format!("pvs does not report {device} after pvcreate")),
                ));
            }
            pv
        };
        let detail = pv
            .as_ref()
            .map(|pv| format_size(pv.size_bytes))
            .unwrap_or_else(|| "physical volume".to_string());
        let outcome = self.created();
        self.record(stage, device, outcome, detail);
        Ok(pv)
    }

    fn ensure_vg(
        &mut self,
        device: &str,
        vg_name: &str,
        lv_name: &str,
        lv_size_bytes: u64,
        pv: Option<&PvInfo>,
    ) -> Result<VolumeGroup> {
        let stage = Stage::VolumeGroup;
        let extent = self.opts.extent_size_bytes;
        let existing = self
            .hal
            .vg_info(vg_name)
            .map_err(|e| ProvisionError::tool(stage, vg_name, e))?;

        if let Some(info) = existing {
            let members = self
                .hal
                .vg_members(vg_name)
                .map_err(|e| ProvisionError::tool(stage, vg_name, e))?;
            if !members.iter().any(|member| member == device) {
                return Err(ProvisionError::NameConflict {
                    vg: vg_name.to_string(),
                });
            }
            if !self.opts.idempotent {
                return Err(ProvisionError::AlreadyExists {
                    stage,
                    resource: vg_name.to_string(),
                    detail: format!("volume group already exists on {device}"),
                });
            }
            if info.extent_size_bytes != extent {
                warn!(
                    "Volume group {} uses {} extents, not the configured {}",
                    vg_name,
                    format_size(info.extent_size_bytes),
                    format_size(extent)
                );
            }
            info!("Volume group {} already exists on {}; reusing it", vg_name, device);
            let detail = format!("{} free", format_size(info.free_bytes()));
            self.record(stage, vg_name, Outcome::Reused, detail);
            return Ok(VolumeGroup::from_info(info, members));
        }

        // Refuse before vgcreate so a request that can never fit leaves only the PV behind.
        if let Some(pv) = pv {
            let usable = pv.usable_extents(extent);
            let requested = lv_size_bytes / extent;
            if requested > usable {
                return Err(ProvisionError::InsufficientSpace {
                    resource: format!("{vg_name}/{lv_name}"),
                    requested_bytes: lv_size_bytes,
                    available_bytes: usable * extent,
                });
            }
        }

        self.hal
            .vg_create(vg_name, &[device], extent, &self.lvm_options())
            .map_err(|e| ProvisionError::tool(stage, vg_name, e))?;
        info!("Created volume group {} on {}", vg_name, device);

        let vg = if self.opts.dry_run {
            let extent_count = pv.map(|pv| pv.usable_extents(extent));
            VolumeGroup {
                name: vg_name.to_string(),
                devices: vec![device.to_string()],
                extent_size_bytes: extent,
                extent_count,
                free_extents: extent_count,
            }
        } else {
            let info = self
                .hal
                .vg_info(vg_name)
                .map_err(|e| ProvisionError::tool(stage, vg_name, e))?
                .ok_or_else(|| {
                    ProvisionError::tool(
                        stage,
                        vg_name,
                        lvmloop_hal::HalError::Parse(format!(
                            "vgs does not report {vg_name} after vgcreate"
                        )),
                    )
                })?;
            VolumeGroup::from_info(info, vec![device.to_string()])
        };
        let detail = vg
            .capacity_bytes()
            .map(|bytes| format!("{} capacity", format_size(bytes)))
            .unwrap_or_else(|| format!("{} extents", format_size(extent)));
        let outcome = self.created();
        self.record(stage, vg_name, outcome, detail);
        Ok(vg)
    }

    fn ensure_lv(&mut self, vg: &VolumeGroup, lv_name: &str, lv_size_bytes: u64) -> Result<LogicalVolume> {
        let stage = Stage::LogicalVolume;
        let qualified = format!("{}/{}", vg.name, lv_name);
        let existing = self
            .hal
            .lv_info(&vg.name, lv_name)
            .map_err(|e| ProvisionError::tool(stage, &qualified, e))?;

        if let Some(info) = existing {
            if info.size_bytes != lv_size_bytes {
                return Err(ProvisionError::AlreadyExists {
                    stage,
                    resource: qualified,
                    detail: format!(
                        "logical volume exists with {} but {} was requested",
                        format_size(info.size_bytes),
                        format_size(lv_size_bytes)
                    ),
                });
            }
            if !self.opts.idempotent {
                return Err(ProvisionError::AlreadyExists {
                    stage,
                    resource: qualified,
                    detail: "logical volume already exists".to_string(),
                });
            }
            info!("Logical volume {} already exists; reusing it", qualified);
            self.record(stage, &qualified, Outcome::Reused, format_size(info.size_bytes));
            return Ok(LogicalVolume {
                name: info.name,
                vg_name: info.vg_name,
                size_bytes: info.size_bytes,
                path: info.path,
            });
        }

        // An existing VG may use a different extent size than configured.
        self.check_alignment(&vg.name, lv_name, lv_size_bytes, vg.extent_size_bytes)?;
        let extents = lv_size_bytes / vg.extent_size_bytes;
        if let Some(free) = vg.free_extents {
            if extents > free {
                return Err(ProvisionError::InsufficientSpace {
                    resource: qualified,
                    requested_bytes: lv_size_bytes,
                    available_bytes: free.saturating_mul(vg.extent_size_bytes),
                });
            }
        }

        let opts = self.lvm_options();
        self.hal
            .lv_create(&vg.name, lv_name, extents, &opts)
            .map_err(|e| ProvisionError::tool(stage, &qualified, e))?;
        info!(
            "Created logical volume {} ({} extents, {})",
            qualified,
            extents,
            format_size(lv_size_bytes)
        );
        self.settle(&vg.name, &opts)?;

        let lv = if self.opts.dry_run {
            LogicalVolume {
                name: lv_name.to_string(),
                vg_name: vg.name.clone(),
                size_bytes: lv_size_bytes,
                path: lv_device_path(&vg.name, lv_name),
            }
        } else {
            let info = self
                .hal
                .lv_info(&vg.name, lv_name)
                .map_err(|e| ProvisionError::tool(stage, &qualified, e))?
                .ok_or_else(|| {
                    ProvisionError::tool(
                        stage,
                        &qualified,
                        lvmloop_hal::HalError::Parse(format!(
                            "lvs does not report {qualified} after lvcreate"
                        )),
                    )
                })?;
            LogicalVolume {
                name: info.name,
                vg_name: info.vg_name,
                size_bytes: info.size_bytes,
                path: info.path,
            }
        };
        let outcome = self.created();
        self.record(stage, &qualified, outcome, format_size(lv.size_bytes));
        Ok(lv)
    }

    /// Make sure `/dev/<vg>/<lv>` exists before anything tries to format it.
    fn settle(&self, vg: &str, opts: &LvmOptions) -> Result<()> {
        if opts.dry_run {
            return Ok(());
        }
        if opts.udev_sync {
            if let Err(err) = self.hal.udev_settle() {
                warn!("udevadm settle failed (continuing): {}", err);
            }
            return Ok(());
        }
        self.hal
            .vg_mknodes(vg, opts)
            .map_err(|e| ProvisionError::tool(Stage::LogicalVolume, vg, e))
    }
}
