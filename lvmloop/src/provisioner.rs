//! Runs the allocator, topology builder and filesystem provisioner in order, and takes the
//! chain down again on request.

use crate::allocator::{Allocator, LoopBinding};
use crate::config::ProvisionConfig;
use crate::errors::{ProvisionError, Result, Stage};
use crate::filesystem::{FilesystemOptions, FilesystemProvisioner, MountedFilesystem};
use crate::report::{Outcome, ProvisionReport};
use crate::size::{align_up, format_size};
use crate::topology::{is_lv_device, lv_device_path, LogicalVolume, TopologyBuilder, TopologyOptions};
use log::{info, warn};
use lvmloop_hal::{HalError, LvmOptions, SystemHal};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

const QUERY_TOOLS: &[&str] = &["losetup", "pvs", "vgs", "lvs", "blkid"];
const PROVISION_TOOLS: &[&str] = &["pvcreate", "vgcreate", "lvcreate"];
const TEARDOWN_TOOLS: &[&str] = &["pvremove", "vgremove", "lvremove"];

/// Everything a successful `provision` produced.
#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub binding: LoopBinding,
    pub volume: LogicalVolume,
    pub filesystem: MountedFilesystem,
    pub report: ProvisionReport,
}

pub struct Provisioner<'a, H: SystemHal + ?Sized> {
    hal: &'a H,
    dry_run: bool,
}

impl<'a, H: SystemHal + ?Sized> Provisioner<'a, H> {
    pub fn new(hal: &'a H, dry_run: bool) -> Self {
        Self { hal, dry_run }
    }

    fn planned_or(&self, done: Outcome) -> Outcome {
        if self.dry_run {
            Outcome::Planned
        } else {
            done
        }
    }

    fn preflight(&self, tools: &[&str], needs_root: bool) -> Result<()> {
        let missing: Vec<&str> = tools
            .iter()
            .copied()
            .filter(|tool| !self.hal.command_exists(tool))
            .collect();
        if !missing.is_empty() {
            return Err(ProvisionError::ToolMissing {
                program: missing.join(", "),
            });
        }
        if needs_root && !self.dry_run && !self.hal.is_root() {
            return Err(ProvisionError::PermissionDenied {
                stage: Stage::Preflight,
                resource: "loop and LVM administration (run as root)".to_string(),
            });
        }
        Ok(())
    }

    /// Backing file -> loop device -> PV -> VG -> LV -> filesystem -> mount.
    pub fn provision(&self, config: &ProvisionConfig) -> Result<Provisioned> {
        let mkfs = config.fs_type.program();
        let mut tools: Vec<&str> = QUERY_TOOLS.iter().chain(PROVISION_TOOLS).copied().collect();
        tools.push(&mkfs);
        if !config.udev_sync {
            tools.push("vgmknodes");
        }
        self.preflight(&tools, true)?;

        let mut report = ProvisionReport::new(self.dry_run);
        let vg_name = config.effective_vg_name();

        let mut allocator = Allocator::new(self.hal, self.dry_run)
            .with_attach_retries(config.attach_retries);
        let binding = allocator.allocate(&config.backing_file_path, config.size_bytes)?;
        report.extend(allocator.steps().iter().cloned());

        let lv_size = align_up(config.lv_size_bytes, config.extent_size_bytes).ok_or_else(|| {
            ProvisionError::InvalidConfig(format!(
                "lv_size_bytes {} cannot be rounded to {} extents",
                config.lv_size_bytes,
                format_size(config.extent_size_bytes)
            ))
        })?;
        if lv_size != config.lv_size_bytes {
            info!(
                "Rounded LV size {} up to {} ({} extents of {})",
                config.lv_size_bytes,
                lv_size,
                lv_size / config.extent_size_bytes,
                format_size(config.extent_size_bytes)
            );
        }

        let topology_opts = TopologyOptions::new(config.extent_size_bytes)
            .idempotent(config.idempotent)
            .dry_run(self.dry_run)
            .udev_sync(config.udev_sync);
        let mut builder = TopologyBuilder::new(self.hal, topology_opts);
        let volume = builder.build_topology(&binding.device, &vg_name, &config.lv_name, lv_size)?;
        report.extend(builder.steps().iter().cloned());

        let fs_opts = FilesystemOptions {
            dry_run: self.dry_run,
            force: config.force,
            label: config.label.clone(),
            mount_options: config.mount_options.clone(),
        };
        let mut fs = FilesystemProvisioner::new(self.hal, fs_opts);
        let filesystem = fs.provision(&volume, config.fs_type, &config.mount_point)?;
        report.extend(fs.steps().iter().cloned());

        if report.changed() {
            info!(
                "Provisioned {} at {}",
                volume.qualified_name(),
                config.mount_point.display()
            );
        } else {
            info!("Nothing to do: {} is already in place", volume.qualified_name());
        }
        Ok(Provisioned {
            binding,
            volume,
            filesystem,
            report,
        })
    }

    /// Remove what `config` names, in reverse order. Missing pieces are reported as absent.
    pub fn teardown(&self, config: &ProvisionConfig, remove_backing_file: bool) -> Result<ProvisionReport> {
        let tools: Vec<&str> = QUERY_TOOLS.iter().chain(TEARDOWN_TOOLS).copied().collect();
        self.preflight(&tools, true)?;

        let mut report = ProvisionReport::new(self.dry_run);
        let stage = Stage::Teardown;
        let vg = config.effective_vg_name();
        let lv = &config.lv_name;
        let qualified = format!("{vg}/{lv}");
        let path = config.backing_file_path.as_path();
        let lvm = LvmOptions::new(self.dry_run).with_udev_sync(config.udev_sync);

        let devices = if path.exists() {
            self.hal
                .losetup_associated(path)
                .map_err(|e| ProvisionError::tool(stage, path.display(), e))?
        } else {
            Vec::new()
        };

        // A VG of this name on devices we do not back is someone else's; touch nothing.
        let vg_info = self
            .hal
            .vg_info(&vg)
            .map_err(|e| ProvisionError::tool(stage, &vg, e))?;
        if vg_info.is_some() {
            let members = self
                .hal
                .vg_members(&vg)
                .map_err(|e| ProvisionError::tool(stage, &vg, e))?;
            if !members.iter().any(|m| devices.contains(m)) {
                return Err(ProvisionError::NameConflict { vg });
            }
        }

        self.teardown_mount(config, &vg, &mut report)?;

        let lv_present = self
            .hal
            .lv_info(&vg, lv)
            .map_err(|e| ProvisionError::tool(stage, &qualified, e))?
            .is_some();
        if lv_present {
            self.hal
                .lv_remove(&vg, lv, &lvm)
                .map_err(|e| ProvisionError::tool(stage, &qualified, e))?;
            info!("Removed logical volume {}", qualified);
            report.push(stage, &qualified, self.planned_or(Outcome::Removed));
        } else {
            report.push(stage, &qualified, Outcome::Absent);
        }

        match vg_info {
            Some(info) => {
                // lv_count was read before our LV was removed.
                let others = info.lv_count.saturating_sub(u64::from(lv_present));
                if others > 0 {
                    return Err(ProvisionError::DeviceBusy {
                        stage,
                        resource: vg,
                        detail: format!("volume group still holds {others} other logical volume(s)"),
                    });
                }
                self.hal
                    .vg_remove(&vg, &lvm)
                    .map_err(|e| ProvisionError::tool(stage, &vg, e))?;
                info!("Removed volume group {}", vg);
                report.push(stage, &vg, self.planned_or(Outcome::Removed));
            }
            None => report.push(stage, &vg, Outcome::Absent),
        }

        for device in &devices {
            let pv = self
                .hal
                .pv_info(device)
                .map_err(|e| ProvisionError::tool(stage, device, e))?;
            let Some(pv) = pv else {
                report.push_detail(stage, device, Outcome::Absent, "physical volume");
                continue;
            };
            if let Some(owner) = pv.vg_name.as_deref().filter(|owner| *owner != vg) {
                return Err(ProvisionError::DeviceBusy {
                    stage,
                    resource: device.clone(),
                    detail: format!("physical volume belongs to volume group {owner}"),
                });
            }
            self.hal
                .pv_remove(device, &lvm)
                .map_err(|e| ProvisionError::tool(stage, device, e))?;
            info!("Removed physical volume {}", device);
            report.push_detail(stage, device, self.planned_or(Outcome::Removed), "physical volume");
        }

        let mut allocator = Allocator::new(self.hal, self.dry_run);
        let released = allocator.release(path)?;
        if released.is_empty() {
            report.push_detail(stage, path.display(), Outcome::Absent, "loop device");
        }
        for device in released {
            report.push_detail(stage, device, self.planned_or(Outcome::Removed), "loop device");
        }

        if remove_backing_file {
            self.remove_backing_file(path, &mut report)?;
        }
        Ok(report)
    }

    fn teardown_mount(&self, config: &ProvisionConfig, vg: &str, report: &mut ProvisionReport) -> Result<()> {
        let stage = Stage::Teardown;
        let target = config.mount_point.as_path();
        let entry = self
            .hal
            .mount_entry(target)
            .map_err(|e| ProvisionError::tool(stage, target.display(), e))?;
        let Some(entry) = entry else {
            report.push(stage, target.display(), Outcome::Absent);
            return Ok(());
        };
        if !is_lv_device(vg, &config.lv_name, Path::new(&entry.source)) {
            warn!(
                "{} hosts {}, not {}/{}; leaving it mounted",
                target.display(),
                entry.source,
                vg,
                config.lv_name
            );
            report.push_detail(stage, target.display(), Outcome::Absent, format!("{} left mounted", entry.source));
            return Ok(());
        }

        self.hal
            .unmount(target, self.dry_run)
            .map_err(|err| match err {
                HalError::DiskBusy => ProvisionError::DeviceBusy {
                    stage,
                    resource: target.display().to_string(),
                    detail: "filesystem is in use".to_string(),
                },
                other => ProvisionError::tool(stage, target.display(), other),
            })?;
        info!("Unmounted {}", target.display());
        report.push(stage, target.display(), self.planned_or(Outcome::Removed));
        Ok(())
    }

    fn remove_backing_file(&self, path: &Path, report: &mut ProvisionReport) -> Result<()> {
        let stage = Stage::Teardown;
        if !path.exists() {
            report.push_detail(stage, path.display(), Outcome::Absent, "backing file");
            return Ok(());
        }
        if self.dry_run {
            info!("DRY RUN: would delete {}", path.display());
        } else {
            match fs::remove_file(path) {
                Ok(()) => info!("Deleted backing file {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(ProvisionError::io(stage, path.display(), err)),
            }
        }
        report.push_detail(stage, path.display(), self.planned_or(Outcome::Removed), "backing file");
        Ok(())
    }

    /// Read-only view of every layer named by `config`.
    pub fn status(&self, config: &ProvisionConfig) -> Result<ProvisionReport> {
        self.preflight(QUERY_TOOLS, false)?;

        let mut report = ProvisionReport::new(false);
        let vg = config.effective_vg_name();
        let lv = &config.lv_name;
        let qualified = format!("{vg}/{lv}");
        let path = config.backing_file_path.as_path();

        let devices = match fs::metadata(path) {
            Ok(meta) => {
                let detail = if meta.len() == config.size_bytes {
                    format_size(meta.len())
                } else {
                    format!(
                        "{}, expected {}",
                        format_size(meta.len()),
                        format_size(config.size_bytes)
                    )
                };
                report.push_detail(Stage::Allocate, path.display(), Outcome::Present, detail);
                self.hal
                    .losetup_associated(path)
                    .map_err(|e| ProvisionError::tool(Stage::Allocate, path.display(), e))?
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                report.push_detail(Stage::Allocate, path.display(), Outcome::Absent, "backing file");
                Vec::new()
            }
            Err(err) => return Err(ProvisionError::io(Stage::Allocate, path.display(), err)),
        };
        if devices.is_empty() {
            report.push_detail(Stage::Allocate, path.display(), Outcome::Absent, "loop device");
        }
        for device in &devices {
            report.push_detail(Stage::Allocate, device, Outcome::Present, "loop device");
            match self
                .hal
                .pv_info(device)
                .map_err(|e| ProvisionError::tool(Stage::PhysicalVolume, device, e))?
            {
                Some(pv) => {
                    let owner = pv.vg_name.unwrap_or_else(|| "no volume group".to_string());
                    report.push_detail(Stage::PhysicalVolume, device, Outcome::Present, owner);
                }
                None => report.push(Stage::PhysicalVolume, device, Outcome::Absent),
            }
        }

        match self
            .hal
            .vg_info(&vg)
            .map_err(|e| ProvisionError::tool(Stage::VolumeGroup, &vg, e))?
        {
            Some(info) => {
                let members = self
                    .hal
                    .vg_members(&vg)
                    .map_err(|e| ProvisionError::tool(Stage::VolumeGroup, &vg, e))?;
                let mut detail = format!(
                    "{} capacity, {} free",
                    format_size(info.capacity_bytes()),
                    format_size(info.free_bytes())
                );
                if !members.iter().any(|m| devices.contains(m)) {
                    detail.push_str(&format!(", on other devices: {}", members.join(", ")));
                }
                report.push_detail(Stage::VolumeGroup, &vg, Outcome::Present, detail);
            }
            None => report.push(Stage::VolumeGroup, &vg, Outcome::Absent),
        }

        let lv_info = self
            .hal
            .lv_info(&vg, lv)
            .map_err(|e| ProvisionError::tool(Stage::LogicalVolume, &qualified, e))?;
        match &lv_info {
            Some(info) => report.push_detail(
                Stage::LogicalVolume,
                &qualified,
                Outcome::Present,
                format_size(info.size_bytes),
            ),
            None => report.push(Stage::LogicalVolume, &qualified, Outcome::Absent),
        }

        if let Some(info) = &lv_info {
            let device = info.path.display();
            match self
                .hal
                .blkid_type(&info.path)
                .map_err(|e| ProvisionError::tool(Stage::Format, &device, e))?
            {
                Some(fs_type) => report.push_detail(Stage::Format, &device, Outcome::Present, fs_type),
                None => report.push(Stage::Format, &device, Outcome::Absent),
            }
        } else {
            let device = lv_device_path(&vg, lv);
            report.push(Stage::Format, device.display(), Outcome::Absent);
        }

        let target = config.mount_point.as_path();
        match self
            .hal
            .mount_entry(target)
            .map_err(|e| ProvisionError::tool(Stage::Mount, target.display(), e))?
        {
            Some(entry) => report.push_detail(
                Stage::Mount,
                target.display(),
                Outcome::Present,
                format!("{} ({})", entry.source, entry.fs_type),
            ),
            None => report.push(Stage::Mount, target.display(), Outcome::Absent),
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartialConfig;
    use lvmloop_hal::{FakeHal, LvmOps};
    use tempfile::tempdir;

    fn config(dir: &Path) -> ProvisionConfig {
        PartialConfig {
            backing_file_path: Some(dir.join("disk.img")),
            size_bytes: Some(256 * 1024 * 1024),
            vg_name: Some("vg_test".to_string()),
            lv_name: Some("lv_test".to_string()),
            lv_size_bytes: Some(64 * 1024 * 1024),
            fs_type: Some("ext4".to_string()),
            mount_point: Some(dir.join("mnt")),
            ..Default::default()
        }
        .resolve()
        .unwrap()
    }

    #[test]
    fn missing_tools_stop_before_any_change() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.remove_command("mkfs.ext4");
        hal.remove_command("lvcreate");

        let err = Provisioner::new(&hal, false)
            .provision(&config(dir.path()))
            .unwrap_err();
        assert_eq!(err.stage(), Stage::Preflight);
        assert!(err.to_string().contains("lvcreate, mkfs.ext4"), "{err}");
        assert!(!dir.path().join("disk.img").exists());
    }

    #[test]
    fn non_root_is_refused_unless_dry_run() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.set_root(false);

        let err = Provisioner::new(&hal, false)
            .provision(&config(dir.path()))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::PermissionDenied { stage: Stage::Preflight, .. }));

        Provisioner::new(&hal, true)
            .provision(&config(dir.path()))
            .unwrap();
        Provisioner::new(&hal, false)
            .status(&config(dir.path()))
            .unwrap();
    }

    #[test]
    fn unaligned_lv_size_is_rounded_up() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let mut config = config(dir.path());
        config.lv_size_bytes = 50_000_000;

        let provisioned = Provisioner::new(&hal, false).provision(&config).unwrap();
        assert_eq!(provisioned.volume.size_bytes, 12 * 4 * 1024 * 1024);
    }

    #[test]
    fn vg_with_other_volumes_is_kept_on_teardown() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let config = config(dir.path());
        let provisioned = Provisioner::new(&hal, false).provision(&config).unwrap();
        hal.lv_create("vg_test", "lv_extra", 2, &LvmOptions::new(false))
            .unwrap();

        let err = Provisioner::new(&hal, false)
            .teardown(&config, false)
            .unwrap_err();
        assert!(matches!(err, ProvisionError::DeviceBusy { .. }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(hal.lv_names("vg_test"), vec!["lv_extra".to_string()]);
        assert_eq!(hal.pv_devices(), vec![provisioned.binding.device]);
    }

    #[test]
    fn teardown_leaves_foreign_mounts_alone() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let config = config(dir.path());
        hal.seed_mount("/dev/sdb1", &config.mount_point, "xfs");

        let report = Provisioner::new(&hal, false)
            .teardown(&config, false)
            .unwrap();
        assert_eq!(hal.mounted_targets(), vec![config.mount_point.clone()]);
        assert!(report.steps.iter().all(|s| s.outcome == Outcome::Absent));
    }

    #[test]
    fn status_reports_every_layer() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        let config = config(dir.path());

        let before = Provisioner::new(&hal, false).status(&config).unwrap();
        assert!(before.steps.iter().all(|s| s.outcome == Outcome::Absent));

        Provisioner::new(&hal, false).provision(&config).unwrap();
        hal.clear_operations();
        let after = Provisioner::new(&hal, false).status(&config).unwrap();

        for stage in [
            Stage::Allocate,
            Stage::PhysicalVolume,
            Stage::VolumeGroup,
            Stage::LogicalVolume,
            Stage::Format,
            Stage::Mount,
        ] {
            assert_eq!(after.outcome_of(stage), Some(Outcome::Present), "{stage}");
        }
        assert_eq!(hal.operation_count(), 0);
    }
}
