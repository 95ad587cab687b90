//! Filesystem provisioner: format the LV once and mount it.

use crate::errors::{ProvisionError, Result, Stage};
use crate::report::{Outcome, StepReport};
use crate::topology::{is_lv_device, LogicalVolume};
use log::{debug, info, warn};
use lvmloop_hal::{FormatOps, FormatOptions, FsKind, HalError, MountOps, MountOptions, ProbeOps};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountedFilesystem {
    /// Device actually mounted at `mount_point`
    pub source: PathBuf,
    pub fs_type: String,
    pub mount_point: PathBuf,
    /// True if the mount was already in place
    pub reused: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FilesystemOptions {
    pub dry_run: bool,
    /// Replace a different filesystem signature on the LV
    pub force: bool,
    pub label: Option<String>,
    pub mount_options: Option<String>,
}

pub struct FilesystemProvisioner<'a, H: FormatOps + ProbeOps + MountOps + ?Sized> {
    hal: &'a H,
    opts: FilesystemOptions,
    steps: Vec<StepReport>,
}

impl<'a, H: FormatOps + ProbeOps + MountOps + ?Sized> FilesystemProvisioner<'a, H> {
    pub fn new(hal: &'a H, opts: FilesystemOptions) -> Self {
        Self {
            hal,
            opts,
            steps: Vec::new(),
        }
    }

    pub fn steps(&self) -> &[StepReport] {
        &self.steps
    }

    pub fn provision(
        &mut self,
        lv: &LogicalVolume,
        fs_type: FsKind,
        mount_point: &Path,
    ) -> Result<MountedFilesystem> {
        let entry = self
            .hal
            .mount_entry(mount_point)
            .map_err(|e| ProvisionError::tool(Stage::Mount, mount_point.display(), e))?;
        if let Some(entry) = entry {
            if !is_lv_device(&lv.vg_name, &lv.name, Path::new(&entry.source)) {
                warn!(
                    "{} already has {} ({}) mounted, not {}; leaving it in place",
                    mount_point.display(),
                    entry.source,
                    entry.fs_type,
                    lv.path.display()
                );
            } else {
                info!(
                    "{} is already mounted at {}",
                    lv.path.display(),
                    mount_point.display()
                );
            }
            if self.opts.force {
                warn!("force is ignored for a mounted filesystem; it is never reformatted");
            }
            self.record(Stage::Mount, mount_point.display(), Outcome::Reused, entry.source.clone());
            return Ok(MountedFilesystem {
                source: PathBuf::from(entry.source),
                fs_type: entry.fs_type,
                mount_point: mount_point.to_path_buf(),
                reused: true,
            });
        }

        self.ensure_mount_point(mount_point)?;
        self.ensure_filesystem(lv, fs_type)?;
        self.mount(lv, fs_type, mount_point)?;

        Ok(MountedFilesystem {
            source: lv.path.clone(),
            fs_type: fs_type.to_string(),
            mount_point: mount_point.to_path_buf(),
            reused: false,
        })
    }

    fn created(&self) -> Outcome {
        if self.opts.dry_run {
            Outcome::Planned
        } else {
            Outcome::Created
        }
    }

    fn record(
        &mut self,
        stage: Stage,
        resource: impl std::fmt::Display,
        outcome: Outcome,
        detail: String,
    ) {
        self.steps.push(StepReport {
            stage,
            resource: resource.to_string(),
            outcome,
            detail: Some(detail),
        });
    }

    fn ensure_mount_point(&self, mount_point: &Path) -> Result<()> {
        match fs::metadata(mount_point) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ProvisionError::AlreadyExists {
                stage: Stage::Mount,
                resource: mount_point.display().to_string(),
                detail: "exists and is not a directory".to_string(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if self.opts.dry_run {
                    info!("DRY RUN: would create directory {}", mount_point.display());
                    return Ok(());
                }
                fs::create_dir_all(mount_point)
                    .map_err(|e| ProvisionError::io(Stage::Mount, mount_point.display(), e))?;
                info!("Created mount point {}", mount_point.display());
                Ok(())
            }
            Err(err) => Err(ProvisionError::io(Stage::Mount, mount_point.display(), err)),
        }
    }

    fn ensure_filesystem(&mut self, lv: &LogicalVolume, fs_type: FsKind) -> Result<()> {
        let device = lv.path.as_path();
        let existing = match self.hal.blkid_type(device) {
            Ok(existing) => existing,
            // The LV does not exist yet in a dry run.
            Err(err) if self.opts.dry_run => {
                debug!("probe of {} failed in dry run: {}", device.display(), err);
                None
            }
            Err(err) => return Err(ProvisionError::tool(Stage::Format, device.display(), err)),
        };

        let force = match existing.as_deref() {
            Some(found) if found == fs_type.as_str() => {
                info!(
                    "{} already carries {}; skipping format",
                    device.display(),
                    found
                );
                self.record(Stage::Format, device.display(), Outcome::Reused, found.to_string());
                return Ok(());
            }
            Some(found) if !self.opts.force => {
                return Err(ProvisionError::AlreadyExists {
                    stage: Stage::Format,
                    resource: device.display().to_string(),
                    detail: format!(
                        "carries a {found} filesystem; set force to replace it with {fs_type}"
                    ),
                });
            }
            Some(found) => {
                warn!(
                    "Replacing {} filesystem on {} with {} (force)",
                    found,
                    device.display(),
                    fs_type
                );
                true
            }
            None => false,
        };

        let opts = FormatOptions::new(self.opts.dry_run, true)
            .with_force(force)
            .with_label(self.opts.label.clone());
        self.hal
            .mkfs(device, fs_type, &opts)
            .map_err(|err| format_error(device, fs_type, err))?;
        info!("Formatted {} as {}", device.display(), fs_type);

        let outcome = self.created();
        self.record(Stage::Format, device.display(), outcome, fs_type.to_string());
        Ok(())
    }

    fn mount(&mut self, lv: &LogicalVolume, fs_type: FsKind, mount_point: &Path) -> Result<()> {
        let options = match &self.opts.mount_options {
            Some(opts) => MountOptions::with_options(opts.clone()),
            None => MountOptions::new(),
        };
        self.hal
            .mount_device(
                &lv.path,
                mount_point,
                Some(fs_type.as_str()),
                options,
                self.opts.dry_run,
            )
            .map_err(|err| mount_error(&lv.path, mount_point, fs_type, err))?;
        info!("Mounted {} at {}", lv.path.display(), mount_point.display());

        let outcome = self.created();
        self.record(
            Stage::Mount,
            mount_point.display(),
            outcome,
            lv.path.display().to_string(),
        );
        Ok(())
    }
}

fn format_error(device: &Path, fs_type: FsKind, err: HalError) -> ProvisionError {
    match err {
        HalError::CommandFailed {
            program,
            code,
            stderr,
        } => {
            if stderr.contains("Permission denied") {
                return ProvisionError::PermissionDenied {
                    stage: Stage::Format,
                    resource: device.display().to_string(),
                };
            }
            ProvisionError::FormatFailed {
                device: device.to_path_buf(),
                program,
                code,
                stderr: stderr.trim().to_string(),
            }
        }
        HalError::CommandTimeout { .. } => ProvisionError::FormatFailed {
            device: device.to_path_buf(),
            program: fs_type.program(),
            code: None,
            stderr: err.to_string(),
        },
        other => ProvisionError::tool(Stage::Format, device.display(), other),
    }
}

fn mount_error(device: &Path, target: &Path, fs_type: FsKind, err: HalError) -> ProvisionError {
    let reason = match err {
        HalError::PermissionDenied => {
            return ProvisionError::PermissionDenied {
                stage: Stage::Mount,
                resource: target.display().to_string(),
            }
        }
        HalError::DiskBusy => "target is busy".to_string(),
        HalError::NoDevice => format!("filesystem type {fs_type} is not supported by the running kernel"),
        other => other.to_string(),
    };
    ProvisionError::MountFailed {
        device: device.to_path_buf(),
        target: target.to_path_buf(),
        reason,
    }
}
