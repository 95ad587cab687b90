//! Backing store allocator: sparse backing file plus one loop binding per file.

use crate::errors::{ProvisionError, Result, Stage};
use crate::report::{Outcome, StepReport};
use crate::size::format_size;
use log::{debug, info, warn};
use lvmloop_hal::{HalError, LoopOps};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackingFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopBinding {
    pub backing: BackingFile,
    /// Kernel-assigned loop device, e.g. `/dev/loop7`
    pub device: String,
    /// True if the binding existed before this allocation
    pub reused: bool,
}

enum AttachError {
    /// Another process took the device between lookup and bind
    Raced(HalError),
    Fatal(ProvisionError),
}

fn classify_attach_error(path: &Path, err: HalError) -> AttachError {
    let stderr = err.stderr().unwrap_or_default();
    if stderr.contains("cannot find an unused loop device")
        || stderr.contains("could not find any free loop device")
    {
        return AttachError::Fatal(ProvisionError::NoLoopDevicesAvailable {
            path: path.to_path_buf(),
        });
    }
    if stderr.contains("Device or resource busy")
        || stderr.contains("Resource temporarily unavailable")
    {
        return AttachError::Raced(err);
    }
    AttachError::Fatal(ProvisionError::tool(Stage::Allocate, path.display(), err))
}

pub struct Allocator<'a, H: LoopOps + ?Sized> {
    hal: &'a H,
    dry_run: bool,
    attach_retries: u32,
    retry_delay: Duration,
    bindings: BTreeMap<PathBuf, LoopBinding>,
    steps: Vec<StepReport>,
}

impl<'a, H: LoopOps + ?Sized> Allocator<'a, H> {
    pub fn new(hal: &'a H, dry_run: bool) -> Self {
        Self {
            hal,
            dry_run,
            attach_retries: crate::config::DEFAULT_ATTACH_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            bindings: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_attach_retries(mut self, retries: u32) -> Self {
        self.attach_retries = retries;
        self
    }

    /// Base delay between attach attempts; attempt `n` waits `n * delay`.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Ensure `path` exists with exactly `size_bytes` and is bound to a loop device.
    pub fn allocate(&mut self, path: &Path, size_bytes: u64) -> Result<LoopBinding> {
        if size_bytes == 0 {
            return Err(ProvisionError::InvalidConfig(format!(
                "{}: backing file size must be greater than zero",
                path.display()
            )));
        }

        let created = self.ensure_backing_file(path, size_bytes)?;
        let backing = BackingFile {
            path: path.to_path_buf(),
            size_bytes,
        };

        // A file that does not exist yet (dry run) cannot be bound.
        let existing = if created && self.dry_run {
            Vec::new()
        } else {
            self.hal
                .losetup_associated(path)
                .map_err(|e| ProvisionError::tool(Stage::Allocate, path.display(), e))?
        };

        let binding = match existing.split_first() {
            Some((device, rest)) => {
                if !rest.is_empty() {
                    warn!(
                        "{} is bound to several loop devices ({}, {}); using {}",
                        path.display(),
                        device,
                        rest.join(", "),
                        device
                    );
                }
                info!("{} already bound to {}", path.display(), device);
                self.record(device, Outcome::Reused);
                LoopBinding {
                    backing,
                    device: device.clone(),
                    reused: true,
                }
            }
            None => {
                let device = self.attach(path)?;
                let outcome = if self.dry_run {
                    Outcome::Planned
                } else {
                    Outcome::Created
                };
                self.record(&device, outcome);
                LoopBinding {
                    backing,
                    device,
                    reused: false,
                }
            }
        };

        self.bindings.insert(path.to_path_buf(), binding.clone());
        Ok(binding)
    }

    /// Detach the loop device(s) backing `path`, returning the devices detached.
    ///
    /// Devices the kernel reports for the file are detached too, so a binding made by an
    /// earlier process is released as well as one registered here.
    pub fn release(&mut self, path: &Path) -> Result<Vec<String>> {
        let mut devices: Vec<String> = self
            .bindings
            .remove(path)
            .map(|binding| vec![binding.device])
            .unwrap_or_default();
        if path.exists() {
            let associated = self
                .hal
                .losetup_associated(path)
                .map_err(|e| ProvisionError::tool(Stage::Teardown, path.display(), e))?;
            for device in associated {
                if !devices.contains(&device) {
                    devices.push(device);
                }
            }
        }

        let mut released = Vec::new();
        for device in devices {
            match self.hal.losetup_detach(&device, self.dry_run) {
                Ok(()) => {
                    info!("Detached {} ({})", device, path.display());
                    released.push(device);
                }
                // Registered binding that someone else already detached.
                Err(err) if err.stderr().is_some_and(|s| s.contains("No such device")) => {
                    debug!("{} was already detached: {}", device, err);
                }
                Err(err) => return Err(ProvisionError::tool(Stage::Teardown, &device, err)),
            }
        }
        Ok(released)
    }

    pub fn binding(&self, path: &Path) -> Option<&LoopBinding> {
        self.bindings.get(path)
    }

    pub fn steps(&self) -> &[StepReport] {
        &self.steps
    }

    fn record(&mut self, device: &str, outcome: Outcome) {
        self.steps.push(StepReport {
            stage: Stage::Allocate,
            resource: device.to_string(),
            outcome,
            detail: Some("loop device".to_string()),
        });
    }

    /// Returns true if the file was (or, in a dry run, would be) created.
    fn ensure_backing_file(&mut self, path: &Path, size_bytes: u64) -> Result<bool> {
        match fs::metadata(path) {
            Ok(meta) => {
                if !meta.is_file() {
                    return Err(ProvisionError::AlreadyExists {
                        stage: Stage::Allocate,
                        resource: path.display().to_string(),
                        detail: "exists and is not a regular file".to_string(),
                    });
                }
                if meta.len() != size_bytes {
                    return Err(ProvisionError::SizeMismatch {
                        path: path.to_path_buf(),
                        expected: size_bytes,
                        actual: meta.len(),
                    });
                }
                debug!("{} exists with expected size", path.display());
                self.push_file_step(path, size_bytes, Outcome::Reused);
                Ok(false)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if self.dry_run {
                    info!(
                        "DRY RUN: would create sparse file {} ({})",
                        path.display(),
                        format_size(size_bytes)
                    );
                    self.push_file_step(path, size_bytes, Outcome::Planned);
                    return Ok(true);
                }
                create_sparse_file(path, size_bytes)?;
                info!(
                    "Created sparse file {} ({})",
                    path.display(),
                    format_size(size_bytes)
                );
                self.push_file_step(path, size_bytes, Outcome::Created);
                Ok(true)
            }
            Err(err) => Err(ProvisionError::io(Stage::Allocate, path.display(), err)),
        }
    }

    fn push_file_step(&mut self, path: &Path, size_bytes: u64, outcome: Outcome) {
        self.steps.push(StepReport {
            stage: Stage::Allocate,
            resource: path.display().to_string(),
            outcome,
            detail: Some(format_size(size_bytes)),
        });
    }

    fn attach(&self, path: &Path) -> Result<String> {
        let attempts = self.attach_retries.saturating_add(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.hal.losetup_attach(path, self.dry_run) {
                Ok(device) => {
                    if self.dry_run {
                        info!("DRY RUN: would bind {} to {}", path.display(), device);
                    } else {
                        info!("Bound {} to {}", path.display(), device);
                    }
                    return Ok(device);
                }
                Err(err) => match classify_attach_error(path, err) {
                    AttachError::Fatal(err) => return Err(err),
                    AttachError::Raced(err) => {
                        warn!(
                            "Loop attach attempt {}/{} for {} lost a race: {}",
                            attempt,
                            attempts,
                            path.display(),
                            err
                        );
                        last_err = Some(err);
                        if attempt < attempts {
                            sleep(self.retry_delay * attempt);
                        }
                    }
                },
            }
        }
        let err = last_err.unwrap_or_else(|| HalError::Parse("loop attach never ran".to_string()));
        Err(ProvisionError::ExternalTool {
            stage: Stage::Allocate,
            resource: path.display().to_string(),
            source: err,
        })
    }
}

fn create_sparse_file(path: &Path, size_bytes: u64) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| ProvisionError::io(Stage::Allocate, parent.display(), e))?;
    }
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| ProvisionError::io(Stage::Allocate, path.display(), e))?;
    file.set_len(size_bytes)
        .map_err(|e| ProvisionError::io(Stage::Allocate, path.display(), e))
}
