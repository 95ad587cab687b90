//! Fake HAL implementation for testing.
//!
//! This implementation models the loop table, LVM metadata, filesystem signatures and the mount
//! table in memory and records every mutating operation, allowing CI-safe testing without root
//! privileges or real block devices.

use super::{
    mkfs_command_spec, FormatOps, FormatOptions, FsKind, LoopOps, LvInfo, LvmOps, LvmOptions,
    MountEntry, MountOps, MountOptions, ProbeOps, PvInfo, SystemOps, VgInfo,
};
use crate::{HalError, HalResult};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Metadata area the fake reserves in front of the first extent, like LVM's default 1 MiB.
pub const FAKE_PE_START: u64 = 1024 * 1024;

const DEFAULT_LOOP_SLOTS: usize = 8;

/// Operation records for testing and verification.
///
/// Only operations that change host state are recorded; queries are not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Mount {
        device: PathBuf,
        target: PathBuf,
        fstype: Option<String>,
    },
    Unmount {
        target: PathBuf,
    },
    Mkfs {
        device: PathBuf,
        fs_type: String,
        force: bool,
    },
    LosetupAttach {
        image: PathBuf,
        loop_device: String,
    },
    LosetupDetach {
        loop_device: String,
    },
    PvCreate {
        device: String,
    },
    PvRemove {
        device: String,
    },
    VgCreate {
        name: String,
        devices: Vec<String>,
        extent_size_bytes: u64,
    },
    VgRemove {
        name: String,
    },
    LvCreate {
        vg: String,
        lv: String,
        extents: u64,
    },
    LvRemove {
        vg: String,
        lv: String,
    },
    VgMknodes {
        vg: String,
    },
    UdevSettle,
}

#[derive(Debug, Clone)]
struct FakePv {
    size_bytes: u64,
    vg: Option<String>,
}

#[derive(Debug, Clone)]
struct FakeVg {
    extent_size_bytes: u64,
    extent_count: u64,
    lvs: BTreeMap<String, u64>,
}

impl FakeVg {
    fn free_extents(&self) -> u64 {
        self.extent_count
            .saturating_sub(self.lvs.values().copied().sum::<u64>())
    }
}

/// Shared state for FakeHal operations.
#[derive(Debug, Clone)]
struct FakeHalState {
    /// All mutating operations that were recorded
    operations: Vec<Operation>,
    /// Loop device -> backing file
    loops: BTreeMap<String, PathBuf>,
    loop_slots: usize,
    /// Upcoming attaches that lose a race for the device they were handed
    attach_races: u32,
    pvs: BTreeMap<String, FakePv>,
    vgs: BTreeMap<String, FakeVg>,
    /// Device -> filesystem signature
    signatures: BTreeMap<PathBuf, String>,
    mounts: BTreeMap<PathBuf, MountEntry>,
    unsupported_fs: BTreeSet<String>,
    /// Program -> (exit code, stderr) it fails with
    failing_programs: BTreeMap<String, (i32, String)>,
    missing_commands: BTreeSet<String>,
    root: bool,
}

impl Default for FakeHalState {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
            loops: BTreeMap::new(),
            loop_slots: DEFAULT_LOOP_SLOTS,
            attach_races: 0,
            pvs: BTreeMap::new(),
            vgs: BTreeMap::new(),
            signatures: BTreeMap::new(),
            mounts: BTreeMap::new(),
            unsupported_fs: BTreeSet::new(),
            failing_programs: BTreeMap::new(),
            missing_commands: BTreeSet::new(),
            root: true,
        }
    }
}

/// Fake HAL implementation that records operations without executing them.
///
/// This is designed for testing and CI environments where real system
/// operations would fail or be dangerous.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

fn failed(program: &str, code: i32, stderr: impl Into<String>) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: Some(code),
        stderr: stderr.into(),
    }
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeHalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    /// Get the number of operations recorded.
    pub fn operation_count(&self) -> usize {
        self.lock().operations.len()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.lock().operations.iter().any(check)
    }

    /// Forget recorded operations while keeping the simulated host state.
    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// Limit the number of loop devices the fake kernel offers.
    pub fn set_loop_slots(&self, slots: usize) {
        self.lock().loop_slots = slots;
    }

    /// Make the next `races` attaches fail as if another process grabbed the device first.
    pub fn set_attach_races(&self, races: u32) {
        self.lock().attach_races = races;
    }

    /// Simulate running without (or with) root privileges.
    pub fn set_root(&self, root: bool) {
        self.lock().root = root;
    }

    /// Make every invocation of `program` fail with the given exit code and stderr.
    pub fn fail_command(&self, program: &str, code: i32, stderr: &str) {
        self.lock()
            .failing_programs
            .insert(program.to_string(), (code, stderr.to_string()));
    }

    /// Pretend `program` is not installed.
    pub fn remove_command(&self, program: &str) {
        self.lock().missing_commands.insert(program.to_string());
    }

    /// Pretend the running kernel cannot mount `fs_type`.
    pub fn mark_unsupported_fs(&self, fs_type: &str) {
        self.lock().unsupported_fs.insert(fs_type.to_string());
    }

    /// Place a filesystem signature on `device` without recording a format.
    pub fn seed_signature(&self, device: impl Into<PathBuf>, fs_type: &str) {
        self.lock()
            .signatures
            .insert(device.into(), fs_type.to_string());
    }

    /// Place an existing mount in the mount table without recording it.
    pub fn seed_mount(&self, source: &str, target: impl Into<PathBuf>, fs_type: &str) {
        let target = target.into();
        self.lock().mounts.insert(
            target.clone(),
            MountEntry {
                mount_point: target,
                fs_type: fs_type.to_string(),
                source: source.to_string(),
            },
        );
    }

    /// Create a volume group on a device this fake does not own (another tenant's VG).
    pub fn seed_volume_group(&self, name: &str, device: &str, size_bytes: u64, extent: u64) {
        let mut state = self.lock();
        state.pvs.insert(
            device.to_string(),
            FakePv {
                size_bytes,
                vg: Some(name.to_string()),
            },
        );
        state.vgs.insert(
            name.to_string(),
            FakeVg {
                extent_size_bytes: extent,
                extent_count: size_bytes.saturating_sub(FAKE_PE_START) / extent,
                lvs: BTreeMap::new(),
            },
        );
    }

    /// Bound loop devices with their backing files.
    pub fn loop_devices(&self) -> BTreeMap<String, PathBuf> {
        self.lock().loops.clone()
    }

    pub fn pv_devices(&self) -> Vec<String> {
        self.lock().pvs.keys().cloned().collect()
    }

    pub fn vg_names(&self) -> Vec<String> {
        self.lock().vgs.keys().cloned().collect()
    }

    pub fn lv_names(&self, vg: &str) -> Vec<String> {
        self.lock()
            .vgs
            .get(vg)
            .map(|vg| vg.lvs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn signature(&self, device: &Path) -> Option<String> {
        self.lock().signatures.get(device).cloned()
    }

    pub fn mounted_targets(&self) -> Vec<PathBuf> {
        self.lock().mounts.keys().cloned().collect()
    }

    fn record_operation(&self, op: Operation) {
        self.lock().operations.push(op);
    }

    fn check_injected(&self, program: &str) -> HalResult<()> {
        match self.lock().failing_programs.get(program) {
            Some((code, stderr)) => Err(failed(program, *code, stderr.clone())),
            None => Ok(()),
        }
    }

    fn require_root(&self, program: &str, detail: &str) -> HalResult<()> {
        if self.lock().root {
            return Ok(());
        }
        Err(failed(program, 1, format!("{program}: {detail}: Permission denied")))
    }
}

impl LoopOps for FakeHal {
    fn losetup_attach(&self, image: &Path, dry_run: bool) -> HalResult<String> {
        self.check_injected("losetup")?;

        let loop_device = {
            let state = self.lock();
            (0..state.loop_slots)
                .map(|i| format!("/dev/loop{i}"))
                .find(|dev| !state.loops.contains_key(dev))
        };
        let Some(loop_device) = loop_device else {
            return Err(failed(
                "losetup",
                1,
                "losetup: cannot find an unused loop device",
            ));
        };

        if dry_run {
            log::info!(
                "FAKE HAL DRY RUN: losetup {} -> {}",
                image.display(),
                loop_device
            );
            return Ok(loop_device);
        }

        self.require_root(
            "losetup",
            &format!("{}: failed to set up loop device", image.display()),
        )?;

        {
            let mut state = self.lock();
            if state.attach_races > 0 {
                state.attach_races -= 1;
                return Err(failed(
                    "losetup",
                    1,
                    format!(
                        "losetup: {}: failed to set up loop device: Device or resource busy",
                        image.display()
                    ),
                ));
            }
            state.loops.insert(loop_device.clone(), image.to_path_buf());
        }

        log::info!("FAKE HAL: losetup {} -> {}", image.display(), loop_device);
        self.record_operation(Operation::LosetupAttach {
            image: image.to_path_buf(),
            loop_device: loop_device.clone(),
        });
        Ok(loop_device)
    }

    fn losetup_detach(&self, loop_device: &str, dry_run: bool) -> HalResult<()> {
        if !self.lock().loops.contains_key(loop_device) {
            return Err(failed(
                "losetup",
                1,
                format!("losetup: {loop_device}: detach failed: No such device or address"),
            ));
        }
        if dry_run {
            log::info!("FAKE HAL DRY RUN: losetup -d {}", loop_device);
            return Ok(());
        }

        self.lock().loops.remove(loop_device);
        self.record_operation(Operation::LosetupDetach {
            loop_device: loop_device.to_string(),
        });
        Ok(())
    }

    fn losetup_associated(&self, image: &Path) -> HalResult<Vec<String>> {
        Ok(self
            .lock()
            .loops
            .iter()
            .filter(|(_, backing)| backing.as_path() == image)
            .map(|(dev, _)| dev.clone())
            .collect())
    }
}

impl LvmOps for FakeHal {
    fn pv_create(&self, device: &str, opts: &LvmOptions) -> HalResult<()> {
        self.check_injected("pvcreate")?;
        if opts.dry_run {
            log::info!("FAKE HAL DRY RUN: pvcreate {}", device);
            return Ok(());
        }
        let backing = self.lock().loops.get(device).cloned();
        let Some(backing) = backing else {
            return Err(failed(
                "pvcreate",
                5,
                format!("No device found for {device}."),
            ));
        };
        if self.lock().pvs.contains_key(device) {
            return Err(failed(
                "pvcreate",
                5,
                format!("Can't initialize physical volume \"{device}\": already a physical volume."),
            ));
        }

        let size_bytes = std::fs::metadata(&backing).map(|m| m.len()).unwrap_or(0);
        self.lock().pvs.insert(
            device.to_string(),
            FakePv {
                size_bytes,
                vg: None,
            },
        );
        self.record_operation(Operation::PvCreate {
            device: device.to_string(),
        });
        Ok(())
    }

    fn pv_remove(&self, device: &str, opts: &LvmOptions) -> HalResult<()> {
        self.check_injected("pvremove")?;
        if opts.dry_run {
            log::info!("FAKE HAL DRY RUN: pvremove {}", device);
            return Ok(());
        }
        {
            let state = self.lock();
            match state.pvs.get(device) {
                None => {
                    return Err(failed(
                        "pvremove",
                        5,
                        format!("No PV found on device {device}."),
                    ))
                }
                Some(FakePv { vg: Some(vg), .. }) => {
                    return Err(failed(
                        "pvremove",
                        5,
                        format!("PV {device} is used by VG {vg} so please use vgreduce first."),
                    ))
                }
                Some(_) => {}
            }
        }

        self.lock().pvs.remove(device);
        self.record_operation(Operation::PvRemove {
            device: device.to_string(),
        });
        Ok(())
    }

    fn pv_list(&self) -> HalResult<Vec<PvInfo>> {
        self.check_injected("pvs")?;
        Ok(self
            .lock()
            .pvs
            .iter()
            .map(|(device, pv)| PvInfo {
                device: device.clone(),
                vg_name: pv.vg.clone(),
                size_bytes: pv.size_bytes,
                pe_start_bytes: FAKE_PE_START,
            })
            .collect())
    }

    fn vg_create(
        &self,
        name: &str,
        devices: &[&str],
        extent_size_bytes: u64,
        opts: &LvmOptions,
    ) -> HalResult<()> {
        self.check_injected("vgcreate")?;
        if opts.dry_run {
            log::info!("FAKE HAL DRY RUN: vgcreate {} {:?}", name, devices);
            return Ok(());
        }
        let mut extent_count = 0;
        {
            let state = self.lock();
            if state.vgs.contains_key(name) {
                return Err(failed(
                    "vgcreate",
                    5,
                    format!("A volume group called {name} already exists."),
                ));
            }
            for device in devices {
                match state.pvs.get(*device) {
                    Some(FakePv { vg: None, size_bytes }) => {
                        extent_count +=
                            size_bytes.saturating_sub(FAKE_PE_START) / extent_size_bytes.max(1);
                    }
                    Some(FakePv { vg: Some(vg), .. }) => {
                        return Err(failed(
                            "vgcreate",
                            5,
                            format!("Physical volume '{device}' is already in volume group '{vg}'"),
                        ))
                    }
                    None => {
                        return Err(failed(
                            "vgcreate",
                            5,
                            format!("No device found for {device}."),
                        ))
                    }
                }
            }
        }

        {
            let mut state = self.lock();
            for device in devices {
                if let Some(pv) = state.pvs.get_mut(*device) {
                    pv.vg = Some(name.to_string());
                }
            }
            state.vgs.insert(
                name.to_string(),
                FakeVg {
                    extent_size_bytes,
                    extent_count,
                    lvs: BTreeMap::new(),
                },
            );
        }
        self.record_operation(Operation::VgCreate {
            name: name.to_string(),
            devices: devices.iter().map(|d| d.to_string()).collect(),
            extent_size_bytes,
        });
        Ok(())
    }

    fn vg_remove(&self, name: &str, opts: &LvmOptions) -> HalResult<()> {
        self.check_injected("vgremove")?;
        if !self.lock().vgs.contains_key(name) {
            return Err(failed(
                "vgremove",
                5,
                format!("Volume group \"{name}\" not found"),
            ));
        }
        if opts.dry_run {
            log::info!("FAKE HAL DRY RUN: vgremove {}", name);
            return Ok(());
        }

        {
            let mut state = self.lock();
            if let Some(vg) = state.vgs.remove(name) {
                for lv in vg.lvs.keys() {
                    let path = PathBuf::from(format!("/dev/{name}/{lv}"));
                    state.signatures.remove(&path);
                }
            }
            for pv in state.pvs.values_mut() {
                if pv.vg.as_deref() == Some(name) {
                    pv.vg = None;
                }
            }
        }
        self.record_operation(Operation::VgRemove {
            name: name.to_string(),
        });
        Ok(())
    }

    fn vg_list(&self) -> HalResult<Vec<VgInfo>> {
        self.check_injected("vgs")?;
        Ok(self
            .lock()
            .vgs
            .iter()
            .map(|(name, vg)| VgInfo {
                name: name.clone(),
                extent_size_bytes: vg.extent_size_bytes,
                extent_count: vg.extent_count,
                free_extents: vg.free_extents(),
                lv_count: vg.lvs.len() as u64,
            })
            .collect())
    }

    fn lv_create(&self, vg: &str, lv: &str, extents: u64, opts: &LvmOptions) -> HalResult<()> {
        self.check_injected("lvcreate")?;
        if opts.dry_run {
            log::info!("FAKE HAL DRY RUN: lvcreate -l {} -n {} {}", extents, lv, vg);
            return Ok(());
        }
        {
            let state = self.lock();
            let Some(group) = state.vgs.get(vg) else {
                return Err(failed(
                    "lvcreate",
                    5,
                    format!("Volume group \"{vg}\" not found"),
                ));
            };
            if group.lvs.contains_key(lv) {
                return Err(failed(
                    "lvcreate",
                    5,
                    format!("Logical Volume \"{lv}\" already exists in volume group \"{vg}\""),
                ));
            }
            if extents > group.free_extents() {
                return Err(failed(
                    "lvcreate",
                    5,
                    format!(
                        "Volume group \"{vg}\" has insufficient free space ({} extents): {extents} required.",
                        group.free_extents()
                    ),
                ));
            }
        }

        if let Some(group) = self.lock().vgs.get_mut(vg) {
            group.lvs.insert(lv.to_string(), extents);
        }
        self.record_operation(Operation::LvCreate {
            vg: vg.to_string(),
            lv: lv.to_string(),
            extents,
        });
        Ok(())
    }

    fn lv_remove(&self, vg: &str, lv: &str, opts: &LvmOptions) -> HalResult<()> {
        self.check_injected("lvremove")?;
        let exists = self
            .lock()
            .vgs
            .get(vg)
            .is_some_and(|group| group.lvs.contains_key(lv));
        if !exists {
            return Err(failed(
                "lvremove",
                5,
                format!("Failed to find logical volume \"{vg}/{lv}\""),
            ));
        }
        if opts.dry_run {
            log::info!("FAKE HAL DRY RUN: lvremove {}/{}", vg, lv);
            return Ok(());
        }

        {
            let mut state = self.lock();
            if let Some(group) = state.vgs.get_mut(vg) {
                group.lvs.remove(lv);
            }
            let path = PathBuf::from(format!("/dev/{vg}/{lv}"));
            state.signatures.remove(&path);
        }
        self.record_operation(Operation::LvRemove {
            vg: vg.to_string(),
            lv: lv.to_string(),
        });
        Ok(())
    }

    fn lv_list(&self) -> HalResult<Vec<LvInfo>> {
        self.check_injected("lvs")?;
        let state = self.lock();
        let lvs = state
            .vgs
            .iter()
            .flat_map(|(vg_name, vg)| {
                vg.lvs.iter().map(move |(lv, extents)| LvInfo {
                    vg_name: vg_name.clone(),
                    name: lv.clone(),
                    path: PathBuf::from(format!("/dev/{vg_name}/{lv}")),
                    size_bytes: extents * vg.extent_size_bytes,
                })
            })
            .collect();
        Ok(lvs)
    }

    fn vg_mknodes(&self, vg: &str, opts: &LvmOptions) -> HalResult<()> {
        if opts.dry_run {
            return Ok(());
        }
        self.record_operation(Operation::VgMknodes { vg: vg.to_string() });
        Ok(())
    }
}

impl FormatOps for FakeHal {
    fn mkfs(&self, device: &Path, kind: FsKind, opts: &FormatOptions) -> HalResult<()> {
        if !opts.dry_run && !opts.confirmed {
            return Err(HalError::SafetyLock);
        }

        let spec = mkfs_command_spec(device, kind, opts);
        if opts.dry_run {
            log::info!("FAKE HAL DRY RUN: {}", spec);
            return Ok(());
        }

        self.check_injected(&spec.program)?;
        if !opts.force {
            if let Some(existing) = self.signature(device) {
                return Err(failed(
                    &spec.program,
                    1,
                    format!("{} contains a {existing} file system", device.display()),
                ));
            }
        }

        log::info!("FAKE HAL: {}", spec);
        self.lock()
            .signatures
            .insert(device.to_path_buf(), kind.as_str().to_string());
        self.record_operation(Operation::Mkfs {
            device: device.to_path_buf(),
            fs_type: kind.as_str().to_string(),
            force: opts.force,
        });
        Ok(())
    }
}

impl ProbeOps for FakeHal {
    fn blkid_type(&self, device: &Path) -> HalResult<Option<String>> {
        self.check_injected("blkid")?;
        Ok(self.signature(device))
    }
}

impl MountOps for FakeHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        _options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()> {
        if dry_run {
            log::info!(
                "FAKE HAL DRY RUN: mount {} -> {}",
                device.display(),
                target.display()
            );
            return Ok(());
        }

        {
            let state = self.lock();
            if !state.root {
                return Err(HalError::PermissionDenied);
            }
            if state.mounts.contains_key(target) {
                return Err(HalError::DiskBusy);
            }
            if fstype.is_some_and(|fs| state.unsupported_fs.contains(fs)) {
                return Err(HalError::NoDevice);
            }
            if !state.signatures.contains_key(device) {
                return Err(HalError::Nix(nix::errno::Errno::EINVAL));
            }
        }

        log::info!(
            "FAKE HAL: mount {} -> {} (type: {:?})",
            device.display(),
            target.display(),
            fstype
        );

        let fs_type = fstype
            .map(String::from)
            .or_else(|| self.signature(device))
            .unwrap_or_default();
        self.lock().mounts.insert(
            target.to_path_buf(),
            MountEntry {
                mount_point: target.to_path_buf(),
                fs_type,
                source: device.display().to_string(),
            },
        );
        self.record_operation(Operation::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.map(String::from),
        });

        Ok(())
    }

    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("FAKE HAL DRY RUN: unmount {}", target.display());
            return Ok(());
        }

        if self.lock().mounts.remove(target).is_none() {
            return Err(HalError::Nix(nix::errno::Errno::EINVAL));
        }
        log::info!("FAKE HAL: unmount {}", target.display());
        self.record_operation(Operation::Unmount {
            target: target.to_path_buf(),
        });

        Ok(())
    }

    fn mount_entry(&self, path: &Path) -> HalResult<Option<MountEntry>> {
        Ok(self.lock().mounts.get(path).cloned())
    }
}

impl SystemOps for FakeHal {
    fn udev_settle(&self) -> HalResult<()> {
        self.record_operation(Operation::UdevSettle);
        Ok(())
    }

    fn is_root(&self) -> bool {
        self.lock().root
    }

    fn command_exists(&self, program: &str) -> bool {
        !self.lock().missing_commands.contains(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn image(size: u64) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(size).unwrap();
        (dir, path)
    }

    #[test]
    fn fake_hal_hands_out_distinct_loop_devices() {
        let hal = FakeHal::new();
        let a = hal.losetup_attach(Path::new("/tmp/a.img"), false).unwrap();
        let b = hal.losetup_attach(Path::new("/tmp/b.img"), false).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            hal.losetup_associated(Path::new("/tmp/b.img")).unwrap(),
            vec![b]
        );
    }

    #[test]
    fn fake_hal_runs_out_of_loop_devices() {
        let hal = FakeHal::new();
        hal.set_loop_slots(1);
        hal.losetup_attach(Path::new("/tmp/a.img"), false).unwrap();
        let err = hal
            .losetup_attach(Path::new("/tmp/b.img"), false)
            .unwrap_err();
        assert!(err.stderr().unwrap().contains("unused loop device"));
    }

    #[test]
    fn fake_hal_tracks_extents() {
        let (_dir, path) = image(1024 * 1024 * 1024);
        let hal = FakeHal::new();
        let opts = LvmOptions::new(false);
        let dev = hal.losetup_attach(&path, false).unwrap();
        hal.pv_create(&dev, &opts).unwrap();
        hal.vg_create("vg", &[&dev], 4 * 1024 * 1024, &opts).unwrap();

        let vg = hal.vg_info("vg").unwrap().unwrap();
        assert_eq!(vg.extent_count, 255);

        hal.lv_create("vg", "lv", 125, &opts).unwrap();
        assert_eq!(hal.vg_info("vg").unwrap().unwrap().free_extents, 130);
        assert!(hal.lv_create("vg", "big", 131, &opts).is_err());
        assert_eq!(hal.vg_members("vg").unwrap(), vec![dev]);
    }

    #[test]
    fn fake_hal_dry_run_records_nothing() {
        let (_dir, path) = image(64 * 1024 * 1024);
        let hal = FakeHal::new();
        let dev = hal.losetup_attach(&path, true).unwrap();
        assert_eq!(dev, "/dev/loop0");
        assert_eq!(hal.operation_count(), 0);
        assert!(hal.loop_devices().is_empty());
    }

    #[test]
    fn fake_hal_records_mount() {
        let hal = FakeHal::new();
        let device = Path::new("/dev/vg/lv");
        let target = Path::new("/mnt/test");
        hal.seed_signature(device, "ext4");

        hal.mount_device(device, target, Some("ext4"), MountOptions::new(), false)
            .unwrap();

        assert_eq!(hal.operation_count(), 1);
        assert!(hal.has_operation(|op| matches!(op, Operation::Mount { .. })));
        assert!(hal.is_mounted(target).unwrap());

        let err = hal
            .mount_device(device, target, Some("ext4"), MountOptions::new(), false)
            .unwrap_err();
        assert!(matches!(err, HalError::DiskBusy));
    }

    #[test]
    fn fake_hal_requires_confirmation() {
        let hal = FakeHal::new();
        let opts = FormatOptions::new(false, false);

        let err = hal
            .mkfs(Path::new("/dev/vg/lv"), FsKind::Ext4, &opts)
            .unwrap_err();
        assert!(matches!(err, HalError::SafetyLock));
    }

    #[test]
    fn fake_hal_refuses_to_overwrite_without_force() {
        let hal = FakeHal::new();
        let device = Path::new("/dev/vg/lv");
        hal.seed_signature(device, "xfs");

        let opts = FormatOptions::new(false, true);
        assert!(hal.mkfs(device, FsKind::Ext4, &opts).is_err());

        hal.mkfs(device, FsKind::Ext4, &opts.with_force(true))
            .unwrap();
        assert_eq!(hal.signature(device).as_deref(), Some("ext4"));
    }
}
