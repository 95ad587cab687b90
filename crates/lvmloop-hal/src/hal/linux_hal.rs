//! Linux HAL implementation using real system calls.

use super::{
    mkfs_command_spec, FormatOps, FormatOptions, FsKind, LoopOps, LvInfo, LvmOps, LvmOptions,
    MountEntry, MountOps, MountOptions, ProbeOps, PvInfo, SystemOps, VgInfo,
};
use crate::procfs::mountinfo::{find_mount, parse_mountinfo};
use crate::{HalError, HalResult};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const UDEV_TIMEOUT: Duration = Duration::from_secs(60);
const FORMAT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const LOSETUP_TIMEOUT: Duration = Duration::from_secs(30);
const LVM_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Exit status `blkid -p` uses when no signature was found.
const BLKID_NOTHING_FOUND: i32 = 2;

const PVS_FIELDS: &str = "pv_name,vg_name,pv_size,pe_start";
const VGS_FIELDS: &str = "vg_name,vg_extent_size,vg_extent_count,vg_free_count,lv_count";
const LVS_FIELDS: &str = "vg_name,lv_name,lv_path,lv_size";

fn map_command_err(program: &str, err: std::io::Error) -> HalError {
    match err.kind() {
        std::io::ErrorKind::NotFound => HalError::CommandNotFound(program.to_string()),
        std::io::ErrorKind::PermissionDenied => HalError::PermissionDenied,
        _ => HalError::Io(err),
    }
}

fn output_failed(program: &str, output: &Output) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn output_with_timeout(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<Output> {
    // LVM prompts on stdin; a closed stdin makes every prompt answer "no".
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    log::debug!("exec: {:?}", cmd);
    let mut child = cmd.spawn().map_err(|e| map_command_err(program, e))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    // Drain pipes concurrently to avoid deadlocks on large output.
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout.take() {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr.take() {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let status = match child.wait_timeout(timeout).map_err(HalError::Io)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_handle.join();
            let _ = stderr_handle.join();
            return Err(HalError::CommandTimeout {
                program: program.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

/// Run `program args...`, returning stdout on success.
fn run_checked(program: &str, args: &[String], timeout: Duration) -> HalResult<String> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    let output = output_with_timeout(program, &mut cmd, timeout)?;
    if !output.status.success() {
        return Err(output_failed(program, &output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn report_args(fields: &str) -> Vec<String> {
    to_args(&[
        "--noheadings",
        "--units",
        "b",
        "--nosuffix",
        "--separator",
        "\t",
        "-o",
        fields,
    ])
}

fn map_nix_err(err: nix::errno::Errno) -> HalError {
    use nix::errno::Errno;
    match err {
        Errno::EBUSY => HalError::DiskBusy,
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied,
        Errno::ENODEV => HalError::NoDevice,
        other => HalError::Nix(other),
    }
}

fn parse_tabbed_line(line: &str) -> Vec<String> {
    line.split('\t')
        .map(|part| part.trim().to_string())
        .collect()
}

fn parse_u64(field: &str, value: &str) -> HalResult<u64> {
    value
        .parse()
        .map_err(|_| HalError::Parse(format!("invalid {field}: {value:?}")))
}

fn report_rows(output: &str, columns: usize) -> impl Iterator<Item = Vec<String>> + '_ {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_tabbed_line)
        .filter(move |cols| cols.len() >= columns)
}

fn parse_pvs(output: &str) -> HalResult<Vec<PvInfo>> {
    report_rows(output, 4)
        .map(|cols| {
            Ok(PvInfo {
                device: cols[0].clone(),
                vg_name: Some(cols[1].clone()).filter(|vg| !vg.is_empty()),
                size_bytes: parse_u64("pv_size", &cols[2])?,
                pe_start_bytes: parse_u64("pe_start", &cols[3])?,
            })
        })
        .collect()
}

fn parse_vgs(output: &str) -> HalResult<Vec<VgInfo>> {
    report_rows(output, 5)
        .map(|cols| {
            Ok(VgInfo {
                name: cols[0].clone(),
                extent_size_bytes: parse_u64("vg_extent_size", &cols[1])?,
                extent_count: parse_u64("vg_extent_count", &cols[2])?,
                free_extents: parse_u64("vg_free_count", &cols[3])?,
                lv_count: parse_u64("lv_count", &cols[4])?,
            })
        })
        .collect()
}

fn parse_lvs(output: &str) -> HalResult<Vec<LvInfo>> {
    report_rows(output, 4)
        .map(|cols| {
            Ok(LvInfo {
                vg_name: cols[0].clone(),
                name: cols[1].clone(),
                path: PathBuf::from(&cols[2]),
                size_bytes: parse_u64("lv_size", &cols[3])?,
            })
        })
        .collect()
}

fn parse_device_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

impl MountOps for LinuxHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()> {
        if dry_run {
            log::info!(
                "DRY RUN: mount {} -> {}",
                device.display(),
                target.display()
            );
            return Ok(());
        }

        let flags = nix::mount::MsFlags::empty();
        let data = options.options.as_deref();

        nix::mount::mount(Some(device), target, fstype, flags, data).map_err(map_nix_err)?;

        Ok(())
    }

    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("DRY RUN: unmount {}", target.display());
            return Ok(());
        }

        nix::mount::umount2(target, nix::mount::MntFlags::empty()).map_err(map_nix_err)?;

        Ok(())
    }

    fn mount_entry(&self, path: &Path) -> HalResult<Option<MountEntry>> {
        let content = fs::read_to_string("/proc/self/mountinfo")?;
        let entries = parse_mountinfo(&content);
        Ok(find_mount(path, &entries).cloned())
    }
}

impl FormatOps for LinuxHal {
    fn mkfs(&self, device: &Path, kind: FsKind, opts: &FormatOptions) -> HalResult<()> {
        let spec = mkfs_command_spec(device, kind, opts);
        if opts.dry_run {
            log::info!("DRY RUN: {}", spec);
            return Ok(());
        }

        if !opts.confirmed {
            return Err(HalError::SafetyLock);
        }

        run_checked(&spec.program, &spec.args, FORMAT_TIMEOUT)?;
        Ok(())
    }
}

impl ProbeOps for LinuxHal {
    fn blkid_type(&self, device: &Path) -> HalResult<Option<String>> {
        let mut cmd = Command::new("blkid");
        cmd.args(["-p", "-s", "TYPE", "-o", "value"]).arg(device);
        let output = output_with_timeout("blkid", &mut cmd, PROBE_TIMEOUT)?;

        if output.status.code() == Some(BLKID_NOTHING_FOUND) {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(output_failed("blkid", &output));
        }

        let fs_type = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Some(fs_type).filter(|t| !t.is_empty()))
    }
}

impl LoopOps for LinuxHal {
    fn losetup_attach(&self, image: &Path, dry_run: bool) -> HalResult<String> {
        let mut args = vec!["--find".to_string()];
        if dry_run {
            // `--find` alone only reports the next free device.
            let device = run_checked("losetup", &args, LOSETUP_TIMEOUT)?;
            let device = device.trim().to_string();
            log::info!("DRY RUN: losetup {} -> {}", image.display(), device);
            return Ok(device);
        }

        args.push("--show".to_string());
        args.push(image.display().to_string());
        let device = run_checked("losetup", &args, LOSETUP_TIMEOUT)?;
        Ok(device.trim().to_string())
    }

    fn losetup_detach(&self, loop_device: &str, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("DRY RUN: losetup -d {}", loop_device);
            return Ok(());
        }
        run_checked("losetup", &to_args(&["-d", loop_device]), LOSETUP_TIMEOUT)?;
        Ok(())
    }

    fn losetup_associated(&self, image: &Path) -> HalResult<Vec<String>> {
        let mut args = to_args(&["--list", "--noheadings", "--output", "NAME", "--associated"]);
        args.push(image.display().to_string());
        let stdout = run_checked("losetup", &args, LOSETUP_TIMEOUT)?;
        Ok(parse_device_lines(&stdout))
    }
}

impl LvmOps for LinuxHal {
    fn pv_create(&self, device: &str, opts: &LvmOptions) -> HalResult<()> {
        if opts.dry_run {
            log::info!("DRY RUN: pvcreate {}", device);
            return Ok(());
        }
        run_checked("pvcreate", &to_args(&[device]), LVM_TIMEOUT)?;
        Ok(())
    }

    fn pv_remove(&self, device: &str, opts: &LvmOptions) -> HalResult<()> {
        if opts.dry_run {
            log::info!("DRY RUN: pvremove {}", device);
            return Ok(());
        }
        run_checked("pvremove", &to_args(&["--yes", device]), LVM_TIMEOUT)?;
        Ok(())
    }

    fn pv_list(&self) -> HalResult<Vec<PvInfo>> {
        let stdout = run_checked("pvs", &report_args(PVS_FIELDS), LVM_TIMEOUT)?;
        parse_pvs(&stdout)
    }

    fn vg_create(
        &self,
        name: &str,
        devices: &[&str],
        extent_size_bytes: u64,
        opts: &LvmOptions,
    ) -> HalResult<()> {
        let mut args = vec![
            "--physicalextentsize".to_string(),
            format!("{}k", extent_size_bytes / 1024),
            name.to_string(),
        ];
        args.extend(devices.iter().map(|d| d.to_string()));
        if opts.dry_run {
            log::info!("DRY RUN: vgcreate {}", args.join(" "));
            return Ok(());
        }
        run_checked("vgcreate", &args, LVM_TIMEOUT)?;
        Ok(())
    }

    fn vg_remove(&self, name: &str, opts: &LvmOptions) -> HalResult<()> {
        if opts.dry_run {
            log::info!("DRY RUN: vgremove {}", name);
            return Ok(());
        }
        let mut args = to_args(&["--yes"]);
        if !opts.udev_sync {
            args.push("--noudevsync".to_string());
        }
        args.push(name.to_string());
        run_checked("vgremove", &args, LVM_TIMEOUT)?;
        Ok(())
    }

    fn vg_list(&self) -> HalResult<Vec<VgInfo>> {
        let stdout = run_checked("vgs", &report_args(VGS_FIELDS), LVM_TIMEOUT)?;
        parse_vgs(&stdout)
    }

    fn lv_create(&self, vg: &str, lv: &str, extents: u64, opts: &LvmOptions) -> HalResult<()> {
        let mut args = vec![
            "--yes".to_string(),
            "--extents".to_string(),
            extents.to_string(),
            "--name".to_string(),
            lv.to_string(),
        ];
        if !opts.udev_sync {
            args.push("--noudevsync".to_string());
        }
        args.push(vg.to_string());
        if opts.dry_run {
            log::info!("DRY RUN: lvcreate {}", args.join(" "));
            return Ok(());
        }
        run_checked("lvcreate", &args, LVM_TIMEOUT)?;
        Ok(())
    }

    fn lv_remove(&self, vg: &str, lv: &str, opts: &LvmOptions) -> HalResult<()> {
        if opts.dry_run {
            log::info!("DRY RUN: lvremove {}/{}", vg, lv);
            return Ok(());
        }
        let mut args = to_args(&["--yes"]);
        if !opts.udev_sync {
            args.push("--noudevsync".to_string());
        }
        args.push(format!("{vg}/{lv}"));
        run_checked("lvremove", &args, LVM_TIMEOUT)?;
        Ok(())
    }

    fn lv_list(&self) -> HalResult<Vec<LvInfo>> {
        let stdout = run_checked("lvs", &report_args(LVS_FIELDS), LVM_TIMEOUT)?;
        parse_lvs(&stdout)
    }

    fn vg_mknodes(&self, vg: &str, opts: &LvmOptions) -> HalResult<()> {
        if opts.dry_run {
            log::info!("DRY RUN: vgmknodes {}", vg);
            return Ok(());
        }
        run_checked("vgmknodes", &to_args(&[vg]), LVM_TIMEOUT)?;
        Ok(())
    }
}

impl SystemOps for LinuxHal {
    fn udev_settle(&self) -> HalResult<()> {
        run_checked("udevadm", &to_args(&["settle"]), UDEV_TIMEOUT)?;
        Ok(())
    }

    fn is_root(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn command_exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkfs_requires_confirmation() {
        let hal = LinuxHal::new();
        let opts = FormatOptions::new(false, false);
        let err = hal
            .mkfs(Path::new("/dev/null"), FsKind::Ext4, &opts)
            .unwrap_err();
        assert!(matches!(err, HalError::SafetyLock));
    }

    #[test]
    fn parse_pvs_reads_unassigned_and_assigned_pvs() {
        let out = "  /dev/loop0\t\t1073741824\t1048576\n  /dev/loop1\tvg_data\t536870912\t1048576\n";
        let pvs = parse_pvs(out).unwrap();
        assert_eq!(pvs.len(), 2);
        assert_eq!(pvs[0].device, "/dev/loop0");
        assert_eq!(pvs[0].vg_name, None);
        assert_eq!(pvs[0].size_bytes, 1_073_741_824);
        assert_eq!(pvs[1].vg_name.as_deref(), Some("vg_data"));
    }

    #[test]
    fn parse_vgs_reads_extent_accounting() {
        let out = "  vg_data\t4194304\t255\t130\t1\n";
        let vgs = parse_vgs(out).unwrap();
        assert_eq!(vgs[0].name, "vg_data");
        assert_eq!(vgs[0].extent_size_bytes, 4_194_304);
        assert_eq!(vgs[0].extent_count, 255);
        assert_eq!(vgs[0].free_extents, 130);
        assert_eq!(vgs[0].lv_count, 1);
        assert_eq!(vgs[0].free_bytes(), 130 * 4_194_304);
    }

    #[test]
    fn parse_lvs_reads_paths() {
        let out = "  vg_data\tlv_storage\t/dev/vg_data/lv_storage\t524288000\n\n";
        let lvs = parse_lvs(out).unwrap();
        assert_eq!(lvs.len(), 1);
        assert_eq!(lvs[0].path, PathBuf::from("/dev/vg_data/lv_storage"));
        assert_eq!(lvs[0].size_bytes, 524_288_000);
    }

    #[test]
    fn parse_reports_reject_garbage_numbers() {
        let err = parse_vgs("vg\tfour\t1\t1\t0\n").unwrap_err();
        assert!(matches!(err, HalError::Parse(_)));
    }

    #[test]
    fn short_rows_are_ignored() {
        assert!(parse_pvs("  WARNING: something\n").unwrap().is_empty());
    }

    #[test]
    fn device_lines_are_trimmed() {
        assert_eq!(
            parse_device_lines("/dev/loop3\n  /dev/loop4 \n\n"),
            vec!["/dev/loop3".to_string(), "/dev/loop4".to_string()]
        );
    }
}
