//! HAL trait definitions and implementations.
//!
//! This module defines the core traits for system operations and provides
//! both real (LinuxHal) and fake (FakeHal) implementations.

pub mod fake_hal;
pub mod format_ops;
pub mod linux_hal;
pub mod loop_ops;
pub mod lvm_ops;
pub mod mount_ops;
pub mod probe_ops;
pub mod system_ops;

pub use fake_hal::{FakeHal, Operation};
pub use format_ops::{mkfs_command_spec, CommandSpec, FormatOps, FormatOptions, FsKind};
pub use linux_hal::LinuxHal;
pub use loop_ops::LoopOps;
pub use lvm_ops::{LvInfo, LvmOps, LvmOptions, PvInfo, VgInfo};
pub use mount_ops::{MountEntry, MountOps, MountOptions};
pub use probe_ops::ProbeOps;
pub use system_ops::SystemOps;

/// Complete HAL combining all system operation traits.
pub trait SystemHal:
    LoopOps + LvmOps + FormatOps + ProbeOps + MountOps + SystemOps + Send + Sync
{
}

/// Automatically implement SystemHal for any type implementing all required traits.
impl<T> SystemHal for T where
    T: LoopOps + LvmOps + FormatOps + ProbeOps + MountOps + SystemOps + Send + Sync
{
}
