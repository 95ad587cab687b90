//! System-level operations (udev settle, privilege and tool discovery).

use crate::HalResult;

/// System operations trait.
pub trait SystemOps {
    /// Best-effort udev settle (wait for block device events to quiesce).
    fn udev_settle(&self) -> HalResult<()>;

    /// True when running with an effective uid of 0.
    fn is_root(&self) -> bool;

    /// True when `program` resolves on `PATH`.
    fn command_exists(&self, program: &str) -> bool;
}
