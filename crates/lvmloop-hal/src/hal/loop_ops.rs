//! Loop device operations (losetup).

use crate::HalResult;
use std::path::Path;

pub trait LoopOps {
    /// Bind `image` to the next free loop device, returning the loop path (e.g. `/dev/loop7`).
    ///
    /// The kernel picks the device (`losetup --find --show`); callers never name one. With
    /// `dry_run` nothing is bound and the device that would be used is returned.
    fn losetup_attach(&self, image: &Path, dry_run: bool) -> HalResult<String>;

    /// Detach a loop device.
    fn losetup_detach(&self, loop_device: &str, dry_run: bool) -> HalResult<()>;

    /// Loop devices currently backed by `image` (`losetup -j`).
    fn losetup_associated(&self, image: &Path) -> HalResult<Vec<String>>;
}
