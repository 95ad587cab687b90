//! Device probing operations (blkid).

use crate::HalResult;
use std::path::Path;

/// Probing operations trait.
pub trait ProbeOps {
    /// Return the filesystem signature type on `device` (e.g. `"ext4"`), or `None` when the
    /// device carries no recognizable signature.
    fn blkid_type(&self, device: &Path) -> HalResult<Option<String>>;
}
