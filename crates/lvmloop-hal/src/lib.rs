//! lvmloop Hardware Abstraction Layer (HAL).
//!
//! Everything that touches the host (loop devices, LVM metadata, mkfs, mounts) goes through the
//! traits in [`hal`] so provisioning workflows can run against [`FakeHal`] without root.

pub mod error;
pub mod hal;
pub mod procfs;

pub use error::{HalError, HalResult};
pub use hal::*;
