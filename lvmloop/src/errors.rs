use lvmloop_hal::HalError;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// The step of the chain an error or report line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Preflight,
    Allocate,
    PhysicalVolume,
    VolumeGroup,
    LogicalVolume,
    Format,
    Mount,
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preflight => "preflight",
            Stage::Allocate => "allocate",
            Stage::PhysicalVolume => "physical-volume",
            Stage::VolumeGroup => "volume-group",
            Stage::LogicalVolume => "logical-volume",
            Stage::Format => "format",
            Stage::Mount => "mount",
            Stage::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// Coarse error classes; each maps to a distinct process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidConfig,
    ResourceUnavailable,
    AlreadyExists,
    PermissionDenied,
    ExternalToolFailure,
}

impl ErrorCategory {
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorCategory::InvalidConfig => 2,
            ErrorCategory::ResourceUnavailable => 3,
            ErrorCategory::AlreadyExists => 4,
            ErrorCategory::PermissionDenied => 5,
            ErrorCategory::ExternalToolFailure => 6,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("required tool not found on PATH: {program}")]
    ToolMissing { program: String },

    #[error("{lv}: size {size_bytes} is not a multiple of the {extent_size_bytes}-byte extent size")]
    UnalignedSize {
        lv: String,
        size_bytes: u64,
        extent_size_bytes: u64,
    },

    #[error("{}: existing file is {actual} bytes, expected {expected}", .path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error(
        "{}: no free loop device available (detach stale bindings or add loop devices)",
        .path.display()
    )]
    NoLoopDevicesAvailable { path: PathBuf },

    #[error("{resource}: permission denied")]
    PermissionDenied { stage: Stage, resource: String },

    #[error(
        "{device}: already initialized as a physical volume{}",
        .vg.as_ref().map(|vg| format!(" of volume group {vg}")).unwrap_or_default()
    )]
    AlreadyInitialized { device: String, vg: Option<String> },

    #[error("volume group {vg} already exists on other devices (VG names are system-wide)")]
    NameConflict { vg: String },

    #[error("{resource}: {detail}")]
    AlreadyExists {
        stage: Stage,
        resource: String,
        detail: String,
    },

    #[error("{resource}: insufficient space: requested {requested_bytes} bytes, {available_bytes} available")]
    InsufficientSpace {
        resource: String,
        requested_bytes: u64,
        available_bytes: u64,
    },

    #[error("{resource}: busy: {detail}")]
    DeviceBusy {
        stage: Stage,
        resource: String,
        detail: String,
    },

    #[error("{}: {program} failed (exit={code:?}): {stderr}", .device.display())]
    FormatFailed {
        device: PathBuf,
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{} on {}: mount failed: {reason}", .device.display(), .target.display())]
    MountFailed {
        device: PathBuf,
        target: PathBuf,
        reason: String,
    },

    #[error("{resource}: {source}")]
    Io {
        stage: Stage,
        resource: String,
        source: std::io::Error,
    },

    #[error("{resource}: {source}")]
    ExternalTool {
        stage: Stage,
        resource: String,
        source: HalError,
    },
}

fn stderr_says_permission_denied(err: &HalError) -> bool {
    err.stderr().is_some_and(|stderr| {
        stderr.contains("Permission denied") || stderr.contains("Operation not permitted")
    })
}

impl ProvisionError {
    /// Wrap a HAL failure, promoting privilege failures to [`ProvisionError::PermissionDenied`].
    pub fn tool(stage: Stage, resource: impl fmt::Display, err: HalError) -> Self {
        let resource = resource.to_string();
        if matches!(err, HalError::PermissionDenied) || stderr_says_permission_denied(&err) {
            return ProvisionError::PermissionDenied { stage, resource };
        }
        ProvisionError::ExternalTool {
            stage,
            resource,
            source: err,
        }
    }

    /// Wrap a local I/O failure on `resource`.
    pub fn io(stage: Stage, resource: impl fmt::Display, err: std::io::Error) -> Self {
        let resource = resource.to_string();
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            return ProvisionError::PermissionDenied { stage, resource };
        }
        ProvisionError::Io {
            stage,
            resource,
            source: err,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            ProvisionError::InvalidConfig(_) | ProvisionError::ToolMissing { .. } => {
                Stage::Preflight
            }
            ProvisionError::SizeMismatch { .. } | ProvisionError::NoLoopDevicesAvailable { .. } => {
                Stage::Allocate
            }
            ProvisionError::AlreadyInitialized { .. } => Stage::PhysicalVolume,
            ProvisionError::NameConflict { .. } => Stage::VolumeGroup,
            ProvisionError::UnalignedSize { .. } | ProvisionError::InsufficientSpace { .. } => {
                Stage::LogicalVolume
            }
            ProvisionError::FormatFailed { .. } => Stage::Format,
            ProvisionError::MountFailed { .. } => Stage::Mount,
            ProvisionError::PermissionDenied { stage, .. }
            | ProvisionError::AlreadyExists { stage, .. }
            | ProvisionError::DeviceBusy { stage, .. }
            | ProvisionError::Io { stage, .. }
            | ProvisionError::ExternalTool { stage, .. } => *stage,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ProvisionError::InvalidConfig(_) | ProvisionError::UnalignedSize { .. } => {
                ErrorCategory::InvalidConfig
            }
            ProvisionError::NoLoopDevicesAvailable { .. }
            | ProvisionError::InsufficientSpace { .. }
            | ProvisionError::DeviceBusy { .. } => ErrorCategory::ResourceUnavailable,
            ProvisionError::SizeMismatch { .. }
            | ProvisionError::AlreadyInitialized { .. }
            | ProvisionError::NameConflict { .. }
            | ProvisionError::AlreadyExists { .. } => ErrorCategory::AlreadyExists,
            ProvisionError::PermissionDenied { .. } => ErrorCategory::PermissionDenied,
            ProvisionError::ToolMissing { .. }
            | ProvisionError::FormatFailed { .. }
            | ProvisionError::MountFailed { .. }
            | ProvisionError::Io { .. }
            | ProvisionError::ExternalTool { .. } => ErrorCategory::ExternalToolFailure,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.category().exit_code()
    }
}
