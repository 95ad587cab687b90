//! Provisioning configuration.
//!
//! A config is assembled from an optional TOML file and command-line overrides, then resolved
//! into a validated [`ProvisionConfig`]. Every key may come from either source; flags win.

use crate::errors::{ProvisionError, Result};
use crate::size::{self, format_size, KIB, MIB};
use lvmloop_hal::FsKind;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_EXTENT_SIZE: u64 = 4 * MIB;
pub const DEFAULT_ATTACH_RETRIES: u32 = 3;

/// LVM rejects longer VG/LV names.
const MAX_NAME_LEN: usize = 127;

/// Config keys as written in a TOML file; every field is optional until resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub backing_file_path: Option<PathBuf>,
    #[serde(default, deserialize_with = "size::deserialize_opt")]
    pub size_bytes: Option<u64>,
    pub vg_name: Option<String>,
    pub lv_name: Option<String>,
    #[serde(default, deserialize_with = "size::deserialize_opt")]
    pub lv_size_bytes: Option<u64>,
    pub fs_type: Option<String>,
    pub mount_point: Option<PathBuf>,
    pub idempotent: Option<bool>,
    pub force: Option<bool>,
    pub namespace: Option<String>,
    #[serde(default, deserialize_with = "size::deserialize_opt")]
    pub extent_size_bytes: Option<u64>,
    pub mount_options: Option<String>,
    pub label: Option<String>,
    pub attach_retries: Option<u32>,
    pub udev_sync: Option<bool>,
}

impl PartialConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ProvisionError::InvalidConfig(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            ProvisionError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text).map_err(|err| match err {
            ProvisionError::InvalidConfig(msg) => {
                ProvisionError::InvalidConfig(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Layer `overrides` on top of `self`; set fields in `overrides` win.
    pub fn merge(self, overrides: PartialConfig) -> PartialConfig {
        PartialConfig {
            backing_file_path: overrides.backing_file_path.or(self.backing_file_path),
            size_bytes: overrides.size_bytes.or(self.size_bytes),
            vg_name: overrides.vg_name.or(self.vg_name),
            lv_name: overrides.lv_name.or(self.lv_name),
            lv_size_bytes: overrides.lv_size_bytes.or(self.lv_size_bytes),
            fs_type: overrides.fs_type.or(self.fs_type),
            mount_point: overrides.mount_point.or(self.mount_point),
            idempotent: overrides.idempotent.or(self.idempotent),
            force: overrides.force.or(self.force),
            namespace: overrides.namespace.or(self.namespace),
            extent_size_bytes: overrides.extent_size_bytes.or(self.extent_size_bytes),
            mount_options: overrides.mount_options.or(self.mount_options),
            label: overrides.label.or(self.label),
            attach_retries: overrides.attach_retries.or(self.attach_retries),
            udev_sync: overrides.udev_sync.or(self.udev_sync),
        }
    }

    /// Fill defaults, check required keys and validate the result.
    pub fn resolve(self) -> Result<ProvisionConfig> {
        let fs_type = required(self.fs_type, "fs_type")?;
        let fs_type = fs_type
            .parse::<FsKind>()
            .map_err(|e| ProvisionError::InvalidConfig(e.to_string()))?;

        let config = ProvisionConfig {
            backing_file_path: required(self.backing_file_path, "backing_file_path")?,
            size_bytes: required(self.size_bytes, "size_bytes")?,
            vg_name: required(self.vg_name, "vg_name")?,
            lv_name: required(self.lv_name, "lv_name")?,
            lv_size_bytes: required(self.lv_size_bytes, "lv_size_bytes")?,
            fs_type,
            mount_point: required(self.mount_point, "mount_point")?,
            idempotent: self.idempotent.unwrap_or(false),
            force: self.force.unwrap_or(false),
            namespace: self.namespace.filter(|ns| !ns.is_empty()),
            extent_size_bytes: self.extent_size_bytes.unwrap_or(DEFAULT_EXTENT_SIZE),
            mount_options: self.mount_options.filter(|opts| !opts.is_empty()),
            label: self.label.filter(|label| !label.is_empty()),
            attach_retries: self.attach_retries.unwrap_or(DEFAULT_ATTACH_RETRIES),
            udev_sync: self.udev_sync.unwrap_or(true),
        };
        config.validate()?;
        Ok(config)
    }
}

fn required<T>(value: Option<T>, key: &str) -> Result<T> {
    value.ok_or_else(|| ProvisionError::InvalidConfig(format!("missing required key `{key}`")))
}

/// A complete, validated provisioning request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    pub backing_file_path: PathBuf,
    pub size_bytes: u64,
    pub vg_name: String,
    pub lv_name: String,
    pub lv_size_bytes: u64,
    pub fs_type: FsKind,
    pub mount_point: PathBuf,
    /// Treat already-present pieces of the chain as success
    pub idempotent: bool,
    /// Allow replacing a different filesystem signature on the LV
    pub force: bool,
    /// Prefix for the system-global VG name
    pub namespace: Option<String>,
    pub extent_size_bytes: u64,
    pub mount_options: Option<String>,
    pub label: Option<String>,
    pub attach_retries: u32,
    /// Let LVM wait for udev; disable in containers without udevd
    pub udev_sync: bool,
}

impl ProvisionConfig {
    /// VG name as created on the system, including the namespace prefix.
    pub fn effective_vg_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}_{}", self.vg_name),
            None => self.vg_name.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backing_file_path.as_os_str().is_empty() {
            return invalid("backing_file_path must not be empty");
        }
        if self.size_bytes == 0 {
            return invalid("size_bytes must be greater than zero");
        }
        if self.lv_size_bytes == 0 {
            return invalid("lv_size_bytes must be greater than zero");
        }
        if self.extent_size_bytes < KIB || !self.extent_size_bytes.is_power_of_two() {
            return invalid(format!(
                "extent_size_bytes must be a power of two of at least 1KiB, got {}",
                format_size(self.extent_size_bytes)
            ));
        }
        if self.lv_size_bytes > self.size_bytes {
            log::warn!(
                "lv_size_bytes ({}) exceeds the backing file size ({}); provisioning will run out of space",
                format_size(self.lv_size_bytes),
                format_size(self.size_bytes)
            );
        }

        check_lvm_name("vg_name", &self.vg_name)?;
        check_lvm_name("lv_name", &self.lv_name)?;
        if let Some(ns) = &self.namespace {
            check_lvm_name("namespace", ns)?;
        }
        check_lvm_name("vg_name (with namespace)", &self.effective_vg_name())?;
        if self.lv_name.starts_with("snapshot") || self.lv_name.starts_with("pvmove") {
            return invalid(format!(
                "lv_name {:?} uses a prefix reserved by LVM",
                self.lv_name
            ));
        }

        if !self.mount_point.is_absolute() {
            return invalid(format!(
                "mount_point must be an absolute path, got {}",
                self.mount_point.display()
            ));
        }
        if self.mount_point == Path::new("/") {
            return invalid("mount_point must not be /");
        }
        if self
            .mount_options
            .as_deref()
            .is_some_and(|opts| opts.chars().any(char::is_whitespace))
        {
            return invalid("mount_options must be a comma-separated list without spaces");
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> Result<()> {
    Err(ProvisionError::InvalidConfig(msg.into()))
}

fn check_lvm_name(key: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return invalid(format!("{key} must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return invalid(format!("{key} is longer than {MAX_NAME_LEN} characters"));
    }
    if name == "." || name == ".." || name.starts_with('-') {
        return invalid(format!("{key} {name:?} is not a valid LVM name"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-')))
    {
        return invalid(format!(
            "{key} {name:?} contains {bad:?}; LVM names allow only a-z A-Z 0-9 + _ . -"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
backing_file_path = "/tmp/disk.img"
size_bytes = 1073741824
vg_name = "vg_data"
lv_name = "lv_storage"
lv_size_bytes = "500MiB"
fs_type = "ext4"
mount_point = "/mnt/lv_storage"
idempotent = true
"#;

    #[test]
    fn sample_config_resolves_with_defaults() {
        let config = PartialConfig::from_toml_str(SAMPLE)
            .unwrap()
            .resolve()
            .unwrap();
        assert_eq!(config.size_bytes, 1_073_741_824);
        assert_eq!(config.lv_size_bytes, 524_288_000);
        assert_eq!(config.fs_type, FsKind::Ext4);
        assert_eq!(config.extent_size_bytes, DEFAULT_EXTENT_SIZE);
        assert_eq!(config.attach_retries, DEFAULT_ATTACH_RETRIES);
        assert!(config.idempotent);
        assert!(!config.force);
        assert!(config.udev_sync);
        assert_eq!(config.effective_vg_name(), "vg_data");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = PartialConfig::from_toml_str("vg_nmae = \"x\"").unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidConfig(_)));
    }

    #[test]
    fn overrides_win_over_file_values() {
        let file = PartialConfig::from_toml_str(SAMPLE).unwrap();
        let flags = PartialConfig {
            lv_name: Some("lv_other".to_string()),
            namespace: Some("ci42".to_string()),
            udev_sync: Some(false),
            ..Default::default()
        };
        let config = file.merge(flags).resolve().unwrap();
        assert_eq!(config.lv_name, "lv_other");
        assert_eq!(config.vg_name, "vg_data");
        assert_eq!(config.effective_vg_name(), "ci42_vg_data");
        assert!(!config.udev_sync);
    }

    #[test]
    fn missing_keys_are_named() {
        let err = PartialConfig::default().resolve().unwrap_err();
        assert!(err.to_string().contains("fs_type"), "{err}");

        let partial = PartialConfig {
            fs_type: Some("xfs".to_string()),
            ..Default::default()
        };
        let err = partial.resolve().unwrap_err();
        assert!(err.to_string().contains("backing_file_path"), "{err}");
    }

    fn sample() -> ProvisionConfig {
        PartialConfig::from_toml_str(SAMPLE)
            .unwrap()
            .resolve()
            .unwrap()
    }

    #[test]
    fn rejects_illegal_names() {
        for bad in ["", "vg data", "-vg", "..", "vg/data", "vg\u{e9}"] {
            let mut config = sample();
            config.vg_name = bad.to_string();
            assert!(config.validate().is_err(), "accepted {bad:?}");
        }

        let mut config = sample();
        config.lv_name = "snapshot0".to_string();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.namespace = Some("a b".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_sizes_and_paths() {
        let mut config = sample();
        config.size_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.extent_size_bytes = 3 * MIB;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.extent_size_bytes = 512;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.mount_point = PathBuf::from("mnt/relative");
        assert!(config.validate().is_err());

        let mut config = sample();
        config.mount_point = PathBuf::from("/");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_filesystems() {
        let err = PartialConfig::from_toml_str(&SAMPLE.replace("ext4", "zfs"))
            .unwrap()
            .resolve()
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn shipped_example_config_resolves() {
        let config = PartialConfig::from_toml_str(include_str!("../lvmloop.example.toml"))
            .unwrap()
            .resolve()
            .unwrap();
        assert_eq!(config.size_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.effective_vg_name(), "vg_data");
        assert!(config.udev_sync);
    }
}
