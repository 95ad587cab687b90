//! Parsing helpers for `/proc/self/mountinfo` (and similar mountinfo files).

use std::path::{Path, PathBuf};

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            // mountinfo format:
            //   <id> <parent> <maj:min> <root> <mount point> <opts...> - <fstype> <source> <superopts>
            let (pre, post) = line.split_once(" - ")?;
            let pre_fields: Vec<&str> = pre.split_whitespace().collect();
            if pre_fields.len() < 5 {
                return None;
            }
            let mut post_fields = post.split_whitespace();
            let fs_type = post_fields.next()?.to_string();
            let source = unescape_mount_path(post_fields.next().unwrap_or("none"));
            Some(MountEntry {
                mount_point: PathBuf::from(unescape_mount_path(pre_fields[4])),
                fs_type,
                source,
            })
        })
        .collect()
}

/// The last entry mounted at exactly `path`; later lines shadow earlier ones.
pub fn find_mount<'a>(path: &Path, entries: &'a [MountEntry]) -> Option<&'a MountEntry> {
    let target = normalize_path(path);
    entries
        .iter()
        .rev()
        .find(|entry| normalize_path(&entry.mount_point) == target)
}

pub fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

fn normalize_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.len() > 1 && s.ends_with('/') {
        s.trim_end_matches('/').to_string()
    } else {
        s.to_string()
    }
}
