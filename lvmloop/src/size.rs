//! Byte-size parsing and extent arithmetic.
//!
//! Sizes are accepted either as plain byte counts or with a unit suffix. Single-letter and
//! `*iB` suffixes are binary (`10G` == `10GiB`, as `truncate(1)` reads them); `*B` suffixes
//! are decimal (`10GB` == 10 * 1000^3).

use serde::{de, Deserialize, Deserializer};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

const SUFFIXES: &[(&str, u64)] = &[
    ("", 1),
    ("b", 1),
    ("k", KIB),
    ("kib", KIB),
    ("kb", 1000),
    ("m", MIB),
    ("mib", MIB),
    ("mb", 1000 * 1000),
    ("g", GIB),
    ("gib", GIB),
    ("gb", 1000 * 1000 * 1000),
    ("t", TIB),
    ("tib", TIB),
    ("tb", 1000 * 1000 * 1000 * 1000),
];

/// Parse `"524288000"`, `"500MiB"`, `"1 GiB"` or `"10G"` into bytes.
pub fn parse_size(input: &str) -> Result<u64, String> {
    let text = input.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, suffix) = text.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid size {input:?}: expected a number of bytes"));
    }
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid size {input:?}: {e}"))?;

    let suffix = suffix.trim().to_ascii_lowercase();
    let multiplier = SUFFIXES
        .iter()
        .find(|(name, _)| *name == suffix)
        .map(|(_, mult)| *mult)
        .ok_or_else(|| format!("invalid size {input:?}: unknown unit {suffix:?}"))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("invalid size {input:?}: too large"))
}

/// Render a byte count using the largest binary unit that divides it exactly.
pub fn format_size(bytes: u64) -> String {
    for (unit, mult) in [("TiB", TIB), ("GiB", GIB), ("MiB", MIB), ("KiB", KIB)] {
        if bytes >= mult && bytes % mult == 0 {
            return format!("{}{unit}", bytes / mult);
        }
    }
    format!("{bytes}B")
}

/// Round `value` up to the next multiple of `unit`. `None` on overflow or a zero unit.
pub fn align_up(value: u64, unit: u64) -> Option<u64> {
    if unit == 0 {
        return None;
    }
    match value % unit {
        0 => Some(value),
        rem => value.checked_add(unit - rem),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Bytes(u64),
    Text(String),
}

/// serde helper for optional size fields that may be integers or suffixed strings.
pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawSize>::deserialize(deserializer)?;
    raw.map(|raw| match raw {
        RawSize::Bytes(bytes) => Ok(bytes),
        RawSize::Text(text) => parse_size(&text).map_err(de::Error::custom),
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_byte_counts() {
        assert_eq!(parse_size("524288000").unwrap(), 524_288_000);
        assert_eq!(parse_size(" 4096 ").unwrap(), 4096);
    }

    #[test]
    fn binary_and_decimal_suffixes() {
        assert_eq!(parse_size("1GiB").unwrap(), GIB);
        assert_eq!(parse_size("500MiB").unwrap(), 500 * MIB);
        assert_eq!(parse_size("10G").unwrap(), 10 * GIB);
        assert_eq!(parse_size("4 mib").unwrap(), 4 * MIB);
        assert_eq!(parse_size("2GB").unwrap(), 2_000_000_000);
        assert_eq!(parse_size("512b").unwrap(), 512);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("GiB").is_err());
        assert!(parse_size("12 parsecs").is_err());
        assert!(parse_size("1.5GiB").is_err());
        assert!(parse_size("99999999999999TiB").is_err());
    }

    #[test]
    fn formats_exact_units() {
        assert_eq!(format_size(500 * MIB), "500MiB");
        assert_eq!(format_size(GIB), "1GiB");
        assert_eq!(format_size(1536 * MIB), "1536MiB");
        assert_eq!(format_size(1000), "1000B");
        assert_eq!(format_size(0), "0B");
    }

    #[test]
    fn aligns_up_to_extents() {
        assert_eq!(align_up(524_288_000, 4 * MIB), Some(524_288_000));
        assert_eq!(align_up(500_000_000, 4 * MIB), Some(121 * 4 * MIB));
        assert_eq!(align_up(1, 4 * MIB), Some(4 * MIB));
        assert_eq!(align_up(10, 0), None);
        assert_eq!(align_up(u64::MAX, 4 * MIB), None);
    }
}
