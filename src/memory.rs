//! Human-readable memory sizes for the per-worker memory ceiling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Memory size in bytes with parsing and formatting.
///
/// Serialized as a plain byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * MIB)
    }

    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * GIB)
    }

    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Whole mebibytes, rounded down.
    pub const fn as_mib(&self) -> u64 {
        self.0 / MIB
    }

    /// Whole gibibytes, rounded down.
    pub const fn as_gib(&self) -> u64 {
        self.0 / GIB
    }
}

/// Error parsing a memory size string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid memory size: {0}")]
pub struct MemorySizeError(String);

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Bytes per unit for a size suffix. No suffix means MiB.
fn unit_multiplier(suffix: &str) -> Option<u64> {
    let unit = suffix.to_ascii_lowercase();
    // "kib", "kb" and "k" are the same unit; a bare "b" is bytes.
    let unit = unit
        .strip_suffix("ib")
        .or_else(|| unit.strip_suffix('b').filter(|u| !u.is_empty()))
        .unwrap_or(&unit);
    match unit {
        "" => Some(MIB),
        "b" => Some(1),
        "k" => Some(KIB),
        "m" => Some(MIB),
        "g" => Some(GIB),
        "t" => Some(TIB),
        _ => None,
    }
}

impl FromStr for MemorySize {
    type Err = MemorySizeError;

    /// Parse sizes such as "2048", "512M", "2GiB", "1.5g" or "64 kb".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MemorySizeError("empty string".into()));
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        if number.is_empty() {
            return Err(MemorySizeError(format!("no numeric value in '{}'", s)));
        }

        let value: f64 = number
            .parse()
            .map_err(|_| MemorySizeError(format!("invalid number: '{}'", number)))?;
        let multiplier = unit_multiplier(suffix.trim())
            .ok_or_else(|| MemorySizeError(format!("unknown suffix: '{}'", suffix.trim())))?;

        Ok(MemorySize((value * multiplier as f64) as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            bytes if bytes >= GIB && bytes % GIB == 0 => write!(f, "{} GiB", bytes / GIB),
            bytes if bytes >= GIB => write!(f, "{:.1} GiB", bytes as f64 / GIB as f64),
            bytes if bytes >= MIB => write!(f, "{} MiB", bytes / MIB),
            bytes => write!(f, "{} bytes", bytes),
        }
    }
}
