// src/size_parser.rs
//! Human-friendly size specs ("10MiB", "1.5GB", "4096") to byte counts.
//!
//! Decimal suffixes are powers of 10, binary suffixes powers of 2; both are
//! case-insensitive. A malformed spec is a hard error so a typo in a config
//! cannot silently benchmark the wrong object size.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer};

/// Parse a size spec into bytes.
///
/// Accepts raw byte counts ("1048576"), decimal suffixes (k/KB, m/MB, g/GB,
/// t/TB) and binary suffixes (Ki/KiB, Mi/MiB, Gi/GiB, Ti/TiB), with optional
/// fractional values ("1.5GiB").
pub fn parse_size_spec(spec: &str) -> Result<u64> {
    let spec = spec.trim();

    if let Ok(bytes) = spec.parse::<u64>() {
        return Ok(bytes);
    }

    let split = spec
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| anyhow!("invalid size spec: {:?}", spec))?;
    let (digits, suffix) = spec.split_at(split);

    let value: f64 = digits
        .parse()
        .map_err(|_| anyhow!("invalid number in size spec: {:?}", spec))?;
    if digits.is_empty() || value < 0.0 {
        return Err(anyhow!("invalid size spec: {:?}", spec));
    }

    let unit: u64 = match suffix.to_ascii_uppercase().as_str() {
        "K" | "KB" => 1_000,
        "M" | "MB" => 1_000_000,
        "G" | "GB" => 1_000_000_000,
        "T" | "TB" => 1_000_000_000_000,
        "KI" | "KIB" => 1 << 10,
        "MI" | "MIB" => 1 << 20,
        "GI" | "GIB" => 1 << 30,
        "TI" | "TIB" => 1 << 40,
        other => {
            return Err(anyhow!(
                "unknown size suffix {:?} (expected KB/MB/GB/TB or KiB/MiB/GiB/TiB)",
                other
            ))
        }
    };

    Ok((value * unit as f64).round() as u64)
}

/// Serde adapter: accept either a bare integer or a suffixed string.
pub fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Spec {
        Bytes(u64),
        Text(String),
    }

    match Spec::deserialize(deserializer)? {
        Spec::Bytes(n) => Ok(n),
        Spec::Text(s) => parse_size_spec(&s).map_err(serde::de::Error::custom),
    }
}

/// Serde adapter for optional size fields.
pub fn deserialize_opt_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Spec {
        Bytes(u64),
        Text(String),
    }

    match Option::<Spec>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Spec::Bytes(n)) => Ok(Some(n)),
        Some(Spec::Text(s)) => parse_size_spec(&s).map(Some).map_err(serde::de::Error::custom),
    }
}
