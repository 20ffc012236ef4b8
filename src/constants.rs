// src/constants.rs
//
// Default values shared by the config layer and the CLI so both surfaces
// stay in agreement.

use std::time::Duration;

/// Wall time to run when no duration is given.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(60);

/// Concurrent workers when unspecified.
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Object size when unspecified. Binary units, like the size specs.
pub const DEFAULT_OBJECT_SIZE: u64 = 10 << 20;

/// Objects synthesized for (or discovered into) a read corpus.
pub const DEFAULT_OBJECT_COUNT: usize = 2500;

/// Versions retained per logical object.
pub const DEFAULT_VERSIONS: usize = 1;

// Size units for human-readable display.

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Convert bytes to a human-readable string in binary units.
pub fn format_bytes_binary(bytes: u64) -> String {
    if bytes >= TIB {
        format!("{:.2} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}
