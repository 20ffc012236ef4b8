// src/config.rs
//! Run configuration.
//!
//! Loaded from YAML for `run --config`, or assembled from CLI flags for the
//! `put`/`get` subcommands. Size fields accept "10MiB"-style specs; durations
//! accept humantime strings ("60s", "5m"). `validate()` rejects combinations
//! the engine cannot honor before any storage traffic happens.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::buffer::MemoryClass;
use crate::constants;
use crate::size_parser;

/// Workload driven during the run phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Put,
    Get,
}

/// Top-level configuration for one run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Which benchmark to run.
    pub workload: WorkloadKind,

    /// Storage URI to target, e.g. "mem://" or "file:///tmp/bench".
    pub target: String,

    /// Bucket operated on.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Wall time to run (e.g. "60s", "5m").
    #[serde(default = "default_duration", with = "humantime_serde")]
    pub duration: Duration,

    /// Number of concurrent workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Size of each object ("10MiB" style, or raw bytes).
    #[serde(
        default = "default_object_size",
        deserialize_with = "size_parser::deserialize_size"
    )]
    pub object_size: u64,

    /// Read corpus definition. Only consulted for GET runs.
    #[serde(default)]
    pub corpus: CorpusConfig,

    /// Byte-range read behavior for GET runs.
    #[serde(default)]
    pub range: RangeConfig,

    /// Memory class for transfer buffers.
    #[serde(default)]
    pub memory: MemoryClass,

    /// Optional issue-rate throttling.
    #[serde(default)]
    pub pacing: Option<PacingConfig>,
}

/// Where the read corpus comes from.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    /// Objects to synthesize, or at most this many to discover (0 = no cap
    /// when discovering).
    #[serde(default = "default_object_count")]
    pub objects: usize,

    /// Versions uploaded (or required) per logical object. More than 1
    /// turns on versioned listing and version-pinned reads.
    #[serde(default = "default_versions")]
    pub versions: usize,

    /// Use objects already in the bucket instead of synthesizing new ones.
    #[serde(default)]
    pub list_existing: bool,

    /// With list_existing, list without recursion.
    #[serde(default)]
    pub list_flat: bool,

    /// Key prefix to discover under.
    #[serde(default)]
    pub prefix: String,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            objects: default_object_count(),
            versions: default_versions(),
            list_existing: false,
            list_flat: false,
            prefix: String::new(),
        }
    }
}

/// Byte-range read selection for GET runs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    /// Read random byte ranges instead of whole objects.
    #[serde(default)]
    pub enabled: bool,

    /// Fixed range length; omit for randomized lengths.
    #[serde(default, deserialize_with = "size_parser::deserialize_opt_size")]
    pub size: Option<u64>,
}

/// Aggregate issue-rate target across the worker pool.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PacingConfig {
    /// Operations per second across all workers.
    pub iops: u64,

    /// Sample exponential inter-arrival times instead of a fixed cadence.
    #[serde(default)]
    pub poisson: bool,
}

fn default_bucket() -> String {
    "benchdata".to_string()
}

fn default_duration() -> Duration {
    constants::DEFAULT_DURATION
}

fn default_concurrency() -> usize {
    constants::DEFAULT_CONCURRENCY
}

fn default_object_size() -> u64 {
    constants::DEFAULT_OBJECT_SIZE
}

fn default_object_count() -> usize {
    constants::DEFAULT_OBJECT_COUNT
}

fn default_versions() -> usize {
    constants::DEFAULT_VERSIONS
}

impl RunConfig {
    /// Load a YAML config file.
    pub fn from_yaml_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: RunConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            bail!("bucket must not be empty");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        // Worker indices are u16; a larger pool would wrap object-name
        // prefixes and RNG seeds into collisions.
        if self.concurrency > u16::MAX as usize {
            bail!("concurrency must be at most {}", u16::MAX);
        }
        if self.object_size == 0 {
            bail!("object_size must be at least 1 byte");
        }
        if self.corpus.versions == 0 {
            bail!("corpus.versions must be at least 1");
        }
        if self.workload == WorkloadKind::Get && !self.corpus.list_existing && self.corpus.objects == 0
        {
            bail!("corpus.objects must be at least 1 when synthesizing a read corpus");
        }
        if let Some(len) = self.range.size {
            if len == 0 {
                bail!("range.size must be at least 1 byte");
            }
            if !self.corpus.list_existing && len > self.object_size {
                bail!(
                    "range.size ({} bytes) exceeds object_size ({} bytes)",
                    len,
                    self.object_size
                );
            }
        }
        if let Some(pacing) = &self.pacing {
            if pacing.iops == 0 {
                bail!("pacing.iops must be at least 1");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RunConfig {
        serde_yaml::from_str(
            r#"
workload: put
target: "mem://"
"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let cfg = base();
        assert_eq!(cfg.bucket, "benchdata");
        assert_eq!(cfg.duration, Duration::from_secs(60));
        assert_eq!(cfg.concurrency, 20);
        assert_eq!(cfg.object_size, 10 << 20);
        assert_eq!(cfg.corpus.objects, 2500);
        assert_eq!(cfg.corpus.versions, 1);
        assert!(cfg.pacing.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn full_yaml_round() {
        let cfg: RunConfig = serde_yaml::from_str(
            r#"
workload: get
target: "file:///tmp/bench"
bucket: mydata
duration: 2m
concurrency: 8
object_size: 4MiB
corpus:
  objects: 100
  versions: 2
  list_existing: true
  prefix: "ingest/"
range:
  enabled: true
  size: 64KiB
memory: host
pacing:
  iops: 500
  poisson: true
"#,
        )
        .unwrap();
        assert_eq!(cfg.workload, WorkloadKind::Get);
        assert_eq!(cfg.duration, Duration::from_secs(120));
        assert_eq!(cfg.object_size, 4 << 20);
        assert_eq!(cfg.corpus.versions, 2);
        assert!(cfg.corpus.list_existing);
        assert_eq!(cfg.range.size, Some(64 << 10));
        assert_eq!(cfg.memory, MemoryClass::Host);
        assert_eq!(cfg.pacing.unwrap().iops, 500);
        cfg.validate().unwrap();
    }

    #[test]
    fn validation_rejects_impossible_runs() {
        let mut cfg = base();
        cfg.concurrency = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.concurrency = u16::MAX as usize + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.object_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.workload = WorkloadKind::Get;
        cfg.corpus.objects = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.range.size = Some(cfg.object_size + 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn malformed_size_spec_fails_parsing() {
        let res: Result<RunConfig, _> = serde_yaml::from_str(
            r#"
workload: put
target: "mem://"
object_size: "10XB"
"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let res: Result<RunConfig, _> = serde_yaml::from_str(
            r#"
workload: put
target: "mem://"
object_siz: 1MiB
"#,
        );
        assert!(res.is_err());
    }
}
