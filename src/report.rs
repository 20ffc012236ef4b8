// src/report.rs
//! End-of-run summaries built from the drained operation records.

use std::time::{Duration, Instant};

use hdrhistogram::Histogram;

use crate::collector::{OpKind, Operations};
use crate::constants::{format_bytes_binary, MIB};

// One hour in microseconds, same ceiling for latency and first-byte.
const HIST_HIGH_MICROS: u64 = 3_600_000_000;
const HIST_SIGFIGS: u8 = 3;

fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, HIST_HIGH_MICROS, HIST_SIGFIGS)
        .expect("failed to allocate histogram")
}

/// Aggregates for one operation kind.
///
/// Error records count toward `count` and `errors` but contribute nothing
/// to bytes or the latency distributions. The wall-clock window spans the
/// first start to the last completion of the kind, so throughput reflects
/// the whole measured period rather than per-operation sums.
pub struct KindSummary {
    pub kind: OpKind,
    pub count: u64,
    pub errors: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    latency: Histogram<u64>,
    ttfb: Histogram<u64>,
}

impl KindSummary {
    fn build(kind: OpKind, operations: &Operations) -> Option<Self> {
        let mut latency = new_histogram();
        let mut ttfb = new_histogram();
        let mut count = 0u64;
        let mut errors = 0u64;
        let mut bytes = 0u64;
        let mut window: Option<(Instant, Instant)> = None;

        for op in operations.of_kind(kind) {
            count += 1;
            window = Some(match window {
                None => (op.start, op.end),
                Some((s, e)) => (s.min(op.start), e.max(op.end)),
            });
            if !op.is_ok() {
                errors += 1;
                continue;
            }
            bytes += op.size;
            let _ = latency.record(op.duration().as_micros() as u64);
            if let Some(t) = op.ttfb() {
                let _ = ttfb.record(t.as_micros() as u64);
            }
        }

        if count == 0 {
            return None;
        }
        let elapsed = window
            .map(|(s, e)| e.saturating_duration_since(s))
            .unwrap_or_default();
        Some(Self {
            kind,
            count,
            errors,
            bytes,
            elapsed,
            latency,
            ttfb,
        })
    }

    pub fn ok(&self) -> u64 {
        self.count - self.errors
    }

    pub fn ops_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.ok() as f64 / secs
        } else {
            0.0
        }
    }

    pub fn throughput_mib(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / MIB as f64 / secs
        } else {
            0.0
        }
    }

    pub fn print(&self) {
        println!(
            "\n{}: {} ops ({} errors), {} in {:.1}s",
            self.kind,
            self.count,
            self.errors,
            format_bytes_binary(self.bytes),
            self.elapsed.as_secs_f64()
        );
        println!(
            "  throughput: {:.2} MiB/s, {:.1} ops/s",
            self.throughput_mib(),
            self.ops_per_sec()
        );
        if !self.latency.is_empty() {
            print_histogram("latency", &self.latency);
        }
        if !self.ttfb.is_empty() {
            print_histogram("ttfb   ", &self.ttfb);
        }
    }
}

fn print_histogram(label: &str, hist: &Histogram<u64>) {
    println!(
        "  {} (µs): mean={:<8.0} p50={:<8} p95={:<8} p99={:<8} max={:<8}",
        label,
        hist.mean(),
        hist.value_at_quantile(0.50),
        hist.value_at_quantile(0.95),
        hist.value_at_quantile(0.99),
        hist.max()
    );
}

/// Per-kind summaries for a completed run, in PUT then GET order.
pub struct RunReport {
    summaries: Vec<KindSummary>,
}

impl RunReport {
    pub fn new(operations: &Operations) -> Self {
        let mut summaries = Vec::new();
        for kind in [OpKind::Put, OpKind::Get] {
            if let Some(summary) = KindSummary::build(kind, operations) {
                summaries.push(summary);
            }
        }
        Self { summaries }
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    pub fn summaries(&self) -> &[KindSummary] {
        &self.summaries
    }

    pub fn print(&self) {
        if self.is_empty() {
            println!("no operations recorded");
            return;
        }
        for summary in &self.summaries {
            summary.print();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Operation;
    use std::time::SystemTime;

    fn op(
        base: Instant,
        kind: OpKind,
        offset_ms: u64,
        dur_ms: u64,
        size: u64,
        error: Option<&str>,
    ) -> Operation {
        let start = base + Duration::from_millis(offset_ms);
        let end = start + Duration::from_millis(dur_ms);
        Operation {
            kind,
            worker: 0,
            object: "obj".to_string(),
            requested: size,
            size: if error.is_some() { 0 } else { size },
            started_at: SystemTime::now(),
            start,
            end,
            first_byte: Some(start),
            error: error.map(String::from),
            endpoint: "mem://".to_string(),
        }
    }

    #[test]
    fn errors_count_but_add_no_bytes() {
        let base = Instant::now();
        let ops: Operations = vec![
            op(base, OpKind::Put, 0, 10, 100, None),
            op(base, OpKind::Put, 10, 10, 100, None),
            op(base, OpKind::Put, 20, 10, 100, Some("boom")),
        ]
        .into();
        let report = RunReport::new(&ops);
        let put = &report.summaries()[0];
        assert_eq!(put.kind, OpKind::Put);
        assert_eq!(put.count, 3);
        assert_eq!(put.errors, 1);
        assert_eq!(put.ok(), 2);
        assert_eq!(put.bytes, 200);
    }

    #[test]
    fn window_spans_first_start_to_last_end() {
        let base = Instant::now();
        let ops: Operations = vec![
            op(base, OpKind::Get, 0, 10, 1, None),
            op(base, OpKind::Get, 20, 10, 1, None),
        ]
        .into();
        let report = RunReport::new(&ops);
        let get = &report.summaries()[0];
        assert_eq!(get.elapsed, Duration::from_millis(30));
        assert!(get.ops_per_sec() > 0.0);
    }

    #[test]
    fn kinds_without_records_are_omitted() {
        let base = Instant::now();
        let ops: Operations = vec![op(base, OpKind::Put, 0, 5, 10, None)].into();
        let report = RunReport::new(&ops);
        assert_eq!(report.summaries().len(), 1);
        assert_eq!(report.summaries()[0].kind, OpKind::Put);

        let empty = RunReport::new(&Operations::default());
        assert!(empty.is_empty());
    }
}
