use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use crate::workload::OpKind;

/// Smallest bucket exponent; zero or sub-nanosecond samples land here.
pub const MIN_EXPONENT: i32 = -9;

/// Counts of latency samples keyed by `floor(log10(seconds))`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencyHistogram {
    buckets: BTreeMap<i32, u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, delta: Duration) {
        *self.buckets.entry(bucket_exponent(delta)).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &LatencyHistogram) {
        for (exp, count) in &other.buckets {
            *self.buckets.entry(*exp).or_insert(0) += count;
        }
    }

    pub fn total(&self) -> u64 {
        self.buckets.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn count(&self, exponent: i32) -> u64 {
        self.buckets.get(&exponent).copied().unwrap_or(0)
    }

    /// `(exponent, count)` pairs from fastest to slowest bucket.
    pub fn buckets(&self) -> impl Iterator<Item = (i32, u64)> + '_ {
        self.buckets.iter().map(|(exp, count)| (*exp, *count))
    }
}

pub fn bucket_exponent(delta: Duration) -> i32 {
    let secs = delta.as_secs_f64();
    if secs <= 0.0 {
        return MIN_EXPONENT;
    }
    (secs.log10().floor() as i32).max(MIN_EXPONENT)
}

/// Decimal label for a bucket without float noise: `0.001`, `1`, `100`.
pub fn bucket_label(exponent: i32) -> String {
    if exponent >= 0 {
        format!("1{}", "0".repeat(exponent as usize))
    } else {
        format!("0.{}1", "0".repeat((-exponent - 1) as usize))
    }
}

/// Per-command latency histograms, keyed `latency-<cmd>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timings {
    histograms: BTreeMap<String, LatencyHistogram>,
}

impl Timings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_timing_sample(&mut self, cmd: &str, delta: Duration) {
        self.histograms
            .entry(format!("latency-{}", cmd))
            .or_default()
            .record(delta);
    }

    pub fn merge(&mut self, other: &Timings) {
        for (name, histogram) in &other.histograms {
            self.histograms.entry(name.clone()).or_default().merge(histogram);
        }
    }

    pub fn get(&self, cmd: &str) -> Option<&LatencyHistogram> {
        self.histograms.get(&format!("latency-{}", cmd))
    }

    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LatencyHistogram)> {
        self.histograms.iter().map(|(name, h)| (name.as_str(), h))
    }

    /// `{ "latency-get": { "0.001": 12, ... }, ... }` for reports.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        self.histograms
            .iter()
            .map(|(name, h)| {
                let buckets = h.buckets().map(|(exp, n)| (bucket_label(exp), n)).collect();
                (name.clone(), buckets)
            })
            .collect()
    }
}

/// Per-kind subtotals of a batch plus its wall-clock span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub arpas: u64,
    pub start: SystemTime,
    pub end: SystemTime,
}

impl BatchStats {
    pub fn new(start: SystemTime) -> Self {
        Self {
            gets: 0,
            sets: 0,
            deletes: 0,
            arpas: 0,
            start,
            end: start,
        }
    }

    pub fn add(&mut self, kind: OpKind) {
        match kind {
            OpKind::Get => self.gets += 1,
            OpKind::Set => self.sets += 1,
            OpKind::Delete => self.deletes += 1,
            OpKind::Arpa(_) => self.arpas += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.gets + self.sets + self.deletes + self.arpas
    }
}

/// Receives batch-level statistics from protocol clients.
pub trait StatsSink: Send + Sync {
    /// A pipelined batch has been fully acknowledged.
    fn ops_stats(&self, batch: &BatchStats);
    /// A single operation was timed end to end.
    fn latency_stats(&self, probe: &BatchStats);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorTotals {
    pub batches: u64,
    pub batch_ops: u64,
    pub probes: u64,
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub arpas: u64,
    pub first_start: Option<SystemTime>,
    pub last_end: Option<SystemTime>,
}

impl CollectorTotals {
    fn absorb(&mut self, stats: &BatchStats) {
        self.gets += stats.gets;
        self.sets += stats.sets;
        self.deletes += stats.deletes;
        self.arpas += stats.arpas;
        self.first_start = Some(match self.first_start {
            Some(t) if t <= stats.start => t,
            _ => stats.start,
        });
        self.last_end = Some(match self.last_end {
            Some(t) if t >= stats.end => t,
            _ => stats.end,
        });
    }

    pub fn total_ops(&self) -> u64 {
        self.gets + self.sets + self.deletes + self.arpas
    }
}

/// Thread-safe sink shared by every worker of a run.
#[derive(Debug, Default)]
pub struct StatsCollector {
    totals: Mutex<CollectorTotals>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> CollectorTotals {
        *self.totals.lock()
    }
}

impl StatsSink for StatsCollector {
    fn ops_stats(&self, batch: &BatchStats) {
        let mut totals = self.totals.lock();
        totals.batches += 1;
        totals.batch_ops += batch.total();
        totals.absorb(batch);
    }

    fn latency_stats(&self, probe: &BatchStats) {
        let mut totals = self.totals.lock();
        totals.probes += 1;
        totals.absorb(probe);
    }
}
