use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::config::{Target, WorkloadConfig, PARAMS};
use crate::keys::key_for;
use crate::scheduler::RunSummary;
use crate::stats::{bucket_label, CollectorTotals, LatencyHistogram, Timings};
use crate::workload::RunCounters;

/// Width of the longest histogram bar.
pub const BAR_WIDTH: u64 = 50;

/// `cur-arpas: 0, cur-creates: 12, ...` in name order.
pub fn format_counters(cur: &RunCounters) -> String {
    cur.entries()
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn progress_line(prefix: &str, ops: u64, secs: f64) -> String {
    let rate = if secs > 0.0 { ops as f64 / secs } else { 0.0 };
    format!(
        "{}    ops: {:<10} secs: {:<15.6} ops/sec: {:.1}",
        prefix, ops, secs, rate
    )
}

/// One row per bucket: label, right-aligned count, and a bar scaled so the
/// fullest bucket gets `BAR_WIDTH` stars.
pub fn histogram_lines(histogram: &LatencyHistogram) -> Vec<String> {
    let max = histogram.buckets().map(|(_, n)| n).max().unwrap_or(0);
    histogram
        .buckets()
        .map(|(exp, count)| {
            let stars = if max == 0 {
                0
            } else {
                (BAR_WIDTH * count + max - 1) / max
            };
            format!(
                "  {:>12} : {:>8} {}",
                bucket_label(exp),
                count,
                "*".repeat(stars as usize)
            )
        })
        .collect()
}

pub fn timings_lines(timings: &Timings) -> Vec<String> {
    let mut lines = Vec::new();
    for (name, histogram) in timings.iter() {
        lines.push(format!("{}:", name));
        lines.extend(histogram_lines(histogram));
    }
    lines
}

/// Every parameter with its effective value and description.
pub fn settings_lines(config: &WorkloadConfig, counters: &RunCounters) -> Vec<String> {
    let mut values = BTreeMap::new();
    for source in [serde_json::to_value(config), serde_json::to_value(counters)] {
        if let Ok(Value::Object(map)) = source {
            values.extend(map);
        }
    }
    PARAMS
        .iter()
        .map(|(name, _, help)| {
            let value = values.get(*name).map(param_value).unwrap_or_default();
            format!("  {:<20} = {:<12} - {}", name, value, help)
        })
        .collect()
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Array(items) => items.iter().map(param_value).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

/// Commands that fetch the first `count` created items by hand.
pub fn replay_lines(config: &WorkloadConfig, target: &Target, count: i64) -> Vec<String> {
    (0..count)
        .map(|id| {
            format!(
                "    echo get {} | nc {} {}",
                key_for(id, &config.prefix),
                target.host,
                target.port
            )
        })
        .collect()
}

pub fn summary_lines(summary: &RunSummary, totals: Option<&CollectorTotals>) -> Vec<String> {
    let mut lines = vec![
        "=== RUN SUMMARY ===".to_string(),
        format!("Total Duration: {:?}", summary.elapsed),
        format!("Total Ops: {}", summary.counters.num_ops()),
        format!("Acknowledged Ops: {}", summary.ops),
        format!("Throughput: {:.2} ops/sec", summary.ops_per_sec()),
        format!("Error Responses: {}", summary.error_responses),
        format!("Counters: {}", format_counters(&summary.counters)),
    ];
    if let Some(totals) = totals {
        lines.push(format!(
            "Pipelined Batches: {} ({} ops), Timed Probes: {}",
            totals.batches, totals.batch_ops, totals.probes
        ));
    }
    for worker in summary.failed_workers() {
        if let Some(error) = &worker.error {
            lines.push(format!("Worker {} failed: {}", worker.worker_id, error));
        }
    }
    if !summary.timings.is_empty() {
        lines.push(String::new());
        lines.extend(timings_lines(&summary.timings));
    }
    lines
}

pub fn print_summary(summary: &RunSummary, totals: Option<&CollectorTotals>) {
    println!();
    for line in summary_lines(summary, totals) {
        println!("{}", line);
    }
}

#[derive(Debug, Serialize)]
pub struct WorkerFailure {
    pub worker_id: usize,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub target: Target,
    pub config: WorkloadConfig,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub total_duration: Duration,
    pub counters: RunCounters,
    pub acknowledged_ops: u64,
    pub error_responses: u64,
    pub ops_per_sec: f64,
    pub timings: BTreeMap<String, BTreeMap<String, u64>>,
    pub failed_workers: Vec<WorkerFailure>,
}

impl RunReport {
    pub fn new(target: &Target, config: &WorkloadConfig, summary: &RunSummary) -> Self {
        Self {
            target: target.clone(),
            config: config.clone(),
            start_time: summary.start_time,
            end_time: summary.end_time,
            total_duration: summary.elapsed,
            counters: summary.counters,
            acknowledged_ops: summary.ops,
            error_responses: summary.error_responses,
            ops_per_sec: summary.ops_per_sec(),
            timings: summary.timings.snapshot(),
            failed_workers: summary
                .failed_workers()
                .filter_map(|w| {
                    w.error.as_ref().map(|error| WorkerFailure {
                        worker_id: w.worker_id,
                        error: error.clone(),
                    })
                })
                .collect(),
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
