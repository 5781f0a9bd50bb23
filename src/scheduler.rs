//! Runs the workers that share one set of counters.
//!
//! Each worker owns its own store. The stop check and the decision happen
//! under one lock on the shared counters, so a `max-ops` ceiling is never
//! overshot no matter how many workers race for the last operations. Key
//! and document building happen outside the lock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, error, info, warn};

use crate::clients::{Store, StoreFactory};
use crate::config::WorkloadConfig;
use crate::error::SodaResult;
use crate::report;
use crate::stats::Timings;
use crate::workload::{Decision, RunCounters, WorkloadModel};

/// Progress is logged every this many operations per worker.
pub const REPORT_EVERY: u64 = 20_000;

/// Cooperative stop flag shared by workers, the timer and signal handlers.
#[derive(Debug, Clone)]
pub struct RunControl {
    running: Arc<AtomicBool>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct SharedCounters {
    inner: Mutex<RunCounters>,
}

impl SharedCounters {
    pub fn new(initial: RunCounters) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    pub fn snapshot(&self) -> RunCounters {
        *self.inner.lock()
    }

    /// The next decision, or `None` once a stop condition holds.
    pub fn next_decision(&self, model: &WorkloadModel) -> Option<Decision> {
        let mut cur = self.inner.lock();
        if model.should_stop(&cur) {
            return None;
        }
        Some(model.decide(&mut cur))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub ops: u64,
    pub error_responses: u64,
    pub timings: Timings,
    /// Progress lines this worker logged.
    pub progress_reports: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub counters: RunCounters,
    /// Operations acknowledged by the server across all workers.
    pub ops: u64,
    pub error_responses: u64,
    pub timings: Timings,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub elapsed: Duration,
    pub workers: Vec<WorkerReport>,
}

impl RunSummary {
    pub fn ops_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.counters.num_ops() as f64 / secs
        } else {
            0.0
        }
    }

    pub fn failed_workers(&self) -> impl Iterator<Item = &WorkerReport> {
        self.workers.iter().filter(|w| w.error.is_some())
    }

    pub fn is_success(&self) -> bool {
        self.failed_workers().next().is_none()
    }
}

pub struct WorkerScheduler {
    model: WorkloadModel,
    counters: SharedCounters,
    control: RunControl,
    report_every: u64,
}

impl WorkerScheduler {
    pub fn new(config: Arc<WorkloadConfig>, initial: RunCounters) -> Self {
        Self {
            model: WorkloadModel::new(config),
            counters: SharedCounters::new(initial),
            control: RunControl::new(),
            report_every: REPORT_EVERY,
        }
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_report_every(mut self, every: u64) -> Self {
        self.report_every = every.max(1);
        self
    }

    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn counters(&self) -> RunCounters {
        self.counters.snapshot()
    }

    pub fn config(&self) -> &WorkloadConfig {
        self.model.config()
    }

    /// Connects every worker, runs them to a stop condition and merges their
    /// results. A failed connection aborts the run before any traffic; a
    /// worker that fails mid-run is reported in the summary.
    pub fn run<F: StoreFactory>(&self, factory: &F) -> SodaResult<RunSummary> {
        let config = self.model.config();
        if config.max_ops_per_sec > 0 {
            warn!(
                "max-ops-per-sec is not enforced; it only forces batch={}",
                config.effective_batch()
            );
        }

        let mut stores = Vec::new();
        for worker_id in 0..config.threads {
            stores.push(factory.create_store(worker_id)?);
        }

        let timer = config
            .run_time()
            .map(|limit| spawn_stop_timer(limit, self.control.clone()));

        info!("starting {} worker(s)", stores.len());
        let start_time = SystemTime::now();
        let clock = Instant::now();

        let reports = thread::scope(|scope| -> SodaResult<Vec<WorkerReport>> {
            let mut handles = Vec::with_capacity(stores.len());
            for (worker_id, store) in stores.into_iter().enumerate() {
                let handle = thread::Builder::new()
                    .name(format!("soda-worker-{}", worker_id))
                    .spawn_scoped(scope, move || self.run_worker(worker_id, store))?;
                handles.push((worker_id, handle));
            }
            Ok(handles
                .into_iter()
                .map(|(worker_id, handle)| {
                    handle.join().unwrap_or_else(|_| WorkerReport {
                        worker_id,
                        ops: 0,
                        error_responses: 0,
                        timings: Timings::new(),
                        progress_reports: 0,
                        error: Some("worker panicked".to_string()),
                    })
                })
                .collect())
        });

        let elapsed = clock.elapsed();
        let end_time = SystemTime::now();
        if let Some((cancel, handle)) = timer {
            drop(cancel);
            let _ = handle.join();
        }
        let reports = reports?;

        let mut timings = Timings::new();
        let mut ops = 0;
        let mut error_responses = 0;
        for worker in &reports {
            timings.merge(&worker.timings);
            ops += worker.ops;
            error_responses += worker.error_responses;
        }

        Ok(RunSummary {
            counters: self.counters.snapshot(),
            ops,
            error_responses,
            timings,
            start_time,
            end_time,
            elapsed,
            workers: reports,
        })
    }

    fn run_worker(&self, worker_id: usize, mut store: Box<dyn Store>) -> WorkerReport {
        let prefix = if self.model.config().threads > 1 {
            format!("thread-{}: ", worker_id)
        } else {
            String::new()
        };

        let mut progress = Progress::new(self.report_every, store.num_ops(), Instant::now());
        let result = self
            .drive(&prefix, store.as_mut(), &mut progress)
            .and_then(|_| store.finish());
        let error = match result {
            Ok(()) => None,
            Err(e) => {
                error!("{}stopped after {} ops: {}", prefix, store.num_ops(), e);
                Some(e.to_string())
            }
        };
        debug!("{}done, {} ops acknowledged", prefix, store.num_ops());

        WorkerReport {
            worker_id,
            ops: store.num_ops(),
            error_responses: store.error_responses(),
            timings: store.timings().clone(),
            progress_reports: progress.reports,
            error,
        }
    }

    fn drive(&self, prefix: &str, store: &mut dyn Store, progress: &mut Progress) -> SodaResult<()> {
        while self.control.is_running() {
            let decision = match self.counters.next_decision(&self.model) {
                Some(decision) => decision,
                None => break,
            };
            store.enqueue(self.model.materialize(&decision))?;

            if let Some((ops, secs)) = progress.tick(store.num_ops(), Instant::now()) {
                info!("{}{}", prefix, report::format_counters(&self.counters.snapshot()));
                info!("{}", report::progress_line(prefix, ops, secs.as_secs_f64()));
            }
        }
        Ok(())
    }
}

/// Throughput bookkeeping between a worker's progress lines.
#[derive(Debug)]
struct Progress {
    every: u64,
    issued: u64,
    last_ops: u64,
    last_report: Instant,
    reports: u64,
}

impl Progress {
    fn new(every: u64, ops: u64, now: Instant) -> Self {
        Self {
            every: every.max(1),
            issued: 0,
            last_ops: ops,
            last_report: now,
            reports: 0,
        }
    }

    /// Counts one issued operation. Every `every` operations, returns the
    /// acknowledged-ops delta and the time since the previous report.
    fn tick(&mut self, ops: u64, now: Instant) -> Option<(u64, Duration)> {
        self.issued += 1;
        if self.issued % self.every != 0 {
            return None;
        }
        let delta = ops.saturating_sub(self.last_ops);
        let elapsed = now.saturating_duration_since(self.last_report);
        self.last_ops = ops;
        self.last_report = now;
        self.reports += 1;
        Some((delta, elapsed))
    }
}

/// Stops the run after `limit` unless the returned sender is dropped first.
fn spawn_stop_timer(limit: Duration, control: RunControl) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
    let (cancel, wait) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        if let Err(RecvTimeoutError::Timeout) = wait.recv_timeout(limit) {
            info!("time limit of {:?} reached, stopping", limit);
            control.stop();
        }
    });
    (cancel, handle)
}
