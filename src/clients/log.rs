use tracing::info;

use super::Store;
use crate::error::SodaResult;
use crate::stats::Timings;
use crate::workload::Operation;

/// Dry-run store for `log://` targets: logs each operation, sends nothing.
#[derive(Debug, Default)]
pub struct LogStore {
    worker_id: usize,
    ops: u64,
    timings: Timings,
}

impl LogStore {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            ..Self::default()
        }
    }
}

impl Store for LogStore {
    fn enqueue(&mut self, op: Operation) -> SodaResult<()> {
        info!(
            worker = self.worker_id,
            "{} {} {} {}",
            op.kind,
            op.key_id,
            op.key,
            op.payload_bytes().len()
        );
        self.ops += 1;
        Ok(())
    }

    fn flush(&mut self) -> SodaResult<()> {
        Ok(())
    }

    fn finish(&mut self) -> SodaResult<()> {
        Ok(())
    }

    fn num_ops(&self) -> u64 {
        self.ops
    }

    fn timings(&self) -> &Timings {
        &self.timings
    }
}
