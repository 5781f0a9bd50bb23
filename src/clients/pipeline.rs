use std::collections::VecDeque;
use std::time::SystemTime;

use crate::stats::BatchStats;
use crate::workload::Operation;

/// Queue of operations not yet written to the socket.
///
/// `push` reports when the queue has grown past the batch size; the caller
/// flushes then, so the queue never holds more than `batch + 1` entries.
#[derive(Debug)]
pub struct Pipeliner {
    queue: Vec<Operation>,
    batch: usize,
}

impl Pipeliner {
    pub fn new(batch: usize) -> Self {
        let batch = batch.max(1);
        Self {
            queue: Vec::new(),
            batch,
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Queues `op`; true when a flush is due.
    pub fn push(&mut self, op: Operation) -> bool {
        self.queue.push(op);
        self.queue.len() > self.batch
    }

    pub fn take(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A batch that has been written but whose responses have not been read.
#[derive(Debug)]
pub struct InFlight<T> {
    pending: VecDeque<T>,
    stats: Option<BatchStats>,
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            stats: None,
        }
    }
}

impl<T> InFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, pending: VecDeque<T>, stats: BatchStats) {
        self.pending = pending;
        self.stats = Some(stats);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Moves the expected responses out, leaving nothing in flight.
    pub fn take(&mut self) -> (VecDeque<T>, Option<BatchStats>) {
        (std::mem::take(&mut self.pending), self.stats.take())
    }
}

/// Batch stats stamped with `start` and counting every queued kind.
pub fn batch_stats<'a>(ops: impl IntoIterator<Item = &'a Operation>, start: SystemTime) -> BatchStats {
    let mut stats = BatchStats::new(start);
    for op in ops {
        stats.add(op.kind);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::OpKind;

    fn get(n: i64) -> Operation {
        Operation {
            kind: OpKind::Get,
            key_id: n,
            key: format!("k{}", n),
            payload: None,
        }
    }

    #[test]
    fn test_flush_due_past_batch() {
        let mut pipe = Pipeliner::new(3);
        assert!(!pipe.push(get(0)));
        assert!(!pipe.push(get(1)));
        assert!(!pipe.push(get(2)));
        assert!(pipe.push(get(3)));
        assert_eq!(pipe.len(), 4);
        let ops = pipe.take();
        assert_eq!(ops.len(), 4);
        assert!(pipe.is_empty());
    }

    #[test]
    fn test_queue_bounded_when_caller_flushes() {
        let mut pipe = Pipeliner::new(5);
        let mut max_len = 0;
        for n in 0..1000 {
            let due = pipe.push(get(n));
            max_len = max_len.max(pipe.len());
            if due {
                pipe.take();
            }
        }
        assert_eq!(max_len, 6);
    }

    #[test]
    fn test_huge_batch_does_not_reserve() {
        let mut pipe = Pipeliner::new(usize::MAX);
        assert!(!pipe.push(get(0)));
        assert_eq!(pipe.take().len(), 1);
        assert!(!pipe.push(get(1)));
    }

    #[test]
    fn test_zero_batch_treated_as_one() {
        let mut pipe = Pipeliner::new(0);
        assert_eq!(pipe.batch(), 1);
        assert!(!pipe.push(get(0)));
        assert!(pipe.push(get(1)));
    }

    #[test]
    fn test_in_flight_take_resets() {
        let mut flight = InFlight::new();
        let ops = vec![get(0), get(1)];
        let stats = batch_stats(&ops, SystemTime::now());
        flight.begin(VecDeque::from(vec![1u32, 2u32]), stats);
        assert_eq!(flight.len(), 2);
        let (pending, stats) = flight.take();
        assert_eq!(pending.len(), 2);
        assert_eq!(stats.unwrap().gets, 2);
        assert!(flight.is_empty());
    }
}
