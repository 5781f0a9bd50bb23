use std::net::TcpStream;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{Protocol, Target, WorkloadConfig};
use crate::error::{SodaError, SodaResult};
use crate::stats::{StatsSink, Timings};
use crate::workload::Operation;

pub mod binary;
pub mod buffer;
pub mod log;
pub mod pipeline;
pub mod text;

pub use binary::BinaryClient;
pub use log::LogStore;
pub use pipeline::Pipeliner;
pub use text::TextClient;

/// A connection that accepts operations, pipelines them and reports what the
/// server acknowledged. Each worker owns one.
pub trait Store: Send {
    /// Queues `op`, flushing when the pipeline grows past the batch size.
    fn enqueue(&mut self, op: Operation) -> SodaResult<()>;

    fn flush(&mut self) -> SodaResult<()>;

    /// Flushes, then waits for every outstanding response.
    fn finish(&mut self) -> SodaResult<()>;

    /// Operations whose responses have been received.
    fn num_ops(&self) -> u64;

    /// Responses with a non-success status (misses, NOT_STORED, ...).
    fn error_responses(&self) -> u64 {
        0
    }

    fn timings(&self) -> &Timings;
}

/// Opens one store per worker.
pub trait StoreFactory: Sync {
    fn create_store(&self, worker_id: usize) -> SodaResult<Box<dyn Store>>;
}

impl<F> StoreFactory for F
where
    F: Fn(usize) -> SodaResult<Box<dyn Store>> + Sync,
{
    fn create_store(&self, worker_id: usize) -> SodaResult<Box<dyn Store>> {
        self(worker_id)
    }
}

/// Connects to a parsed target with the protocol it names.
pub struct TargetFactory {
    target: Target,
    config: Arc<WorkloadConfig>,
    sink: Option<Arc<dyn StatsSink>>,
}

impl TargetFactory {
    pub fn new(target: Target, config: Arc<WorkloadConfig>, sink: Option<Arc<dyn StatsSink>>) -> Self {
        Self { target, config, sink }
    }
}

impl StoreFactory for TargetFactory {
    fn create_store(&self, worker_id: usize) -> SodaResult<Box<dyn Store>> {
        let target = &self.target;
        if target.protocol == Protocol::Log {
            debug!("worker {} using dry-run store", worker_id);
            return Ok(Box::new(LogStore::new(worker_id)));
        }

        let addr = target.addr();
        let stream = TcpStream::connect(&addr).map_err(|source| SodaError::Connect {
            addr: addr.clone(),
            source,
        })?;
        stream.set_nodelay(true)?;
        info!("worker {} connected to {} ({})", worker_id, addr, target.protocol);

        match target.protocol {
            Protocol::Binary => {
                let mut client = BinaryClient::new(stream, &self.config, self.sink.clone());
                if let Some(user) = &target.user {
                    let password = target.password.as_deref().unwrap_or("");
                    client.authenticate(user, password)?;
                }
                Ok(Box::new(client))
            }
            Protocol::Ascii => {
                if target.user.is_some() {
                    warn!("worker {}: the text protocol has no auth, ignoring credentials", worker_id);
                }
                Ok(Box::new(TextClient::new(stream, &self.config, self.sink.clone())))
            }
            Protocol::Log => Ok(Box::new(LogStore::new(worker_id))),
        }
    }
}
