// Library exports for the binary and the integration tests

pub mod clients;
pub mod config;
pub mod document;
pub mod error;
pub mod keys;
pub mod report;
pub mod scheduler;
pub mod stats;
pub mod workload;

// Re-export commonly used types for convenience
pub use clients::{BinaryClient, LogStore, Store, StoreFactory, TargetFactory, TextClient};
pub use config::{parse_params, ConfigBuilder, Protocol, Target, WorkloadConfig};
pub use document::DocumentSynthesizer;
pub use error::{SodaError, SodaResult};
pub use keys::key_for;
pub use scheduler::{RunControl, RunSummary, WorkerScheduler};
pub use stats::{BatchStats, StatsCollector, StatsSink, Timings};
pub use workload::{ArpaVerb, OpKind, Operation, RunCounters, WorkloadModel};
