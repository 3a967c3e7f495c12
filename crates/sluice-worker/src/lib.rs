//! Ingest worker built on a three-stage sluice pipeline
//!
//! Payloads arrive in bursts from a [`LoadGenerator`], are validated by
//! `intake`, split by `expand` and written to a [`RecordStore`] by
//! `persist`. Every outcome lands in an [`OutcomeLedger`].

pub mod config;
pub mod handlers;
pub mod ledger;
pub mod load;
pub mod payload;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use config::{LoadConfig, StageSettings, WorkerConfig};
pub use handlers::{Persister, ValidationError};
pub use ledger::{LedgerSnapshot, OutcomeLedger};
pub use load::{LoadGenerator, LoadReport};
pub use payload::Payload;
pub use store::RecordStore;
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use worker::{build_pipeline, IngestWorker, WorkerSummary};
