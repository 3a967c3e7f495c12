//! The ingest worker: pipeline wiring and lifecycle

use std::sync::Arc;

use serde::Serialize;
use sluice::{
    Pipeline, PipelineError, PipelineState, PoolStats, StageConfig, StageSnapshot, Task,
};
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::handlers::{self, Persister};
use crate::ledger::{LedgerSnapshot, OutcomeLedger};
use crate::load::{LoadGenerator, LoadReport};
use crate::payload::Payload;
use crate::store::RecordStore;

pub const INTAKE_STAGE: &str = "intake";
pub const EXPAND_STAGE: &str = "expand";
pub const PERSIST_STAGE: &str = "persist";

/// Owns the pipeline and everything its handlers share
pub struct IngestWorker {
    config: WorkerConfig,
    pipeline: Pipeline<Payload>,
    persister: Persister,
    ledger: Arc<OutcomeLedger>,
}

impl IngestWorker {
    /// Build the pipeline and start its workers
    ///
    /// Must be called from inside a tokio runtime.
    pub fn new(config: WorkerConfig) -> Result<Self, PipelineError> {
        let store = Arc::new(RecordStore::new(config.write_latency));
        let buffers = Arc::new(Persister::buffer_pool(config.stages.workers));
        let persister = Persister::new(store, buffers);
        let ledger = Arc::new(OutcomeLedger::new());

        let pipeline = build_pipeline(&config, persister.clone(), Arc::clone(&ledger))?;

        info!(
            worker_id = %config.worker_id,
            ingress_workers = config.ingress.workers,
            ingress_capacity = config.ingress.capacity,
            ingress_policy = %config.ingress.policy,
            stage_workers = config.stages.workers,
            stage_capacity = config.stages.capacity,
            "Ingest worker initialized"
        );

        Ok(Self {
            config,
            pipeline,
            persister,
            ledger,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline<Payload> {
        &self.pipeline
    }

    pub fn store(&self) -> &RecordStore {
        self.persister.store()
    }

    pub fn ledger(&self) -> &OutcomeLedger {
        &self.ledger
    }

    /// Run the configured synthetic load to completion
    pub async fn run_load(&self) -> LoadReport {
        LoadGenerator::new(self.config.load.clone())
            .with_task_timeout(self.config.task_timeout)
            .with_retry(self.config.submit_retry())
            .run(&self.pipeline)
            .await
    }

    /// Drain the pipeline within the configured shutdown timeout
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        info!(
            worker_id = %self.config.worker_id,
            timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
            "Shutting down ingest worker"
        );
        self.pipeline
            .shutdown_timeout(self.config.shutdown_timeout)
            .await
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            worker_id: self.config.worker_id.clone(),
            state: self.pipeline.state(),
            stages: self.pipeline.stats(),
            outcomes: self.ledger.snapshot(),
            stored_records: self.store().len(),
            buffers: self.persister.buffers().stats(),
        }
    }

    /// Log per-stage counters and final outcomes
    pub fn log_summary(&self) {
        let summary = self.summary();
        for stage in &summary.stages {
            info!(
                stage = %stage.stage,
                processed = stage.processed,
                failed = stage.failed,
                rejected = stage.rejected,
                expired = stage.expired,
                abandoned = stage.abandoned,
                mean_queue_wait_us = stage.mean_queue_wait_micros,
                max_queue_wait_us = stage.max_queue_wait_micros,
                "Stage summary"
            );
        }

        let abandoned: u64 = summary.stages.iter().map(|s| s.abandoned).sum();
        if abandoned > 0 {
            warn!(abandoned, "Tasks abandoned during shutdown");
        }

        match serde_json::to_string(&summary.outcomes) {
            Ok(outcomes) => info!(
                state = %summary.state,
                stored_records = summary.stored_records,
                buffer_hit_rate = summary.buffers.hit_rate(),
                %outcomes,
                "Worker summary"
            ),
            Err(e) => warn!(error = %e, "Failed to serialize outcomes"),
        }
    }
}

/// Final state of a worker run
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub state: PipelineState,
    pub stages: Vec<StageSnapshot>,
    pub outcomes: LedgerSnapshot,
    pub stored_records: usize,
    pub buffers: PoolStats,
}

/// `intake` → `expand` → `persist`, with the ledger as both sinks
pub fn build_pipeline(
    config: &WorkerConfig,
    persister: Persister,
    ledger: Arc<OutcomeLedger>,
) -> Result<Pipeline<Payload>, PipelineError> {
    let intake = StageConfig::new(INTAKE_STAGE, handlers::intake)
        .with_workers(config.ingress.workers)
        .with_capacity(config.ingress.capacity)
        .with_policy(config.ingress.policy);

    let mut expand = StageConfig::new(EXPAND_STAGE, handlers::expand)
        .with_workers(config.stages.workers)
        .with_capacity(config.stages.capacity)
        .with_policy(config.stages.policy);
    if let Some(limit) = config.max_fan_out {
        expand = expand.with_max_fan_out(limit);
    }

    let persist = StageConfig::new(PERSIST_STAGE, move |ctx, task: Task<Payload>| {
        persister.clone().handle(ctx, task)
    })
    .with_workers(config.stages.workers)
    .with_capacity(config.stages.capacity)
    .with_policy(config.stages.policy);

    Pipeline::builder()
        .add_stage(intake)
        .add_stage(expand)
        .add_stage(persist)
        .error_sink(Arc::clone(&ledger))
        .result_sink(ledger)
        .build()
}
