//! Synthetic bursty load

use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sluice::{Context, Pipeline, PipelineError, RetryPolicy, Task};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LoadConfig;
use crate::payload::{ClinicalRecord, InferenceRequest, Payload, ReportBatch, ReportSubmission};

/// Submission outcomes seen by the generator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub submitted: u64,
    pub accepted: u64,
    /// Shed at the ingress after every retry
    pub rejected: u64,
    /// Any other submission error (shutdown, caller deadline)
    pub failed: u64,
}

/// Submits bursts of random payloads at a fixed interval
#[derive(Debug, Clone)]
pub struct LoadGenerator {
    config: LoadConfig,
    task_timeout: Option<Duration>,
    retry: RetryPolicy,
}

impl LoadGenerator {
    pub fn new(config: LoadConfig) -> Self {
        Self {
            config,
            task_timeout: None,
            retry: RetryPolicy::no_retry(),
        }
    }

    /// Deadline attached to every generated task
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Submit the configured number of tasks, stopping early once the
    /// pipeline stops accepting work
    pub async fn run(&self, pipeline: &Pipeline<Payload>) -> LoadReport {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let ctx = Context::background();
        let mut report = LoadReport::default();

        info!(
            tasks = self.config.tasks,
            burst = self.config.burst,
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting load generation"
        );

        while report.submitted < self.config.tasks {
            let burst = self.config.burst.min(self.config.tasks - report.submitted);
            for _ in 0..burst {
                let mut task = Task::new(random_payload(&mut rng));
                if let Some(timeout) = self.task_timeout {
                    task = task.with_timeout(timeout);
                }

                report.submitted += 1;
                match pipeline.submit_with_retry(&ctx, task, &self.retry).await {
                    Ok(()) => report.accepted += 1,
                    Err(PipelineError::QueueFull) => report.rejected += 1,
                    Err(PipelineError::ShuttingDown) => {
                        report.failed += 1;
                        warn!(submitted = report.submitted, "Pipeline stopped accepting work");
                        return report;
                    }
                    Err(e) => {
                        report.failed += 1;
                        debug!(error = %e, "Submission failed");
                    }
                }
            }

            debug!(
                submitted = report.submitted,
                accepted = report.accepted,
                rejected = report.rejected,
                "Burst submitted"
            );

            if report.submitted < self.config.tasks && !self.config.interval.is_zero() {
                tokio::time::sleep(self.config.interval).await;
            }
        }

        info!(
            submitted = report.submitted,
            accepted = report.accepted,
            rejected = report.rejected,
            failed = report.failed,
            "Load generation finished"
        );
        report
    }
}

const TEST_PANEL: &[(&str, &str, f64, f64)] = &[
    ("GLU", "mg/dL", 70.0, 140.0),
    ("GLU", "mmol/L", 3.9, 7.8),
    ("HBA1C", "%", 4.0, 10.0),
    ("K", "mEq/L", 3.5, 5.1),
    ("CRP", "mg/L", 0.0, 10.0),
];

const MODELS: &[&str] = &["triage-small", "triage-large"];

/// Draw one payload from the synthetic mix
///
/// Roughly 1 in 20 clinical records carries a negative value so the
/// validation failure path stays exercised.
pub fn random_payload<R: Rng>(rng: &mut R) -> Payload {
    match rng.gen_range(0..10) {
        0..=4 => Payload::ClinicalRecord(random_record(rng)),
        5 | 6 => {
            let count = rng.gen_range(2..=6);
            Payload::ReportBatch(ReportBatch {
                batch_id: Uuid::now_v7(),
                source: format!("lab-{}", rng.gen_range(1..=9)),
                reports: (0..count).map(|_| random_report(rng)).collect(),
            })
        }
        7 => Payload::ReportSubmission(random_report(rng)),
        _ => Payload::InferenceRequest(InferenceRequest {
            request_id: Uuid::now_v7(),
            model: MODELS[rng.gen_range(0..MODELS.len())].to_string(),
            prompt: "summarize the latest results ".repeat(rng.gen_range(1..=20)),
        }),
    }
}

fn random_record<R: Rng>(rng: &mut R) -> ClinicalRecord {
    let (test_code, unit, low, high) = TEST_PANEL[rng.gen_range(0..TEST_PANEL.len())];
    let mut value = rng.gen_range(low..high);
    if rng.gen_bool(0.05) {
        value = -value;
    }
    ClinicalRecord {
        record_id: Uuid::now_v7(),
        patient_id: random_patient(rng),
        test_code: test_code.to_string(),
        value,
        unit: unit.to_string(),
        collected_at: Utc::now(),
    }
}

fn random_report<R: Rng>(rng: &mut R) -> ReportSubmission {
    ReportSubmission {
        report_id: Uuid::now_v7(),
        patient_id: random_patient(rng),
        body: format!("report body #{}", rng.gen::<u32>()),
    }
}

fn random_patient<R: Rng>(rng: &mut R) -> String {
    format!("patient-{:05}", rng.gen_range(0..50_000))
}
