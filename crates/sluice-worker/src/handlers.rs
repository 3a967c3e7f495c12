//! Stage handlers for the ingest pipeline
//!
//! - `intake`: validates payloads and normalizes lab units
//! - `expand`: splits report batches into one submission per report
//! - `persist`: serializes into a pooled buffer and writes to the store

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sluice::{Context, HandlerError, HandlerResult, Pool, Task};
use thiserror::Error;
use tracing::debug;

use crate::payload::{ClinicalRecord, Payload, PersistedRecord};
use crate::store::RecordStore;

/// Longest prompt accepted by `intake`
pub const MAX_PROMPT_CHARS: usize = 8_000;

/// Simulated inference cost per prompt character
const INFERENCE_COST_PER_CHAR: Duration = Duration::from_micros(5);

/// Upper bound on simulated inference time
const MAX_INFERENCE_LATENCY: Duration = Duration::from_millis(50);

/// Initial capacity of pooled serialization buffers
pub const SCRATCH_BUFFER_CAPACITY: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("unit '{unit}' not accepted for test {test_code}")]
    UnknownUnit { test_code: String, unit: String },

    #[error("report batch is empty")]
    EmptyBatch,

    #[error("prompt is {len} characters (max {max})")]
    PromptTooLong { len: usize, max: usize },

    #[error("{kind} payload not accepted by stage {stage}")]
    UnexpectedPayload {
        stage: &'static str,
        kind: &'static str,
    },
}

impl From<ValidationError> for HandlerError {
    fn from(err: ValidationError) -> Self {
        let details = match &err {
            ValidationError::MissingField(field) => json!({ "field": field }),
            ValidationError::OutOfRange { field, value } => {
                json!({ "field": field, "value": value })
            }
            ValidationError::UnknownUnit { test_code, unit } => {
                json!({ "test_code": test_code, "unit": unit })
            }
            ValidationError::PromptTooLong { len, max } => json!({ "len": len, "max": max }),
            ValidationError::UnexpectedPayload { stage, kind } => {
                json!({ "stage": stage, "kind": kind })
            }
            ValidationError::EmptyBatch => json!({}),
        };
        HandlerError::new(err.to_string())
            .with_kind("validation")
            .with_details(details)
    }
}

// ============================================================================
// intake
// ============================================================================

/// Validate the payload in place and pass it on
pub async fn intake(_ctx: Context, mut task: Task<Payload>) -> HandlerResult<Payload> {
    validate(task.payload_mut())?;
    Ok(vec![task])
}

/// Check required fields and rewrite lab values into canonical units
pub fn validate(payload: &mut Payload) -> Result<(), ValidationError> {
    match payload {
        Payload::ClinicalRecord(record) => normalize_record(record),
        Payload::ReportBatch(batch) => {
            if batch.reports.is_empty() {
                return Err(ValidationError::EmptyBatch);
            }
            if batch.source.trim().is_empty() {
                return Err(ValidationError::MissingField("source"));
            }
            Ok(())
        }
        Payload::ReportSubmission(report) => {
            if report.patient_id.trim().is_empty() {
                return Err(ValidationError::MissingField("patient_id"));
            }
            if report.body.trim().is_empty() {
                return Err(ValidationError::MissingField("body"));
            }
            Ok(())
        }
        Payload::InferenceRequest(request) => {
            if request.prompt.trim().is_empty() {
                return Err(ValidationError::MissingField("prompt"));
            }
            let len = request.prompt.chars().count();
            if len > MAX_PROMPT_CHARS {
                return Err(ValidationError::PromptTooLong {
                    len,
                    max: MAX_PROMPT_CHARS,
                });
            }
            Ok(())
        }
        Payload::Persisted(_) => Err(ValidationError::UnexpectedPayload {
            stage: "intake",
            kind: "persisted",
        }),
    }
}

fn normalize_record(record: &mut ClinicalRecord) -> Result<(), ValidationError> {
    if record.patient_id.trim().is_empty() {
        return Err(ValidationError::MissingField("patient_id"));
    }
    if !record.value.is_finite() || record.value < 0.0 {
        return Err(ValidationError::OutOfRange {
            field: "value",
            value: record.value,
        });
    }

    record.test_code = record.test_code.trim().to_ascii_uppercase();
    let (factor, unit) = canonical_unit(&record.test_code, &record.unit)?;
    record.value *= factor;
    record.unit = unit;
    Ok(())
}

/// Conversion factor and canonical unit for a test
///
/// Unknown test codes keep their unit as reported.
fn canonical_unit(test_code: &str, unit: &str) -> Result<(f64, String), ValidationError> {
    let normalized = unit.trim().to_ascii_lowercase();
    let known = match (test_code, normalized.as_str()) {
        ("GLU", "mg/dl") => Some((1.0, "mg/dL")),
        ("GLU", "mmol/l") => Some((18.016, "mg/dL")),
        ("HBA1C", "%") => Some((1.0, "%")),
        ("K", "mmol/l") | ("K", "meq/l") => Some((1.0, "mmol/L")),
        ("GLU" | "HBA1C" | "K", _) => None,
        _ => return Ok((1.0, unit.trim().to_string())),
    };
    known
        .map(|(factor, canonical)| (factor, canonical.to_string()))
        .ok_or_else(|| ValidationError::UnknownUnit {
            test_code: test_code.to_string(),
            unit: unit.to_string(),
        })
}

// ============================================================================
// expand
// ============================================================================

/// Split a batch into one submission per report; pass anything else through
pub async fn expand(_ctx: Context, task: Task<Payload>) -> HandlerResult<Payload> {
    if let Payload::ReportBatch(batch) = task.payload() {
        debug!(
            task_id = %task.id(),
            batch_id = %batch.batch_id,
            reports = batch.reports.len(),
            "Expanding report batch"
        );
        return Ok(batch
            .reports
            .iter()
            .map(|report| task.derive(Payload::ReportSubmission(report.clone())))
            .collect());
    }
    Ok(vec![task])
}

// ============================================================================
// persist
// ============================================================================

/// Writes payloads to a [`RecordStore`] through reusable scratch buffers
#[derive(Debug, Clone)]
pub struct Persister {
    store: Arc<RecordStore>,
    buffers: Arc<Pool<Vec<u8>>>,
}

impl Persister {
    pub fn new(store: Arc<RecordStore>, buffers: Arc<Pool<Vec<u8>>>) -> Self {
        Self { store, buffers }
    }

    /// Buffer pool sized for serialized payloads
    pub fn buffer_pool(max_idle: usize) -> Pool<Vec<u8>> {
        Pool::with_max_idle(|| Vec::with_capacity(SCRATCH_BUFFER_CAPACITY), max_idle)
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn buffers(&self) -> &Arc<Pool<Vec<u8>>> {
        &self.buffers
    }

    /// `persist` stage handler
    pub async fn handle(self, ctx: Context, task: Task<Payload>) -> HandlerResult<Payload> {
        if let Payload::InferenceRequest(request) = task.payload() {
            ctx.run(tokio::time::sleep(inference_latency(&request.prompt)))
                .await?;
        }

        let mut buf = self.buffers.get();
        let written = self.write(&ctx, task.payload(), &mut buf).await;
        // Reset before returning so the next task starts from an empty buffer
        buf.clear();
        self.buffers.put(buf);

        let record = written?;
        Ok(vec![task.derive(Payload::Persisted(record))])
    }

    async fn write(
        &self,
        ctx: &Context,
        payload: &Payload,
        buf: &mut Vec<u8>,
    ) -> Result<PersistedRecord, HandlerError> {
        if let Payload::Persisted(_) = payload {
            return Err(ValidationError::UnexpectedPayload {
                stage: "persist",
                kind: payload.kind(),
            }
            .into());
        }

        serde_json::to_writer(&mut *buf, payload)
            .map_err(|e| HandlerError::new(e.to_string()).with_kind("serialization"))?;

        let key = payload.key();
        ctx.run(self.store.write(&key, buf)).await?;

        Ok(PersistedRecord {
            key,
            kind: payload.kind().to_string(),
            bytes: buf.len(),
            stored_at: Utc::now(),
        })
    }
}

fn inference_latency(prompt: &str) -> Duration {
    let chars = u32::try_from(prompt.len()).unwrap_or(u32::MAX);
    INFERENCE_COST_PER_CHAR
        .saturating_mul(chars)
        .min(MAX_INFERENCE_LATENCY)
}
