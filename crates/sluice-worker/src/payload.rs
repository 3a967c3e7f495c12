//! Work items flowing through the ingest pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything a stage can receive or emit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    ClinicalRecord(ClinicalRecord),
    ReportBatch(ReportBatch),
    ReportSubmission(ReportSubmission),
    InferenceRequest(InferenceRequest),
    /// Terminal output of the `persist` stage
    Persisted(PersistedRecord),
}

impl Payload {
    /// Stable name of the variant, used for keys and counters
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClinicalRecord(_) => "clinical_record",
            Self::ReportBatch(_) => "report_batch",
            Self::ReportSubmission(_) => "report_submission",
            Self::InferenceRequest(_) => "inference_request",
            Self::Persisted(_) => "persisted",
        }
    }

    /// Record store key: `<kind>/<id>`
    pub fn key(&self) -> String {
        match self {
            Self::ClinicalRecord(r) => format!("{}/{}", self.kind(), r.record_id),
            Self::ReportBatch(b) => format!("{}/{}", self.kind(), b.batch_id),
            Self::ReportSubmission(r) => format!("{}/{}", self.kind(), r.report_id),
            Self::InferenceRequest(r) => format!("{}/{}", self.kind(), r.request_id),
            Self::Persisted(p) => p.key.clone(),
        }
    }
}

/// A single lab measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalRecord {
    pub record_id: Uuid,
    pub patient_id: String,
    /// Lab test code (e.g. "GLU", "K")
    pub test_code: String,
    pub value: f64,
    pub unit: String,
    pub collected_at: DateTime<Utc>,
}

/// Several reports uploaded together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBatch {
    pub batch_id: Uuid,
    pub source: String,
    pub reports: Vec<ReportSubmission>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSubmission {
    pub report_id: Uuid,
    pub patient_id: String,
    pub body: String,
}

/// Prompt destined for a model, simulated by the `persist` stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub request_id: Uuid,
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub key: String,
    /// Kind of the payload that was stored
    pub kind: String,
    /// Serialized size
    pub bytes: usize,
    pub stored_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> ReportSubmission {
        ReportSubmission {
            report_id: Uuid::nil(),
            patient_id: "p-1".to_string(),
            body: "normal sinus rhythm".to_string(),
        }
    }

    #[test]
    fn test_kind_and_key() {
        let payload = Payload::ReportSubmission(submission());
        assert_eq!(payload.kind(), "report_submission");
        assert_eq!(
            payload.key(),
            "report_submission/00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_persisted_key_is_the_stored_key() {
        let payload = Payload::Persisted(PersistedRecord {
            key: "clinical_record/abc".to_string(),
            kind: "clinical_record".to_string(),
            bytes: 120,
            stored_at: Utc::now(),
        });
        assert_eq!(payload.key(), "clinical_record/abc");
    }

    #[test]
    fn test_serialization_is_tagged() {
        let json = serde_json::to_value(Payload::ReportSubmission(submission())).unwrap();
        assert_eq!(json["type"], "report_submission");
        assert_eq!(json["patient_id"], "p-1");
    }
}
