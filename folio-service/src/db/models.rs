//! Database model structs.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Processing status for documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Waiting for the worker to start a pipeline run
    Pending,
    /// A pipeline run is in flight
    Processing,
    /// The last run persisted a result
    Completed,
    /// The last run ended in failure
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => ProcessingStatus::Pending,
            "processing" => ProcessingStatus::Processing,
            "failed" => ProcessingStatus::Failed,
            _ => ProcessingStatus::Completed,
        }
    }
}

/// Document record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub file_path: String,
    pub processing_status: ProcessingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_error: Option<String>,
    /// Pipeline state of the current or last run (e.g. "dispatched", "aggregating")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_completed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_total: Option<usize>,
    /// Combined text of the last successful run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    /// Combined entities of the last successful run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<String>>,
    /// Run that wrote `extracted_text` and `entities`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Build a new pending document record
    pub fn new_pending(id: String, title: String, file_path: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            file_path,
            processing_status: ProcessingStatus::Pending,
            processing_error: None,
            processing_phase: None,
            chunks_completed: None,
            chunks_total: None,
            extracted_text: None,
            entities: None,
            result_run_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let processing_status_str: String = row.get(3)?;
        let chunks_completed: Option<i64> = row.get(6)?;
        let chunks_total: Option<i64> = row.get(7)?;
        let entities_str: Option<String> = row.get(9)?;
        let created_at_str: String = row.get(11)?;
        let updated_at_str: String = row.get(12)?;

        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            file_path: row.get(2)?,
            processing_status: ProcessingStatus::from_str(&processing_status_str),
            processing_error: row.get(4)?,
            processing_phase: row.get(5)?,
            chunks_completed: chunks_completed.map(|c| c as usize),
            chunks_total: chunks_total.map(|t| t as usize),
            extracted_text: row.get(8)?,
            entities: entities_str.and_then(|s| serde_json::from_str(&s).ok()),
            result_run_id: row.get(10)?,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

/// Column list matching `Document::from_row`
pub(crate) const DOCUMENT_COLUMNS: &str = "id, title, file_path, processing_status, processing_error, \
     processing_phase, chunks_completed, chunks_total, extracted_text, entities, result_run_id, \
     created_at, updated_at";

