//! Document record operations.
//!
//! Insert, lookup and listing of documents, the status bookkeeping written
//! while a pipeline run is in flight, and the final result write.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::Database;
use super::models::{DOCUMENT_COLUMNS, Document, ProcessingStatus};
use crate::error::{DatabaseError, ServiceError, ServiceResult};
use crate::pipeline::{DocumentResult, PipelineState, RecordStore};

impl Database {
    /// Insert a new document
    pub fn insert_document(&self, doc: &Document) -> ServiceResult<()> {
        let conn = self.conn();

        let entities_json = doc
            .entities
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(DatabaseError::Serialization)?;

        conn.execute(
            r#"
            INSERT INTO documents (id, title, file_path, processing_status, processing_error, processing_phase, chunks_completed, chunks_total, extracted_text, entities, result_run_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                doc.id,
                doc.title,
                doc.file_path,
                doc.processing_status.as_str(),
                doc.processing_error,
                doc.processing_phase,
                doc.chunks_completed.map(|c| c as i64),
                doc.chunks_total.map(|t| t as i64),
                doc.extracted_text,
                entities_json,
                doc.result_run_id,
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a document by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<Document>> {
        let conn = self.conn();

        conn.query_row(
            &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
            params![id],
            Document::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// List all documents, newest first
    pub fn list_documents(&self) -> ServiceResult<Vec<Document>> {
        let conn = self.conn();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM documents ORDER BY created_at DESC",
                DOCUMENT_COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map([], Document::from_row)
            .map_err(DatabaseError::Query)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row.map_err(DatabaseError::Query)?);
        }

        Ok(docs)
    }

    /// Claim the oldest pending document by flipping it to `processing`.
    ///
    /// Selection and update happen under one connection lock, so two workers
    /// never claim the same document.
    pub fn claim_next_pending_document(&self) -> ServiceResult<Option<Document>> {
        let conn = self.conn();

        let doc = conn
            .query_row(
                &format!(
                    "SELECT {} FROM documents WHERE processing_status = 'pending' ORDER BY created_at LIMIT 1",
                    DOCUMENT_COLUMNS
                ),
                [],
                Document::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let Some(mut doc) = doc else {
            return Ok(None);
        };

        let now = Utc::now();
        conn.execute(
            "UPDATE documents SET processing_status = 'processing', processing_error = NULL, updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), doc.id],
        )
        .map_err(DatabaseError::Query)?;

        doc.processing_status = ProcessingStatus::Processing;
        doc.processing_error = None;
        doc.updated_at = now;
        Ok(Some(doc))
    }

    /// Queue a document for (re)processing
    pub fn mark_document_pending(&self, document_id: &str) -> ServiceResult<bool> {
        let conn = self.conn();

        let rows = conn
            .execute(
                "UPDATE documents SET processing_status = 'pending', processing_error = NULL, processing_phase = NULL, \
                 chunks_completed = NULL, chunks_total = NULL, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), document_id],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Requeue documents left in `processing` by a previous process.
    pub fn requeue_interrupted_documents(&self) -> ServiceResult<usize> {
        let conn = self.conn();

        let rows = conn
            .execute(
                "UPDATE documents SET processing_status = 'pending', processing_phase = NULL, updated_at = ?1 \
                 WHERE processing_status = 'processing'",
                params![Utc::now().to_rfc3339()],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows)
    }

    /// Update document processing status
    pub fn update_document_processing_status(
        &self,
        document_id: &str,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> ServiceResult<bool> {
        let conn = self.conn();

        let rows = conn
            .execute(
                "UPDATE documents SET processing_status = ?1, processing_error = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), error, Utc::now().to_rfc3339(), document_id],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Record the pipeline state of the run working on a document
    pub fn update_document_phase(&self, document_id: &str, phase: &str) -> ServiceResult<bool> {
        let conn = self.conn();

        let rows = conn
            .execute(
                "UPDATE documents SET processing_phase = ?1, updated_at = ?2 WHERE id = ?3",
                params![phase, Utc::now().to_rfc3339(), document_id],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Update chunk progress of the run working on a document
    pub fn update_document_progress(
        &self,
        document_id: &str,
        completed: usize,
        total: usize,
    ) -> ServiceResult<bool> {
        let conn = self.conn();

        let rows = conn
            .execute(
                "UPDATE documents SET chunks_completed = ?1, chunks_total = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    completed as i64,
                    total as i64,
                    Utc::now().to_rfc3339(),
                    document_id
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Write the combined result of a run in a single statement.
    ///
    /// Overwrites whatever an earlier run stored, so repeating the write with
    /// the same result leaves the record unchanged.
    pub fn save_document_result(
        &self,
        document_id: &str,
        run_id: &str,
        result: &DocumentResult,
    ) -> ServiceResult<()> {
        let entities_json =
            serde_json::to_string(&result.entities).map_err(DatabaseError::Serialization)?;

        let conn = self.conn();
        let rows = conn
            .execute(
                "UPDATE documents SET extracted_text = ?1, entities = ?2, result_run_id = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    result.text,
                    entities_json,
                    run_id,
                    Utc::now().to_rfc3339(),
                    document_id
                ],
            )
            .map_err(DatabaseError::Query)?;

        if rows == 0 {
            return Err(ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            });
        }

        Ok(())
    }
}

impl RecordStore for Database {
    fn save_result(
        &self,
        document_id: &str,
        run_id: &str,
        result: &DocumentResult,
    ) -> ServiceResult<()> {
        self.save_document_result(document_id, run_id, result)
    }

    fn record_state(
        &self,
        document_id: &str,
        state: PipelineState,
        error: Option<&str>,
    ) -> ServiceResult<()> {
        self.update_document_phase(document_id, state.as_ref())?;
        match state {
            PipelineState::Planning => {
                self.update_document_processing_status(
                    document_id,
                    ProcessingStatus::Processing,
                    None,
                )?;
            }
            PipelineState::Completed => {
                self.update_document_processing_status(
                    document_id,
                    ProcessingStatus::Completed,
                    None,
                )?;
            }
            PipelineState::Failed => {
                self.update_document_processing_status(
                    document_id,
                    ProcessingStatus::Failed,
                    error,
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    fn record_progress(&self, document_id: &str, completed: usize, total: usize) -> ServiceResult<()> {
        self.update_document_progress(document_id, completed, total)?;
        Ok(())
    }
}
