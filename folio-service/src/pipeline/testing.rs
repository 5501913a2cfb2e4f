//! Test doubles for the pipeline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::db::Database;
use crate::error::{DatabaseError, ServiceError, ServiceResult};

use super::reader::PageReader;
use super::types::{DocumentHandle, DocumentResult, PageRange, PageText};
use super::{PipelineState, RecordStore};

/// In-memory pages with injectable failures and delays, keyed by the first
/// requested page
pub struct StaticPageReader {
    pages: Vec<String>,
    failures: Mutex<HashMap<u32, u32>>,
    delays: HashMap<u32, Duration>,
    count_delay: Option<Duration>,
    reads: AtomicUsize,
    counts: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl StaticPageReader {
    pub fn new(pages: &[&str]) -> Self {
        Self {
            pages: pages.iter().map(|p| p.to_string()).collect(),
            failures: Mutex::new(HashMap::new()),
            delays: HashMap::new(),
            count_delay: None,
            reads: AtomicUsize::new(0),
            counts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail the next `times` reads starting at `chunk_key`
    pub fn failing_reads(self, chunk_key: u32, times: u32) -> Self {
        self.failures.lock().unwrap().insert(chunk_key, times);
        self
    }

    /// Block reads starting at `chunk_key` for `delay`
    pub fn delayed(mut self, chunk_key: u32, delay: Duration) -> Self {
        self.delays.insert(chunk_key, delay);
        self
    }

    /// Block `page_count` for `delay`
    pub fn slow_count(mut self, delay: Duration) -> Self {
        self.count_delay = Some(delay);
        self
    }

    pub fn read_calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn count_calls(&self) -> usize {
        self.counts.load(Ordering::SeqCst)
    }

    /// Most `read_pages` calls that were running at the same time
    pub fn peak_concurrent_reads(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl PageReader for StaticPageReader {
    fn page_count(&self, _document: &DocumentHandle) -> ServiceResult<u32> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.count_delay {
            std::thread::sleep(delay);
        }
        Ok(self.pages.len() as u32)
    }

    fn read_pages(
        &self,
        _document: &DocumentHandle,
        pages: &PageRange,
    ) -> ServiceResult<Vec<PageText>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let key = pages.first().unwrap_or(0);

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&key) {
            std::thread::sleep(*delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&key).filter(|left| **left > 0) {
                *left -= 1;
                return Err(ServiceError::extraction(pages.as_slice(), "injected failure"));
            }
        }

        Ok(pages
            .iter()
            .filter_map(|page| {
                let text = self.pages.get(page.checked_sub(1)? as usize)?;
                Some(PageText {
                    page,
                    text: text.clone(),
                })
            })
            .collect())
    }
}

/// Record store over an in-memory database whose saves can be made to fail
pub struct FlakyStore {
    pub db: Database,
    save_failures: AtomicU32,
    saves: AtomicUsize,
}

impl FlakyStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            save_failures: AtomicU32::new(0),
            saves: AtomicUsize::new(0),
        }
    }

    /// Make the next `times` saves fail with a retryable error
    pub fn failing_saves(self, times: u32) -> Self {
        self.save_failures.store(times, Ordering::SeqCst);
        self
    }

    /// Successful saves so far
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl RecordStore for FlakyStore {
    fn save_result(
        &self,
        document_id: &str,
        run_id: &str,
        result: &DocumentResult,
    ) -> ServiceResult<()> {
        let left = self.save_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.save_failures.store(left - 1, Ordering::SeqCst);
            return Err(ServiceError::Database(DatabaseError::Query(
                rusqlite::Error::InvalidQuery,
            )));
        }
        self.db.save_result(document_id, run_id, result)?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn record_state(
        &self,
        document_id: &str,
        state: PipelineState,
        error: Option<&str>,
    ) -> ServiceResult<()> {
        self.db.record_state(document_id, state, error)
    }

    fn record_progress(&self, document_id: &str, completed: usize, total: usize) -> ServiceResult<()> {
        self.db.record_progress(document_id, completed, total)
    }
}
