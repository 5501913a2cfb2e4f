//! Page readers: page counts and raw per-page text.
//!
//! Readers are blocking; the stage executor calls them from
//! `spawn_blocking`. Page indices past the end of a document are skipped,
//! never reported as errors.

use std::path::Path;

use pdfium_render::prelude::*;
use tracing::{debug, warn};

use crate::error::{ServiceError, ServiceResult};

use super::types::{DocumentHandle, PageRange, PageText};

/// Source of page counts and page text for a document
pub trait PageReader: Send + Sync {
    /// Number of pages in the document
    fn page_count(&self, document: &DocumentHandle) -> ServiceResult<u32>;

    /// Text of the requested pages, in request order, omitting pages the
    /// document does not have
    fn read_pages(
        &self,
        document: &DocumentHandle,
        pages: &PageRange,
    ) -> ServiceResult<Vec<PageText>>;
}

/// Page separator used by plain-text documents
const FORM_FEED: char = '\x0c';

/// Reader that picks a format from the file extension
#[derive(Debug, Default, Clone, Copy)]
pub struct FilePageReader;

impl FilePageReader {
    /// Whether the file extension names a format with a reader
    pub fn supports(path: &Path) -> bool {
        Self::format_reader(path).is_some()
    }

    fn format_reader(path: &Path) -> Option<&'static dyn PageReader> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Some(&PdfPageReader),
            "txt" | "text" | "md" | "markdown" => Some(&TextPageReader),
            _ => None,
        }
    }

    fn reader_for(&self, document: &DocumentHandle) -> ServiceResult<&'static dyn PageReader> {
        Self::format_reader(&document.path).ok_or_else(|| {
            ServiceError::extraction(
                &[],
                format!("Unsupported document format: {}", document.path.display()),
            )
        })
    }
}

impl PageReader for FilePageReader {
    fn page_count(&self, document: &DocumentHandle) -> ServiceResult<u32> {
        self.reader_for(document)?.page_count(document)
    }

    fn read_pages(
        &self,
        document: &DocumentHandle,
        pages: &PageRange,
    ) -> ServiceResult<Vec<PageText>> {
        self.reader_for(document)?.read_pages(document, pages)
    }
}

/// Plain-text documents whose pages are separated by form feeds
#[derive(Debug, Default, Clone, Copy)]
pub struct TextPageReader;

impl TextPageReader {
    fn load_pages(path: &Path, requested: &[u32]) -> ServiceResult<Vec<String>> {
        let content = std::fs::read_to_string(path).map_err(|e| ServiceError::Extraction {
            pages: requested.to_vec(),
            source: Box::new(e),
        })?;
        Ok(split_text_pages(&content))
    }
}

/// Split plain text into pages on form feeds.
///
/// A trailing form feed does not open a new page, and a blank file has no
/// pages at all.
pub(crate) fn split_text_pages(content: &str) -> Vec<String> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    let mut pages: Vec<String> = content.split(FORM_FEED).map(str::to_string).collect();
    if pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
        pages.pop();
    }
    pages
}

impl PageReader for TextPageReader {
    fn page_count(&self, document: &DocumentHandle) -> ServiceResult<u32> {
        let pages = Self::load_pages(&document.path, &[])?;
        Ok(pages.len() as u32)
    }

    fn read_pages(
        &self,
        document: &DocumentHandle,
        pages: &PageRange,
    ) -> ServiceResult<Vec<PageText>> {
        let all = Self::load_pages(&document.path, pages.as_slice())?;

        let mut result = Vec::with_capacity(pages.len());
        for page in pages.iter() {
            match page.checked_sub(1).and_then(|i| all.get(i as usize)) {
                Some(text) => result.push(PageText {
                    page,
                    text: text.trim().to_string(),
                }),
                None => {
                    debug!(doc_id = %document.id, page, total_pages = all.len(), "Skipping page out of range");
                }
            }
        }
        Ok(result)
    }
}

/// PDF documents, read through PDFium
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfPageReader;

/// Create a new Pdfium instance (dynamically linked).
///
/// Searches for libpdfium in:
/// 1. Current directory (./libpdfium.so)
/// 2. vendor/pdfium/lib/
/// 3. System library paths
fn create_pdfium(pages: &[u32]) -> ServiceResult<Pdfium> {
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(
                "./vendor/pdfium/lib/",
            ))
        })
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| {
            ServiceError::extraction(pages, format!("Failed to load PDFium library: {:?}", e))
        })?;

    Ok(Pdfium::new(bindings))
}

impl PageReader for PdfPageReader {
    fn page_count(&self, document: &DocumentHandle) -> ServiceResult<u32> {
        let pdfium = create_pdfium(&[])?;
        let pdf = pdfium
            .load_pdf_from_file(&document.path, None)
            .map_err(|e| ServiceError::extraction(&[], format!("Failed to load PDF: {:?}", e)))?;

        Ok(u32::from(pdf.pages().len()))
    }

    fn read_pages(
        &self,
        document: &DocumentHandle,
        pages: &PageRange,
    ) -> ServiceResult<Vec<PageText>> {
        let requested = pages.as_slice();
        let pdfium = create_pdfium(requested)?;
        let pdf = pdfium
            .load_pdf_from_file(&document.path, None)
            .map_err(|e| {
                ServiceError::extraction(requested, format!("Failed to load PDF: {:?}", e))
            })?;

        let page_count = u32::from(pdf.pages().len());
        let mut result = Vec::with_capacity(pages.len());

        for page_num in pages.iter() {
            if page_num < 1 || page_num > page_count {
                debug!(
                    doc_id = %document.id,
                    page = page_num,
                    total_pages = page_count,
                    "Skipping page out of range"
                );
                continue;
            }

            let page = pdf.pages().get((page_num - 1) as u16).map_err(|e| {
                warn!(doc_id = %document.id, page = page_num, error = ?e, "Failed to load PDF page");
                ServiceError::extraction(&[page_num], format!("Failed to load page: {:?}", e))
            })?;
            let text = page.text().map_err(|e| {
                ServiceError::extraction(
                    &[page_num],
                    format!("Failed to extract text from page {}: {:?}", page_num, e),
                )
            })?;

            result.push(PageText {
                page: page_num,
                text: text.all().trim().to_string(),
            });
        }

        Ok(result)
    }
}
