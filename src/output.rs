//! Result types returned by [`crate::convert::Pipeline::run`].

use crate::error::PageError;
use crate::ledger::Ledger;
use serde::Serialize;
use std::path::PathBuf;

/// How far a run got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every page is converted and the master document is finalized.
    Complete,
    /// The run stopped early or some pages failed; progress is preserved
    /// and a re-run resumes from the ledger.
    Partial,
}

/// Counters and timings for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Pages in the document.
    pub total_pages: usize,
    /// Pages rasterised without error.
    pub rasterized: usize,
    /// Pages whose image was (re)written this run.
    pub images_updated: usize,
    /// Pages scheduled for conversion.
    pub scheduled: usize,
    /// Pages converted successfully this run.
    pub processed: usize,
    /// Up-to-date pages reused as-is.
    pub skipped: usize,
    /// Pages that failed (rasterisation or conversion).
    pub failed: usize,
    pub render_duration_ms: u64,
    pub convert_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub status: RunStatus,
    /// Source identity the ledger is keyed on (path or URL as given).
    pub source: String,
    /// Page images, ascending by page.
    pub images: Vec<PathBuf>,
    /// Fragment files that exist for converted pages, ascending by page.
    pub fragments: Vec<PathBuf>,
    /// The master document, once it exists.
    pub main_document: Option<PathBuf>,
    /// Ledger state at the end of the run.
    pub ledger: Ledger,
    /// Page failures; a conversion failure is always the last entry.
    pub failures: Vec<PageError>,
    pub stats: RunStats,
}

impl PipelineResult {
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Complete
    }
}
