//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline rasterises, plans and converts pages.
//!
//! Callers can forward events to a channel, a terminal progress bar or a log.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2tex::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     converted: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page: usize, latex_len: usize) {
//!         self.converted.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {} converted ({} bytes)", page, latex_len);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { converted: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::RunStatus;
use crate::pipeline::diff::ChangeVerdict;
use std::sync::Arc;

/// Called by the pipeline as it works through a document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// `on_page_rasterized` is called from the rasterisation stage, whose pages
/// complete in any order. All other events are emitted from the sequential
/// conversion loop.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once the page count is known, before rasterisation.
    fn on_run_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called for every successfully rasterised page.
    ///
    /// `verdict` is `None` when no comparison was made (first render, or
    /// change detection disabled).
    fn on_page_rasterized(&self, page: usize, version: u32, verdict: Option<ChangeVerdict>) {
        let _ = (page, version, verdict);
    }

    /// Called after planning with the number of pages needing conversion.
    fn on_plan(&self, to_process: usize, total_pages: usize) {
        let _ = (to_process, total_pages);
    }

    /// Called just before the model request is sent for a page.
    ///
    /// `index` counts from 1 up to `count`, the pages scheduled this run.
    fn on_page_start(&self, page: usize, index: usize, count: usize) {
        let _ = (page, index, count);
    }

    /// Called when a page's fragment has been written and recorded.
    fn on_page_complete(&self, page: usize, latex_len: usize) {
        let _ = (page, latex_len);
    }

    /// Called for an up-to-date page that is reused without a model call.
    fn on_page_skipped(&self, page: usize) {
        let _ = page;
    }

    /// Called when a page fails to rasterise or convert.
    fn on_page_error(&self, page: usize, error: &str) {
        let _ = (page, error);
    }

    /// Called once at the end of a run.
    fn on_run_complete(&self, status: RunStatus, processed: usize) {
        let _ = (status, processed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        skips: AtomicUsize,
        errors: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_page_start(&self, _page: usize, _index: usize, _count: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page: usize, _latex_len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_skipped(&self, _page: usize) {
            self.skips.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(5);
        cb.on_page_rasterized(1, 2, Some(ChangeVerdict::Changed { clusters: 4 }));
        cb.on_plan(1, 5);
        cb.on_page_start(1, 1, 1);
        cb.on_page_complete(1, 42);
        cb.on_page_skipped(2);
        cb.on_page_error(3, "some error");
        cb.on_run_complete(RunStatus::Partial, 1);
    }

    #[test]
    fn arc_dyn_callback_receives_events() {
        let tracker = Arc::new(TrackingCallback::default());
        let cb: ProgressCallback = tracker.clone();
        cb.on_page_start(1, 1, 2);
        cb.on_page_complete(1, 100);
        cb.on_page_skipped(2);
        cb.on_page_start(3, 2, 2);
        cb.on_page_error(3, "VLM timeout");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.skips.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }
}
