//! # edgequake-pdf2tex
//!
//! Incrementally convert PDFs of handwritten notes to LaTeX using Vision
//! Language Models (VLMs).
//!
//! ## Incremental runs
//!
//! Lecture notes grow. A 40-page notebook gets two new pages and a
//! correction on page 7, and re-sending every page to a model costs quota
//! and overwrites LaTeX you already fixed by hand. This crate keeps a
//! per-page version ledger next to the output and only reconverts pages
//! whose rendered image *visibly* changed. Rendering noise (anti-aliasing,
//! a stray pixel) is absorbed by a cluster-based change detector.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     resolve local file or download from URL
//!  ├─ 2. Render    rasterise every page via pdfium (spawn_blocking pool)
//!  ├─ 3. Diff      keep the old PNG unless enough pixel clusters changed
//!  ├─ 4. Schedule  compare image/LaTeX versions in the ledger
//!  ├─ 5. Convert   stale pages only, one at a time, rate limited + retried
//!  ├─ 6. Repair    optional xelatex compile + model fix rounds
//!  └─ 7. Assemble  fragment files + idempotent \input lines in main.tex
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2tex::{convert, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::builder().output_dir("notes_out").build()?;
//!     let result = convert("notes.pdf", &config).await?;
//!     eprintln!(
//!         "{:?}: {} converted, {} reused",
//!         result.status, result.stats.processed, result.stats.skipped
//!     );
//!     Ok(())
//! }
//! ```
//!
//! Run it again after editing the PDF and only the changed pages are sent.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2tex` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ```toml
//! edgequake-pdf2tex = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod ledger;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod schedule;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConverterBackend, FileConfig, PipelineConfig, PipelineConfigBuilder};
pub use convert::{convert, convert_sync, Pipeline};
pub use error::{BackendError, PageError, Pdf2TexError};
pub use ledger::{Ledger, LedgerStore, PageEntry, PageUpdate};
pub use output::{PipelineResult, RunStats, RunStatus};
pub use pipeline::diff::{ChangeDetector, ChangeVerdict, Cluster};
pub use pipeline::dummy::DummyConverter;
pub use pipeline::llm::PageConverter;
pub use pipeline::render::PageRasterizer;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
