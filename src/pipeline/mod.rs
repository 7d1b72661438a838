//! Pipeline stages for incremental PDF-to-LaTeX conversion.
//!
//! Each submodule implements one step and is testable on its own; the
//! orchestration (ledger, scheduling, resume) lives in [`crate::convert`].
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ diff ──▶ encode ──▶ llm ──▶ postprocess ──▶ compile ──▶ assemble
//! (URL/path) (pdfium) (clusters) (base64)  (VLM)    (cleanup)     (optional)  (master .tex)
//! ```
//!
//! 1. [`input`]  resolves the user-supplied path or URL to a local file
//! 2. [`render`] rasterises pages in `spawn_blocking` (pdfium is not
//!    async-safe) and saves a PNG only when [`diff`] reports a change
//! 3. [`encode`] base64-wraps a page PNG for the multimodal request
//! 4. [`llm`] makes one model call per page; [`resilience`] adds retry and
//!    rate limiting; [`dummy`] is the offline stand-in
//! 5. [`postprocess`] strips fences, preambles and chat noise
//! 6. [`compile`] optionally compiles each fragment and asks the model to
//!    repair it
//! 7. [`assemble`] writes fragments and splices `\input` lines into the
//!    master document

pub mod assemble;
pub mod compile;
pub mod diff;
pub mod dummy;
pub mod encode;
pub mod input;
pub mod llm;
pub mod postprocess;
pub mod render;
pub mod resilience;
