//! Error types for the edgequake-pdf2tex library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`Pdf2TexError`] is **fatal**: the run cannot start or cannot continue
//!   safely (bad input file, unreadable ledger, corrupt master document,
//!   provider not configured). Returned as `Err(Pdf2TexError)` from
//!   [`crate::convert::Pipeline::run`].
//!
//! * [`PageError`] is **page-local**: one page failed to render or convert.
//!   A render failure is collected and the run continues; a conversion
//!   failure stops the sequential loop and the run ends as
//!   [`crate::output::RunStatus::Partial`]. Either way the error travels
//!   inside [`crate::output::PipelineResult`], not as an `Err`.
//!
//! * [`BackendError`] means **one model call** failed. Transient failures are
//!   retried by [`crate::pipeline::resilience::ResilientConverter`];
//!   permanent ones (bad key, refused request) are surfaced immediately.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2tex library.
#[derive(Debug, Error)]
pub enum Pdf2TexError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was supplied but pdfium rejected it.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// pdfium could not render a page (raised per page, collected as [`PageError`]).
    #[error("Page {page}: pdfium failed to render: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Install libpdfium, place it next to the binary, or set PDFIUM_LIB_PATH."
    )]
    PdfiumBindingFailed(String),

    // ── Ledger errors ─────────────────────────────────────────────────────
    /// The ledger file exists but could not be read or written.
    #[error("Ledger I/O failed for '{path}': {source}")]
    LedgerIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The ledger file exists but does not parse as a ledger.
    #[error("Ledger '{path}' is corrupt: {detail}\nRe-run with --no-resume to rebuild it.")]
    LedgerCorrupt { path: PathBuf, detail: String },

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or write an output file (image, fragment, master).
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The master document has no `\end{document}` marker to insert before.
    #[error("Master document '{path}' is missing its \\end{{document}} marker; refusing to edit it")]
    MasterDocumentCorrupt { path: PathBuf },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Compiler errors ───────────────────────────────────────────────────
    /// The LaTeX compiler could not be started at all.
    #[error("LaTeX compiler '{program}' could not be started: {detail}")]
    CompilerUnavailable { program: String, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A page-local error.
///
/// Render failures are collected while the other pages keep going;
/// conversion failures end the run as partial. Both are reported through
/// [`crate::output::PipelineResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Page rasterisation (or saving its image) failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The model call failed terminally.
    #[error("Page {page}: conversion failed after {attempts} attempt(s): {detail}")]
    ConversionFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// The fragment file could not be written.
    #[error("Page {page}: could not write fragment: {detail}")]
    WriteFailed { page: usize, detail: String },

    /// The fragment could not be added to the master document.
    #[error("Page {page}: could not update master document: {detail}")]
    AssemblyFailed { page: usize, detail: String },
}

impl PageError {
    /// 1-indexed page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::ConversionFailed { page, .. }
            | PageError::WriteFailed { page, .. }
            | PageError::AssemblyFailed { page, .. } => *page,
        }
    }
}

/// Failure of a single call to a model backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Worth retrying: timeouts, 429s, 5xx, dropped connections.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Retrying will not help: bad credentials, malformed request, refusal.
    #[error("permanent backend failure: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    /// Classify a provider error message.
    ///
    /// edgequake-llm reports failures as display strings; authentication
    /// and request-shape problems are the only ones known to be permanent.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let permanent = [
            "401",
            "403",
            "unauthorized",
            "authentication",
            "invalid api key",
            "invalid_api_key",
            "content_filter",
        ];
        if permanent.iter().any(|p| lower.contains(p)) {
            BackendError::Permanent(message)
        } else {
            BackendError::Transient(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_corrupt_display_mentions_marker() {
        let e = Pdf2TexError::MasterDocumentCorrupt {
            path: PathBuf::from("out/main.tex"),
        };
        let msg = e.to_string();
        assert!(msg.contains("\\end{document}"), "got: {msg}");
        assert!(msg.contains("out/main.tex"));
    }

    #[test]
    fn ledger_corrupt_display_suggests_no_resume() {
        let e = Pdf2TexError::LedgerCorrupt {
            path: PathBuf::from("checkpoint.json"),
            detail: "duplicate page 3".into(),
        };
        assert!(e.to_string().contains("--no-resume"));
    }

    #[test]
    fn page_error_reports_its_page() {
        let e = PageError::ConversionFailed {
            page: 7,
            attempts: 3,
            detail: "timeout".into(),
        };
        assert_eq!(e.page(), 7);
        assert!(e.to_string().contains("3 attempt(s)"));
    }

    #[test]
    fn classify_auth_failures_as_permanent() {
        assert!(!BackendError::classify("HTTP 401 Unauthorized").is_retryable());
        assert!(!BackendError::classify("Invalid API key provided").is_retryable());
        assert!(BackendError::classify("HTTP 429 Too Many Requests").is_retryable());
        assert!(BackendError::classify("connection reset by peer").is_retryable());
    }
}
