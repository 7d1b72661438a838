//! Configuration types for incremental PDF-to-LaTeX conversion.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. A [`FileConfig`] (JSON) can seed the
//! builder; the binary applies CLI flags on top of it.

use crate::error::Pdf2TexError;
use crate::pipeline::diff::{
    ChangeDetector, DEFAULT_CHANGE_CLUSTER_THRESHOLD, DEFAULT_MIN_CLUSTER_SIZE,
    DEFAULT_THRESHOLD,
};
use crate::pipeline::render::RasterOptions;
use crate::pipeline::resilience::{Backoff, RetryPolicy};
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Which page-conversion backend a run uses. Chosen once per pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConverterBackend {
    /// Vision language model through edgequake-llm.
    #[default]
    Vision,
    /// Deterministic placeholder LaTeX; no network, no API key.
    Dummy,
}

impl std::str::FromStr for ConverterBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vision" | "llm" | "vlm" => Ok(ConverterBackend::Vision),
            "dummy" => Ok(ConverterBackend::Dummy),
            other => Err(format!(
                "unknown backend '{other}' (expected 'vision' or 'dummy')"
            )),
        }
    }
}

/// Configuration for a pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdf2tex::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .output_dir("out")
///     .dpi(200)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    // ── Layout ────────────────────────────────────────────────────────────
    /// Root of all artifacts: `images/`, `latex/`, `main.tex`, the ledger.
    pub output_dir: PathBuf,

    /// Ledger file name inside `output_dir`. Default: `checkpoint.json`.
    pub ledger_file: String,

    /// Fragment file prefix: `latex/{prefix}_page{N}.tex`. Default: `notes`.
    pub section_prefix: String,

    /// Title written into a newly created master document.
    pub doc_title: String,

    /// Head each fragment with `\section{Page N}`. Default: true.
    pub wrap_in_section: bool,

    /// Maintain `main.tex`. When false, only fragments are produced.
    pub create_main_doc: bool,

    /// Reuse the ledger from a previous run. Default: true.
    ///
    /// When false the ledger file is deleted first, so every page is
    /// treated as new and reconverted.
    pub resume: bool,

    // ── Rasterisation and change detection ────────────────────────────────
    /// Rendering DPI. Range: 72–600. Default: 300.
    ///
    /// Handwriting needs more pixels than print: thin pencil strokes and
    /// small sub/superscripts vanish below ~200 DPI. Changing the DPI
    /// between runs changes image dimensions, which forces every page to be
    /// treated as changed.
    pub dpi: u32,

    /// Compare each new render with the stored image. Default: true.
    pub enable_diff_check: bool,

    /// Per-channel difference treated as noise. Default: 30.
    pub diff_threshold: u8,

    /// Minimum pixels for a changed region to count. Default: 10.
    pub min_cluster_size: usize,

    /// A page counts as changed with more than this many regions. Default: 2.
    pub change_cluster_threshold: usize,

    /// Pages rasterised concurrently. Default: 4.
    pub render_workers: usize,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    // ── Model ─────────────────────────────────────────────────────────────
    pub backend: ConverterBackend,

    /// LLM model identifier, e.g. "gpt-4o". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "gemini").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    ///
    /// Transcription wants the model faithful to what it sees, not creative.
    pub temperature: f32,

    /// Maximum tokens generated per page. Default: 4096.
    pub max_tokens: usize,

    /// Custom conversion system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    // ── Resilience ────────────────────────────────────────────────────────
    /// Retries after the first attempt on a transient failure. Default: 3.
    pub max_retries: u32,

    /// Base retry delay in milliseconds. Default: 500.
    pub retry_delay_ms: u64,

    /// Delay growth between retries. Default: exponential.
    pub backoff: Backoff,

    /// Model calls allowed per window. Default: 2.
    ///
    /// Free-tier vision endpoints commonly allow a handful of requests per
    /// minute; staying under that avoids 429s entirely.
    pub rate_limit_requests: usize,

    /// Rate-limit window in seconds. Default: 60.
    pub rate_limit_window_secs: u64,

    // ── Compile and fix ───────────────────────────────────────────────────
    /// Compile each fragment and ask the model to repair errors. Default: false.
    pub compile_and_fix: bool,

    /// LaTeX compiler program. Default: `xelatex`.
    pub compiler: String,

    /// Repair rounds per page before falling back to the last code. Default: 2.
    pub max_fix_attempts: u32,

    /// Compiler timeout in seconds. Default: 60.
    pub compile_timeout_secs: u64,

    // ── Observability ─────────────────────────────────────────────────────
    /// Optional progress callback. None means no events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            ledger_file: "checkpoint.json".into(),
            section_prefix: "notes".into(),
            doc_title: "Converted Notes".into(),
            wrap_in_section: true,
            create_main_doc: true,
            resume: true,
            dpi: 300,
            enable_diff_check: true,
            diff_threshold: DEFAULT_THRESHOLD,
            min_cluster_size: DEFAULT_MIN_CLUSTER_SIZE,
            change_cluster_threshold: DEFAULT_CHANGE_CLUSTER_THRESHOLD,
            render_workers: 4,
            password: None,
            download_timeout_secs: 120,
            backend: ConverterBackend::default(),
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            system_prompt: None,
            max_retries: 3,
            retry_delay_ms: 500,
            backoff: Backoff::default(),
            rate_limit_requests: 2,
            rate_limit_window_secs: 60,
            compile_and_fix: false,
            compiler: "xelatex".into(),
            max_fix_attempts: 2,
            compile_timeout_secs: 60,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("output_dir", &self.output_dir)
            .field("ledger_file", &self.ledger_file)
            .field("section_prefix", &self.section_prefix)
            .field("create_main_doc", &self.create_main_doc)
            .field("resume", &self.resume)
            .field("dpi", &self.dpi)
            .field("enable_diff_check", &self.enable_diff_check)
            .field("diff_threshold", &self.diff_threshold)
            .field("min_cluster_size", &self.min_cluster_size)
            .field("change_cluster_threshold", &self.change_cluster_threshold)
            .field("render_workers", &self.render_workers)
            .field("backend", &self.backend)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("rate_limit_requests", &self.rate_limit_requests)
            .field("rate_limit_window_secs", &self.rate_limit_window_secs)
            .field("compile_and_fix", &self.compile_and_fix)
            .field("compiler", &self.compiler)
            .field("max_fix_attempts", &self.max_fix_attempts)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn image_dir(&self) -> PathBuf {
        self.output_dir.join("images")
    }

    pub fn latex_dir(&self) -> PathBuf {
        self.output_dir.join("latex")
    }

    pub fn main_document_path(&self) -> PathBuf {
        self.output_dir.join("main.tex")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.output_dir.join(&self.ledger_file)
    }

    /// Rasterisation settings for [`crate::pipeline::render::rasterize_pages`].
    pub fn raster_options(&self) -> RasterOptions {
        RasterOptions {
            dpi: self.dpi,
            enable_diff_check: self.enable_diff_check,
            detector: ChangeDetector::new(self.diff_threshold, self.min_cluster_size),
            change_cluster_threshold: self.change_cluster_threshold,
            workers: self.render_workers,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.max_retries)
            .with_base_delay(Duration::from_millis(self.retry_delay_ms))
            .with_backoff(self.backoff)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn ledger_file(mut self, name: impl Into<String>) -> Self {
        self.config.ledger_file = name.into();
        self
    }

    pub fn section_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.section_prefix = prefix.into();
        self
    }

    pub fn doc_title(mut self, title: impl Into<String>) -> Self {
        self.config.doc_title = title.into();
        self
    }

    pub fn wrap_in_section(mut self, v: bool) -> Self {
        self.config.wrap_in_section = v;
        self
    }

    pub fn create_main_doc(mut self, v: bool) -> Self {
        self.config.create_main_doc = v;
        self
    }

    pub fn resume(mut self, v: bool) -> Self {
        self.config.resume = v;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn enable_diff_check(mut self, v: bool) -> Self {
        self.config.enable_diff_check = v;
        self
    }

    pub fn diff_threshold(mut self, t: u8) -> Self {
        self.config.diff_threshold = t;
        self
    }

    pub fn min_cluster_size(mut self, n: usize) -> Self {
        self.config.min_cluster_size = n.max(1);
        self
    }

    pub fn change_cluster_threshold(mut self, n: usize) -> Self {
        self.config.change_cluster_threshold = n;
        self
    }

    pub fn render_workers(mut self, n: usize) -> Self {
        self.config.render_workers = n.max(1);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn backend(mut self, backend: ConverterBackend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn rate_limit(mut self, requests: usize, window_secs: u64) -> Self {
        self.config.rate_limit_requests = requests.max(1);
        self.config.rate_limit_window_secs = window_secs;
        self
    }

    pub fn compile_and_fix(mut self, v: bool) -> Self {
        self.config.compile_and_fix = v;
        self
    }

    pub fn compiler(mut self, program: impl Into<String>) -> Self {
        self.config.compiler = program.into();
        self
    }

    pub fn max_fix_attempts(mut self, n: u32) -> Self {
        self.config.max_fix_attempts = n;
        self
    }

    pub fn compile_timeout_secs(mut self, secs: u64) -> Self {
        self.config.compile_timeout_secs = secs.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Apply every field set in `file` over the current values.
    pub fn apply_file(mut self, file: &FileConfig) -> Self {
        if let Some(v) = &file.output_dir {
            self = self.output_dir(v);
        }
        if let Some(v) = &file.ledger_file {
            self = self.ledger_file(v);
        }
        if let Some(v) = &file.section_prefix {
            self = self.section_prefix(v);
        }
        if let Some(v) = &file.doc_title {
            self = self.doc_title(v);
        }
        if let Some(v) = file.wrap_in_section {
            self = self.wrap_in_section(v);
        }
        if let Some(v) = file.create_main_doc {
            self = self.create_main_doc(v);
        }
        if let Some(v) = file.resume {
            self = self.resume(v);
        }
        if let Some(v) = file.dpi {
            self = self.dpi(v);
        }
        if let Some(v) = file.enable_diff_check {
            self = self.enable_diff_check(v);
        }
        if let Some(v) = file.diff_threshold {
            self = self.diff_threshold(v);
        }
        if let Some(v) = file.min_cluster_size {
            self = self.min_cluster_size(v);
        }
        if let Some(v) = file.change_cluster_threshold {
            self = self.change_cluster_threshold(v);
        }
        if let Some(v) = file.render_workers {
            self = self.render_workers(v);
        }
        if let Some(v) = file.backend {
            self = self.backend(v);
        }
        if let Some(v) = &file.model {
            self = self.model(v);
        }
        if let Some(v) = &file.provider {
            self = self.provider_name(v);
        }
        if let Some(v) = file.temperature {
            self = self.temperature(v);
        }
        if let Some(v) = file.max_tokens {
            self = self.max_tokens(v);
        }
        if let Some(v) = &file.system_prompt {
            self = self.system_prompt(v);
        }
        if let Some(v) = file.max_retries {
            self = self.max_retries(v);
        }
        if let Some(v) = file.retry_delay_ms {
            self = self.retry_delay_ms(v);
        }
        if let Some(v) = file.backoff {
            self = self.backoff(v);
        }
        if file.rate_limit_requests.is_some() || file.rate_limit_window_secs.is_some() {
            let requests = file
                .rate_limit_requests
                .unwrap_or(self.config.rate_limit_requests);
            let window = file
                .rate_limit_window_secs
                .unwrap_or(self.config.rate_limit_window_secs);
            self = self.rate_limit(requests, window);
        }
        if let Some(v) = file.compile_and_fix {
            self = self.compile_and_fix(v);
        }
        if let Some(v) = &file.compiler {
            self = self.compiler(v);
        }
        if let Some(v) = file.max_fix_attempts {
            self = self.max_fix_attempts(v);
        }
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, Pdf2TexError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(Pdf2TexError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.render_workers == 0 {
            return Err(Pdf2TexError::InvalidConfig(
                "Render workers must be ≥ 1".into(),
            ));
        }
        if c.rate_limit_requests == 0 {
            return Err(Pdf2TexError::InvalidConfig(
                "Rate limit must allow ≥ 1 request per window".into(),
            ));
        }
        if c.section_prefix.is_empty() || c.section_prefix.contains(['/', '\\']) {
            return Err(Pdf2TexError::InvalidConfig(format!(
                "Section prefix must be a non-empty file name, got '{}'",
                c.section_prefix
            )));
        }
        if c.ledger_file.is_empty() {
            return Err(Pdf2TexError::InvalidConfig(
                "Ledger file name must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Optional on-disk configuration (JSON). Every field is optional; unset
/// fields keep the builder's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub ledger_file: Option<String>,
    pub section_prefix: Option<String>,
    pub doc_title: Option<String>,
    pub wrap_in_section: Option<bool>,
    pub create_main_doc: Option<bool>,
    pub resume: Option<bool>,
    pub dpi: Option<u32>,
    pub enable_diff_check: Option<bool>,
    pub diff_threshold: Option<u8>,
    pub min_cluster_size: Option<usize>,
    pub change_cluster_threshold: Option<usize>,
    pub render_workers: Option<usize>,
    pub backend: Option<ConverterBackend>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub system_prompt: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub backoff: Option<Backoff>,
    pub rate_limit_requests: Option<usize>,
    pub rate_limit_window_secs: Option<u64>,
    pub compile_and_fix: Option<bool>,
    pub compiler: Option<String>,
    pub max_fix_attempts: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, Pdf2TexError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Pdf2TexError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            Pdf2TexError::InvalidConfig(format!("invalid config {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.dpi, 300);
        assert_eq!(c.section_prefix, "notes");
        assert_eq!(c.doc_title, "Converted Notes");
        assert_eq!(c.render_workers, 4);
        assert_eq!(c.rate_limit_requests, 2);
        assert_eq!(c.rate_limit_window_secs, 60);
        assert_eq!(c.max_fix_attempts, 2);
        assert!(c.resume && c.enable_diff_check && c.create_main_doc);
        assert_eq!(c.ledger_path(), PathBuf::from("output/checkpoint.json"));
    }

    #[test]
    fn builder_clamps_out_of_range_values() {
        let c = PipelineConfig::builder()
            .dpi(5000)
            .render_workers(0)
            .temperature(9.0)
            .rate_limit(0, 30)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 600);
        assert_eq!(c.render_workers, 1);
        assert_eq!(c.temperature, 2.0);
        assert_eq!(c.rate_limit_requests, 1);
    }

    #[test]
    fn raster_options_follow_config() {
        let c = PipelineConfig::builder()
            .dpi(150)
            .diff_threshold(40)
            .min_cluster_size(9)
            .change_cluster_threshold(5)
            .render_workers(3)
            .build()
            .unwrap();
        let o = c.raster_options();
        assert_eq!(o.dpi, 150);
        assert_eq!(o.detector.threshold, 40);
        assert_eq!(o.detector.min_cluster_size, 9);
        assert_eq!(o.change_cluster_threshold, 5);
        assert_eq!(o.workers, 3);
        assert!(o.enable_diff_check);
    }

    #[test]
    fn build_rejects_path_like_prefix() {
        let err = PipelineConfig::builder()
            .section_prefix("../evil")
            .build()
            .unwrap_err();
        assert!(matches!(err, Pdf2TexError::InvalidConfig(_)));
    }

    #[test]
    fn file_config_overrides_only_set_fields() {
        let file: FileConfig = serde_json::from_str(
            r#"{"dpi": 150, "backend": "dummy", "backoff": "linear", "rate_limit_window_secs": 10}"#,
        )
        .unwrap();
        let c = PipelineConfig::builder()
            .section_prefix("lecture")
            .apply_file(&file)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 150);
        assert_eq!(c.backend, ConverterBackend::Dummy);
        assert_eq!(c.backoff, Backoff::Linear);
        assert_eq!(c.rate_limit_window_secs, 10);
        assert_eq!(c.rate_limit_requests, 2);
        assert_eq!(c.section_prefix, "lecture");
    }

    #[test]
    fn file_config_rejects_unknown_keys() {
        assert!(serde_json::from_str::<FileConfig>(r#"{"dpii": 1}"#).is_err());
    }

    #[test]
    fn backend_parses_from_str() {
        assert_eq!("Dummy".parse::<ConverterBackend>().unwrap(), ConverterBackend::Dummy);
        assert_eq!("vlm".parse::<ConverterBackend>().unwrap(), ConverterBackend::Vision);
        assert!("gpt".parse::<ConverterBackend>().is_err());
    }
}
