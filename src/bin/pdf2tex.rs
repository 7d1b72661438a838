//! CLI binary for edgequake-pdf2tex.
//!
//! A thin shim over the library crate: layer an optional JSON config file
//! and CLI flags onto `PipelineConfig`, run the pipeline, print a summary.
//! Exit code 0 means every page is converted, 2 means the run is partial
//! and a re-run will resume.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2tex::pipeline::resilience::Backoff;
use edgequake_pdf2tex::{
    convert, ChangeVerdict, ConverterBackend, FileConfig, PipelineConfig,
    PipelineProgressCallback, ProgressCallback, RunStatus,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: a spinner while rasterising, then a bar over the pages
/// scheduled for conversion, with one log line per page.
struct CliProgressCallback {
    bar: ProgressBar,
    page_started: Mutex<Option<Instant>>,
    rasterized: AtomicUsize,
    changed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            page_started: Mutex::new(None),
            rasterized: AtomicUsize::new(0),
            changed: AtomicUsize::new(0),
        })
    }

    fn page_elapsed(&self) -> f64 {
        self.page_started
            .lock()
            .ok()
            .and_then(|mut started| started.take())
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_pages: usize) {
        self.bar.set_prefix("Rendering");
        self.bar.set_message(format!("0/{total_pages} pages"));
    }

    fn on_page_rasterized(&self, _page: usize, _version: u32, verdict: Option<ChangeVerdict>) {
        let done = self.rasterized.fetch_add(1, Ordering::SeqCst) + 1;
        if !matches!(
            verdict,
            Some(ChangeVerdict::Unchanged) | Some(ChangeVerdict::Minor { .. })
        ) {
            self.changed.fetch_add(1, Ordering::SeqCst);
        }
        self.bar.set_message(format!("{done} pages"));
    }

    fn on_plan(&self, to_process: usize, total_pages: usize) {
        self.bar.println(format!(
            "{} {}  {}",
            cyan("◆"),
            bold(&format!("{to_process} of {total_pages} pages need conversion")),
            dim(&format!(
                "({} new or changed images)",
                self.changed.load(Ordering::SeqCst)
            )),
        ));

        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_length(to_process as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn on_page_start(&self, page: usize, _index: usize, _count: usize) {
        if let Ok(mut started) = self.page_started.lock() {
            *started = Some(Instant::now());
        }
        self.bar.set_message(format!("page {page}"));
    }

    fn on_page_complete(&self, page: usize, latex_len: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}  {:<8}  {}",
            green("✓"),
            page,
            dim(&format!("{latex_len:>5} chars")),
            dim(&format!("{:.1}s", self.page_elapsed())),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page: usize, error: &str) {
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}  {}",
            red("✗"),
            page,
            red(&msg)
        ));
    }

    fn on_run_complete(&self, status: RunStatus, processed: usize) {
        self.bar.finish_and_clear();
        match status {
            RunStatus::Complete => eprintln!(
                "{} {} pages converted, document finalized",
                green("✔"),
                bold(&processed.to_string())
            ),
            RunStatus::Partial => eprintln!(
                "{} {} pages converted; run is partial, re-run to resume",
                cyan("⚠"),
                bold(&processed.to_string())
            ),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert (or update) notes into ./output
  pdf2tex notes.pdf

  # Choose the output directory and model
  pdf2tex notes.pdf -o build/notes --model gpt-4.1-mini --provider openai

  # Dry run without an API key
  pdf2tex notes.pdf --backend dummy

  # Start over, ignoring the checkpoint
  pdf2tex notes.pdf --no-resume

  # Compile every page with xelatex and let the model repair errors
  pdf2tex notes.pdf --compile-and-fix

  # Settings from a JSON file, overridden by flags
  pdf2tex notes.pdf --config pdf2tex.json --dpi 200

OUTPUT LAYOUT:
  <output>/images/<stem>_page<N>.png   rendered pages (rewritten only when changed)
  <output>/latex/<prefix>_page<N>.tex  one LaTeX fragment per page
  <output>/main.tex                    master document with one \input per page
  <output>/checkpoint.json             version ledger used to resume

EXIT CODES:
  0  every page converted, master document finalized
  2  partial run (a page failed); re-run the same command to resume

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium
"#;

/// Incrementally convert PDFs of handwritten notes to LaTeX using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2tex",
    version,
    about = "Incrementally convert PDFs of handwritten notes to LaTeX using Vision LLMs",
    long_about = "Convert a PDF of handwritten notes to LaTeX one page at a time. Re-running \
after the PDF changes only reconverts pages whose rendered image visibly changed; everything \
else is reused from the previous run.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Output directory for images, fragments, master document and ledger.
    #[arg(short, long, env = "PDF2TEX_OUTPUT")]
    output: Option<PathBuf>,

    /// JSON config file; flags override its values.
    #[arg(long, env = "PDF2TEX_CONFIG")]
    config: Option<PathBuf>,

    /// Conversion backend: vision or dummy.
    #[arg(long, env = "PDF2TEX_BACKEND")]
    backend: Option<ConverterBackend>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–600).
    #[arg(long, env = "PDF2TEX_DPI",
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: Option<u32>,

    /// Re-render and reconvert every page regardless of image changes.
    #[arg(long, env = "PDF2TEX_NO_DIFF")]
    no_diff: bool,

    /// Per-pixel difference (0–255) that counts as changed.
    #[arg(long, env = "PDF2TEX_DIFF_THRESHOLD")]
    diff_threshold: Option<u8>,

    /// Smallest changed region, in pixels, that counts as a cluster.
    #[arg(long, env = "PDF2TEX_MIN_CLUSTER_SIZE")]
    min_cluster_size: Option<usize>,

    /// More clusters than this marks a page as changed.
    #[arg(long, env = "PDF2TEX_CHANGE_CLUSTERS")]
    change_clusters: Option<usize>,

    /// Pages rasterised in parallel.
    #[arg(long, env = "PDF2TEX_RENDER_WORKERS")]
    render_workers: Option<usize>,

    /// Ignore and clear the existing checkpoint.
    #[arg(long, env = "PDF2TEX_NO_RESUME")]
    no_resume: bool,

    /// Fragment file prefix (<prefix>_page<N>.tex).
    #[arg(long, env = "PDF2TEX_PREFIX")]
    prefix: Option<String>,

    /// Title of the master document.
    #[arg(long, env = "PDF2TEX_TITLE")]
    title: Option<String>,

    /// Do not head fragments with \section{Page N}.
    #[arg(long, env = "PDF2TEX_NO_SECTION")]
    no_section: bool,

    /// Write fragments only; leave main.tex alone.
    #[arg(long, env = "PDF2TEX_NO_MAIN_DOC")]
    no_main_doc: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2TEX_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PDF2TEX_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max LLM output tokens per page.
    #[arg(long, env = "PDF2TEX_MAX_TOKENS")]
    max_tokens: Option<usize>,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDF2TEX_TEMPERATURE")]
    temperature: Option<f32>,

    /// Retries per model call after the first attempt.
    #[arg(long, env = "PDF2TEX_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Base delay between retries, in milliseconds.
    #[arg(long, env = "PDF2TEX_RETRY_DELAY_MS")]
    retry_delay_ms: Option<u64>,

    /// Retry backoff: linear or exponential.
    #[arg(long, env = "PDF2TEX_BACKOFF")]
    backoff: Option<Backoff>,

    /// Model requests allowed per rate-limit window.
    #[arg(long, env = "PDF2TEX_RATE_LIMIT")]
    rate_limit: Option<usize>,

    /// Rate-limit window in seconds.
    #[arg(long, env = "PDF2TEX_RATE_WINDOW")]
    rate_window: Option<u64>,

    /// Compile each fragment and let the model fix errors.
    #[arg(long, env = "PDF2TEX_COMPILE_AND_FIX")]
    compile_and_fix: bool,

    /// LaTeX compiler program.
    #[arg(long, env = "PDF2TEX_COMPILER")]
    compiler: Option<String>,

    /// Fix rounds per page when compilation fails.
    #[arg(long, env = "PDF2TEX_MAX_FIX_ATTEMPTS")]
    max_fix_attempts: Option<u32>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF2TEX_DOWNLOAD_TIMEOUT")]
    download_timeout: Option<u64>,

    /// Print the run result as JSON on stdout.
    #[arg(long, env = "PDF2TEX_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2TEX_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2TEX_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2TEX_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs unless -v is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb).await?;
    let result = convert(&cli.input, &config)
        .await
        .context("Conversion failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&result).context("Failed to serialise result")?;
        println!("{json}");
    } else if !cli.quiet {
        let stats = &result.stats;
        eprintln!(
            "   {} converted  /  {} reused  /  {} failed  ·  {}ms total",
            stats.processed, stats.skipped, stats.failed, stats.total_duration_ms
        );
        for failure in &result.failures {
            eprintln!("   {} {}", red("✗"), failure);
        }
        if let Some(ref master) = result.main_document {
            eprintln!("   {}", bold(&master.display().to_string()));
        }
    }

    Ok(match result.status {
        RunStatus::Complete => ExitCode::SUCCESS,
        RunStatus::Partial => ExitCode::from(2),
    })
}

/// Map the config file and CLI args to `PipelineConfig`. Flags win.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder();

    if let Some(ref path) = cli.config {
        let file = FileConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?;
        builder = builder.apply_file(&file);
    }

    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }

    if let Some(ref v) = cli.output {
        builder = builder.output_dir(v);
    }
    if let Some(v) = cli.backend {
        builder = builder.backend(v);
    }
    if let Some(ref v) = cli.model {
        builder = builder.model(v);
    }
    if let Some(ref v) = cli.provider {
        builder = builder.provider_name(v);
    }
    if let Some(v) = cli.dpi {
        builder = builder.dpi(v);
    }
    if cli.no_diff {
        builder = builder.enable_diff_check(false);
    }
    if let Some(v) = cli.diff_threshold {
        builder = builder.diff_threshold(v);
    }
    if let Some(v) = cli.min_cluster_size {
        builder = builder.min_cluster_size(v);
    }
    if let Some(v) = cli.change_clusters {
        builder = builder.change_cluster_threshold(v);
    }
    if let Some(v) = cli.render_workers {
        builder = builder.render_workers(v);
    }
    if cli.no_resume {
        builder = builder.resume(false);
    }
    if let Some(ref v) = cli.prefix {
        builder = builder.section_prefix(v);
    }
    if let Some(ref v) = cli.title {
        builder = builder.doc_title(v);
    }
    if cli.no_section {
        builder = builder.wrap_in_section(false);
    }
    if cli.no_main_doc {
        builder = builder.create_main_doc(false);
    }
    if let Some(ref v) = cli.password {
        builder = builder.password(v);
    }
    if let Some(v) = cli.max_tokens {
        builder = builder.max_tokens(v);
    }
    if let Some(v) = cli.temperature {
        builder = builder.temperature(v);
    }
    if let Some(v) = cli.max_retries {
        builder = builder.max_retries(v);
    }
    if let Some(v) = cli.retry_delay_ms {
        builder = builder.retry_delay_ms(v);
    }
    if let Some(v) = cli.backoff {
        builder = builder.backoff(v);
    }
    // Either half of the rate limit may come from the config file.
    builder = builder.apply_file(&FileConfig {
        rate_limit_requests: cli.rate_limit,
        rate_limit_window_secs: cli.rate_window,
        ..Default::default()
    });
    if cli.compile_and_fix {
        builder = builder.compile_and_fix(true);
    }
    if let Some(ref v) = cli.compiler {
        builder = builder.compiler(v);
    }
    if let Some(v) = cli.max_fix_attempts {
        builder = builder.max_fix_attempts(v);
    }
    if let Some(v) = cli.download_timeout {
        builder = builder.download_timeout_secs(v);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
