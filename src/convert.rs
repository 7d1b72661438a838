//! The incremental run loop.
//!
//! A run rasterises every page, lets the change detector decide which
//! images got a new version, asks [`crate::schedule::plan`] which pages are
//! stale, and converts those one at a time. The ledger is persisted after
//! every page-level transition, so killing the process at any point loses
//! at most the page in flight and a re-run picks up where it stopped.
//!
//! ## Per-page write order
//!
//! fragment file → master `\input` line → ledger entry → ledger file.
//! A ledger entry therefore never claims a fragment that is not on disk.
//!
//! Rasterisation writes in the opposite direction: a new image version is
//! persisted to the ledger before its PNG replaces the stored one, so a
//! stored PNG never runs ahead of the ledger.

use crate::config::{ConverterBackend, PipelineConfig};
use crate::error::{PageError, Pdf2TexError};
use crate::ledger::{Ledger, LedgerStore, PageUpdate};
use crate::output::{PipelineResult, RunStats, RunStatus};
use crate::pipeline::compile::{self, LatexCompiler, LatexFixer, XelatexCompiler};
use crate::pipeline::dummy::DummyConverter;
use crate::pipeline::llm::{LlmLatexFixer, PageConverter, SamplingOptions, VisionConverter};
use crate::pipeline::render::{self, PageRasterizer, PdfiumRasterizer};
use crate::pipeline::resilience::{RateLimiter, Resilience, ResilientConverter, ResilientFixer};
use crate::pipeline::{assemble, input, postprocess};
use crate::progress::{NoopProgressCallback, PipelineProgressCallback};
use crate::schedule::{self, WorkReason};
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A configured conversion pipeline.
///
/// Build one with [`Pipeline::from_config`] for the real collaborators
/// (pdfium, a vision model, xelatex), or with [`Pipeline::new`] to inject
/// your own rasterizer and converter.
pub struct Pipeline {
    config: PipelineConfig,
    rasterizer: Arc<dyn PageRasterizer>,
    converter: ResilientConverter,
    limiter: Arc<RateLimiter>,
    repair: Option<(Arc<dyn LatexCompiler>, Arc<dyn LatexFixer>)>,
}

impl Pipeline {
    /// Wrap `converter` in the configured retry policy and rate limit.
    pub fn new(
        config: PipelineConfig,
        rasterizer: Arc<dyn PageRasterizer>,
        converter: Arc<dyn PageConverter>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_requests,
            config.rate_limit_window(),
        ));
        let resilience = Resilience::new(config.retry_policy(), Some(Arc::clone(&limiter)));
        Self {
            converter: ResilientConverter::new(converter, resilience),
            config,
            rasterizer,
            limiter,
            repair: None,
        }
    }

    /// Enable compile-and-fix. The fixer shares the converter's rate limit.
    pub fn with_compile_and_fix(
        mut self,
        compiler: Arc<dyn LatexCompiler>,
        fixer: Arc<dyn LatexFixer>,
    ) -> Self {
        let resilience = Resilience::new(
            self.config.retry_policy(),
            Some(Arc::clone(&self.limiter)),
        );
        let fixer: Arc<dyn LatexFixer> = Arc::new(ResilientFixer::new(fixer, resilience));
        self.repair = Some((compiler, fixer));
        self
    }

    /// Build the pipeline from configuration alone.
    ///
    /// A model provider is resolved only when something needs one: the
    /// vision backend, or compile-and-fix.
    pub async fn from_config(config: PipelineConfig) -> Result<Self, Pdf2TexError> {
        let rasterizer: Arc<dyn PageRasterizer> =
            Arc::new(PdfiumRasterizer::new(config.password.clone())?);
        let sampling = SamplingOptions {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };

        let (converter, provider): (Arc<dyn PageConverter>, Option<Arc<dyn LLMProvider>>) =
            match config.backend {
                ConverterBackend::Vision => {
                    let provider = resolve_provider(&config).await?;
                    info!(
                        "Using vision backend (provider {}, model {})",
                        config.provider_name.as_deref().unwrap_or("auto"),
                        config.model.as_deref().unwrap_or("default")
                    );
                    let converter = VisionConverter::new(
                        Arc::clone(&provider),
                        config.system_prompt.clone(),
                        sampling,
                    );
                    (Arc::new(converter), Some(provider))
                }
                ConverterBackend::Dummy => {
                    info!("Using dummy backend; no model calls will be made");
                    (Arc::new(DummyConverter), None)
                }
            };

        let compile_and_fix = config.compile_and_fix;
        let compiler = XelatexCompiler::new(
            config.compiler.clone(),
            Duration::from_secs(config.compile_timeout_secs),
        );
        let pipeline = Self::new(config, rasterizer, converter);

        if !compile_and_fix {
            return Ok(pipeline);
        }
        match provider {
            Some(provider) => {
                let fixer = LlmLatexFixer::new(provider, sampling);
                Ok(pipeline.with_compile_and_fix(Arc::new(compiler), Arc::new(fixer)))
            }
            None => {
                warn!("Compile-and-fix needs a model provider; disabled for the dummy backend");
                Ok(pipeline)
            }
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Bring the output directory up to date with `input`.
    ///
    /// A run that stops early (a page fails to rasterise or convert)
    /// still returns `Ok` with [`RunStatus::Partial`]; `Err` is reserved for
    /// failures that leave nothing to resume from, such as an unreadable
    /// PDF, a corrupt ledger or a master document without `\end{document}`.
    pub async fn run(&self, input_str: &str) -> Result<PipelineResult, Pdf2TexError> {
        let total_start = Instant::now();
        let cb = self.progress();
        let config = &self.config;
        info!("Starting run: {}", input_str);

        // ── Step 1: Resolve input and ledger ─────────────────────────────
        let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
        let pdf_path = resolved.path().to_path_buf();
        let stem = resolved.stem();

        let store = LedgerStore::new(config.ledger_path());
        let mut ledger = self.load_ledger(&store, input_str)?;
        let known_before: BTreeSet<usize> = ledger.entries().map(|e| e.page).collect();

        let total_pages = render::page_count(Arc::clone(&self.rasterizer), &pdf_path).await?;
        info!("PDF has {} pages", total_pages);
        cb.on_run_start(total_pages);

        // ── Step 2: Rasterise and version images ─────────────────────────
        let render_start = Instant::now();
        let pages: Vec<usize> = (1..=total_pages).collect();
        let outcome = render::rasterize_pages(
            Arc::clone(&self.rasterizer),
            &pdf_path,
            &config.image_dir(),
            &stem,
            &pages,
            &ledger.image_versions(),
            &config.raster_options(),
            |rasterized| {
                let previous = ledger.get(rasterized.page).map_or(0, |e| e.image_version);
                ledger.upsert(
                    rasterized.page,
                    PageUpdate::image(rasterized.version, rasterized.version > previous),
                );
                store.persist(&mut ledger)?;
                cb.on_page_rasterized(rasterized.page, rasterized.version, rasterized.verdict);
                Ok(())
            },
        )
        .await?;
        let render_duration_ms = render_start.elapsed().as_millis() as u64;

        for failure in &outcome.failures {
            cb.on_page_error(failure.page(), &failure.to_string());
        }

        // ── Step 3: Plan ─────────────────────────────────────────────────
        let latex_dir = config.latex_dir();
        let rasterized_pages: Vec<usize> = outcome.pages.iter().map(|p| p.page).collect();
        let plan = schedule::plan(&ledger, &known_before, &rasterized_pages, |page| {
            assemble::fragment_path(&latex_dir, &config.section_prefix, page).exists()
        });
        let work = plan.pages_to_process();
        info!(
            "{} of {} pages need conversion",
            work.len(),
            rasterized_pages.len()
        );
        cb.on_plan(work.len(), total_pages);

        if !work.is_empty() || !outcome.failures.is_empty() {
            ledger.main_document_finalized = false;
            store.persist(&mut ledger)?;
        }

        // ── Step 4: Convert stale pages in order ─────────────────────────
        let master = config.main_document_path();
        let mut fragments: Vec<PathBuf> = Vec::new();
        let mut failures: Vec<PageError> = outcome.failures.clone();
        let mut started = 0usize;
        let mut processed = 0usize;
        let mut skipped = 0usize;
        let mut stopped = false;
        let convert_start = Instant::now();

        for planned in &plan.pages {
            let page = planned.page;
            let fragment = assemble::fragment_path(&latex_dir, &config.section_prefix, page);

            if planned.reason == WorkReason::UpToDate {
                debug!("Page {}: up to date", page);
                if let Err(e) = self.include_in_master(page, &fragment, &master) {
                    stopped = self.page_failed(e, cb, &mut failures)?;
                    break;
                }
                fragments.push(fragment);
                skipped += 1;
                cb.on_page_skipped(page);
                continue;
            }

            started += 1;
            info!("Page {}: converting ({:?})", page, planned.reason);
            cb.on_page_start(page, started, work.len());

            let image = render::image_path(&config.image_dir(), &stem, page);
            let raw = match self.converter.convert_page(page, &image).await {
                Ok(raw) => raw,
                Err(failure) => {
                    let err = PageError::ConversionFailed {
                        page,
                        attempts: failure.attempts,
                        detail: failure.error.to_string(),
                    };
                    stopped = self.page_failed(PageFailure::Page(err), cb, &mut failures)?;
                    break;
                }
            };

            let mut body = postprocess::clean_latex(&raw);
            if let Some((compiler, fixer)) = &self.repair {
                body = compile::compile_and_fix(
                    page,
                    &body,
                    compiler.as_ref(),
                    fixer.as_ref(),
                    config.max_fix_attempts,
                )
                .await;
            }

            let saved = assemble::save_fragment(
                &latex_dir,
                &config.section_prefix,
                page,
                &body,
                config.wrap_in_section,
            )
            .map_err(|e| {
                PageFailure::Page(PageError::WriteFailed {
                    page,
                    detail: e.to_string(),
                })
            })
            .and_then(|path| self.include_in_master(page, &path, &master).map(|_| path));
            let saved = match saved {
                Ok(path) => path,
                Err(e) => {
                    stopped = self.page_failed(e, cb, &mut failures)?;
                    break;
                }
            };

            let image_version = ledger.get(page).map_or(0, |e| e.image_version);
            ledger.upsert(page, PageUpdate::latex_done(image_version));
            store.persist(&mut ledger)?;
            fragments.push(saved);
            processed += 1;
            cb.on_page_complete(page, body.len());

            let elapsed = convert_start.elapsed();
            let average = elapsed / processed as u32;
            let remaining = work.len().saturating_sub(processed);
            info!(
                "Page {}: done ({}/{}); avg {:.1}s/page, ETA {:.0}s",
                page,
                processed,
                work.len(),
                average.as_secs_f64(),
                (average * remaining as u32).as_secs_f64()
            );
        }
        let convert_duration_ms = convert_start.elapsed().as_millis() as u64;

        // ── Step 5: Finalise ─────────────────────────────────────────────
        let status = if stopped || !outcome.failures.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Complete
        };

        if !stopped {
            if config.create_main_doc {
                self.finalize_master(&fragments, &master)?;
            }
            if status == RunStatus::Complete {
                ledger.main_document_finalized = true;
                ledger.main_document_path = config
                    .create_main_doc
                    .then(|| master.to_string_lossy().into_owned());
            }
            store.persist(&mut ledger)?;
        }

        let stats = RunStats {
            total_pages,
            rasterized: outcome.pages.len(),
            images_updated: outcome.pages.iter().filter(|p| p.updated).count(),
            scheduled: work.len(),
            processed,
            skipped,
            failed: failures.len(),
            render_duration_ms,
            convert_duration_ms,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
        };

        match status {
            RunStatus::Complete => info!(
                "Run complete: {} converted, {} reused, {}ms",
                processed, skipped, stats.total_duration_ms
            ),
            RunStatus::Partial => warn!(
                "Run partial: {} converted, {} failed; re-run to resume",
                processed,
                failures.len()
            ),
        }
        cb.on_run_complete(status, processed);

        let main_document = (config.create_main_doc && master.exists()).then_some(master);
        Ok(PipelineResult {
            status,
            source: input_str.to_string(),
            images: outcome.image_paths(),
            fragments,
            main_document,
            ledger,
            failures,
            stats,
        })
    }

    fn progress(&self) -> &dyn PipelineProgressCallback {
        match &self.config.progress_callback {
            Some(cb) => &**cb,
            None => &NoopProgressCallback,
        }
    }

    fn load_ledger(&self, store: &LedgerStore, source: &str) -> Result<Ledger, Pdf2TexError> {
        if !self.config.resume {
            info!("Resume disabled; clearing {}", store.path().display());
            store.clear()?;
            return Ok(Ledger::new(source));
        }
        match store.load()? {
            Some(ledger) if ledger.source == source => {
                info!(
                    "Resuming from {} ({} pages recorded)",
                    store.path().display(),
                    ledger.len()
                );
                Ok(ledger)
            }
            Some(ledger) => {
                warn!(
                    "Ledger {} belongs to '{}', not '{}'; starting fresh",
                    store.path().display(),
                    ledger.source,
                    source
                );
                Ok(Ledger::new(source))
            }
            None => Ok(Ledger::new(source)),
        }
    }

    fn include_in_master(
        &self,
        page: usize,
        fragment: &Path,
        master: &Path,
    ) -> Result<(), PageFailure> {
        if !self.config.create_main_doc {
            return Ok(());
        }
        assemble::append_fragment(fragment, master, &self.config.doc_title)
            .map(|_| ())
            .map_err(|e| match e {
                Pdf2TexError::MasterDocumentCorrupt { .. } => PageFailure::Fatal(e),
                other => PageFailure::Page(PageError::AssemblyFailed {
                    page,
                    detail: other.to_string(),
                }),
            })
    }

    /// Every fragment of this run ends up referenced by the master.
    fn finalize_master(&self, fragments: &[PathBuf], master: &Path) -> Result<(), Pdf2TexError> {
        if !master.exists() {
            assemble::create_main_document(fragments, master, &self.config.doc_title)?;
            return Ok(());
        }
        for fragment in fragments {
            assemble::append_fragment(fragment, master, &self.config.doc_title)?;
        }
        Ok(())
    }

    /// Record a page failure. Returns `Ok(true)` (stop the run) for a
    /// page-local failure and `Err` for a fatal one.
    fn page_failed(
        &self,
        failure: PageFailure,
        cb: &dyn PipelineProgressCallback,
        failures: &mut Vec<PageError>,
    ) -> Result<bool, Pdf2TexError> {
        match failure {
            PageFailure::Fatal(e) => Err(e),
            PageFailure::Page(e) => {
                warn!("{}; stopping", e);
                cb.on_page_error(e.page(), &e.to_string());
                failures.push(e);
                Ok(true)
            }
        }
    }
}

enum PageFailure {
    Page(PageError),
    Fatal(Pdf2TexError),
}

/// Convert `input` with a pipeline built from `config`.
///
/// # Example
/// ```rust,no_run
/// use edgequake_pdf2tex::{convert, ConverterBackend, PipelineConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = PipelineConfig::builder()
///     .output_dir("notes_out")
///     .backend(ConverterBackend::Dummy)
///     .build()?;
/// let result = convert("lecture.pdf", &config).await?;
/// println!("{:?}: {} pages converted", result.status, result.stats.processed);
/// # Ok(())
/// # }
/// ```
pub async fn convert(
    input_str: impl AsRef<str>,
    config: &PipelineConfig,
) -> Result<PipelineResult, Pdf2TexError> {
    Pipeline::from_config(config.clone())
        .await?
        .run(input_str.as_ref())
        .await
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    input_str: impl AsRef<str>,
    config: &PipelineConfig,
) -> Result<PipelineResult, Pdf2TexError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Pdf2TexError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(input_str, config))
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, Pdf2TexError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Pdf2TexError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`); the factory reads
///    the matching API key from the environment.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`),
///    checked before auto-detection so the model choice is honoured even
///    when several API keys are present.
/// 4. **OpenAI** when `OPENAI_API_KEY` is set.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
async fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, Pdf2TexError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Pdf2TexError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Use --backend dummy for a dry run without a model.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
