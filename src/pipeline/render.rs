//! Page rasterisation and image versioning.
//!
//! Every page is rendered on every run. Whether the new render replaces the
//! stored PNG (and bumps the page's image version) is decided by the
//! [`ChangeDetector`]: only a visibly changed page produces a new version,
//! which is what later triggers a reconversion.
//!
//! ## Replacing a stored image
//!
//! A changed render is first written next to the stored image as
//! `{stem}_page{N}.png.pending`. The caller's `record` hook must make the
//! version bump durable; only then is the pending file renamed over the
//! stored PNG. A crash in between leaves the old image in place, so the
//! next run sees the change again. A pending file left over from such a
//! crash makes its page count as changed.
//!
//! ## Threading
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, and both
//! rendering and the pixel diff are CPU-bound. Each page runs on the
//! blocking pool; at most `workers` pages are in flight at once. Results
//! are recorded on the calling task in completion order.

use crate::error::{PageError, Pdf2TexError};
use crate::pipeline::diff::{ChangeDetector, ChangeVerdict};
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Renders single PDF pages to images.
///
/// Implementations are called from blocking threads, one page per call.
pub trait PageRasterizer: Send + Sync {
    fn page_count(&self, pdf: &Path) -> Result<usize, Pdf2TexError>;

    /// Render 1-indexed `page` at `dpi`.
    fn rasterize_page(
        &self,
        pdf: &Path,
        page: usize,
        dpi: u32,
    ) -> Result<DynamicImage, Pdf2TexError>;
}

/// [`PageRasterizer`] backed by the pdfium library.
///
/// A bound [`Pdfium`] cannot cross threads, so only the library location is
/// kept here and each call binds its own instance on the calling thread.
pub struct PdfiumRasterizer {
    /// `None` binds the system library.
    library: Option<PathBuf>,
    password: Option<String>,
}

impl PdfiumRasterizer {
    /// Locate pdfium: `PDFIUM_LIB_PATH`, then the working directory, then
    /// the system library search path. Binds once to fail early.
    pub fn new(password: Option<String>) -> Result<Self, Pdf2TexError> {
        let library = match std::env::var("PDFIUM_LIB_PATH") {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => {
                let local = Pdfium::pdfium_platform_library_name_at_path("./");
                Path::new(&local).exists().then(|| PathBuf::from(local))
            }
        };
        let rasterizer = Self { library, password };
        rasterizer.bind()?;
        Ok(rasterizer)
    }

    fn bind(&self) -> Result<Pdfium, Pdf2TexError> {
        let bindings = match &self.library {
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| Pdf2TexError::PdfiumBindingFailed(e.to_string()))?;
        Ok(Pdfium::new(bindings))
    }

    fn open<'a>(&'a self, pdfium: &'a Pdfium, pdf: &Path) -> Result<PdfDocument<'a>, Pdf2TexError> {
        let password = self.password.as_deref();
        pdfium.load_pdf_from_file(pdf, password).map_err(|e| {
            let err_str = format!("{:?}", e);
            if err_str.to_lowercase().contains("password") {
                if password.is_some() {
                    Pdf2TexError::WrongPassword {
                        path: pdf.to_path_buf(),
                    }
                } else {
                    Pdf2TexError::PasswordRequired {
                        path: pdf.to_path_buf(),
                    }
                }
            } else {
                Pdf2TexError::CorruptPdf {
                    path: pdf.to_path_buf(),
                    detail: err_str,
                }
            }
        })
    }
}

impl PageRasterizer for PdfiumRasterizer {
    fn page_count(&self, pdf: &Path) -> Result<usize, Pdf2TexError> {
        let pdfium = self.bind()?;
        let document = self.open(&pdfium, pdf)?;
        Ok(document.pages().len() as usize)
    }

    fn rasterize_page(
        &self,
        pdf: &Path,
        page: usize,
        dpi: u32,
    ) -> Result<DynamicImage, Pdf2TexError> {
        let pdfium = self.bind()?;
        let document = self.open(&pdfium, pdf)?;
        let render_err = |e: PdfiumError| Pdf2TexError::RasterisationFailed {
            page,
            detail: format!("{:?}", e),
        };

        let index = u16::try_from(page.saturating_sub(1)).map_err(|_| {
            Pdf2TexError::RasterisationFailed {
                page,
                detail: "page index exceeds pdfium's u16 range".into(),
            }
        })?;
        let pdf_page = document.pages().get(index).map_err(render_err)?;

        // PDF user space is 72 units per inch.
        let render_config = PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / 72.0);
        let bitmap = pdf_page
            .render_with_config(&render_config)
            .map_err(render_err)?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            page,
            image.width(),
            image.height()
        );
        Ok(image)
    }
}

/// Knobs for [`rasterize_pages`].
#[derive(Debug, Clone)]
pub struct RasterOptions {
    pub dpi: u32,
    pub enable_diff_check: bool,
    pub detector: ChangeDetector,
    pub change_cluster_threshold: usize,
    pub workers: usize,
}

/// Result of rasterising one page.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterizedPage {
    pub page: usize,
    pub path: PathBuf,
    pub version: u32,
    /// Whether this run wrote a new image (and bumped the version).
    pub updated: bool,
    /// New render waiting to replace `path`; `None` once promoted.
    pub pending: Option<PathBuf>,
    /// Diff verdict, when a comparison was made.
    pub verdict: Option<ChangeVerdict>,
}

#[derive(Debug, Clone, Default)]
pub struct RasterOutcome {
    /// Successfully rasterised pages, ascending.
    pub pages: Vec<RasterizedPage>,
    pub failures: Vec<PageError>,
}

impl RasterOutcome {
    pub fn versions(&self) -> BTreeMap<usize, u32> {
        self.pages.iter().map(|p| (p.page, p.version)).collect()
    }

    pub fn image_paths(&self) -> Vec<PathBuf> {
        self.pages.iter().map(|p| p.path.clone()).collect()
    }
}

/// `{image_dir}/{stem}_page{N}.png`
pub fn image_path(image_dir: &Path, stem: &str, page: usize) -> PathBuf {
    image_dir.join(format!("{stem}_page{page}.png"))
}

/// `{image_dir}/{stem}_page{N}.png.pending`
pub fn pending_path(image: &Path) -> PathBuf {
    image.with_extension("png.pending")
}

/// Count pages off the async runtime.
pub async fn page_count(
    rasterizer: Arc<dyn PageRasterizer>,
    pdf: &Path,
) -> Result<usize, Pdf2TexError> {
    let pdf = pdf.to_path_buf();
    tokio::task::spawn_blocking(move || rasterizer.page_count(&pdf))
        .await
        .map_err(|e| Pdf2TexError::Internal(format!("Page count task panicked: {}", e)))?
}

/// Rasterise `pages` of `pdf` into `image_dir`, versioning each image
/// against `current_versions` (the ledger's view before this run).
///
/// `record` is called once per rasterised page, as pages finish, and must
/// persist the page's version before returning. A new image replaces the
/// stored one only after `record` succeeds; an error from `record` aborts
/// the stage with pending files left in place.
#[allow(clippy::too_many_arguments)]
pub async fn rasterize_pages<F>(
    rasterizer: Arc<dyn PageRasterizer>,
    pdf: &Path,
    image_dir: &Path,
    stem: &str,
    pages: &[usize],
    current_versions: &BTreeMap<usize, u32>,
    options: &RasterOptions,
    mut record: F,
) -> Result<RasterOutcome, Pdf2TexError>
where
    F: FnMut(&RasterizedPage) -> Result<(), Pdf2TexError>,
{
    std::fs::create_dir_all(image_dir).map_err(|e| Pdf2TexError::OutputWriteFailed {
        path: image_dir.to_path_buf(),
        source: e,
    })?;

    let workers = options.workers.max(1);
    info!(
        "Rasterising {} pages at {} DPI ({} workers, diff {})",
        pages.len(),
        options.dpi,
        workers,
        if options.enable_diff_check { "on" } else { "off" }
    );

    let mut results = stream::iter(pages.iter().copied())
        .map(|page| {
            let rasterizer = Arc::clone(&rasterizer);
            let pdf = pdf.to_path_buf();
            let path = image_path(image_dir, stem, page);
            let current = current_versions.get(&page).copied().unwrap_or(0);
            let options = options.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    rasterize_one(rasterizer.as_ref(), &pdf, page, current, path, &options)
                })
                .await
                .unwrap_or_else(|e| {
                    Err(PageError::RenderFailed {
                        page,
                        detail: format!("render task panicked: {e}"),
                    })
                })
            }
        })
        .buffer_unordered(workers);

    let mut outcome = RasterOutcome::default();
    while let Some(result) = results.next().await {
        let mut page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!("{}", e);
                outcome.failures.push(e);
                continue;
            }
        };
        record(&page)?;
        match promote(&mut page) {
            Ok(()) => outcome.pages.push(page),
            Err(detail) => {
                let e = PageError::RenderFailed {
                    page: page.page,
                    detail,
                };
                warn!("{}", e);
                outcome.failures.push(e);
            }
        }
    }
    outcome.pages.sort_by_key(|p| p.page);
    outcome.failures.sort_by_key(|e| e.page());

    info!(
        "Rasterised {} pages ({} new images, {} failed)",
        outcome.pages.len(),
        outcome.pages.iter().filter(|p| p.updated).count(),
        outcome.failures.len()
    );
    Ok(outcome)
}

fn rasterize_one(
    rasterizer: &dyn PageRasterizer,
    pdf: &Path,
    page: usize,
    current: u32,
    path: PathBuf,
    options: &RasterOptions,
) -> Result<RasterizedPage, PageError> {
    let render_failed = |detail: String| PageError::RenderFailed { page, detail };

    let image = rasterizer
        .rasterize_page(pdf, page, options.dpi)
        .map_err(|e| render_failed(e.to_string()))?;

    let pending = pending_path(&path);
    let verdict = if pending.exists() {
        debug!("Page {}: leftover {} counts as changed", page, pending.display());
        Some(ChangeVerdict::Changed { clusters: 0 })
    } else if options.enable_diff_check && current > 0 && path.exists() {
        Some(compare_with_existing(&path, &image, page, options))
    } else {
        None
    };

    if let Some(v) = verdict.filter(|v| !v.is_changed()) {
        debug!("Page {}: image kept at v{} ({:?})", page, current, v);
        return Ok(RasterizedPage {
            page,
            path,
            version: current,
            updated: false,
            pending: None,
            verdict,
        });
    }

    save_png(&image, &pending).map_err(render_failed)?;
    let version = current + 1;
    debug!("Page {}: image staged as v{}", page, version);
    Ok(RasterizedPage {
        page,
        path,
        version,
        updated: true,
        pending: Some(pending),
        verdict,
    })
}

/// Move a staged render over the stored image.
fn promote(page: &mut RasterizedPage) -> Result<(), String> {
    if let Some(pending) = page.pending.take() {
        std::fs::rename(&pending, &page.path)
            .map_err(|e| format!("cannot move {}: {}", pending.display(), e))?;
        debug!("Page {}: image saved as v{}", page.page, page.version);
    }
    Ok(())
}

/// Compare against the stored image. A stored image that cannot be read or
/// compared counts as changed.
fn compare_with_existing(
    path: &Path,
    image: &DynamicImage,
    page: usize,
    options: &RasterOptions,
) -> ChangeVerdict {
    let old = match image::open(path) {
        Ok(old) => old,
        Err(e) => {
            warn!("Page {}: cannot read {}: {}", page, path.display(), e);
            return ChangeVerdict::Changed { clusters: 0 };
        }
    };
    match options.detector.compare(&old, image) {
        Ok(clusters) => {
            ChangeVerdict::from_clusters(clusters.len(), options.change_cluster_threshold)
        }
        Err(e) => {
            warn!("Page {}: {}; treating page as changed", page, e);
            ChangeVerdict::Changed { clusters: 0 }
        }
    }
}

fn save_png(image: &DynamicImage, path: &Path) -> Result<(), String> {
    let tmp = path.with_extension("tmp");
    image
        .save_with_format(&tmp, image::ImageFormat::Png)
        .map_err(|e| format!("cannot write {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| format!("cannot move {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serves one fixed image per page; pages listed in `broken` fail.
    struct FakeRasterizer {
        pages: Mutex<BTreeMap<usize, DynamicImage>>,
        broken: Vec<usize>,
    }

    impl FakeRasterizer {
        fn new(pages: BTreeMap<usize, DynamicImage>) -> Self {
            Self {
                pages: Mutex::new(pages),
                broken: Vec::new(),
            }
        }
    }

    impl PageRasterizer for FakeRasterizer {
        fn page_count(&self, _pdf: &Path) -> Result<usize, Pdf2TexError> {
            Ok(self.pages.lock().unwrap().len())
        }

        fn rasterize_page(
            &self,
            _pdf: &Path,
            page: usize,
            _dpi: u32,
        ) -> Result<DynamicImage, Pdf2TexError> {
            if self.broken.contains(&page) {
                return Err(Pdf2TexError::RasterisationFailed {
                    page,
                    detail: "boom".into(),
                });
            }
            Ok(self.pages.lock().unwrap()[&page].clone())
        }
    }

    fn page_with_marks(marks: &[(u32, u32)]) -> DynamicImage {
        let mut img = RgbImage::from_pixel(200, 200, Rgb([255, 255, 255]));
        for &(x0, y0) in marks {
            for y in y0..y0 + 6 {
                for x in x0..x0 + 6 {
                    img.put_pixel(x, y, Rgb([0, 0, 0]));
                }
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    fn options(diff: bool) -> RasterOptions {
        RasterOptions {
            dpi: 72,
            enable_diff_check: diff,
            detector: ChangeDetector::default(),
            change_cluster_threshold: 2,
            workers: 2,
        }
    }

    async fn run(
        raster: &Arc<FakeRasterizer>,
        dir: &Path,
        current: &BTreeMap<usize, u32>,
        diff: bool,
    ) -> RasterOutcome {
        let pages: Vec<usize> = raster.pages.lock().unwrap().keys().copied().collect();
        rasterize_pages(
            Arc::clone(raster) as Arc<dyn PageRasterizer>,
            Path::new("doc.pdf"),
            dir,
            "doc",
            &pages,
            current,
            &options(diff),
            |_| Ok(()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn first_run_saves_every_page_as_v1() {
        let dir = TempDir::new().unwrap();
        let raster = Arc::new(FakeRasterizer::new(BTreeMap::from([
            (1, page_with_marks(&[])),
            (2, page_with_marks(&[(10, 10)])),
        ])));
        let out = run(&raster, dir.path(), &BTreeMap::new(), true).await;

        assert_eq!(out.versions(), BTreeMap::from([(1, 1), (2, 1)]));
        assert!(out.pages.iter().all(|p| p.updated && p.path.exists()));
        assert_eq!(out.pages[1].path, dir.path().join("doc_page2.png"));
        assert!(out.failures.is_empty());
    }

    #[tokio::test]
    async fn unchanged_pages_keep_their_version_and_file() {
        let dir = TempDir::new().unwrap();
        let raster = Arc::new(FakeRasterizer::new(BTreeMap::from([(
            1,
            page_with_marks(&[(10, 10)]),
        )])));
        let first = run(&raster, dir.path(), &BTreeMap::new(), true).await;
        let modified = std::fs::metadata(&first.pages[0].path).unwrap().modified().unwrap();

        let second = run(&raster, dir.path(), &first.versions(), true).await;
        let p = &second.pages[0];
        assert_eq!(p.version, 1);
        assert!(!p.updated);
        assert_eq!(p.verdict, Some(ChangeVerdict::Unchanged));
        assert_eq!(std::fs::metadata(&p.path).unwrap().modified().unwrap(), modified);
    }

    #[tokio::test]
    async fn minor_changes_do_not_bump() {
        let dir = TempDir::new().unwrap();
        let raster = Arc::new(FakeRasterizer::new(BTreeMap::from([(1, page_with_marks(&[]))])));
        let first = run(&raster, dir.path(), &BTreeMap::new(), true).await;

        raster
            .pages
            .lock()
            .unwrap()
            .insert(1, page_with_marks(&[(10, 10), (100, 100)]));
        let second = run(&raster, dir.path(), &first.versions(), true).await;
        assert_eq!(second.pages[0].version, 1);
        assert_eq!(second.pages[0].verdict, Some(ChangeVerdict::Minor { clusters: 2 }));
    }

    #[tokio::test]
    async fn visible_changes_bump_the_version() {
        let dir = TempDir::new().unwrap();
        let raster = Arc::new(FakeRasterizer::new(BTreeMap::from([(1, page_with_marks(&[]))])));
        let first = run(&raster, dir.path(), &BTreeMap::new(), true).await;

        raster
            .pages
            .lock()
            .unwrap()
            .insert(1, page_with_marks(&[(10, 10), (100, 10), (10, 100)]));
        let second = run(&raster, dir.path(), &first.versions(), true).await;
        assert_eq!(second.pages[0].version, 2);
        assert!(second.pages[0].updated);
    }

    #[tokio::test]
    async fn disabled_diff_always_bumps() {
        let dir = TempDir::new().unwrap();
        let raster = Arc::new(FakeRasterizer::new(BTreeMap::from([(1, page_with_marks(&[]))])));
        let first = run(&raster, dir.path(), &BTreeMap::new(), false).await;
        let second = run(&raster, dir.path(), &first.versions(), false).await;
        assert_eq!(second.pages[0].version, 2);
        assert_eq!(second.pages[0].verdict, None);
    }

    #[tokio::test]
    async fn unreadable_stored_image_counts_as_changed() {
        let dir = TempDir::new().unwrap();
        let raster = Arc::new(FakeRasterizer::new(BTreeMap::from([(1, page_with_marks(&[]))])));
        std::fs::write(dir.path().join("doc_page1.png"), b"not a png").unwrap();

        let out = run(&raster, dir.path(), &BTreeMap::from([(1, 3)]), true).await;
        assert_eq!(out.pages[0].version, 4);
        assert!(image::open(&out.pages[0].path).is_ok());
    }

    #[tokio::test]
    async fn failed_pages_are_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut fake = FakeRasterizer::new(BTreeMap::from([
            (1, page_with_marks(&[])),
            (2, page_with_marks(&[])),
            (3, page_with_marks(&[])),
        ]));
        fake.broken = vec![2];
        let raster = Arc::new(fake);
        let out = run(&raster, dir.path(), &BTreeMap::new(), true).await;

        assert_eq!(out.versions(), BTreeMap::from([(1, 1), (3, 1)]));
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].page(), 2);
    }

    #[test]
    fn pdfium_rasterizer_can_be_shared_across_workers() {
        fn assert_shareable<T: PageRasterizer + 'static>() {}
        assert_shareable::<PdfiumRasterizer>();
        let _: fn(Arc<PdfiumRasterizer>) -> Arc<dyn PageRasterizer> = |r| r;
    }

    #[tokio::test]
    async fn changed_image_waits_for_the_record_hook() {
        let dir = TempDir::new().unwrap();
        let raster = Arc::new(FakeRasterizer::new(BTreeMap::from([(1, page_with_marks(&[]))])));
        let first = run(&raster, dir.path(), &BTreeMap::new(), true).await;
        let stored = first.pages[0].path.clone();
        let before = std::fs::read(&stored).unwrap();

        raster
            .pages
            .lock()
            .unwrap()
            .insert(1, page_with_marks(&[(10, 10), (100, 10), (10, 100)]));
        let mut seen = Vec::new();
        let result = rasterize_pages(
            Arc::clone(&raster) as Arc<dyn PageRasterizer>,
            Path::new("doc.pdf"),
            dir.path(),
            "doc",
            &[1],
            &first.versions(),
            &options(true),
            |page| {
                seen.push((page.page, page.version));
                assert_eq!(std::fs::read(&page.path).unwrap(), before);
                Err(Pdf2TexError::Internal("ledger write failed".into()))
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(seen, vec![(1, 2)]);
        assert_eq!(std::fs::read(&stored).unwrap(), before);
        assert!(pending_path(&stored).exists());
    }

    #[tokio::test]
    async fn leftover_pending_image_counts_as_changed() {
        let dir = TempDir::new().unwrap();
        let raster = Arc::new(FakeRasterizer::new(BTreeMap::from([(1, page_with_marks(&[]))])));
        let first = run(&raster, dir.path(), &BTreeMap::new(), true).await;
        let stored = first.pages[0].path.clone();
        std::fs::copy(&stored, pending_path(&stored)).unwrap();

        let second = run(&raster, dir.path(), &first.versions(), true).await;
        let p = &second.pages[0];
        assert_eq!(p.version, 2);
        assert!(p.updated);
        assert_eq!(p.pending, None);
        assert!(!pending_path(&stored).exists());
    }
}
