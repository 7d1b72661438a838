//! Page version ledger: the persistent record behind incremental re-runs.
//!
//! For every page the ledger remembers which rasterisation (`image_version`)
//! is current and which of those versions was last converted to LaTeX
//! (`latex_version`). The scheduler compares the two to decide what to send
//! to the model; nothing else in the pipeline keeps state across runs.
//!
//! ## Crash safety
//!
//! Updates are partial ([`PageUpdate`] only touches the fields it carries)
//! and the caller persists after every page-level transition. A crash
//! between [`Ledger::upsert`] and [`LedgerStore::persist`] loses that one
//! update, never an earlier one. Persisting writes a temp file and renames
//! it over the ledger, so a reader never sees a half-written file.

use crate::error::Pdf2TexError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Version record for one page (1-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    pub page: usize,
    /// 0 = never rasterised, 1 = first rasterisation, bumped on each change.
    pub image_version: u32,
    /// The `image_version` last converted to LaTeX. Never above `image_version`.
    pub latex_version: u32,
    /// Whether the latest rasterisation pass bumped `image_version`.
    pub image_updated: bool,
    /// Whether the LaTeX for `latex_version` was written successfully.
    pub latex_updated: bool,
}

impl PageEntry {
    fn new(page: usize) -> Self {
        Self {
            page,
            image_version: 0,
            latex_version: 0,
            image_updated: false,
            latex_updated: false,
        }
    }
}

/// A partial update for [`Ledger::upsert`]. `None` fields are left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageUpdate {
    pub image_version: Option<u32>,
    pub latex_version: Option<u32>,
    pub image_updated: Option<bool>,
    pub latex_updated: Option<bool>,
}

impl PageUpdate {
    pub fn image(version: u32, updated: bool) -> Self {
        Self {
            image_version: Some(version),
            image_updated: Some(updated),
            ..Self::default()
        }
    }

    pub fn latex_done(version: u32) -> Self {
        Self {
            latex_version: Some(version),
            latex_updated: Some(true),
            ..Self::default()
        }
    }
}

/// The checkpoint record for one source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    /// Identity of the source document (the input path or URL as given).
    pub source: String,
    #[serde(with = "page_list")]
    pages: BTreeMap<usize, PageEntry>,
    #[serde(default)]
    pub main_document_finalized: bool,
    #[serde(default)]
    pub main_document_path: Option<String>,
    #[serde(default)]
    pub last_saved: Option<DateTime<Utc>>,
}

impl Ledger {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            pages: BTreeMap::new(),
            main_document_finalized: false,
            main_document_path: None,
            last_saved: None,
        }
    }

    pub fn get(&self, page: usize) -> Option<&PageEntry> {
        self.pages.get(&page)
    }

    /// Iterate entries in ascending page order.
    pub fn entries(&self) -> impl Iterator<Item = &PageEntry> {
        self.pages.values()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Current image version per page, for the rasterisation stage.
    pub fn image_versions(&self) -> BTreeMap<usize, u32> {
        self.pages
            .iter()
            .map(|(&page, entry)| (page, entry.image_version))
            .collect()
    }

    /// Create the entry for `page` if absent, then apply `update`.
    ///
    /// `image_version` never decreases and `latex_version` never exceeds
    /// `image_version`; updates that would break either are corrected here.
    pub fn upsert(&mut self, page: usize, update: PageUpdate) -> &PageEntry {
        let entry = self.pages.entry(page).or_insert_with(|| PageEntry::new(page));

        if let Some(v) = update.image_version {
            if v < entry.image_version {
                warn!(
                    "Page {}: ignoring image version regression v{} → v{}",
                    page, entry.image_version, v
                );
            } else {
                entry.image_version = v;
            }
        }
        if let Some(v) = update.latex_version {
            if v > entry.image_version {
                warn!(
                    "Page {}: clamping LaTeX version v{} to image version v{}",
                    page, v, entry.image_version
                );
                entry.latex_version = entry.image_version;
            } else {
                entry.latex_version = v;
            }
        }
        if let Some(b) = update.image_updated {
            entry.image_updated = b;
        }
        if let Some(b) = update.latex_updated {
            entry.latex_updated = b;
        }
        entry
    }
}

/// File-backed storage for a [`Ledger`].
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the most recently persisted ledger, or `None` if there is none.
    pub fn load(&self) -> Result<Option<Ledger>, Pdf2TexError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Pdf2TexError::LedgerIo {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        let ledger: Ledger =
            serde_json::from_str(&text).map_err(|e| Pdf2TexError::LedgerCorrupt {
                path: self.path.clone(),
                detail: e.to_string(),
            })?;
        info!(
            "Loaded ledger {} ({} pages, last saved {})",
            self.path.display(),
            ledger.len(),
            ledger
                .last_saved
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".into())
        );
        Ok(Some(ledger))
    }

    /// Stamp `last_saved` and write the ledger atomically.
    pub fn persist(&self, ledger: &mut Ledger) -> Result<(), Pdf2TexError> {
        ledger.last_saved = Some(Utc::now());
        let json = serde_json::to_string_pretty(ledger)
            .map_err(|e| Pdf2TexError::Internal(format!("ledger serialisation: {e}")))?;

        let io_err = |source| Pdf2TexError::LedgerIo {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!("Ledger saved to {}", self.path.display());
        Ok(())
    }

    /// Remove the ledger file if present.
    pub fn clear(&self) -> Result<(), Pdf2TexError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Cleared ledger {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Pdf2TexError::LedgerIo {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

/// Serialise the page map as a list ordered by page, rejecting duplicates.
mod page_list {
    use super::PageEntry;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        pages: &BTreeMap<usize, PageEntry>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<&PageEntry> = pages.values().collect();
        list.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<usize, PageEntry>, D::Error> {
        let list = Vec::<PageEntry>::deserialize(d)?;
        let mut pages = BTreeMap::new();
        for entry in list {
            if entry.page == 0 {
                return Err(D::Error::custom("page numbers are 1-indexed, found page 0"));
            }
            if pages.insert(entry.page, entry).is_some() {
                return Err(D::Error::custom(format!(
                    "duplicate entry for page {}",
                    entry.page
                )));
            }
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn upsert_creates_entry_with_defaults() {
        let mut ledger = Ledger::new("notes.pdf");
        let entry = *ledger.upsert(4, PageUpdate::default());
        assert_eq!(entry, PageEntry::new(4));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn upsert_only_touches_supplied_fields() {
        let mut ledger = Ledger::new("notes.pdf");
        ledger.upsert(1, PageUpdate::image(2, true));
        ledger.upsert(1, PageUpdate::latex_done(1));
        ledger.upsert(
            1,
            PageUpdate {
                image_updated: Some(false),
                ..PageUpdate::default()
            },
        );

        let entry = ledger.get(1).unwrap();
        assert_eq!(entry.image_version, 2);
        assert_eq!(entry.latex_version, 1);
        assert!(!entry.image_updated);
        assert!(entry.latex_updated);
    }

    #[test]
    fn one_entry_per_page() {
        let mut ledger = Ledger::new("notes.pdf");
        for v in 1..=5 {
            ledger.upsert(2, PageUpdate::image(v, true));
        }
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get(2).unwrap().image_version, 5);
    }

    #[test]
    fn versions_stay_monotonic_and_ordered() {
        let mut ledger = Ledger::new("notes.pdf");
        let updates = [
            PageUpdate::image(1, true),
            PageUpdate::latex_done(1),
            PageUpdate::image(3, true),
            PageUpdate::image(2, false),
            PageUpdate::latex_done(7),
            PageUpdate::image(0, false),
        ];
        let mut last_image = 0;
        for update in updates {
            let entry = *ledger.upsert(1, update);
            assert!(entry.image_version >= last_image);
            assert!(entry.latex_version <= entry.image_version);
            last_image = entry.image_version;
        }
        let entry = ledger.get(1).unwrap();
        assert_eq!(entry.image_version, 3);
        assert_eq!(entry.latex_version, 3);
    }

    #[test]
    fn load_returns_none_when_absent() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::new(dir.path().join("checkpoint.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn persist_then_load_is_lossless() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::new(dir.path().join("nested/checkpoint.json"));

        let mut ledger = Ledger::new("scans/notes.pdf");
        ledger.upsert(2, PageUpdate::image(3, true));
        ledger.upsert(1, PageUpdate::image(1, false));
        ledger.upsert(1, PageUpdate::latex_done(1));
        ledger.main_document_path = Some("out/main.tex".into());
        store.persist(&mut ledger).unwrap();

        let loaded = store.load().unwrap().expect("ledger present");
        assert_eq!(loaded, ledger);
        assert!(loaded.last_saved.is_some());
        let pages: Vec<usize> = loaded.entries().map(|e| e.page).collect();
        assert_eq!(pages, vec![1, 2]);
    }

    #[test]
    fn persisted_json_uses_documented_keys() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::new(dir.path().join("checkpoint.json"));
        let mut ledger = Ledger::new("notes.pdf");
        ledger.upsert(1, PageUpdate::image(1, true));
        store.persist(&mut ledger).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        for key in [
            "source",
            "pages",
            "main_document_finalized",
            "main_document_path",
            "last_saved",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(value["pages"][0]["image_version"], 1);
    }

    #[test]
    fn duplicate_pages_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let entry = r#"{"page":1,"image_version":1,"latex_version":1,"image_updated":false,"latex_updated":true}"#;
        std::fs::write(
            &path,
            format!(r#"{{"source":"a.pdf","pages":[{entry},{entry}]}}"#),
        )
        .unwrap();

        let err = LedgerStore::new(&path).load().unwrap_err();
        assert!(matches!(err, Pdf2TexError::LedgerCorrupt { .. }), "got {err}");
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::new(dir.path().join("checkpoint.json"));
        let mut ledger = Ledger::new("notes.pdf");
        store.persist(&mut ledger).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
