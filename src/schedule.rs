//! Staleness planning: which pages need a (re)conversion this run.
//!
//! Planning is a pure function of the ledger state after rasterisation,
//! the set of pages the ledger knew before this run, and which fragment
//! files exist. It performs no I/O itself.

use crate::ledger::Ledger;
use std::collections::BTreeSet;

/// Why a page is (or is not) scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkReason {
    /// Absent from the ledger before this run.
    New,
    /// The image has a newer version than the one converted.
    ImageChanged,
    /// A previous run recorded the image but never finished its LaTeX.
    Incomplete,
    /// The ledger claims more than the filesystem or its own versions allow.
    Inconsistent,
    UpToDate,
}

impl WorkReason {
    pub fn needs_work(&self) -> bool {
        !matches!(self, WorkReason::UpToDate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPage {
    pub page: usize,
    pub reason: WorkReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Every considered page, ascending.
    pub pages: Vec<PlannedPage>,
}

impl Plan {
    /// Pages needing conversion, ascending.
    pub fn pages_to_process(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.reason.needs_work())
            .map(|p| p.page)
            .collect()
    }

    pub fn up_to_date(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| !p.reason.needs_work())
            .map(|p| p.page)
            .collect()
    }

    pub fn has_work(&self) -> bool {
        self.pages.iter().any(|p| p.reason.needs_work())
    }

    pub fn reason(&self, page: usize) -> Option<WorkReason> {
        self.pages.iter().find(|p| p.page == page).map(|p| p.reason)
    }
}

/// Classify `pages` against `ledger`.
///
/// `known_before` holds the pages present in the ledger before this run's
/// rasterisation touched it. `fragment_exists` reports whether a page's
/// fragment file is on disk.
pub fn plan(
    ledger: &Ledger,
    known_before: &BTreeSet<usize>,
    pages: &[usize],
    fragment_exists: impl Fn(usize) -> bool,
) -> Plan {
    let mut sorted: Vec<usize> = pages.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let pages = sorted
        .into_iter()
        .map(|page| PlannedPage {
            page,
            reason: classify(ledger, known_before, page, &fragment_exists),
        })
        .collect();
    Plan { pages }
}

fn classify(
    ledger: &Ledger,
    known_before: &BTreeSet<usize>,
    page: usize,
    fragment_exists: &impl Fn(usize) -> bool,
) -> WorkReason {
    let entry = match ledger.get(page) {
        Some(entry) if known_before.contains(&page) => entry,
        _ => return WorkReason::New,
    };
    if entry.image_version > entry.latex_version {
        return WorkReason::ImageChanged;
    }
    if entry.latex_version > entry.image_version {
        return WorkReason::Inconsistent;
    }
    if !entry.latex_updated {
        return WorkReason::Incomplete;
    }
    if !fragment_exists(page) {
        return WorkReason::Inconsistent;
    }
    WorkReason::UpToDate
}
