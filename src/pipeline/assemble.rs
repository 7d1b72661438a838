//! Fragment files and the master document.
//!
//! Each converted page is saved as its own fragment file. The master
//! document pulls fragments in with `\input{…}` directives. Appending is
//! idempotent: a fragment whose directive is already present is left alone,
//! so re-running, resuming or re-appending in any order never duplicates
//! a page.
//!
//! Duplicate detection matches whole lines: a directive is present only if
//! some line of the master, trimmed, is exactly that directive. `page1` is
//! therefore never mistaken for `page10`.

use crate::error::Pdf2TexError;
use crate::pipeline::postprocess::clean_latex;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

const END_DOCUMENT: &str = r"\end{document}";

const PREAMBLE: &str = r"\documentclass[12pt,a4paper]{article}
\usepackage[utf8]{inputenc}
\usepackage{amsmath}
\usepackage{amsfonts}
\usepackage{amssymb}
\usepackage{graphicx}
\usepackage{cancel}
\usepackage{tikz}
\usepackage{arydshln}
\usepackage{geometry}
\geometry{margin=1in}
";

/// `{dir}/{prefix}_page{N}.tex`
pub fn fragment_path(latex_dir: &Path, prefix: &str, page: usize) -> PathBuf {
    latex_dir.join(format!("{prefix}_page{page}.tex"))
}

/// Clean `raw_latex`, optionally head it with `\section{Page N}`, and write
/// it to the page's fragment file (overwriting).
pub fn save_fragment(
    latex_dir: &Path,
    prefix: &str,
    page: usize,
    raw_latex: &str,
    wrap_in_section: bool,
) -> Result<PathBuf, Pdf2TexError> {
    let mut body = clean_latex(raw_latex);
    if wrap_in_section {
        body = format!("\\section{{Page {page}}}\n\n{body}");
    }
    let path = fragment_path(latex_dir, prefix, page);
    write_atomic(&path, &body)?;
    debug!("Saved fragment {} ({} bytes)", path.display(), body.len());
    Ok(path)
}

/// The `\input` token for `fragment`: its path relative to the master's
/// directory, extension stripped, `/`-separated.
pub fn reference_token(fragment: &Path, master: &Path) -> String {
    let base = master.parent().unwrap_or_else(|| Path::new(""));
    let relative = relative_path(&fragment.with_extension(""), base);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn input_directive(fragment: &Path, master: &Path) -> String {
    format!("\\input{{{}}}", reference_token(fragment, master))
}

/// Whether `master_text` already references `directive` on a line of its own.
pub fn contains_directive(master_text: &str, directive: &str) -> bool {
    master_text.lines().any(|line| line.trim() == directive)
}

/// Ensure the master document at `master` includes `fragment`.
///
/// Creates the master (preamble, title, empty body) if it does not exist.
/// Inserts the directive before the last `\end{document}`.
pub fn append_fragment(
    fragment: &Path,
    master: &Path,
    title: &str,
) -> Result<PathBuf, Pdf2TexError> {
    if !master.exists() {
        write_atomic(master, &render_master(title, &[]))?;
        info!("Created master document {}", master.display());
    }

    let content = std::fs::read_to_string(master).map_err(|e| {
        Pdf2TexError::OutputWriteFailed {
            path: master.to_path_buf(),
            source: e,
        }
    })?;

    let end_pos = content
        .rfind(END_DOCUMENT)
        .ok_or_else(|| Pdf2TexError::MasterDocumentCorrupt {
            path: master.to_path_buf(),
        })?;

    let directive = input_directive(fragment, master);
    if contains_directive(&content, &directive) {
        debug!("{} already in {}", directive, master.display());
        return Ok(master.to_path_buf());
    }

    let (head, tail) = content.split_at(end_pos);
    let mut updated = String::with_capacity(content.len() + directive.len() + 3);
    updated.push_str(head);
    if !head.is_empty() && !head.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&directive);
    updated.push_str("\n\n");
    updated.push_str(tail);

    write_atomic(master, &updated)?;
    debug!("Appended {} to {}", directive, master.display());
    Ok(master.to_path_buf())
}

/// Write a fresh master document including every fragment, in order.
pub fn create_main_document(
    fragments: &[PathBuf],
    master: &Path,
    title: &str,
) -> Result<PathBuf, Pdf2TexError> {
    let directives: Vec<String> = fragments
        .iter()
        .map(|f| input_directive(f, master))
        .collect();
    write_atomic(master, &render_master(title, &directives))?;
    info!(
        "Created master document {} with {} fragments",
        master.display(),
        fragments.len()
    );
    Ok(master.to_path_buf())
}

/// A minimal compilable document around one fragment.
pub fn standalone_document(fragment: &str, title: &str) -> String {
    let mut doc = String::from(PREAMBLE);
    doc.push('\n');
    if !title.is_empty() {
        doc.push_str(&format!("\\title{{{title}}}\n"));
    }
    doc.push_str("\n\\begin{document}\n\n");
    doc.push_str(fragment.trim());
    doc.push_str("\n\n");
    doc.push_str(END_DOCUMENT);
    doc.push('\n');
    doc
}

fn render_master(title: &str, directives: &[String]) -> String {
    let mut doc = String::from(PREAMBLE);
    doc.push('\n');
    if !title.is_empty() {
        doc.push_str(&format!("\\title{{{title}}}\n"));
    }
    doc.push_str("\n\\begin{document}\n\n");
    if !title.is_empty() {
        doc.push_str("\\maketitle\n\n");
    }
    for directive in directives {
        doc.push_str(directive);
        doc.push_str("\n\n");
    }
    doc.push_str(END_DOCUMENT);
    doc.push('\n');
    doc
}

/// `path` relative to `base`, lexically. Both are taken as given; callers
/// pass paths built from the same output directory.
fn relative_path(path: &Path, base: &Path) -> PathBuf {
    let path: Vec<Component<'_>> = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    let base: Vec<Component<'_>> = base
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    let common = path
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base.len() {
        out.push("..");
    }
    for c in &path[common..] {
        out.push(c.as_os_str());
    }
    out
}

fn write_atomic(path: &Path, content: &str) -> Result<(), Pdf2TexError> {
    let io_err = |source| Pdf2TexError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("tex.tmp");
    std::fs::write(&tmp, content).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}
