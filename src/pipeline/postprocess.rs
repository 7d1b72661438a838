//! Post-processing: deterministic cleanup of model-generated LaTeX.
//!
//! ## What gets fixed
//!
//! Fragments are `\input` into a master document, so each one must be a
//! body snippet, not a document. Vision models regularly ignore that
//! instruction and return:
//!
//! - output wrapped in ` ```latex ... ``` ` fences
//! - a full `\documentclass ... \begin{document}` preamble
//! - a trailing `\end{document}`, which would end the master document early
//! - a chatty lead-in such as "Here is the corrected code:"
//!
//! Each rule is a pure `&str → String` pass, applied in the order listed
//! in [`clean_latex`].

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to raw model output.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip code fences (` ```latex ` / ` ``` `)
/// 3. Drop a leading "Here is the corrected …:" line
/// 4. Remove the `\documentclass … \begin{document}` preamble
/// 5. Remove `\end{document}`
/// 6. Strip invisible Unicode
/// 7. Trim trailing whitespace per line
/// 8. Collapse 3+ consecutive newlines to one blank line
/// 9. Trim the whole fragment
pub fn clean_latex(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_code_fences(&s);
    let s = strip_response_preface(&s);
    let s = remove_preamble(&s);
    let s = remove_end_document(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim().to_string()
}

/// Strip fences and chatty prefaces only; keeps any preamble.
///
/// Used for AI-fix responses, which return a complete standalone document.
pub fn clean_response(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_code_fences(&s);
    strip_response_preface(&s).trim().to_string()
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Strip code fences ────────────────────────────────────────────────

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*```[A-Za-z]*[ \t]*$\n?").unwrap());

fn strip_code_fences(input: &str) -> String {
    RE_FENCE.replace_all(input, "").to_string()
}

// ── Rule 3: Chatty preface ───────────────────────────────────────────────────

static RE_PREFACE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\A\s*(?:here is the corrected|here's the fixed|here is the|corrected)[^\n]*:[ \t]*\n")
        .unwrap()
});

fn strip_response_preface(input: &str) -> String {
    RE_PREFACE.replace(input, "").to_string()
}

// ── Rule 4: Remove document preamble ─────────────────────────────────────────

static RE_PREAMBLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\\documentclass.*?\\begin\{document\}").unwrap());

fn remove_preamble(input: &str) -> String {
    RE_PREAMBLE.replace_all(input, "").to_string()
}

// ── Rule 5: Remove end-of-document marker ────────────────────────────────────

fn remove_end_document(input: &str) -> String {
    input.replace(r"\end{document}", "")
}

// ── Rule 6: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 7: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 8: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────
