//! Prompts for handwritten-notes-to-LaTeX conversion and LaTeX repair.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: changing the default behaviour requires
//!    editing exactly one place.
//!
//! 2. **Testability**: unit tests can import and inspect prompts directly
//!    without spinning up a real model.
//!
//! Callers can override the conversion prompt via
//! [`crate::config::PipelineConfig::system_prompt`].

use crate::pipeline::compile::Diagnostic;

/// Default system prompt for converting one page image to a LaTeX fragment.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert at transcribing handwritten mathematical notes into LaTeX. Your task is to convert one page image into a LaTeX body fragment.

Follow these rules precisely:

1. CONTENT
   - Transcribe ALL handwritten text and mathematics on the page
   - Preserve the structure and reading order of the notes
   - Be precise with mathematical notation; never simplify or "fix" the maths

2. MATHEMATICS
   - Use $...$ for inline math and equation/align environments for display math
   - Use amsmath, amssymb and amsfonts commands only
   - Use \cancel{...} for crossed-out terms

3. STRUCTURE
   - Use \subsection / \subsubsection for headings written on the page
   - Use itemize / enumerate for lists
   - Use tabular for tables

4. OUTPUT FORMAT
   - Output ONLY LaTeX body content
   - Do NOT include \documentclass, \usepackage, \begin{document} or \end{document}
   - Do NOT wrap the output in ```latex fences
   - Do NOT add commentary or explanations"#;

/// The user turn sent alongside the page image.
pub const CONVERT_INSTRUCTION: &str =
    "Convert this handwritten page to LaTeX. Output only the LaTeX code.";

/// System prompt for the LaTeX repair call.
pub const FIX_SYSTEM_PROMPT: &str = "You are a LaTeX expert who fixes compilation errors.";

/// Build the user prompt asking the model to repair `code`.
pub fn fix_prompt(code: &str, diagnostics: &[Diagnostic]) -> String {
    format!(
        "The following LaTeX document fails to compile.\n\
Fix ALL the errors and return ONLY the corrected LaTeX document.\n\n\
{errors}\n\
ORIGINAL LATEX CODE:\n```latex\n{code}\n```\n\n\
Instructions:\n\
- Preserve the original content and meaning\n\
- Ensure all math environments are properly closed\n\
- Check for missing packages, undefined commands and syntax errors\n\
- Do NOT include explanations\n\
- Do NOT wrap the output in code fences\n\n\
CORRECTED LATEX CODE:",
        errors = format_diagnostics(diagnostics),
    )
}

fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    if diagnostics.is_empty() {
        return "COMPILATION ERRORS: none reported, but the compiler exited with an error.\n"
            .to_string();
    }
    let mut out = format!("COMPILATION ERRORS ({}):\n", diagnostics.len());
    for (i, d) in diagnostics.iter().enumerate() {
        let line = d
            .line
            .map(|l| l.to_string())
            .unwrap_or_else(|| "?".to_string());
        out.push_str(&format!(
            "\nError {}:\n  Line: {}\n  Message: {}\n",
            i + 1,
            line,
            d.message
        ));
    }
    out
}
