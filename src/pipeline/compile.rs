//! Best-effort compile check with model-assisted repair.
//!
//! A fragment is wrapped in a minimal standalone document and compiled.
//! If that fails, a [`LatexFixer`] is asked to repair it, up to a fixed
//! number of rounds. The page is never blocked on a LaTeX defect: when
//! repair does not converge, the last produced fragment is used as-is, and
//! a compiler that cannot be started skips the check entirely.

use crate::error::{BackendError, Pdf2TexError};
use crate::pipeline::assemble::standalone_document;
use crate::pipeline::postprocess::clean_latex;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One compiler error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Line in the compiled document, when the compiler reported one.
    pub line: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileReport {
    pub success: bool,
    pub diagnostics: Vec<Diagnostic>,
    /// Combined stdout and stderr.
    pub log: String,
}

/// Compiles a complete LaTeX document.
pub trait LatexCompiler: Send + Sync {
    /// `Err` only when the compiler cannot be run at all.
    fn compile<'a>(&'a self, document: &'a str) -> BoxFuture<'a, Result<CompileReport, Pdf2TexError>>;
}

/// Repairs a document given its compiler errors.
pub trait LatexFixer: Send + Sync {
    fn fix<'a>(
        &'a self,
        code: &'a str,
        diagnostics: &'a [Diagnostic],
    ) -> BoxFuture<'a, Result<String, BackendError>>;
}

/// Runs `xelatex` (or another TeX engine) in a scratch directory.
#[derive(Debug, Clone)]
pub struct XelatexCompiler {
    pub program: String,
    pub timeout: Duration,
}

impl XelatexCompiler {
    const JOB: &'static str = "page.tex";

    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl Default for XelatexCompiler {
    fn default() -> Self {
        Self::new("xelatex", Duration::from_secs(60))
    }
}

impl LatexCompiler for XelatexCompiler {
    fn compile<'a>(&'a self, document: &'a str) -> BoxFuture<'a, Result<CompileReport, Pdf2TexError>> {
        Box::pin(async move {
            let unavailable = |detail: String| Pdf2TexError::CompilerUnavailable {
                program: self.program.clone(),
                detail,
            };

            let dir = tempfile::TempDir::new().map_err(|e| unavailable(e.to_string()))?;
            tokio::fs::write(dir.path().join(Self::JOB), document)
                .await
                .map_err(|e| unavailable(e.to_string()))?;

            let child = tokio::process::Command::new(&self.program)
                .args(["-interaction=nonstopmode", "-file-line-error", Self::JOB])
                .current_dir(dir.path())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| unavailable(e.to_string()))?;

            let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(unavailable(e.to_string())),
                Err(_) => {
                    let message = format!("Compilation timeout (>{}s)", self.timeout.as_secs());
                    warn!("{}", message);
                    return Ok(CompileReport {
                        success: false,
                        diagnostics: vec![Diagnostic {
                            line: None,
                            message,
                        }],
                        log: String::new(),
                    });
                }
            };

            let log = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            let diagnostics = parse_diagnostics(&log, Self::JOB);
            let success = output.status.success() && diagnostics.is_empty();
            debug!(
                "{} exited with {} ({} diagnostics)",
                self.program,
                output.status,
                diagnostics.len()
            );
            Ok(CompileReport {
                success,
                diagnostics,
                log,
            })
        })
    }
}

static RE_GENERAL_ERROR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^!\s*(.+?)\s*$").unwrap());

/// Extract errors from a TeX log.
///
/// Recognises `file:line: message` lines (from `-file-line-error`) and
/// `! message` lines. Warnings and over/underfull box notices are skipped;
/// repeated messages are reported once.
pub fn parse_diagnostics(log: &str, filename: &str) -> Vec<Diagnostic> {
    let file_line = Regex::new(&format!(
        r"(?m)^(?:\./)?{}:(\d+):\s*(.+?)\s*$",
        regex::escape(filename)
    ));
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    if let Ok(file_line) = file_line {
        for caps in file_line.captures_iter(log) {
            let message = caps[2].to_string();
            let lower = message.to_lowercase();
            if ["warning", "overfull", "underfull"]
                .iter()
                .any(|s| lower.contains(s))
            {
                continue;
            }
            diagnostics.push(Diagnostic {
                line: caps[1].parse().ok(),
                message,
            });
        }
    }

    for caps in RE_GENERAL_ERROR.captures_iter(log) {
        let message = caps[1].to_string();
        if !diagnostics.iter().any(|d| d.message == message) {
            diagnostics.push(Diagnostic {
                line: None,
                message,
            });
        }
    }
    diagnostics
}

/// Check `fragment` compiles; repair it through `fixer` if not.
///
/// Returns the fragment to save: the original when it compiles (or the
/// compiler is unavailable), a repaired one when a fix round succeeds, or
/// the last produced code when all rounds are spent.
pub async fn compile_and_fix(
    page: usize,
    fragment: &str,
    compiler: &dyn LatexCompiler,
    fixer: &dyn LatexFixer,
    max_fix_attempts: u32,
) -> String {
    let title = format!("Page {page}");
    let mut current = fragment.to_string();
    let mut document = standalone_document(&current, &title);

    let mut diagnostics = match compiler.compile(&document).await {
        Ok(report) if report.success => {
            debug!("Page {}: compiles cleanly", page);
            return current;
        }
        Ok(report) => report.diagnostics,
        Err(e) => {
            warn!("Page {}: skipping compile check: {}", page, e);
            return current;
        }
    };
    info!(
        "Page {}: {} compilation error(s), attempting repair",
        page,
        diagnostics.len()
    );

    for attempt in 1..=max_fix_attempts {
        match fixer.fix(&document, &diagnostics).await {
            Ok(fixed) => {
                current = clean_latex(&fixed);
                document = standalone_document(&current, &title);
            }
            Err(e) => {
                warn!("Page {}: fix attempt {} failed: {}", page, attempt, e);
                continue;
            }
        }

        match compiler.compile(&document).await {
            Ok(report) if report.success => {
                info!("Page {}: repaired after {} attempt(s)", page, attempt);
                return current;
            }
            Ok(report) => {
                warn!(
                    "Page {}: still {} error(s) after fix attempt {}",
                    page,
                    report.diagnostics.len(),
                    attempt
                );
                diagnostics = report.diagnostics;
            }
            Err(e) => {
                warn!("Page {}: compiler became unavailable: {}", page, e);
                return current;
            }
        }
    }

    warn!(
        "Page {}: could not fix compilation errors after {} attempt(s); using last code",
        page, max_fix_attempts
    );
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Compiles successfully iff the document contains `good`.
    struct MarkerCompiler {
        calls: AtomicUsize,
    }

    impl LatexCompiler for MarkerCompiler {
        fn compile<'a>(
            &'a self,
            document: &'a str,
        ) -> BoxFuture<'a, Result<CompileReport, Pdf2TexError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let success = document.contains("good");
            Box::pin(async move {
                Ok(CompileReport {
                    success,
                    diagnostics: if success {
                        vec![]
                    } else {
                        vec![Diagnostic {
                            line: Some(14),
                            message: "Undefined control sequence.".into(),
                        }]
                    },
                    log: String::new(),
                })
            })
        }
    }

    struct MissingCompiler;

    impl LatexCompiler for MissingCompiler {
        fn compile<'a>(
            &'a self,
            _document: &'a str,
        ) -> BoxFuture<'a, Result<CompileReport, Pdf2TexError>> {
            Box::pin(async {
                Err(Pdf2TexError::CompilerUnavailable {
                    program: "xelatex".into(),
                    detail: "No such file or directory".into(),
                })
            })
        }
    }

    /// Returns queued responses in order.
    struct ScriptedFixer {
        responses: Mutex<Vec<Result<String, BackendError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedFixer {
        fn new(mut responses: Vec<Result<String, BackendError>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl LatexFixer for ScriptedFixer {
        fn fix<'a>(
            &'a self,
            code: &'a str,
            _diagnostics: &'a [Diagnostic],
        ) -> BoxFuture<'a, Result<String, BackendError>> {
            self.seen.lock().unwrap().push(code.to_string());
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(BackendError::Permanent("no script".into())));
            Box::pin(async move { next })
        }
    }

    fn compiler() -> MarkerCompiler {
        MarkerCompiler {
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn clean_fragment_is_returned_unchanged() {
        let fixer = ScriptedFixer::new(vec![]);
        let out = compile_and_fix(1, "good $x$", &compiler(), &fixer, 2).await;
        assert_eq!(out, "good $x$");
        assert!(fixer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repaired_fragment_is_returned_without_preamble() {
        let fixer = ScriptedFixer::new(vec![Ok(
            "```latex\n\\documentclass{article}\n\\begin{document}\ngood $x$\n\\end{document}\n```"
                .into(),
        )]);
        let c = compiler();
        let out = compile_and_fix(3, "bad \\frc", &c, &fixer, 2).await;
        assert_eq!(out, "good $x$");
        assert_eq!(c.calls.load(Ordering::SeqCst), 2);
        // The fixer sees the whole standalone document.
        assert!(fixer.seen.lock().unwrap()[0].contains("\\begin{document}"));
    }

    #[tokio::test]
    async fn exhausted_attempts_fall_back_to_last_code() {
        let fixer = ScriptedFixer::new(vec![Ok("still bad 1".into()), Ok("still bad 2".into())]);
        let out = compile_and_fix(1, "bad", &compiler(), &fixer, 2).await;
        assert_eq!(out, "still bad 2");
    }

    #[tokio::test]
    async fn fixer_errors_spend_a_round() {
        let fixer = ScriptedFixer::new(vec![
            Err(BackendError::Transient("503".into())),
            Ok("good now".into()),
        ]);
        let out = compile_and_fix(1, "bad", &compiler(), &fixer, 2).await;
        assert_eq!(out, "good now");

        let fixer = ScriptedFixer::new(vec![Err(BackendError::Transient("503".into()))]);
        let out = compile_and_fix(1, "bad", &compiler(), &fixer, 1).await;
        assert_eq!(out, "bad");
    }

    #[tokio::test]
    async fn unavailable_compiler_skips_the_check() {
        let fixer = ScriptedFixer::new(vec![]);
        let out = compile_and_fix(1, "anything", &MissingCompiler, &fixer, 2).await;
        assert_eq!(out, "anything");
    }

    #[test]
    fn parses_file_line_and_bang_errors() {
        let log = "\
This is XeTeX
./page.tex:14: Undefined control sequence.
l.14 \\frc
page.tex:20: LaTeX Warning: Reference undefined
./page.tex:22: Missing $ inserted.
! Emergency stop.
! Emergency stop.
";
        let diags = parse_diagnostics(log, "page.tex");
        assert_eq!(
            diags,
            vec![
                Diagnostic {
                    line: Some(14),
                    message: "Undefined control sequence.".into()
                },
                Diagnostic {
                    line: Some(22),
                    message: "Missing $ inserted.".into()
                },
                Diagnostic {
                    line: None,
                    message: "Emergency stop.".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let c = XelatexCompiler::new("definitely-not-a-tex-engine-5b1e", Duration::from_secs(5));
        let err = c.compile("\\documentclass{article}").await.unwrap_err();
        assert!(matches!(err, Pdf2TexError::CompilerUnavailable { .. }));
    }
}
