//! Model interaction: page image → LaTeX, and LaTeX repair.
//!
//! This module is intentionally thin: prompts live in [`crate::prompts`],
//! and retry plus rate limiting are applied by the decorators in
//! [`crate::pipeline::resilience`]. A backend here makes exactly one
//! request per call and classifies its failure.

use crate::error::BackendError;
use crate::pipeline::compile::{Diagnostic, LatexFixer};
use crate::pipeline::encode;
use crate::pipeline::postprocess::clean_response;
use crate::prompts::{fix_prompt, CONVERT_INSTRUCTION, DEFAULT_SYSTEM_PROMPT, FIX_SYSTEM_PROMPT};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Converts one page image to raw LaTeX.
///
/// One call is one request; retrying is the caller's concern.
pub trait PageConverter: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn convert<'a>(
        &'a self,
        page: usize,
        image: &'a Path,
    ) -> BoxFuture<'a, Result<String, BackendError>>;
}

/// Sampling options shared by conversion and repair calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub max_tokens: usize,
}

impl SamplingOptions {
    fn completion_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

/// [`PageConverter`] backed by a vision-capable edgequake-llm provider.
///
/// ## Message Layout
///
/// 1. **System message**: the conversion rules (or a user-supplied override)
/// 2. **User message**: a one-line instruction plus the page PNG
pub struct VisionConverter {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    sampling: SamplingOptions,
}

impl VisionConverter {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        system_prompt: Option<String>,
        sampling: SamplingOptions,
    ) -> Self {
        Self {
            provider,
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            sampling,
        }
    }
}

impl PageConverter for VisionConverter {
    fn name(&self) -> &str {
        "vision"
    }

    fn convert<'a>(
        &'a self,
        page: usize,
        image: &'a Path,
    ) -> BoxFuture<'a, Result<String, BackendError>> {
        Box::pin(async move {
            let start = Instant::now();
            let image_data = encode::encode_file(image).await.map_err(|e| {
                BackendError::Permanent(format!("cannot read {}: {}", image.display(), e))
            })?;

            let messages = vec![
                ChatMessage::system(self.system_prompt.as_str()),
                ChatMessage::user_with_images(CONVERT_INSTRUCTION, vec![image_data]),
            ];
            let options = self.sampling.completion_options();

            let response = self
                .provider
                .chat(&messages, Some(&options))
                .await
                .map_err(|e| BackendError::classify(e.to_string()))?;

            debug!(
                "Page {}: {} input tokens, {} output tokens, {:?}",
                page,
                response.prompt_tokens,
                response.completion_tokens,
                start.elapsed()
            );
            if response.content.trim().is_empty() {
                return Err(BackendError::Transient("model returned no content".into()));
            }
            Ok(response.content)
        })
    }
}

/// [`LatexFixer`] backed by an edgequake-llm provider.
pub struct LlmLatexFixer {
    provider: Arc<dyn LLMProvider>,
    sampling: SamplingOptions,
}

impl LlmLatexFixer {
    pub fn new(provider: Arc<dyn LLMProvider>, sampling: SamplingOptions) -> Self {
        Self { provider, sampling }
    }
}

impl LatexFixer for LlmLatexFixer {
    fn fix<'a>(
        &'a self,
        code: &'a str,
        diagnostics: &'a [Diagnostic],
    ) -> BoxFuture<'a, Result<String, BackendError>> {
        Box::pin(async move {
            let messages = vec![
                ChatMessage::system(FIX_SYSTEM_PROMPT),
                ChatMessage::user(fix_prompt(code, diagnostics)),
            ];
            let options = self.sampling.completion_options();
            let response = self
                .provider
                .chat(&messages, Some(&options))
                .await
                .map_err(|e| BackendError::classify(e.to_string()))?;

            let fixed = clean_response(&response.content);
            if fixed.is_empty() {
                return Err(BackendError::Transient("model returned no content".into()));
            }
            Ok(fixed)
        })
    }
}
