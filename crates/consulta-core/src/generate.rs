//! Generation contract between the pipeline and the model provider.
//!
//! The pipeline never talks to a provider directly; it goes through
//! [`Generator`] so tests can substitute a deterministic implementation and
//! so provider failures collapse into a small, matchable error set.

use serde::{Deserialize, Serialize};

/// Knobs forwarded to the provider for one completion call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { max_tokens: 1200, temperature: 0.2 }
    }
}

/// Everything that can go wrong while producing an answer text. Each variant
/// maps a whole class of provider failures so callers match on three cases,
/// not on provider-specific strings.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("the model provider did not respond within the configured timeout")]
    Timeout,
    #[error("model provider error: {0}")]
    Provider(String),
    #[error("the model provider returned an empty response")]
    EmptyResponse,
}

/// A completion backend. Implementations must be shareable across worker
/// threads; the pipeline calls `complete` from blocking contexts.
pub trait Generator: Send + Sync {
    /// Run one completion for `prompt`.
    ///
    /// # Errors
    /// Returns a [`GenerationError`] classifying the provider failure.
    fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<String, GenerationError>;
}

/// Run a completion and enforce the non-blank output contract: a completion
/// that is empty after trimming is a failure, never an answer.
///
/// # Errors
/// Propagates the generator's error, or returns
/// [`GenerationError::EmptyResponse`] for blank output.
pub fn generate_answer_text<G: Generator + ?Sized>(
    generator: &G,
    prompt: &str,
    params: &GenerationParams,
) -> Result<String, GenerationError> {
    let text = generator.complete(prompt, params)?;
    if text.trim().is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(text)
}
