//! AI rewriting — service trait, HTTP client, and the rewrite adapter.
//!
//! The engine talks to the AI backend through the one-method [`AiService`]
//! trait. The concrete client speaks the OpenAI-compatible chat-completions
//! protocol, which covers OpenAI, OpenRouter, and any gateway exposing the
//! same surface. Retry and fallback policy live in the adapter, not here.

pub mod client;
pub mod rewriter;

pub use client::OpenAiCompatClient;
pub use rewriter::{Degradation, RewriteAdapter, RewriteOutcome};

use async_trait::async_trait;

use crate::error::AiError;

/// A single idempotent completion call.
#[async_trait]
pub trait AiService: Send + Sync {
    /// Run `text` through the model under `system_prompt` and return the
    /// completion text.
    async fn complete(&self, system_prompt: &str, text: &str) -> Result<String, AiError>;
}
