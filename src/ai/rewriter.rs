//! Rewrite adapter — fallback and caption length enforcement.
//!
//! Wraps the AI service behind a uniform rewrite call. The adapter never
//! propagates an AI failure: the original text passes through and the
//! outcome records that the fallback fired. For captions it also enforces
//! the transport's hard 1024-character cap, degrading in two steps
//! (aggressive re-summarize, then truncate) with each step reported
//! distinctly so statistics can count them.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::ai::AiService;

/// Hard caption limit imposed by the transport.
pub const CAPTION_LIMIT: usize = 1024;

/// Inputs longer than this get the summarizing prompt on the first pass.
const SUMMARIZE_THRESHOLD: usize = 800;

const REWRITE_PROMPT: &str = "Rewrite the following post in a clear, professional tone, \
     ready to publish in a broadcast channel. Keep all key facts. \
     Reply with only the rewritten text.";

const SUMMARIZE_PROMPT: &str = "Rewrite the following post as a concise, professional summary \
     of 600 to 800 characters, ready to publish in a broadcast channel. \
     Keep the key facts. Reply with only the rewritten text.";

const AGGRESSIVE_PROMPT: &str = "Summarize the following post in at most 700 characters, \
     keeping only the key points. Reply with only the summary.";

/// Which degradation step produced the final caption, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degradation {
    /// First rewrite exceeded the cap; a second aggressive pass fit.
    Resummarized,
    /// Both passes exceeded the cap; the text was hard-truncated.
    Truncated,
}

/// Result of a rewrite call.
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub text: String,
    /// The AI call failed and the original text passed through.
    pub used_fallback: bool,
    pub degradation: Option<Degradation>,
}

/// Uniform rewrite front-end over the AI service.
pub struct RewriteAdapter {
    service: Arc<dyn AiService>,
}

impl RewriteAdapter {
    pub fn new(service: Arc<dyn AiService>) -> Self {
        Self { service }
    }

    /// Rewrite `text`, enforcing the caption cap when `is_caption`.
    ///
    /// `system_prompt` overrides the built-in templates when present
    /// (session override or mapping template). Whether this text should be
    /// rewritten at all is the pipeline's decision — by the time this runs,
    /// the answer was yes.
    pub async fn rewrite(
        &self,
        text: &str,
        system_prompt: Option<&str>,
        is_caption: bool,
    ) -> RewriteOutcome {
        let prompt = system_prompt.unwrap_or_else(|| {
            if text.chars().count() > SUMMARIZE_THRESHOLD {
                SUMMARIZE_PROMPT
            } else {
                REWRITE_PROMPT
            }
        });

        let rewritten = match self.service.complete(prompt, text).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "AI rewrite failed, forwarding original text");
                return RewriteOutcome {
                    text: text.to_string(),
                    used_fallback: true,
                    degradation: None,
                };
            }
        };

        if !is_caption || rewritten.chars().count() <= CAPTION_LIMIT {
            return RewriteOutcome {
                text: rewritten,
                used_fallback: false,
                degradation: None,
            };
        }

        // Caption over the cap: one aggressive re-summarize attempt.
        debug!(
            chars = rewritten.chars().count(),
            "Rewritten caption exceeds limit, re-summarizing"
        );
        match self.service.complete(AGGRESSIVE_PROMPT, text).await {
            Ok(shorter) if shorter.chars().count() <= CAPTION_LIMIT => {
                return RewriteOutcome {
                    text: shorter,
                    used_fallback: false,
                    degradation: Some(Degradation::Resummarized),
                };
            }
            Ok(still_long) => {
                warn!(
                    chars = still_long.chars().count(),
                    "Aggressive summary still exceeds caption limit, truncating"
                );
            }
            Err(e) => {
                warn!(error = %e, "Aggressive summarize call failed, truncating first rewrite");
            }
        }

        // Last resort: keep as much leading content as fits.
        let truncated: String = rewritten.chars().take(CAPTION_LIMIT).collect();
        RewriteOutcome {
            text: truncated,
            used_fallback: false,
            degradation: Some(Degradation::Truncated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::AiError;

    type AiResult = Result<String, AiError>;

    /// Mock AI service: pops canned responses and records the prompts it
    /// was called with.
    struct MockAi {
        responses: Mutex<Vec<AiResult>>,
        prompts: Mutex<Vec<String>>,
    }

    impl MockAi {
        fn new(responses: Vec<AiResult>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AiService for MockAi {
        async fn complete(&self, system_prompt: &str, _text: &str) -> Result<String, AiError> {
            self.prompts.lock().unwrap().push(system_prompt.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(AiError::RequestFailed("no canned response".into()));
            }
            responses.remove(0)
        }
    }

    #[tokio::test]
    async fn rewrite_returns_model_output() {
        let ai = MockAi::new(vec![Ok("rewritten".into())]);
        let adapter = RewriteAdapter::new(ai.clone());

        let outcome = adapter.rewrite("original", None, false).await;
        assert_eq!(outcome.text, "rewritten");
        assert!(!outcome.used_fallback);
        assert!(outcome.degradation.is_none());
    }

    #[tokio::test]
    async fn rewrite_falls_back_to_original_on_failure() {
        let ai = MockAi::new(vec![Err(AiError::RequestFailed("timeout".into()))]);
        let adapter = RewriteAdapter::new(ai);

        let outcome = adapter.rewrite("keep me intact", None, true).await;
        assert_eq!(outcome.text, "keep me intact");
        assert!(outcome.used_fallback);
        assert!(outcome.degradation.is_none());
    }

    #[tokio::test]
    async fn long_caption_triggers_second_pass() {
        let long = "x".repeat(2000);
        let ai = MockAi::new(vec![Ok(long), Ok("short enough".into())]);
        let adapter = RewriteAdapter::new(ai.clone());

        let outcome = adapter.rewrite("source", None, true).await;
        assert_eq!(outcome.text, "short enough");
        assert_eq!(outcome.degradation, Some(Degradation::Resummarized));
        assert!(!outcome.used_fallback);

        let prompts = ai.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("at most 700"));
    }

    #[tokio::test]
    async fn caption_truncated_when_second_pass_still_long() {
        let ai = MockAi::new(vec![Ok("a".repeat(1500)), Ok("b".repeat(1300))]);
        let adapter = RewriteAdapter::new(ai);

        let outcome = adapter.rewrite("source", None, true).await;
        assert_eq!(outcome.text.chars().count(), CAPTION_LIMIT);
        assert!(outcome.text.starts_with('a'), "truncation keeps the first rewrite");
        assert_eq!(outcome.degradation, Some(Degradation::Truncated));
    }

    #[tokio::test]
    async fn caption_truncated_when_second_pass_fails() {
        let ai = MockAi::new(vec![
            Ok("c".repeat(1500)),
            Err(AiError::Status { code: 500, body: "oops".into() }),
        ]);
        let adapter = RewriteAdapter::new(ai);

        let outcome = adapter.rewrite("source", None, true).await;
        assert_eq!(outcome.text.chars().count(), CAPTION_LIMIT);
        assert_eq!(outcome.degradation, Some(Degradation::Truncated));
        assert!(!outcome.used_fallback, "first call succeeded, so not a fallback");
    }

    #[tokio::test]
    async fn regular_text_has_no_cap() {
        let long = "y".repeat(3000);
        let ai = MockAi::new(vec![Ok(long.clone())]);
        let adapter = RewriteAdapter::new(ai.clone());

        let outcome = adapter.rewrite("source", None, false).await;
        assert_eq!(outcome.text, long);
        assert!(outcome.degradation.is_none());
        // No second call was made.
        assert_eq!(ai.prompts().len(), 1);
    }

    #[tokio::test]
    async fn custom_prompt_wins_over_templates() {
        let ai = MockAi::new(vec![Ok("out".into())]);
        let adapter = RewriteAdapter::new(ai.clone());

        adapter
            .rewrite(&"z".repeat(2000), Some("My custom instructions"), false)
            .await;
        assert_eq!(ai.prompts(), vec!["My custom instructions".to_string()]);
    }

    #[tokio::test]
    async fn long_input_selects_summarize_template() {
        let ai = MockAi::new(vec![Ok("out".into())]);
        let adapter = RewriteAdapter::new(ai.clone());

        adapter.rewrite(&"z".repeat(900), None, false).await;
        assert!(ai.prompts()[0].contains("600 to 800 characters"));
    }

    #[tokio::test]
    async fn short_input_selects_rewrite_template() {
        let ai = MockAi::new(vec![Ok("out".into())]);
        let adapter = RewriteAdapter::new(ai.clone());

        adapter.rewrite("short post", None, false).await;
        assert!(ai.prompts()[0].contains("Rewrite the following post in a clear"));
    }

    #[tokio::test]
    async fn exact_limit_caption_is_not_degraded() {
        let ai = MockAi::new(vec![Ok("e".repeat(CAPTION_LIMIT))]);
        let adapter = RewriteAdapter::new(ai.clone());

        let outcome = adapter.rewrite("source", None, true).await;
        assert_eq!(outcome.text.chars().count(), CAPTION_LIMIT);
        assert!(outcome.degradation.is_none());
        assert_eq!(ai.prompts().len(), 1);
    }

    #[tokio::test]
    async fn multibyte_truncation_counts_characters_not_bytes() {
        // 1500 two-byte characters: byte-based truncation would slice
        // mid-character or keep far too few.
        let ai = MockAi::new(vec![Ok("é".repeat(1500)), Ok("é".repeat(1500))]);
        let adapter = RewriteAdapter::new(ai);

        let outcome = adapter.rewrite("source", None, true).await;
        assert_eq!(outcome.text.chars().count(), CAPTION_LIMIT);
        assert_eq!(outcome.degradation, Some(Degradation::Truncated));
    }
}
