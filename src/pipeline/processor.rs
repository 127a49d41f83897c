//! Relay pipeline — turns one raw inbound message into at most one
//! outbound post.
//!
//! Per-message state machine:
//! Received → Filtered(pass|drop) → Claimed(ok|duplicate) → Rewritten →
//! Footered → Forwarded(ok|failed). Filter drops and duplicates are
//! expected outcomes, not errors; nothing in here may take down a
//! mapping's worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::ai::RewriteAdapter;
use crate::ai::rewriter::Degradation;
use crate::config::{ChannelMapping, EngineSettings};
use crate::error::{PipelineError, TransportError};
use crate::mode::SessionPolicy;
use crate::pipeline::{FooterComposer, filter};
use crate::stats::RelayStats;
use crate::store::DedupLedger;
use crate::transport::{MediaKind, RawMessage, Transport};

/// Fixed wait between retries of a non-rate-limited send failure.
const SEND_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Failure-reason prefix marking rows the live loop should keep retrying.
const RATE_LIMIT_REASON: &str = "rate limited";

/// How one message left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Filter rejected it — no ledger row exists.
    FilteredOut,
    /// Already claimed by an earlier (or concurrent) scan.
    Duplicate,
    /// Sent and recorded.
    Forwarded,
    /// Claimed but not forwarded; the reason is on the ledger row.
    Failed { reason: String },
}

/// The per-message decision pipeline.
pub struct RelayPipeline {
    transport: Arc<dyn Transport>,
    rewriter: RewriteAdapter,
    footer: FooterComposer,
    ledger: Arc<DedupLedger>,
    stats: Arc<RelayStats>,
    send_retries: u32,
    forward_text_without_media: bool,
}

impl RelayPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        rewriter: RewriteAdapter,
        footer: FooterComposer,
        ledger: Arc<DedupLedger>,
        stats: Arc<RelayStats>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            transport,
            rewriter,
            footer,
            ledger,
            stats,
            send_retries: settings.send_retries,
            forward_text_without_media: settings.forward_text_without_media,
        }
    }

    /// Run one message through the full pipeline.
    pub async fn process(
        &self,
        mapping: &ChannelMapping,
        policy: &SessionPolicy,
        message: &RawMessage,
    ) -> Result<PipelineOutcome, PipelineError> {
        self.stats.record_observed();

        if !filter::matches(mapping, &message.text) {
            debug!(mapping = %mapping.id, message_id = message.id, "Filter rejected message");
            self.stats.record_filtered_out();
            return Ok(PipelineOutcome::FilteredOut);
        }

        if !self
            .ledger
            .try_claim(&mapping.id, message.id, &message.text, message.timestamp)
            .await?
        {
            debug!(mapping = %mapping.id, message_id = message.id, "Duplicate message skipped");
            self.stats.record_duplicate();
            return Ok(PipelineOutcome::Duplicate);
        }

        // Media download, when the session wants it.
        let mut media: Option<(PathBuf, MediaKind)> = None;
        if let Some(media_ref) = &message.media
            && policy.download_media()
        {
            match self.transport.download_media(media_ref).await {
                Ok(path) => media = Some((path, media_ref.kind)),
                Err(e) => {
                    self.stats.record_media_failure();
                    if self.forward_text_without_media && !message.text.is_empty() {
                        warn!(
                            mapping = %mapping.id,
                            message_id = message.id,
                            error = %e,
                            "Media download failed, forwarding text only"
                        );
                    } else {
                        let reason = format!("media download failed: {e}");
                        self.ledger.mark_failed(&mapping.id, message.id, &reason).await?;
                        error!(mapping = %mapping.id, message_id = message.id, "{reason}");
                        return Ok(PipelineOutcome::Failed { reason });
                    }
                }
            }
        }

        // AI rewrite. Captions always qualify; plain text only under the
        // all-messages scope.
        let is_caption = message.media.is_some();
        let system_prompt = policy
            .system_prompt
            .as_deref()
            .or(mapping.prompt_template.as_deref());

        let body = if message.text.is_empty() {
            String::new()
        } else if is_caption || policy.ai_applies_to_regular_text() {
            let outcome = self
                .rewriter
                .rewrite(&message.text, system_prompt, is_caption)
                .await;
            if outcome.used_fallback {
                self.stats.record_ai_fallback();
            }
            match outcome.degradation {
                Some(Degradation::Resummarized) => self.stats.record_caption_resummarized(),
                Some(Degradation::Truncated) => self.stats.record_caption_truncated(),
                None => {}
            }
            outcome.text
        } else {
            message.text.clone()
        };

        let final_text = self.footer.apply(&body, &policy.footer);

        if final_text.is_empty() && media.is_none() {
            let reason = "nothing to forward (empty text, no media)".to_string();
            self.ledger.mark_failed(&mapping.id, message.id, &reason).await?;
            return Ok(PipelineOutcome::Failed { reason });
        }

        self.ledger
            .record_result(
                &mapping.id,
                message.id,
                &final_text,
                media.as_ref().and_then(|(p, _)| p.to_str()),
                media.as_ref().map(|(_, k)| k.as_str()),
            )
            .await?;

        let media_arg = media.as_ref().map(|(path, kind)| (path.as_path(), *kind));
        match self.send_with_retry(mapping.target_channel_id, &final_text, media_arg).await {
            Ok(()) => {
                self.ledger.mark_forwarded(&mapping.id, message.id).await?;
                self.stats.record_forwarded();
                info!(
                    mapping = %mapping.id,
                    message_id = message.id,
                    channel = mapping.target_channel_id,
                    "Message forwarded"
                );
                Ok(PipelineOutcome::Forwarded)
            }
            Err(e) => {
                // Rate-limit exhaustion is recorded with a recognizable
                // prefix so the live loop retries it next cycle; other
                // send failures are terminal.
                let reason = if e.is_rate_limited() {
                    format!("{RATE_LIMIT_REASON} after {} retries: {e}", self.send_retries)
                } else {
                    format!("send failed after {} retries: {e}", self.send_retries)
                };
                self.ledger.mark_failed(&mapping.id, message.id, &reason).await?;
                self.stats.record_send_failure();
                error!(mapping = %mapping.id, message_id = message.id, "{reason}");
                Ok(PipelineOutcome::Failed { reason })
            }
        }
    }

    /// Retry sends that previously exhausted their backoff against a rate
    /// limit. One attempt per row per call — the live loop invokes this
    /// once per poll cycle.
    pub async fn retry_rate_limited(&self, mapping: &ChannelMapping) -> Result<usize, PipelineError> {
        let rows = self
            .ledger
            .failed_with_reason_prefix(&mapping.id, RATE_LIMIT_REASON)
            .await?;

        let mut recovered = 0;
        for row in rows {
            let text = row.final_text.as_deref().unwrap_or(row.original_text.as_str());
            let media_kind = row.media_kind.as_deref().and_then(MediaKind::parse);
            let media = match (&row.media_path, media_kind) {
                (Some(path), Some(kind)) => Some((PathBuf::from(path), kind)),
                _ => None,
            };
            let media_arg = media.as_ref().map(|(path, kind)| (path.as_path(), *kind));

            match self
                .transport
                .send(mapping.target_channel_id, text, media_arg)
                .await
            {
                Ok(()) => {
                    self.ledger
                        .mark_forwarded(&mapping.id, row.source_message_id)
                        .await?;
                    self.stats.record_forwarded();
                    info!(
                        mapping = %mapping.id,
                        message_id = row.source_message_id,
                        "Rate-limited message forwarded on retry"
                    );
                    recovered += 1;
                }
                Err(e) => {
                    debug!(
                        mapping = %mapping.id,
                        message_id = row.source_message_id,
                        error = %e,
                        "Rate-limited message still not sendable"
                    );
                }
            }
        }
        Ok(recovered)
    }

    /// Re-offer rows that were claimed but never forwarded (crash between
    /// claim and send). Returns how many were forwarded now.
    pub async fn resume_pending(&self, mapping: &ChannelMapping) -> Result<usize, PipelineError> {
        let pending = self.ledger.pending_forwards(&mapping.id).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!(
            mapping = %mapping.id,
            count = pending.len(),
            "Re-offering unforwarded messages from a previous run"
        );

        let mut resumed = 0;
        for row in pending {
            // Prefer the recorded final text; fall back to the original for
            // rows that crashed before processing finished.
            let text = row.final_text.as_deref().unwrap_or(row.original_text.as_str());
            let media_kind = row.media_kind.as_deref().and_then(MediaKind::parse);
            let media = match (&row.media_path, media_kind) {
                (Some(path), Some(kind)) => Some((PathBuf::from(path), kind)),
                _ => None,
            };
            if text.is_empty() && media.is_none() {
                continue;
            }

            let media_arg = media.as_ref().map(|(path, kind)| (path.as_path(), *kind));
            match self
                .send_with_retry(mapping.target_channel_id, text, media_arg)
                .await
            {
                Ok(()) => {
                    self.ledger
                        .mark_forwarded(&mapping.id, row.source_message_id)
                        .await?;
                    self.stats.record_forwarded();
                    resumed += 1;
                }
                Err(e) => {
                    // Leave the row unforwarded; the next startup tries again.
                    warn!(
                        mapping = %mapping.id,
                        message_id = row.source_message_id,
                        error = %e,
                        "Failed to resume pending forward"
                    );
                }
            }
        }
        Ok(resumed)
    }

    /// Send with bounded retries. Rate-limit outcomes honor the requested
    /// backoff; other failures wait a fixed delay.
    async fn send_with_retry(
        &self,
        target: i64,
        text: &str,
        media: Option<(&Path, MediaKind)>,
    ) -> Result<(), TransportError> {
        let mut attempt: u32 = 0;
        loop {
            match self.transport.send(target, text, media).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.send_retries => return Err(e),
                Err(TransportError::RateLimited { retry_after }) => {
                    let wait = retry_after.unwrap_or(SEND_RETRY_DELAY);
                    warn!(
                        channel = target,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    warn!(channel = target, attempt, error = %e, "Send failed, retrying");
                    tokio::time::sleep(SEND_RETRY_DELAY).await;
                }
            }
            attempt += 1;
        }
    }
}
