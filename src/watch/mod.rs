//! Scan/watch loop — historical backfill and live polling per mapping.
//!
//! One transient task per mapping runs the bounded historical scan; one
//! long-lived worker per mapping runs the live poll. Both feed the same
//! pipeline and may observe the same message — the dedup ledger is the
//! only thing preventing a double relay, by design. A failure inside one
//! mapping's worker never halts another's.
//!
//! Shutdown is a shared flag, honored at the next safe drain point (the
//! end of the current message's pipeline run), so an in-flight forward is
//! never aborted halfway.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelMapping, RelayConfig};
use crate::error::{ConfigError, Error};
use crate::mode::{FooterSelection, SessionPolicy};
use crate::pipeline::RelayPipeline;
use crate::stats::{RelayStats, StatsSnapshot};
use crate::store::DedupLedger;
use crate::transport::Transport;

/// Drives the pipeline from the historical and live scan sources.
pub struct WatchLoop {
    config: Arc<RelayConfig>,
    transport: Arc<dyn Transport>,
    pipeline: Arc<RelayPipeline>,
    ledger: Arc<DedupLedger>,
    stats: Arc<RelayStats>,
    shutdown: Arc<AtomicBool>,
}

impl WatchLoop {
    pub fn new(
        config: Arc<RelayConfig>,
        transport: Arc<dyn Transport>,
        pipeline: Arc<RelayPipeline>,
        ledger: Arc<DedupLedger>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            config,
            transport,
            pipeline,
            ledger,
            stats,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the loop at the next drain point.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run a full session under the given policy.
    ///
    /// Returns once every worker has finished: immediately after the
    /// backfill for historical-only sessions, or after the shutdown flag
    /// is raised for sessions with a live scope.
    pub async fn run(&self, policy: SessionPolicy) -> Result<StatsSnapshot, Error> {
        self.preflight(&policy).await?;

        let mappings: Vec<ChannelMapping> = self.config.active_mappings().cloned().collect();
        info!(mappings = mappings.len(), "Starting session, {}", policy.mode);

        // Re-offer rows a previous run claimed but never forwarded.
        for mapping in &mappings {
            match self.pipeline.resume_pending(mapping).await {
                Ok(0) => {}
                Ok(count) => info!(mapping = %mapping.id, count, "Resumed pending forwards"),
                Err(e) => warn!(mapping = %mapping.id, error = %e, "Startup resume failed"),
            }
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        if policy.run_historical() {
            for mapping in mappings.clone() {
                handles.push(tokio::spawn(historical_scan(
                    Arc::clone(&self.transport),
                    Arc::clone(&self.pipeline),
                    mapping,
                    policy.clone(),
                    Arc::clone(&self.shutdown),
                    self.config.engine.history_days,
                )));
            }
        }

        if policy.run_live() {
            let poll_interval = Duration::from_millis(self.config.engine.poll_interval_ms);
            for mapping in mappings {
                handles.push(tokio::spawn(live_worker(
                    Arc::clone(&self.transport),
                    Arc::clone(&self.pipeline),
                    Arc::clone(&self.ledger),
                    mapping,
                    policy.clone(),
                    Arc::clone(&self.shutdown),
                    poll_interval,
                )));
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task panicked: {e}");
            }
        }

        let snapshot = self.stats.snapshot();
        info!("Session finished: {snapshot}");
        Ok(snapshot)
    }

    /// Surface unrecoverable configuration problems before any worker
    /// starts.
    async fn preflight(&self, policy: &SessionPolicy) -> Result<(), Error> {
        if self.config.active_mappings().next().is_none() {
            return Err(ConfigError::NoActiveMappings.into());
        }

        if let FooterSelection::Saved(name) = &policy.footer
            && self.config.footer_by_name(name).is_none()
        {
            warn!(footer = %name, "Saved footer not found, messages will go out without one");
        }

        let channels = self.transport.list_channels().await.map_err(Error::from)?;
        for channel in &channels {
            debug!(id = channel.id, name = %channel.name, "Channel resolved");
        }
        Ok(())
    }
}

/// One bounded pass over a mapping's recent history, oldest first.
async fn historical_scan(
    transport: Arc<dyn Transport>,
    pipeline: Arc<RelayPipeline>,
    mapping: ChannelMapping,
    policy: SessionPolicy,
    shutdown: Arc<AtomicBool>,
    history_days: i64,
) {
    let since = chrono::Utc::now() - chrono::Duration::days(history_days);
    info!(mapping = %mapping.id, %since, "Historical scan started");

    let mut stream = match transport.fetch_history(mapping.source_channel_id, since).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(mapping = %mapping.id, error = %e, "Historical fetch failed");
            return;
        }
    };

    let mut processed = 0usize;
    while let Some(message) = stream.next().await {
        if shutdown.load(Ordering::Relaxed) {
            info!(mapping = %mapping.id, "Historical scan interrupted by shutdown");
            return;
        }
        match pipeline.process(&mapping, &policy, &message).await {
            Ok(_) => processed += 1,
            Err(e) => {
                error!(
                    mapping = %mapping.id,
                    message_id = message.id,
                    error = %e,
                    "Pipeline error during historical scan"
                );
            }
        }
    }
    info!(mapping = %mapping.id, processed, "Historical scan complete");
}

/// Continuous poll for one mapping, until shutdown.
async fn live_worker(
    transport: Arc<dyn Transport>,
    pipeline: Arc<RelayPipeline>,
    ledger: Arc<DedupLedger>,
    mapping: ChannelMapping,
    policy: SessionPolicy,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    let mut cursor: Option<i64> = match ledger.last_seen_id(&mapping.id).await {
        Ok(id) => id,
        Err(e) => {
            error!(mapping = %mapping.id, error = %e, "Failed to read live cursor, starting fresh");
            None
        }
    };

    // With a historical scope in the same session the backfill owns the
    // backlog: poll everything and let the ledger dedup, instead of
    // cutting a baseline that would swallow one message.
    if cursor.is_none() && policy.run_historical() {
        cursor = Some(0);
    }

    info!(mapping = %mapping.id, ?cursor, "Live worker started");
    let mut interval = tokio::time::interval(poll_interval);

    loop {
        interval.tick().await;
        if shutdown.load(Ordering::Relaxed) {
            info!(mapping = %mapping.id, "Live worker stopping");
            return;
        }

        // First activation: record the newest visible message as the
        // baseline so only messages arriving from now on are relayed.
        if cursor.is_none() {
            match transport.poll_new(mapping.source_channel_id, None).await {
                Ok(messages) => {
                    if let Some(newest) = messages.iter().max_by_key(|m| m.id) {
                        match ledger
                            .record_baseline(&mapping.id, newest.id, newest.timestamp)
                            .await
                        {
                            Ok(()) => cursor = Some(newest.id),
                            Err(e) => {
                                error!(mapping = %mapping.id, error = %e, "Failed to record baseline")
                            }
                        }
                    }
                }
                Err(e) => warn!(mapping = %mapping.id, error = %e, "Baseline poll failed"),
            }
            continue;
        }

        // Give previously rate-limited messages another chance each cycle.
        match pipeline.retry_rate_limited(&mapping).await {
            Ok(0) => {}
            Ok(recovered) => info!(mapping = %mapping.id, recovered, "Recovered rate-limited messages"),
            Err(e) => warn!(mapping = %mapping.id, error = %e, "Rate-limit retry pass failed"),
        }

        let new_messages = match transport.poll_new(mapping.source_channel_id, cursor).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(mapping = %mapping.id, error = %e, "Live poll failed");
                continue;
            }
        };

        for message in new_messages {
            if shutdown.load(Ordering::Relaxed) {
                info!(mapping = %mapping.id, "Live worker draining before shutdown");
                return;
            }
            // The cursor advances over every observed message, including
            // filter rejections — otherwise they would be re-examined on
            // every poll.
            cursor = Some(cursor.map_or(message.id, |c| c.max(message.id)));
            if let Err(e) = pipeline.process(&mapping, &policy, &message).await {
                error!(
                    mapping = %mapping.id,
                    message_id = message.id,
                    error = %e,
                    "Pipeline error during live poll"
                );
            }
        }
    }
}
