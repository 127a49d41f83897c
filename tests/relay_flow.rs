//! End-to-end relay flow against mock collaborators.
//!
//! Exercises the whole engine — watch loop, pipeline, rewriter, footer,
//! ledger — with a scripted transport and AI service, the way a session
//! runs in production minus the network.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;

use channel_relay::ai::{AiService, RewriteAdapter};
use channel_relay::config::{ChannelMapping, EngineSettings, RelayConfig};
use channel_relay::error::{AiError, TransportError};
use channel_relay::mode::{AiScope, FooterSelection, ProcessingMode, SessionPolicy, TimeScope};
use channel_relay::pipeline::{FooterComposer, RelayPipeline};
use channel_relay::stats::RelayStats;
use channel_relay::store::DedupLedger;
use channel_relay::transport::{
    ChannelInfo, HistoryStream, MediaKind, MediaRef, RawMessage, Transport,
};
use channel_relay::watch::WatchLoop;

// ── Mock collaborators ──────────────────────────────────────────────

/// AI that applies a scripted transformation.
struct ScriptedAi {
    transform: Box<dyn Fn(&str) -> String + Send + Sync>,
}

impl ScriptedAi {
    fn prefixing(prefix: &'static str) -> Arc<Self> {
        Arc::new(Self {
            transform: Box::new(move |text| format!("{prefix}{text}")),
        })
    }

    fn fixed_length(len: usize) -> Arc<Self> {
        Arc::new(Self {
            transform: Box::new(move |_| "x".repeat(len)),
        })
    }
}

#[async_trait]
impl AiService for ScriptedAi {
    async fn complete(&self, _system_prompt: &str, text: &str) -> Result<String, AiError> {
        Ok((self.transform)(text))
    }
}

/// Transport with scripted history/live backlogs and recorded sends.
#[derive(Default)]
struct ScriptedTransport {
    history: Mutex<HashMap<i64, Vec<RawMessage>>>,
    live: Mutex<HashMap<i64, Vec<RawMessage>>>,
    fail_sends: bool,
    sent: Mutex<Vec<(i64, String, Option<PathBuf>)>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing_sends() -> Arc<Self> {
        Arc::new(Self {
            fail_sends: true,
            ..Default::default()
        })
    }

    fn add_history(&self, channel: i64, message: RawMessage) {
        self.history.lock().unwrap().entry(channel).or_default().push(message);
    }

    fn sent(&self) -> Vec<(i64, String, Option<PathBuf>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, TransportError> {
        Ok(vec![])
    }

    async fn fetch_history(
        &self,
        channel_id: i64,
        since: DateTime<Utc>,
    ) -> Result<HistoryStream, TransportError> {
        let mut messages: Vec<RawMessage> = self
            .history
            .lock()
            .unwrap()
            .get(&channel_id)
            .map(|m| m.iter().filter(|m| m.timestamp >= since).cloned().collect())
            .unwrap_or_default();
        messages.sort_by_key(|m| m.id);
        Ok(futures::stream::iter(messages).boxed())
    }

    async fn poll_new(
        &self,
        channel_id: i64,
        after_id: Option<i64>,
    ) -> Result<Vec<RawMessage>, TransportError> {
        let mut messages: Vec<RawMessage> = self
            .live
            .lock()
            .unwrap()
            .get(&channel_id)
            .map(|m| {
                m.iter()
                    .filter(|m| after_id.is_none_or(|after| m.id > after))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn download_media(&self, media: &MediaRef) -> Result<PathBuf, TransportError> {
        Ok(PathBuf::from(format!("media/{}.jpg", media.file_id)))
    }

    async fn send(
        &self,
        target_channel_id: i64,
        text: &str,
        media: Option<(&Path, MediaKind)>,
    ) -> Result<(), TransportError> {
        if self.fail_sends {
            return Err(TransportError::Api {
                method: "sendMessage".into(),
                description: "simulated outage".into(),
            });
        }
        self.sent.lock().unwrap().push((
            target_channel_id,
            text.to_string(),
            media.map(|(p, _)| p.to_path_buf()),
        ));
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn text_message(id: i64, text: &str) -> RawMessage {
    RawMessage {
        id,
        channel_id: -100,
        timestamp: Utc::now(),
        text: text.into(),
        media: None,
    }
}

fn media_message(id: i64, caption: &str) -> RawMessage {
    RawMessage {
        id,
        channel_id: -100,
        timestamp: Utc::now(),
        text: caption.into(),
        media: Some(MediaRef {
            kind: MediaKind::Photo,
            file_id: format!("file{id}"),
        }),
    }
}

fn config(keywords: Vec<String>) -> Arc<RelayConfig> {
    Arc::new(RelayConfig {
        mappings: vec![ChannelMapping {
            id: "m1".into(),
            source_channel_id: -100,
            source_channel_name: "source".into(),
            target_channel_id: -200,
            target_channel_name: "target".into(),
            keywords,
            signature: String::new(),
            prompt_template: None,
            active: true,
        }],
        footers: vec![],
        engine: EngineSettings {
            poll_interval_ms: 10,
            send_retries: 0,
            ..Default::default()
        },
    })
}

struct Harness {
    watch: WatchLoop,
    ledger: Arc<DedupLedger>,
    stats: Arc<RelayStats>,
}

async fn harness(
    transport: Arc<ScriptedTransport>,
    ai: Arc<ScriptedAi>,
    config: Arc<RelayConfig>,
    ledger: Arc<DedupLedger>,
) -> Harness {
    let stats = Arc::new(RelayStats::new());
    let pipeline = Arc::new(RelayPipeline::new(
        transport.clone(),
        RewriteAdapter::new(ai),
        FooterComposer::new(Arc::clone(&config)),
        Arc::clone(&ledger),
        Arc::clone(&stats),
        &config.engine,
    ));
    let watch = WatchLoop::new(config, transport, pipeline, Arc::clone(&ledger), Arc::clone(&stats));
    Harness {
        watch,
        ledger,
        stats,
    }
}

fn policy(time_scope: TimeScope, media: bool, ai: AiScope, footer: FooterSelection) -> SessionPolicy {
    let mode = ProcessingMode::resolve(time_scope, media, ai, footer.kind());
    SessionPolicy::new(mode, footer, None).unwrap()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn historical_session_filters_rewrites_and_footers() {
    let transport = ScriptedTransport::new();
    transport.add_history(-100, text_message(1, "alpha launch announcement"));
    transport.add_history(-100, text_message(2, "unrelated chatter"));
    transport.add_history(-100, media_message(3, "alpha chart attached"));

    let ledger = Arc::new(DedupLedger::open_in_memory().await.unwrap());
    let h = harness(
        transport.clone(),
        ScriptedAi::prefixing("rewritten: "),
        config(vec!["alpha".into()]),
        ledger,
    )
    .await;

    let snapshot = h
        .watch
        .run(policy(
            TimeScope::Historical,
            true,
            AiScope::AllMessages,
            FooterSelection::Custom("via relay".into()),
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.observed, 3);
    assert_eq!(snapshot.filtered_out, 1);
    assert_eq!(snapshot.forwarded, 2);

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);

    // Text message: rewritten, footered, no media.
    assert_eq!(sent[0].0, -200);
    assert_eq!(sent[0].1, "rewritten: alpha launch announcement\n\nvia relay");
    assert!(sent[0].2.is_none());

    // Media message: caption rewritten, media attached.
    assert_eq!(sent[1].1, "rewritten: alpha chart attached\n\nvia relay");
    assert_eq!(sent[1].2.as_deref(), Some(Path::new("media/file3.jpg")));

    // The filtered message left no ledger row.
    assert!(h.ledger.get("m1", 2).await.unwrap().is_none());
    assert!(h.ledger.get("m1", 1).await.unwrap().unwrap().forwarded);
}

#[tokio::test]
async fn caption_cap_holds_end_to_end() {
    let transport = ScriptedTransport::new();
    transport.add_history(-100, media_message(1, "a very long story"));

    let ledger = Arc::new(DedupLedger::open_in_memory().await.unwrap());
    // Both rewrite passes come back far over the cap.
    let h = harness(
        transport.clone(),
        ScriptedAi::fixed_length(3000),
        config(vec![]),
        ledger,
    )
    .await;

    let snapshot = h
        .watch
        .run(policy(
            TimeScope::Historical,
            true,
            AiScope::CaptionsOnly,
            FooterSelection::None,
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.forwarded, 1);
    assert_eq!(snapshot.caption_truncated, 1);

    let sent = transport.sent();
    assert_eq!(sent[0].1.chars().count(), 1024);
}

#[tokio::test]
async fn rescan_after_a_completed_session_is_idempotent() {
    let transport = ScriptedTransport::new();
    transport.add_history(-100, text_message(1, "the one story"));
    let ledger = Arc::new(DedupLedger::open_in_memory().await.unwrap());

    // First session forwards the message.
    let first = harness(
        transport.clone(),
        ScriptedAi::prefixing(""),
        config(vec![]),
        Arc::clone(&ledger),
    )
    .await;
    let snapshot = first
        .watch
        .run(policy(
            TimeScope::Historical,
            false,
            AiScope::CaptionsOnly,
            FooterSelection::None,
        ))
        .await
        .unwrap();
    assert_eq!(snapshot.forwarded, 1);

    // Second session over the same ledger sees only a duplicate.
    let second = harness(
        transport.clone(),
        ScriptedAi::prefixing(""),
        config(vec![]),
        Arc::clone(&ledger),
    )
    .await;
    let snapshot = second
        .watch
        .run(policy(
            TimeScope::Historical,
            false,
            AiScope::CaptionsOnly,
            FooterSelection::None,
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.forwarded, 0);
    assert_eq!(snapshot.duplicates, 1);
    assert_eq!(transport.sent().len(), 1, "still exactly one send overall");
}

#[tokio::test]
async fn send_outage_records_failure_and_next_session_does_not_resend() {
    let transport = ScriptedTransport::failing_sends();
    transport.add_history(-100, text_message(1, "doomed story"));
    let ledger = Arc::new(DedupLedger::open_in_memory().await.unwrap());

    let h = harness(
        transport.clone(),
        ScriptedAi::prefixing(""),
        config(vec![]),
        Arc::clone(&ledger),
    )
    .await;
    let snapshot = h
        .watch
        .run(policy(
            TimeScope::Historical,
            false,
            AiScope::CaptionsOnly,
            FooterSelection::None,
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.forwarded, 0);
    assert_eq!(snapshot.send_failures, 1);

    let row = ledger.get("m1", 1).await.unwrap().unwrap();
    assert!(!row.forwarded);
    assert!(row.failure_reason.is_some());

    // A failed row is terminal: the next session neither resumes nor
    // re-claims it.
    let working = ScriptedTransport::new();
    working.add_history(-100, text_message(1, "doomed story"));
    let h2 = harness(
        working.clone(),
        ScriptedAi::prefixing(""),
        config(vec![]),
        Arc::clone(&ledger),
    )
    .await;
    let snapshot = h2
        .watch
        .run(policy(
            TimeScope::Historical,
            false,
            AiScope::CaptionsOnly,
            FooterSelection::None,
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.forwarded, 0);
    assert_eq!(snapshot.duplicates, 1);
    assert!(working.sent().is_empty());
}

#[tokio::test]
async fn live_overlap_with_historical_stays_at_most_once() {
    let transport = ScriptedTransport::new();
    let shared = text_message(42, "story both scans see");
    transport.add_history(-100, shared.clone());
    transport.live.lock().unwrap().entry(-100).or_default().push(shared);

    let ledger = Arc::new(DedupLedger::open_in_memory().await.unwrap());
    let h = harness(
        transport.clone(),
        ScriptedAi::prefixing(""),
        config(vec![]),
        Arc::clone(&ledger),
    )
    .await;

    let shutdown = h.watch.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.store(true, Ordering::Relaxed);
    });

    let snapshot = h
        .watch
        .run(policy(
            TimeScope::Both,
            false,
            AiScope::CaptionsOnly,
            FooterSelection::None,
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.forwarded, 1, "exactly one forward despite two observers");
    assert_eq!(transport.sent().len(), 1);
    assert!(h.stats.snapshot().duplicates <= 1);
}
