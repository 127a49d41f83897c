use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use channel_relay::ai::{OpenAiCompatClient, RewriteAdapter};
use channel_relay::config::{Credentials, RelayConfig};
use channel_relay::error::ConfigError;
use channel_relay::mode::{AiScope, FooterSelection, ProcessingMode, SessionPolicy, TimeScope};
use channel_relay::pipeline::{FooterComposer, RelayPipeline};
use channel_relay::stats::RelayStats;
use channel_relay::store::DedupLedger;
use channel_relay::transport::{TelegramTransport, Transport};
use channel_relay::watch::WatchLoop;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config_path =
        std::env::var("RELAY_CONFIG").unwrap_or_else(|_| "./relay.json".to_string());
    let config = Arc::new(RelayConfig::load(&config_path)?);
    let credentials = Credentials::from_env()?;

    // Session mode: four axes, all from the environment.
    let time_scope: TimeScope = std::env::var("RELAY_TIME_SCOPE")
        .unwrap_or_else(|_| "live".to_string())
        .parse()?;
    let media_enabled = parse_bool_env("RELAY_MEDIA", true)?;
    let ai_scope: AiScope = std::env::var("RELAY_AI_SCOPE")
        .unwrap_or_else(|_| "captions".to_string())
        .parse()?;
    let footer = FooterSelection::parse(
        &std::env::var("RELAY_FOOTER").unwrap_or_else(|_| "none".to_string()),
    )?;
    let system_prompt = std::env::var("RELAY_AI_PROMPT").ok().filter(|p| !p.is_empty());

    let mode = ProcessingMode::resolve(time_scope, media_enabled, ai_scope, footer.kind());
    let policy = SessionPolicy::new(mode, footer, system_prompt)?;

    let db_path =
        std::env::var("RELAY_DB_PATH").unwrap_or_else(|_| "./data/relay.db".to_string());

    eprintln!("📡 Channel Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {config_path}");
    eprintln!("   Ledger: {db_path}");
    eprintln!("   Model: {} via {}", credentials.ai_model, credentials.ai_base_url);
    eprintln!("   {mode}");
    eprintln!("   Ctrl-C stops after the current message drains.\n");

    let ledger = Arc::new(DedupLedger::open(Path::new(&db_path)).await?);

    let timeout = Duration::from_secs(config.engine.request_timeout_secs);
    let known_channels: Vec<i64> = config
        .mappings
        .iter()
        .flat_map(|m| [m.source_channel_id, m.target_channel_id])
        .collect();
    let transport: Arc<dyn Transport> = Arc::new(TelegramTransport::new(
        credentials.bot_token.clone(),
        known_channels,
        config.engine.media_dir.clone(),
        timeout,
    )?);
    let ai = Arc::new(OpenAiCompatClient::new(
        credentials.ai_base_url.clone(),
        credentials.ai_api_key.clone(),
        credentials.ai_model.clone(),
        timeout,
    )?);

    let stats = Arc::new(RelayStats::new());
    let pipeline = Arc::new(RelayPipeline::new(
        Arc::clone(&transport),
        RewriteAdapter::new(ai),
        FooterComposer::new(Arc::clone(&config)),
        Arc::clone(&ledger),
        Arc::clone(&stats),
        &config.engine,
    ));
    let watch = WatchLoop::new(config, transport, pipeline, ledger, stats);

    // Ctrl-C raises the shutdown flag; workers drain and exit.
    let shutdown = watch.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping — letting in-flight messages drain...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    let snapshot = watch.run(policy).await?;
    eprintln!("Session summary: {snapshot}");
    Ok(())
}

fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected true or false, got '{other}'"),
            }),
        },
    }
}
