//! Relay configuration — channel mappings, saved footers, engine settings.
//!
//! Loaded once from a JSON file at startup and shared read-only for the
//! whole session. Secrets (bot token, AI key) never live in the file —
//! they come from the environment.

use std::path::Path;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A configured source-channel → target-channel relay rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMapping {
    /// Stable identifier, referenced by ledger rows.
    pub id: String,
    pub source_channel_id: i64,
    pub source_channel_name: String,
    pub target_channel_id: i64,
    pub target_channel_name: String,
    /// Every keyword must appear (case-insensitive) for a message to match.
    /// Empty list matches everything.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Required signature substring; empty disables the check.
    #[serde(default)]
    pub signature: String,
    /// Per-mapping override for the AI system prompt.
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// A reusable footer, selectable by name at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedFooter {
    pub name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Engine tuning knobs with conservative defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Live poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Historical backfill window in days.
    pub history_days: i64,
    /// Bounded retry count for a failed send (rate-limited or otherwise).
    pub send_retries: u32,
    /// Forward text-only when a media download fails (instead of marking
    /// the message failed).
    pub forward_text_without_media: bool,
    /// Directory for downloaded media files.
    pub media_dir: String,
    /// Per-request timeout for transport and AI calls, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            history_days: 7,
            send_retries: 3,
            forward_text_without_media: true,
            media_dir: "media".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Full relay configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub mappings: Vec<ChannelMapping>,
    #[serde(default)]
    pub footers: Vec<SavedFooter>,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl RelayConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Mappings with the active flag set.
    pub fn active_mappings(&self) -> impl Iterator<Item = &ChannelMapping> {
        self.mappings.iter().filter(|m| m.active)
    }

    /// Look up a saved footer by name.
    pub fn footer_by_name(&self, name: &str) -> Option<&SavedFooter> {
        self.footers.iter().find(|f| f.name == name)
    }

    /// Structural validation: at least one active mapping, distinct ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.active_mappings().next().is_none() {
            return Err(ConfigError::NoActiveMappings);
        }
        for (i, mapping) in self.mappings.iter().enumerate() {
            if mapping.id.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("mappings[{i}].id"),
                    message: "mapping id must not be empty".to_string(),
                });
            }
            if self.mappings[..i].iter().any(|m| m.id == mapping.id) {
                return Err(ConfigError::InvalidValue {
                    key: format!("mappings[{i}].id"),
                    message: format!("duplicate mapping id '{}'", mapping.id),
                });
            }
        }
        Ok(())
    }
}

/// Secrets and AI endpoint settings, read from the environment.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub bot_token: SecretString,
    pub ai_api_key: SecretString,
    pub ai_base_url: String,
    pub ai_model: String,
}

impl Credentials {
    /// Read credentials from the environment.
    ///
    /// `TELEGRAM_BOT_TOKEN` and `RELAY_AI_API_KEY` are required;
    /// `RELAY_AI_BASE_URL` and `RELAY_AI_MODEL` have OpenAI defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = require_env("TELEGRAM_BOT_TOKEN")?;
        let ai_api_key = require_env("RELAY_AI_API_KEY")?;
        let ai_base_url = std::env::var("RELAY_AI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com".to_string());
        let ai_model =
            std::env::var("RELAY_AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        Ok(Self {
            bot_token: SecretString::from(bot_token),
            ai_api_key: SecretString::from(ai_api_key),
            ai_base_url,
            ai_model,
        })
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn default_true() -> bool {
    true
}
