//! Telegram transport — Bot API over HTTP.
//!
//! Update delivery uses `getUpdates` with an internal per-channel buffer:
//! one refill drains the global update queue into per-channel message
//! queues, and `poll_new`/`fetch_history` read from those. The Bot API only
//! exposes the pending update backlog, so the historical scan is bounded by
//! what Telegram still has queued for the bot; messages older than the
//! backlog require an MTProto client and are out of reach here.
//!
//! A buffered message stays visible to `fetch_history` until `poll_new`
//! drains it, so overlapping historical and live scans can both observe it
//! — deduplication downstream is what keeps the relay at-most-once.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{ChannelInfo, HistoryStream, MediaKind, MediaRef, RawMessage, Transport};

/// Maximum length of a plain text message.
const MAX_TEXT_LENGTH: usize = 4096;

/// Per-channel buffer of updates pulled from `getUpdates`.
#[derive(Debug, Default)]
struct UpdateBuffer {
    /// Next `getUpdates` offset (last seen update id + 1).
    offset: i64,
    queues: HashMap<i64, VecDeque<RawMessage>>,
}

/// Telegram Bot API transport.
pub struct TelegramTransport {
    bot_token: SecretString,
    /// Channel ids this transport resolves in `list_channels`.
    known_channels: Vec<i64>,
    media_dir: PathBuf,
    client: reqwest::Client,
    buffer: Mutex<UpdateBuffer>,
}

impl TelegramTransport {
    pub fn new(
        bot_token: SecretString,
        known_channels: Vec<i64>,
        media_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            bot_token,
            known_channels,
            media_dir: media_dir.into(),
            client,
            buffer: Mutex::new(UpdateBuffer::default()),
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "https://api.telegram.org/file/bot{}/{file_path}",
            self.bot_token.expose_secret()
        )
    }

    /// POST a Bot API method and return its `result` payload.
    async fn call_api(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        if payload.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
            return Err(api_error(method, status, &payload));
        }
        Ok(payload.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }

    /// Pull all pending updates into the per-channel queues.
    async fn refill(&self) -> Result<(), TransportError> {
        let offset = self.buffer.lock().expect("update buffer poisoned").offset;
        let body = serde_json::json!({
            "offset": offset,
            "timeout": 0,
            "allowed_updates": ["channel_post"],
        });

        let result = self.call_api("getUpdates", &body).await?;
        let updates = result
            .as_array()
            .ok_or_else(|| TransportError::InvalidResponse("getUpdates result is not an array".into()))?;

        let mut buffer = self.buffer.lock().expect("update buffer poisoned");
        for update in updates {
            if let Some(update_id) = update.get("update_id").and_then(serde_json::Value::as_i64) {
                buffer.offset = buffer.offset.max(update_id + 1);
            }
            let Some(post) = update.get("channel_post") else {
                continue;
            };
            let Some(message) = parse_channel_post(post) else {
                debug!("Skipping unparseable channel post");
                continue;
            };
            buffer
                .queues
                .entry(message.channel_id)
                .or_default()
                .push_back(message);
        }
        Ok(())
    }

    /// Send one text chunk (≤4096 chars) to a channel.
    async fn send_text_chunk(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        self.call_api("sendMessage", &body).await?;
        Ok(())
    }

    /// Upload a media file with the given caption.
    async fn send_media(
        &self,
        chat_id: i64,
        path: &Path,
        kind: MediaKind,
        caption: &str,
    ) -> Result<(), TransportError> {
        let (method, field) = match kind {
            MediaKind::Photo => ("sendPhoto", "photo"),
            MediaKind::Video => ("sendVideo", "video"),
            MediaKind::Audio => ("sendAudio", "audio"),
            MediaKind::Document => ("sendDocument", "document"),
        };

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        let part = Part::bytes(bytes).file_name(file_name);

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field, part);
        if !caption.is_empty() {
            form = form.text("caption", caption.to_string());
        }

        let response = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        if payload.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
            return Err(api_error(method, status, &payload));
        }

        info!(chat_id, method, "Media sent");
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, TransportError> {
        // getMe doubles as the connectivity/auth check.
        self.call_api("getMe", &serde_json::json!({})).await?;

        let mut channels = Vec::with_capacity(self.known_channels.len());
        for &id in &self.known_channels {
            let name = match self
                .call_api("getChat", &serde_json::json!({ "chat_id": id }))
                .await
            {
                Ok(chat) => chat
                    .get("title")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("untitled")
                    .to_string(),
                Err(e) => {
                    warn!(channel = id, error = %e, "Failed to resolve channel, using placeholder");
                    format!("channel {id}")
                }
            };
            channels.push(ChannelInfo { id, name });
        }
        Ok(channels)
    }

    async fn fetch_history(
        &self,
        channel_id: i64,
        since: DateTime<Utc>,
    ) -> Result<HistoryStream, TransportError> {
        self.refill().await?;

        let buffer = self.buffer.lock().expect("update buffer poisoned");
        let mut messages: Vec<RawMessage> = buffer
            .queues
            .get(&channel_id)
            .map(|queue| queue.iter().filter(|m| m.timestamp >= since).cloned().collect())
            .unwrap_or_default();
        drop(buffer);

        messages.sort_by_key(|m| m.id);
        debug!(channel = channel_id, count = messages.len(), "History fetched from backlog");
        Ok(futures::stream::iter(messages).boxed())
    }

    async fn poll_new(
        &self,
        channel_id: i64,
        after_id: Option<i64>,
    ) -> Result<Vec<RawMessage>, TransportError> {
        self.refill().await?;

        let mut buffer = self.buffer.lock().expect("update buffer poisoned");
        let Some(queue) = buffer.queues.get_mut(&channel_id) else {
            return Ok(Vec::new());
        };

        let mut messages: Vec<RawMessage> = queue
            .drain(..)
            .filter(|m| after_id.is_none_or(|after| m.id > after))
            .collect();
        drop(buffer);

        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn download_media(&self, media: &MediaRef) -> Result<PathBuf, TransportError> {
        let result = self
            .call_api("getFile", &serde_json::json!({ "file_id": media.file_id }))
            .await
            .map_err(|e| TransportError::MediaDownload(e.to_string()))?;

        let remote_path = result
            .get("file_path")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| TransportError::MediaDownload("getFile returned no file_path".into()))?;

        let extension = extension_of(remote_path).unwrap_or("bin");
        let local_path = self.media_dir.join(format!("{}.{extension}", media.file_id));

        // Already downloaded in an earlier run.
        if tokio::fs::try_exists(&local_path).await.unwrap_or(false) {
            return Ok(local_path);
        }

        tokio::fs::create_dir_all(&self.media_dir).await?;

        let response = self
            .client
            .get(self.file_url(remote_path))
            .send()
            .await
            .map_err(|e| TransportError::MediaDownload(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::MediaDownload(format!(
                "file download returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::MediaDownload(e.to_string()))?;
        tokio::fs::write(&local_path, &bytes).await?;

        info!(file_id = %media.file_id, path = %local_path.display(), "Media downloaded");
        Ok(local_path)
    }

    async fn send(
        &self,
        target_channel_id: i64,
        text: &str,
        media: Option<(&Path, MediaKind)>,
    ) -> Result<(), TransportError> {
        match media {
            Some((path, kind)) => self.send_media(target_channel_id, path, kind, text).await,
            None => {
                for chunk in split_message(text, MAX_TEXT_LENGTH) {
                    self.send_text_chunk(target_channel_id, &chunk).await?;
                }
                Ok(())
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Map a failed Bot API response to a transport error, surfacing rate
/// limits as their own variant with the requested backoff.
fn api_error(method: &str, status: u16, payload: &serde_json::Value) -> TransportError {
    let error_code = payload
        .get("error_code")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(status as u64);
    if error_code == 429 {
        let retry_after = payload
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(serde_json::Value::as_u64)
            .map(Duration::from_secs);
        return TransportError::RateLimited { retry_after };
    }
    let description = payload
        .get("description")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown error");
    TransportError::Api {
        method: method.to_string(),
        description: format!("{description} (status {status})"),
    }
}

/// Parse a `channel_post` object into a [`RawMessage`].
fn parse_channel_post(post: &serde_json::Value) -> Option<RawMessage> {
    let id = post.get("message_id").and_then(serde_json::Value::as_i64)?;
    let channel_id = post
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(serde_json::Value::as_i64)?;
    let timestamp = post
        .get("date")
        .and_then(serde_json::Value::as_i64)
        .and_then(|ts| DateTime::from_timestamp(ts, 0))?;

    let media = extract_media(post);
    let text = post
        .get("text")
        .or_else(|| post.get("caption"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(RawMessage {
        id,
        channel_id,
        timestamp,
        text,
        media,
    })
}

/// Pull the single media attachment out of a post, if any.
fn extract_media(post: &serde_json::Value) -> Option<MediaRef> {
    // Photos arrive as an array of sizes; the last one is the largest.
    if let Some(sizes) = post.get("photo").and_then(serde_json::Value::as_array) {
        let file_id = sizes
            .last()
            .and_then(|s| s.get("file_id"))
            .and_then(serde_json::Value::as_str)?;
        return Some(MediaRef {
            kind: MediaKind::Photo,
            file_id: file_id.to_string(),
        });
    }

    for (field, kind) in [
        ("video", MediaKind::Video),
        ("audio", MediaKind::Audio),
        ("voice", MediaKind::Audio),
        ("document", MediaKind::Document),
    ] {
        if let Some(file_id) = post
            .get(field)
            .and_then(|m| m.get("file_id"))
            .and_then(serde_json::Value::as_str)
        {
            return Some(MediaRef {
                kind,
                file_id: file_id.to_string(),
            });
        }
    }
    None
}

/// File extension of a remote file path.
fn extension_of(path: &str) -> Option<&str> {
    Path::new(path).extension().and_then(|e| e.to_str())
}

/// Split a message into chunks that fit the text limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let boundary = (0..=max_len).rev().find(|&i| remaining.is_char_boundary(i)).unwrap_or(0);
        let window = &remaining[..boundary];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .unwrap_or(boundary);
        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { boundary } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
