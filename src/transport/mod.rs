//! Transport abstraction — the channel I/O surface the engine drives.
//!
//! The engine only ever sees this trait; the Telegram implementation lives
//! in [`telegram`]. Rate limiting surfaces as a distinct error variant so
//! the send path can back off instead of failing outright.

pub mod telegram;

pub use telegram::TelegramTransport;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Media classes the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
        }
    }

    /// Inverse of [`as_str`](Self::as_str), for values read back from the
    /// ledger.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(Self::Photo),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "document" => Some(Self::Document),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote handle for a message's single media attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub file_id: String,
}

/// A raw inbound message as the transport observed it.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Channel-native message id, monotonically increasing per channel.
    pub id: i64,
    pub channel_id: i64,
    pub timestamp: DateTime<Utc>,
    /// Text body or media caption; may be empty.
    pub text: String,
    pub media: Option<MediaRef>,
}

/// A channel the transport can see.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: i64,
    pub name: String,
}

/// Bounded, oldest-first stream of historical messages.
pub type HistoryStream = BoxStream<'static, RawMessage>;

/// Channel transport the engine calls. Implementations own connection
/// state, authentication, and wire formats.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve the channels this transport was configured for.
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, TransportError>;

    /// Stream messages from `channel_id` no older than `since`,
    /// oldest first.
    async fn fetch_history(
        &self,
        channel_id: i64,
        since: DateTime<Utc>,
    ) -> Result<HistoryStream, TransportError>;

    /// Fetch messages newer than `after_id` (all buffered messages when
    /// `None`), in arrival order.
    async fn poll_new(
        &self,
        channel_id: i64,
        after_id: Option<i64>,
    ) -> Result<Vec<RawMessage>, TransportError>;

    /// Download a media attachment and return its local path.
    async fn download_media(&self, media: &MediaRef) -> Result<PathBuf, TransportError>;

    /// Send text (and optionally one media file) to a channel.
    async fn send(
        &self,
        target_channel_id: i64,
        text: &str,
        media: Option<(&Path, MediaKind)>,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_round_trips_through_strings() {
        for kind in [MediaKind::Photo, MediaKind::Video, MediaKind::Audio, MediaKind::Document] {
            assert_eq!(MediaKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MediaKind::parse("sticker"), None);
    }

    #[test]
    fn media_kind_display_matches_as_str() {
        assert_eq!(MediaKind::Photo.to_string(), "photo");
        assert_eq!(MediaKind::Document.to_string(), "document");
    }
}

