//! Dedup ledger — libSQL-backed record of every claimed message.
//!
//! The (mapping id, source message id) pair is UNIQUE; `try_claim` relies
//! on that constraint for atomicity between concurrent historical and live
//! scans, treating a constraint violation as "already claimed". Rows are
//! never deleted by the engine.
//!
//! The ledger is a forward-progress log, not a two-phase commit: a crash
//! between claim and forward leaves a row with `forwarded = 0`, which is
//! re-offered on the next startup via `pending_forwards`. At-most-once is
//! guaranteed per successful forward, not per attempt.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LedgerError;

/// A persisted ledger row.
#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub id: String,
    pub mapping_id: String,
    pub source_message_id: i64,
    pub original_text: String,
    pub final_text: Option<String>,
    pub media_path: Option<String>,
    pub media_kind: Option<String>,
    pub forwarded: bool,
    pub failure_reason: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub forwarded_at: Option<DateTime<Utc>>,
}

/// libSQL-backed dedup ledger.
///
/// `libsql::Connection` is `Send + Sync`, so one connection is shared by
/// all workers.
pub struct DedupLedger {
    #[allow(dead_code)]
    db: Arc<libsql::Database>,
    conn: Connection,
}

impl DedupLedger {
    /// Open (or create) the ledger database at the given path.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Open(format!("failed to create ledger directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LedgerError::Open(e.to_string()))?;
        let conn = db.connect().map_err(|e| LedgerError::Open(e.to_string()))?;

        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        ledger.init_schema().await?;
        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Open an in-memory ledger (for tests).
    pub async fn open_in_memory() -> Result<Self, LedgerError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| LedgerError::Open(e.to_string()))?;
        let conn = db.connect().map_err(|e| LedgerError::Open(e.to_string()))?;

        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    async fn init_schema(&self) -> Result<(), LedgerError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS processed_messages (
                    id TEXT PRIMARY KEY,
                    mapping_id TEXT NOT NULL,
                    source_message_id INTEGER NOT NULL,
                    original_text TEXT NOT NULL,
                    final_text TEXT,
                    media_path TEXT,
                    media_kind TEXT,
                    forwarded INTEGER NOT NULL DEFAULT 0,
                    failure_reason TEXT,
                    received_at TEXT NOT NULL,
                    processed_at TEXT NOT NULL,
                    forwarded_at TEXT,
                    UNIQUE(mapping_id, source_message_id)
                );
                CREATE INDEX IF NOT EXISTS idx_processed_mapping
                    ON processed_messages(mapping_id);
                CREATE INDEX IF NOT EXISTS idx_processed_pending
                    ON processed_messages(mapping_id, forwarded);",
            )
            .await
            .map_err(|e| LedgerError::Query(format!("init_schema: {e}")))?;
        Ok(())
    }

    /// Claim a message for processing.
    ///
    /// Returns `true` when this is the first claim, `false` when the
    /// (mapping, message) pair was already claimed — a uniqueness violation
    /// is the expected signal, not an error.
    pub async fn try_claim(
        &self,
        mapping_id: &str,
        source_message_id: i64,
        original_text: &str,
        received_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let row_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let result = self
            .conn
            .execute(
                "INSERT INTO processed_messages
                    (id, mapping_id, source_message_id, original_text,
                     forwarded, received_at, processed_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                params![
                    row_id,
                    mapping_id,
                    source_message_id,
                    original_text,
                    received_at.to_rfc3339(),
                    now,
                ],
            )
            .await;

        match result {
            Ok(_) => {
                debug!(mapping = mapping_id, message_id = source_message_id, "Message claimed");
                Ok(true)
            }
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => Ok(false),
            Err(e) => Err(LedgerError::Query(format!("try_claim: {e}"))),
        }
    }

    /// Record the processed text and media before the send attempt.
    pub async fn record_result(
        &self,
        mapping_id: &str,
        source_message_id: i64,
        final_text: &str,
        media_path: Option<&str>,
        media_kind: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.conn
            .execute(
                "UPDATE processed_messages
                 SET final_text = ?1, media_path = ?2, media_kind = ?3, processed_at = ?4
                 WHERE mapping_id = ?5 AND source_message_id = ?6",
                params![
                    final_text,
                    opt_text(media_path),
                    opt_text(media_kind),
                    Utc::now().to_rfc3339(),
                    mapping_id,
                    source_message_id,
                ],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("record_result: {e}")))?;
        Ok(())
    }

    /// Flip the forwarded flag after a successful send.
    pub async fn mark_forwarded(
        &self,
        mapping_id: &str,
        source_message_id: i64,
    ) -> Result<(), LedgerError> {
        self.conn
            .execute(
                "UPDATE processed_messages
                 SET forwarded = 1, forwarded_at = ?1, failure_reason = NULL
                 WHERE mapping_id = ?2 AND source_message_id = ?3",
                params![Utc::now().to_rfc3339(), mapping_id, source_message_id],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("mark_forwarded: {e}")))?;
        debug!(mapping = mapping_id, message_id = source_message_id, "Marked forwarded");
        Ok(())
    }

    /// Record a terminal failure reason; the row stays unforwarded.
    pub async fn mark_failed(
        &self,
        mapping_id: &str,
        source_message_id: i64,
        reason: &str,
    ) -> Result<(), LedgerError> {
        self.conn
            .execute(
                "UPDATE processed_messages
                 SET failure_reason = ?1
                 WHERE mapping_id = ?2 AND source_message_id = ?3",
                params![reason, mapping_id, source_message_id],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("mark_failed: {e}")))?;
        Ok(())
    }

    /// Insert a synthetic high-water-mark row for a mapping's first live
    /// activation, claimed and marked forwarded so it is never sent.
    pub async fn record_baseline(
        &self,
        mapping_id: &str,
        source_message_id: i64,
        received_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let claimed = self
            .try_claim(mapping_id, source_message_id, "", received_at)
            .await?;
        if claimed {
            self.mark_forwarded(mapping_id, source_message_id).await?;
            info!(
                mapping = mapping_id,
                message_id = source_message_id,
                "Baseline recorded, relaying messages after this point"
            );
        }
        Ok(())
    }

    /// Claimed-but-unforwarded rows without a recorded failure, oldest
    /// first — re-offered to the pipeline on startup.
    pub async fn pending_forwards(&self, mapping_id: &str) -> Result<Vec<LedgerRow>, LedgerError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM processed_messages
                     WHERE mapping_id = ?1 AND forwarded = 0 AND failure_reason IS NULL
                     ORDER BY source_message_id ASC"
                ),
                params![mapping_id],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("pending_forwards: {e}")))?;

        let mut pending = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_ledger(&row) {
                Ok(ledger_row) => pending.push(ledger_row),
                Err(e) => tracing::warn!("Skipping ledger row: {e}"),
            }
        }
        Ok(pending)
    }

    /// Unforwarded rows whose failure reason starts with `prefix`, oldest
    /// first. The live loop uses this to retry rate-limited sends.
    pub async fn failed_with_reason_prefix(
        &self,
        mapping_id: &str,
        prefix: &str,
    ) -> Result<Vec<LedgerRow>, LedgerError> {
        let pattern = format!("{prefix}%");
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM processed_messages
                     WHERE mapping_id = ?1 AND forwarded = 0 AND failure_reason LIKE ?2
                     ORDER BY source_message_id ASC"
                ),
                params![mapping_id, pattern],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("failed_with_reason_prefix: {e}")))?;

        let mut failed = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_ledger(&row) {
                Ok(ledger_row) => failed.push(ledger_row),
                Err(e) => tracing::warn!("Skipping ledger row: {e}"),
            }
        }
        Ok(failed)
    }

    /// Highest source message id seen for a mapping, if any — the live
    /// poll's initial cursor.
    pub async fn last_seen_id(&self, mapping_id: &str) -> Result<Option<i64>, LedgerError> {
        let mut rows = self
            .conn
            .query(
                "SELECT MAX(source_message_id) FROM processed_messages WHERE mapping_id = ?1",
                params![mapping_id],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("last_seen_id: {e}")))?;

        match rows.next().await {
            // MAX() over no rows yields NULL, which a typed get reports
            // as an error — hence `.ok()`.
            Ok(Some(row)) => Ok(row.get::<i64>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(LedgerError::Query(format!("last_seen_id: {e}"))),
        }
    }

    /// Look up a single ledger row.
    pub async fn get(
        &self,
        mapping_id: &str,
        source_message_id: i64,
    ) -> Result<Option<LedgerRow>, LedgerError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM processed_messages
                     WHERE mapping_id = ?1 AND source_message_id = ?2"
                ),
                params![mapping_id, source_message_id],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let ledger_row = row_to_ledger(&row)
                    .map_err(|e| LedgerError::Query(format!("get row parse: {e}")))?;
                Ok(Some(ledger_row))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LedgerError::Query(format!("get: {e}"))),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

const COLUMNS: &str = "id, mapping_id, source_message_id, original_text, final_text, \
     media_path, media_kind, forwarded, failure_reason, received_at, processed_at, forwarded_at";

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

fn row_to_ledger(row: &libsql::Row) -> Result<LedgerRow, libsql::Error> {
    let received_str: String = row.get(9)?;
    let processed_str: String = row.get(10)?;
    // Nullable columns: a typed get on NULL fails, so `.ok()` is the
    // NULL-to-None conversion.
    let forwarded_str: Option<String> = row.get::<String>(11).ok();

    Ok(LedgerRow {
        id: row.get(0)?,
        mapping_id: row.get(1)?,
        source_message_id: row.get(2)?,
        original_text: row.get(3)?,
        final_text: row.get::<String>(4).ok(),
        media_path: row.get::<String>(5).ok(),
        media_kind: row.get::<String>(6).ok(),
        forwarded: row.get::<i64>(7)? != 0,
        failure_reason: row.get::<String>(8).ok(),
        received_at: parse_datetime(&received_str),
        processed_at: parse_datetime(&processed_str),
        forwarded_at: forwarded_str.map(|s| parse_datetime(&s)),
    })
}

// ── Tests ───────────────────────────────────────────────────────────
