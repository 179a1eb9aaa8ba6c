use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{CalsyncError, CalsyncResult};

/// All cache keys live under this namespace
pub const KEY_PREFIX: &str = "calendar:";

const LAST_FULL_SYNC_KEY: &str = "calendar:lastFullSync";
const LAST_ERROR_KEY: &str = "calendar:lastError";
const SYNC_MARKER_PREFIX: &str = "calendar:sync:";

/// How long a sync-in-progress marker survives if the pass crashes
const SYNC_MARKER_TTL_SECS: i64 = 300;

/// A single calendar event as stored in the cache.
///
/// Uniquely identified by `(calendar_id, id)`. Immutable once stored except
/// on re-sync. Field names serialize as camelCase to match the persisted
/// JSON contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub calendar_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub all_day: bool,
}

impl CalendarEvent {
    /// Inclusive interval-overlap test against `[start, end]`
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start <= end && self.end >= start
    }
}

/// Per-calendar cache entry, persisted as one JSON value.
///
/// `events` is the complete known event set for the calendar as of
/// `last_sync` (within the configured sync window); `sync_token` is the
/// opaque cursor handed back to Google to request only deltas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalendarRecord {
    pub calendar_id: String,
    pub calendar_name: String,
    #[serde(default)]
    pub events: Vec<CalendarEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
    pub last_sync: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_full_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_role: Option<String>,
}

pub fn record_key(calendar_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, calendar_id)
}

pub fn sync_marker_key(calendar_id: &str) -> String {
    format!("{}{}", SYNC_MARKER_PREFIX, calendar_id)
}

/// True for keys under the namespace that are not per-calendar records
pub fn is_metadata_key(key: &str) -> bool {
    key == LAST_FULL_SYNC_KEY || key == LAST_ERROR_KEY || key.starts_with(SYNC_MARKER_PREFIX)
}

/// Persistent event cache as the orchestrator sees it. The Redis
/// implementation is the production one; tests substitute in-memory fakes.
#[async_trait]
pub trait EventCache: Send + Sync {
    async fn get_record(&self, calendar_id: &str) -> CalsyncResult<Option<CalendarRecord>>;
    async fn put_record(&self, record: &CalendarRecord) -> CalsyncResult<()>;
    async fn snapshot(&self) -> CalsyncResult<Vec<CalendarRecord>>;
    async fn last_full_sync(&self) -> CalsyncResult<Option<DateTime<Utc>>>;
    async fn set_last_full_sync(&self, at: DateTime<Utc>) -> CalsyncResult<()>;
    async fn last_error(&self) -> CalsyncResult<Option<String>>;
    async fn set_last_error(&self, message: Option<&str>) -> CalsyncResult<()>;
    async fn try_begin_sync(&self, calendar_id: &str) -> CalsyncResult<bool>;
    async fn end_sync(&self, calendar_id: &str) -> CalsyncResult<()>;
    async fn sync_in_progress(&self, calendar_id: &str) -> CalsyncResult<bool>;

    /// Drop the stored sync token so the next fetch is a full one
    async fn clear_sync_token(&self, calendar_id: &str) -> CalsyncResult<()> {
        if let Some(mut record) = self.get_record(calendar_id).await? {
            record.sync_token = None;
            self.put_record(&record).await?;
        }
        Ok(())
    }
}

/// Redis-backed persistent event cache.
///
/// Uses a connection manager for pooling/reconnects; clones share the
/// underlying connection. No transactional guarantee beyond per-key
/// last-write-wins - the remote calendar source stays authoritative.
#[derive(Clone)]
pub struct CalendarCache {
    conn: redis::aio::ConnectionManager,
}

impl CalendarCache {
    pub async fn connect(url: &str) -> CalsyncResult<Self> {
        let client = redis::Client::open(url).map_err(|e| CalsyncError::Cache {
            operation: "connect".to_string(),
            message: e.to_string(),
        })?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| CalsyncError::Cache {
                operation: "connect".to_string(),
                message: e.to_string(),
            })?;
        debug!("Connected to Redis at {}", url);
        Ok(Self { conn })
    }

    async fn record_keys(&self) -> CalsyncResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", KEY_PREFIX);
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            if !is_metadata_key(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl EventCache for CalendarCache {
    async fn get_record(&self, calendar_id: &str) -> CalsyncResult<Option<CalendarRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(record_key(calendar_id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_record(&self, record: &CalendarRecord) -> CalsyncResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        let _: () = conn.set(record_key(&record.calendar_id), json).await?;
        Ok(())
    }

    /// All per-calendar records currently cached (metadata keys stripped).
    /// Records that fail to parse are skipped rather than failing the whole
    /// snapshot.
    async fn snapshot(&self) -> CalsyncResult<Vec<CalendarRecord>> {
        let keys = self.record_keys().await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = conn.mget(&keys).await?;

        let mut records = Vec::new();
        for (key, value) in keys.iter().zip(values) {
            let Some(json) = value else { continue };
            match serde_json::from_str::<CalendarRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unparseable cache entry {}: {}", key, e),
            }
        }
        Ok(records)
    }

    /// Timestamp of the last pass in which every calendar synced cleanly
    async fn last_full_sync(&self) -> CalsyncResult<Option<DateTime<Utc>>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(LAST_FULL_SYNC_KEY).await?;
        Ok(raw
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()))
    }

    async fn set_last_full_sync(&self, at: DateTime<Utc>) -> CalsyncResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(LAST_FULL_SYNC_KEY, at.timestamp_millis().to_string())
            .await?;
        Ok(())
    }

    async fn last_error(&self) -> CalsyncResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(LAST_ERROR_KEY).await?)
    }

    async fn set_last_error(&self, message: Option<&str>) -> CalsyncResult<()> {
        let mut conn = self.conn.clone();
        match message {
            Some(msg) => {
                let _: () = conn.set(LAST_ERROR_KEY, msg).await?;
            }
            None => {
                let _: () = conn.del(LAST_ERROR_KEY).await?;
            }
        }
        Ok(())
    }

    /// Claim the sync-in-progress marker for a calendar. Returns false when
    /// another sync already holds it. The marker carries a TTL so a crashed
    /// pass cannot wedge the calendar.
    async fn try_begin_sync(&self, calendar_id: &str) -> CalsyncResult<bool> {
        let mut conn = self.conn.clone();
        let key = sync_marker_key(calendar_id);
        let claimed: bool = conn.set_nx(&key, "1").await?;
        if claimed {
            let _: () = conn.expire(&key, SYNC_MARKER_TTL_SECS).await?;
        }
        Ok(claimed)
    }

    async fn end_sync(&self, calendar_id: &str) -> CalsyncResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(sync_marker_key(calendar_id)).await?;
        Ok(())
    }

    async fn sync_in_progress(&self, calendar_id: &str) -> CalsyncResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(sync_marker_key(calendar_id)).await?)
    }
}
