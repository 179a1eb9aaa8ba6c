use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CalendarCache, CalendarEvent, CalendarRecord, EventCache};
use crate::config::Config;
use crate::errors::{CalsyncError, CalsyncResult};
use crate::google_calendar::{CalendarListEntry, CalendarSource, EventsDelta, GoogleCalendarService};

/// Outcome of one sync pass
#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    /// True when no attempted calendar failed. Calendars skipped because
    /// another sync held their marker do not count as failures.
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// True when every known calendar actually synced in this pass. A pass
    /// with skips is clean but incomplete, and must not advance the global
    /// full-sync timestamp.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Aggregated sync metadata for the status endpoints
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub authorized: bool,
    pub background_sync_running: bool,
    pub interval_minutes: u32,
}

/// Per-calendar diagnostics for the detailed status endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarSyncDetail {
    pub calendar_id: String,
    pub calendar_name: String,
    pub last_sync: DateTime<Utc>,
    pub event_count: usize,
    pub sync_in_progress: bool,
}

/// Keeps each CalendarRecord in the persistent cache consistent with the
/// remote calendar source.
///
/// Partial-failure tolerant: one calendar's failure is recorded and the pass
/// continues; the global lastFullSync only advances when every attempted
/// calendar succeeded.
pub struct SyncOrchestrator {
    config: Arc<RwLock<Config>>,
    cache: Arc<dyn EventCache>,
    google: Option<Arc<dyn CalendarSource>>,
    background: Mutex<Option<JoinHandle<()>>>,
    // Handle to ourselves for spawning sync tasks
    weak_self: Weak<SyncOrchestrator>,
}

impl SyncOrchestrator {
    pub fn new(config: Arc<RwLock<Config>>, cache: CalendarCache) -> Arc<Self> {
        // Initialize the Google client only when configured, the same way the
        // daemon runs fine without calendar credentials
        let google: Option<Arc<dyn CalendarSource>> = {
            let config_guard = config.read();
            match &config_guard.google_calendar {
                Some(gc) if gc.enabled && !gc.client_id.is_empty() => {
                    match Config::get_data_dir() {
                        Ok(data_dir) => Some(Arc::new(GoogleCalendarService::new(
                            gc.clone(),
                            data_dir,
                        ))),
                        Err(e) => {
                            debug!("Calendar sync not available: {}", e);
                            None
                        }
                    }
                }
                _ => None,
            }
        };

        Self::with_sources(config, Arc::new(cache), google)
    }

    /// Wire the orchestrator to explicit cache and calendar backends
    pub fn with_sources(
        config: Arc<RwLock<Config>>,
        cache: Arc<dyn EventCache>,
        google: Option<Arc<dyn CalendarSource>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            cache,
            google,
            background: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Whether valid OAuth credentials are available. Distinct from sync
    /// failure: callers must not report "not authorized" as an error pass.
    pub async fn is_authorized(&self) -> bool {
        match &self.google {
            Some(google) => google.is_authenticated().await,
            None => false,
        }
    }

    /// Authorization URL for the OAuth setup flow, when configured
    pub fn auth_url(&self) -> Option<String> {
        self.google.as_deref().and_then(|g| g.auth_url().ok())
    }

    pub fn google(&self) -> Option<&dyn CalendarSource> {
        self.google.as_deref()
    }

    /// Run one sync pass over every known calendar.
    ///
    /// `force_fresh` discards every stored sync token up front, so each
    /// calendar re-fetches in full even if an earlier calendar's fetch fails.
    pub async fn sync_all_calendars(&self, force_fresh: bool) -> CalsyncResult<SyncReport> {
        let google = self.google.as_deref().ok_or_else(|| CalsyncError::Config {
            message: "Google Calendar is not configured".to_string(),
        })?;

        debug!("Starting calendar sync pass (force_fresh={})", force_fresh);
        let calendars = self.known_calendars(google).await?;

        if force_fresh {
            for entry in &calendars {
                if let Err(e) = self.cache.clear_sync_token(&entry.id).await {
                    warn!("Failed to clear sync token for {}: {}", entry.id, e);
                }
            }
        }

        let window = self.sync_window();
        let mut report = SyncReport::default();

        for entry in &calendars {
            match self.cache.try_begin_sync(&entry.id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Sync already in progress for {}, skipping", entry.id);
                    report.skipped.push(entry.id.clone());
                    continue;
                }
                Err(e) => {
                    warn!("Could not claim sync marker for {}: {}", entry.id, e);
                    report.failed.push((entry.id.clone(), e.to_string()));
                    continue;
                }
            }

            let result = self.sync_one_calendar(google, entry, force_fresh, window).await;
            if let Err(e) = self.cache.end_sync(&entry.id).await {
                warn!("Failed to clear sync marker for {}: {}", entry.id, e);
            }

            match result {
                Ok(event_count) => {
                    info!("Synced calendar {} ({} events)", entry.id, event_count);
                    report.synced.push(entry.id.clone());
                }
                Err(e) => {
                    warn!("Failed to sync calendar {}: {}", entry.id, e);
                    report.failed.push((entry.id.clone(), e.to_string()));
                }
            }
        }

        if report.is_complete() {
            self.cache.set_last_full_sync(Utc::now()).await?;
            self.cache.set_last_error(None).await?;
        } else if !report.all_succeeded() {
            let summary = report
                .failed
                .iter()
                .map(|(id, err)| format!("{}: {}", id, err))
                .collect::<Vec<_>>()
                .join("; ");
            self.cache.set_last_error(Some(&summary)).await?;
        }
        // An all-skipped pass synced nothing: leave the global sync state as
        // the concurrent pass left it

        info!(
            "Sync pass complete: {} synced, {} skipped, {} failed",
            report.synced.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn sync_one_calendar(
        &self,
        google: &dyn CalendarSource,
        entry: &CalendarListEntry,
        force_fresh: bool,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> CalsyncResult<usize> {
        let existing = self.cache.get_record(&entry.id).await?;
        let sync_token = if force_fresh {
            None
        } else {
            existing.as_ref().and_then(|r| r.sync_token.clone())
        };

        let delta = google
            .fetch_events_delta(&entry.id, sync_token.as_deref(), window)
            .await?;

        let now = Utc::now();
        let prior_events = existing.as_ref().map(|r| r.events.clone()).unwrap_or_default();
        let prior_full_sync = existing.as_ref().and_then(|r| r.last_full_sync);
        let prior_token = existing.and_then(|r| r.sync_token);

        let events = merge_events(prior_events, &delta);
        let event_count = events.len();

        let record = CalendarRecord {
            calendar_id: entry.id.clone(),
            calendar_name: entry.summary.clone(),
            events,
            // Keep the old cursor if Google returned no new one mid-window
            sync_token: delta.next_sync_token.clone().or(prior_token),
            last_sync: now,
            last_full_sync: if delta.full { Some(now) } else { prior_full_sync },
            color: entry.color.clone(),
            time_zone: entry.time_zone.clone(),
            access_role: entry.access_role.clone(),
        };

        self.cache.put_record(&record).await?;
        Ok(event_count)
    }

    /// Calendars this instance syncs: the configured IDs intersected with the
    /// account's calendar list, or every listed calendar when none are
    /// configured
    async fn known_calendars(
        &self,
        google: &dyn CalendarSource,
    ) -> CalsyncResult<Vec<CalendarListEntry>> {
        let listed = google.list_calendars().await?;

        let configured: Vec<String> = self
            .config
            .read()
            .google_calendar
            .as_ref()
            .map(|gc| gc.calendar_ids.clone())
            .unwrap_or_default();

        if configured.is_empty() {
            return Ok(listed);
        }
        Ok(listed
            .into_iter()
            .filter(|entry| configured.iter().any(|id| id == &entry.id))
            .collect())
    }

    fn sync_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let (past_days, horizon_days) = {
            let config = self.config.read();
            (
                config.sync.window_past_days,
                config.sync.planning_horizon_days,
            )
        };
        let now = Utc::now();
        (
            now - ChronoDuration::days(past_days as i64),
            now + ChronoDuration::days(horizon_days as i64),
        )
    }

    /// Begin the recurring background sync task. Idempotent: calling again
    /// while the task is alive does nothing. Returns true when a new task
    /// was started.
    pub fn start_background_sync(&self) -> bool {
        let Some(orchestrator) = self.weak_self.upgrade() else {
            return false;
        };

        let mut guard = self.background.lock();
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                debug!("Background sync already running");
                return false;
            }
        }

        *guard = Some(tokio::spawn(async move {
            loop {
                match orchestrator.sync_all_calendars(false).await {
                    Ok(report) => {
                        debug!(
                            "Background sync tick: {} synced, {} failed",
                            report.synced.len(),
                            report.failed.len()
                        );
                    }
                    Err(e) => warn!("Background sync tick failed: {}", e),
                }

                // Re-read the interval each tick so updates apply without a
                // restart
                let minutes = orchestrator.get_sync_interval().max(1);
                tokio::time::sleep(Duration::from_secs(minutes as u64 * 60)).await;
            }
        }));

        info!("Background sync started");
        true
    }

    /// Cancel the background sync task. Safe to call repeatedly or when no
    /// task is running.
    pub fn stop_background_sync(&self) {
        let mut guard = self.background.lock();
        if let Some(handle) = guard.take() {
            handle.abort();
            info!("Background sync stopped");
        }
    }

    pub fn is_background_sync_running(&self) -> bool {
        self.background
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn get_sync_interval(&self) -> u32 {
        self.config.read().sync.interval_minutes
    }

    /// Update the background sync cadence (minimum 1 minute) and persist it.
    /// The running task picks the new value up on its next tick.
    pub async fn set_sync_interval(&self, minutes: u32) -> CalsyncResult<()> {
        if minutes < 1 {
            return Err(CalsyncError::Validation {
                field: "interval_minutes".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let snapshot = {
            let mut config = self.config.write();
            config.sync.interval_minutes = minutes;
            config.clone()
        };
        snapshot.save().await.map_err(CalsyncError::from)?;
        info!("Sync interval set to {} minutes", minutes);
        Ok(())
    }

    /// Cached events overlapping `[start, end]`, ascending by start time.
    ///
    /// Cold-start policy: when no sync has ever completed a background pass
    /// is fired first, but the caller is never blocked on its completion.
    pub async fn get_events_for_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CalsyncResult<Vec<CalendarEvent>> {
        if start > end {
            return Err(CalsyncError::Validation {
                field: "date range".to_string(),
                message: "start must not be after end".to_string(),
            });
        }

        if self.cache.last_full_sync().await?.is_none() {
            if let Some(orchestrator) = self.weak_self.upgrade() {
                debug!("No completed sync yet, firing cold-start sync");
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.sync_all_calendars(false).await {
                        warn!("Cold-start sync failed: {}", e);
                    }
                });
            }
        }

        let mut events: Vec<CalendarEvent> = self
            .cache
            .snapshot()
            .await?
            .into_iter()
            .flat_map(|record| record.events)
            .filter(|event| event.overlaps(start, end))
            .collect();
        events.sort_by_key(|event| event.start);
        Ok(events)
    }

    pub async fn status(&self) -> CalsyncResult<SyncStatus> {
        Ok(SyncStatus {
            last_full_sync: self.cache.last_full_sync().await?,
            last_error: self.cache.last_error().await?,
            authorized: self.is_authorized().await,
            background_sync_running: self.is_background_sync_running(),
            interval_minutes: self.get_sync_interval(),
        })
    }

    pub async fn detailed_status(
        &self,
    ) -> CalsyncResult<(SyncStatus, Vec<CalendarSyncDetail>)> {
        let status = self.status().await?;

        let mut details = Vec::new();
        for record in self.cache.snapshot().await? {
            let sync_in_progress = self.cache.sync_in_progress(&record.calendar_id).await?;
            details.push(CalendarSyncDetail {
                calendar_id: record.calendar_id,
                calendar_name: record.calendar_name,
                last_sync: record.last_sync,
                event_count: record.events.len(),
                sync_in_progress,
            });
        }

        Ok((status, details))
    }
}

/// Merge a fetched delta into the previously stored event list. Full fetches
/// replace the set wholesale; incremental deltas replace events by ID and
/// drop the ones the source reported deleted.
fn merge_events(existing: Vec<CalendarEvent>, delta: &EventsDelta) -> Vec<CalendarEvent> {
    if delta.full {
        return delta.events.clone();
    }

    let mut by_id: HashMap<String, CalendarEvent> = existing
        .into_iter()
        .map(|event| (event.id.clone(), event))
        .collect();

    for id in &delta.deleted_ids {
        by_id.remove(id);
    }
    for event in &delta.events {
        by_id.insert(event.id.clone(), event.clone());
    }

    let mut merged: Vec<CalendarEvent> = by_id.into_values().collect();
    merged.sort_by_key(|event| event.start);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn event(id: &str, hour: u32, title: &str) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            calendar_id: "work".to_string(),
            start: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 1, hour + 1, 0, 0).unwrap(),
            title: Some(title.to_string()),
            description: None,
            location: None,
            all_day: false,
        }
    }

    fn delta(
        events: Vec<CalendarEvent>,
        deleted_ids: Vec<&str>,
        full: bool,
    ) -> EventsDelta {
        EventsDelta {
            events,
            deleted_ids: deleted_ids.into_iter().map(String::from).collect(),
            next_sync_token: Some("tok-next".to_string()),
            full,
        }
    }

    #[test]
    fn test_incremental_merge_replaces_by_id_and_applies_deletions() {
        let existing = vec![event("a", 9, "old"), event("b", 10, "keep"), event("c", 11, "drop")];
        let incoming = delta(vec![event("a", 14, "updated")], vec!["c"], false);

        let merged = merge_events(existing, &incoming);

        assert_eq!(merged.len(), 2);
        // Sorted ascending by start: b (10:00) before updated a (14:00)
        assert_eq!(merged[0].id, "b");
        assert_eq!(merged[1].id, "a");
        assert_eq!(merged[1].title.as_deref(), Some("updated"));
    }

    #[test]
    fn test_full_fetch_replaces_wholesale() {
        let existing = vec![event("a", 9, "old"), event("b", 10, "old")];
        let incoming = delta(vec![event("z", 8, "fresh")], vec![], true);

        let merged = merge_events(existing, &incoming);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "z");
    }

    #[test]
    fn test_deleting_unknown_id_is_a_noop() {
        let existing = vec![event("a", 9, "keep")];
        let incoming = delta(vec![], vec!["ghost"], false);

        let merged = merge_events(existing, &incoming);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "a");
    }

    #[test]
    fn test_report_all_succeeded_ignores_skips() {
        let report = SyncReport {
            synced: vec!["a".to_string()],
            skipped: vec!["b".to_string()],
            failed: vec![],
        };
        assert!(report.all_succeeded());
        // Clean but not complete: a skipped calendar did not sync
        assert!(!report.is_complete());

        let report = SyncReport {
            synced: vec![],
            skipped: vec![],
            failed: vec![("a".to_string(), "boom".to_string())],
        };
        assert!(!report.all_succeeded());
        assert!(!report.is_complete());
    }

    #[derive(Default)]
    struct FakeCache {
        records: Mutex<HashMap<String, CalendarRecord>>,
        markers: Mutex<HashSet<String>>,
        last_full_sync: Mutex<Option<DateTime<Utc>>>,
        last_error: Mutex<Option<String>>,
        cleared: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventCache for FakeCache {
        async fn get_record(&self, calendar_id: &str) -> CalsyncResult<Option<CalendarRecord>> {
            Ok(self.records.lock().get(calendar_id).cloned())
        }

        async fn put_record(&self, record: &CalendarRecord) -> CalsyncResult<()> {
            self.records
                .lock()
                .insert(record.calendar_id.clone(), record.clone());
            Ok(())
        }

        async fn snapshot(&self) -> CalsyncResult<Vec<CalendarRecord>> {
            Ok(self.records.lock().values().cloned().collect())
        }

        async fn last_full_sync(&self) -> CalsyncResult<Option<DateTime<Utc>>> {
            Ok(*self.last_full_sync.lock())
        }

        async fn set_last_full_sync(&self, at: DateTime<Utc>) -> CalsyncResult<()> {
            *self.last_full_sync.lock() = Some(at);
            Ok(())
        }

        async fn last_error(&self) -> CalsyncResult<Option<String>> {
            Ok(self.last_error.lock().clone())
        }

        async fn set_last_error(&self, message: Option<&str>) -> CalsyncResult<()> {
            *self.last_error.lock() = message.map(String::from);
            Ok(())
        }

        async fn try_begin_sync(&self, calendar_id: &str) -> CalsyncResult<bool> {
            Ok(self.markers.lock().insert(calendar_id.to_string()))
        }

        async fn end_sync(&self, calendar_id: &str) -> CalsyncResult<()> {
            self.markers.lock().remove(calendar_id);
            Ok(())
        }

        async fn sync_in_progress(&self, calendar_id: &str) -> CalsyncResult<bool> {
            Ok(self.markers.lock().contains(calendar_id))
        }

        async fn clear_sync_token(&self, calendar_id: &str) -> CalsyncResult<()> {
            self.cleared.lock().push(calendar_id.to_string());
            if let Some(record) = self.records.lock().get_mut(calendar_id) {
                record.sync_token = None;
            }
            Ok(())
        }
    }

    struct FakeCalendars {
        listed: Vec<CalendarListEntry>,
        failing: Option<String>,
        fetches: Mutex<Vec<(String, Option<String>)>>,
    }

    impl FakeCalendars {
        fn new(ids: &[&str]) -> Arc<Self> {
            Self::build(ids, None)
        }

        fn with_failing(ids: &[&str], failing: &str) -> Arc<Self> {
            Self::build(ids, Some(failing.to_string()))
        }

        fn build(ids: &[&str], failing: Option<String>) -> Arc<Self> {
            Arc::new(Self {
                listed: ids
                    .iter()
                    .map(|id| CalendarListEntry {
                        id: id.to_string(),
                        summary: format!("Calendar {}", id),
                        color: None,
                        time_zone: None,
                        access_role: None,
                    })
                    .collect(),
                failing,
                fetches: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CalendarSource for FakeCalendars {
        async fn is_authenticated(&self) -> bool {
            true
        }

        fn auth_url(&self) -> CalsyncResult<String> {
            Ok("https://accounts.example.com/auth".to_string())
        }

        async fn authenticate_with_code(&self, _auth_code: &str) -> CalsyncResult<()> {
            Ok(())
        }

        async fn list_calendars(&self) -> CalsyncResult<Vec<CalendarListEntry>> {
            Ok(self.listed.clone())
        }

        async fn fetch_events_delta(
            &self,
            calendar_id: &str,
            sync_token: Option<&str>,
            _window: (DateTime<Utc>, DateTime<Utc>),
        ) -> CalsyncResult<EventsDelta> {
            self.fetches
                .lock()
                .push((calendar_id.to_string(), sync_token.map(String::from)));
            if self.failing.as_deref() == Some(calendar_id) {
                return Err(CalsyncError::Api {
                    service: "Google Calendar".to_string(),
                    message: "500 - backend error".to_string(),
                });
            }
            Ok(EventsDelta {
                events: vec![event(&format!("{}-ev", calendar_id), 9, "meeting")],
                deleted_ids: vec![],
                next_sync_token: Some("tok-new".to_string()),
                full: sync_token.is_none(),
            })
        }
    }

    fn record_with_token(calendar_id: &str) -> CalendarRecord {
        CalendarRecord {
            calendar_id: calendar_id.to_string(),
            calendar_name: calendar_id.to_string(),
            events: vec![],
            sync_token: Some("tok-old".to_string()),
            last_sync: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            last_full_sync: None,
            color: None,
            time_zone: None,
            access_role: None,
        }
    }

    fn orchestrator(
        cache: Arc<FakeCache>,
        google: Arc<FakeCalendars>,
    ) -> Arc<SyncOrchestrator> {
        // No configured calendar_ids, so every listed calendar syncs
        let mut config = Config::default();
        config.google_calendar = None;
        SyncOrchestrator::with_sources(Arc::new(RwLock::new(config)), cache, Some(google))
    }

    #[tokio::test]
    async fn test_fresh_sync_clears_tokens_before_any_fetch() {
        let cache = Arc::new(FakeCache::default());
        cache.records.lock().insert("a".to_string(), record_with_token("a"));
        cache.records.lock().insert("b".to_string(), record_with_token("b"));
        let google = FakeCalendars::with_failing(&["a", "b"], "b");
        let orchestrator = orchestrator(cache.clone(), google.clone());

        let report = orchestrator.sync_all_calendars(true).await.unwrap();

        assert_eq!(report.synced, vec!["a".to_string()]);
        assert_eq!(report.failed.len(), 1);

        // Every token was discarded up front, so both fetches ran full even
        // though one of them failed
        let mut cleared = cache.cleared.lock().clone();
        cleared.sort();
        assert_eq!(cleared, vec!["a".to_string(), "b".to_string()]);
        for (_, token) in google.fetches.lock().iter() {
            assert!(token.is_none());
        }

        // A failed calendar blocks the full-sync stamp but is recorded
        assert!(cache.last_full_sync.lock().is_none());
        assert!(cache.last_error.lock().as_ref().unwrap().contains("b"));
    }

    #[tokio::test]
    async fn test_clean_pass_stamps_full_sync_and_clears_error() {
        let cache = Arc::new(FakeCache::default());
        *cache.last_error.lock() = Some("stale failure".to_string());
        let google = FakeCalendars::new(&["a", "b"]);
        let orchestrator = orchestrator(cache.clone(), google);

        let report = orchestrator.sync_all_calendars(false).await.unwrap();

        assert!(report.is_complete());
        assert!(cache.last_full_sync.lock().is_some());
        assert!(cache.last_error.lock().is_none());
        assert_eq!(
            cache.records.lock()["a"].sync_token.as_deref(),
            Some("tok-new")
        );
    }

    #[tokio::test]
    async fn test_all_skipped_pass_leaves_global_sync_state_alone() {
        let cache = Arc::new(FakeCache::default());
        *cache.last_error.lock() = Some("previous failure".to_string());
        cache.markers.lock().insert("a".to_string());
        cache.markers.lock().insert("b".to_string());
        let google = FakeCalendars::new(&["a", "b"]);
        let orchestrator = orchestrator(cache.clone(), google);

        let report = orchestrator.sync_all_calendars(false).await.unwrap();

        assert_eq!(report.skipped.len(), 2);
        assert!(report.all_succeeded());
        // Nothing synced: no full-sync stamp, prior error stays visible
        assert!(cache.last_full_sync.lock().is_none());
        assert_eq!(
            cache.last_error.lock().as_deref(),
            Some("previous failure")
        );
    }
}
