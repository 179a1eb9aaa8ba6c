use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CalendarEvent, CalendarRecord};
use crate::errors::CalsyncResult;

/// How often the store re-pulls the snapshot
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Store lifecycle. Ready is reached even when the initial fetch failed
/// (fail-open); `init_error` distinguishes ready-but-empty-due-to-error from
/// ready-with-data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Where the store pulls its snapshot from. The HTTP implementation talks to
/// a running calsyncd server; tests inject in-memory sources.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self) -> CalsyncResult<Vec<CalendarRecord>>;
}

#[derive(Deserialize)]
struct SnapshotResponse {
    calendars: Vec<CalendarRecord>,
}

/// Snapshot source backed by the calsyncd HTTP API. The first fetch hits the
/// init endpoint, later ones the refresh endpoint, matching the server's
/// surface.
pub struct HttpSnapshotSource {
    base_url: String,
    client: reqwest::Client,
    initialized: AtomicBool,
}

impl HttpSnapshotSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            initialized: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self) -> CalsyncResult<Vec<CalendarRecord>> {
        let path = if self.initialized.swap(true, Ordering::SeqCst) {
            "/api/calendar/store/refresh"
        } else {
            "/api/calendar/store/init"
        };
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let snapshot: SnapshotResponse = response.json().await?;
        Ok(snapshot.calendars)
    }
}

/// Handle returned by `subscribe`, used to remove that subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(dead_code)]
pub struct Subscription(u64);

type Callback = Box<dyn Fn(&[CalendarEvent]) + Send + Sync>;

/// In-memory mirror of the persistent cache snapshot, with change
/// notification.
///
/// A derived, disposable cache: rebuilt wholesale on initialization and
/// refresh, never the source of truth. Queries during Initializing return
/// empty rather than blocking.
pub struct CalendarEventStore {
    source: Arc<dyn SnapshotSource>,
    state: RwLock<StoreState>,
    init_error: RwLock<Option<String>>,
    calendars: RwLock<HashMap<String, CalendarRecord>>,
    subscribers: RwLock<HashMap<u64, Callback>>,
    next_subscriber_id: AtomicU64,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    refresh_interval: Duration,
    // Weak handle to ourselves for the refresh task, so an abandoned store
    // can still drop
    weak_self: Weak<CalendarEventStore>,
}

impl CalendarEventStore {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Arc<Self> {
        Self::with_refresh_interval(source, DEFAULT_REFRESH_INTERVAL)
    }

    pub fn with_refresh_interval(source: Arc<dyn SnapshotSource>, interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            source,
            state: RwLock::new(StoreState::Uninitialized),
            init_error: RwLock::new(None),
            calendars: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            refresh_task: Mutex::new(None),
            refresh_interval: interval,
            weak_self: weak_self.clone(),
        })
    }

    /// Fetch the snapshot and transition to Ready. Idempotent, including
    /// under concurrency: only the caller that wins the Uninitialized ->
    /// Initializing transition fetches; everyone else returns immediately.
    ///
    /// Fail-open: a failed fetch still reaches Ready with an empty store,
    /// recording the failure in `init_error` for diagnostics.
    pub async fn initialize(&self) -> CalsyncResult<()> {
        {
            let mut state = self.state.write();
            if *state != StoreState::Uninitialized {
                return Ok(());
            }
            *state = StoreState::Initializing;
        }

        match self.source.fetch_snapshot().await {
            Ok(records) => {
                let mut calendars = self.calendars.write();
                calendars.clear();
                for record in records {
                    calendars.insert(record.calendar_id.clone(), record);
                }
            }
            Err(e) => {
                warn!("Event store initialization fetch failed, continuing empty: {}", e);
                *self.init_error.write() = Some(e.to_string());
            }
        }

        *self.state.write() = StoreState::Ready;
        self.start_refresh_task();
        self.notify_subscribers();
        Ok(())
    }

    /// Re-fetch the snapshot and replace only calendars whose event content
    /// actually changed. Subscribers are notified only when at least one
    /// calendar changed, so an identical poll causes zero notifications.
    /// Returns whether anything changed.
    pub async fn refresh(&self) -> CalsyncResult<bool> {
        let records = self.source.fetch_snapshot().await?;

        let mut changed = false;
        {
            let mut calendars = self.calendars.write();
            for record in records {
                let content_changed = calendars
                    .get(&record.calendar_id)
                    .map(|held| held.events != record.events)
                    .unwrap_or(true);
                if content_changed {
                    debug!("Calendar {} changed, updating store", record.calendar_id);
                    calendars.insert(record.calendar_id.clone(), record);
                    changed = true;
                }
            }
        }

        if changed {
            self.notify_subscribers();
        }
        Ok(changed)
    }

    /// All events overlapping `[start, end]` (inclusive) across every
    /// calendar, ascending by start time. Pure read.
    pub fn get_events(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<CalendarEvent> {
        if *self.state.read() != StoreState::Ready {
            return Vec::new();
        }
        let mut events: Vec<CalendarEvent> = self
            .calendars
            .read()
            .values()
            .flat_map(|record| record.events.iter())
            .filter(|event| event.overlaps(start, end))
            .cloned()
            .collect();
        events.sort_by_key(|event| event.start);
        events
    }

    /// Every cached event, ascending by start time
    pub fn get_all_events(&self) -> Vec<CalendarEvent> {
        if *self.state.read() != StoreState::Ready {
            return Vec::new();
        }
        let mut events: Vec<CalendarEvent> = self
            .calendars
            .read()
            .values()
            .flat_map(|record| record.events.iter())
            .cloned()
            .collect();
        events.sort_by_key(|event| event.start);
        events
    }

    /// Register a change listener. Invoked immediately with the current event
    /// list when the store is Ready, and again after every future change.
    /// Callbacks must not re-enter subscribe/unsubscribe.
    #[allow(dead_code)]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[CalendarEvent]) + Send + Sync + 'static,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);

        if *self.state.read() == StoreState::Ready {
            callback(&self.get_all_events());
        }

        self.subscribers.write().insert(id, Box::new(callback));
        Subscription(id)
    }

    /// Remove one subscriber; other subscribers are unaffected
    #[allow(dead_code)]
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.subscribers.write().remove(&subscription.0);
    }

    /// Cancel the periodic refresh task. Safe to call repeatedly and when no
    /// task is running.
    pub fn cleanup(&self) {
        if let Some(handle) = self.refresh_task.lock().take() {
            handle.abort();
            debug!("Event store refresh task cancelled");
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> StoreState {
        *self.state.read()
    }

    /// The initialization failure message, when Ready was reached fail-open
    pub fn init_error(&self) -> Option<String> {
        self.init_error.read().clone()
    }

    fn start_refresh_task(&self) {
        let mut guard = self.refresh_task.lock();
        if guard.is_some() {
            return;
        }

        let store = self.weak_self.clone();
        let interval = self.refresh_interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(store) = store.upgrade() else { break };
                if let Err(e) = store.refresh().await {
                    warn!("Periodic store refresh failed: {}", e);
                }
            }
        }));
    }

    fn notify_subscribers(&self) {
        let events = self.get_all_events();
        let subscribers = self.subscribers.read();
        for callback in subscribers.values() {
            callback(&events);
        }
    }
}
