use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::cache::{CalendarCache, CalendarEvent, CalendarRecord, EventCache};
use crate::errors::CalsyncError;
use crate::sync::{CalendarSyncDetail, SyncOrchestrator, SyncStatus};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub cache: CalendarCache,
}

/// Convert domain errors to HTTP responses: 400 invalid input, 401
/// unauthenticated, 429 upstream rate limit, 500 otherwise. Always a JSON
/// `{ error }` body, never a stack trace.
pub struct AppError(CalsyncError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CalsyncError::Validation { .. } => StatusCode::BAD_REQUEST,
            CalsyncError::Authentication { .. } => StatusCode::UNAUTHORIZED,
            CalsyncError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

impl From<CalsyncError> for AppError {
    fn from(err: CalsyncError) -> Self {
        Self(err)
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/calendar/store/init", get(store_snapshot))
        .route("/api/calendar/store/refresh", get(store_snapshot))
        .route("/api/calendar/events", get(events))
        .route("/api/calendar/sync", get(manual_sync).post(start_background_sync))
        .route("/api/calendar/sync/fresh", axum::routing::post(fresh_sync))
        .route(
            "/api/calendar/sync/interval",
            get(get_interval).post(set_interval),
        )
        .route("/api/calendar/sync/status", get(sync_status))
        .route("/api/calendar/sync/detailed-status", get(detailed_status))
        .with_state(state)
        .layer(cors)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let app = router(state);

    info!("calsyncd API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}

#[derive(Serialize)]
struct SnapshotResponse {
    calendars: Vec<CalendarRecord>,
}

/// GET /api/calendar/store/init and /store/refresh - full cache snapshot.
/// A cache outage degrades to an empty snapshot rather than an error; the
/// store is a convenience cache, not a system of record.
async fn store_snapshot(State(state): State<AppState>) -> Json<SnapshotResponse> {
    let calendars = match state.cache.snapshot().await {
        Ok(calendars) => calendars,
        Err(e) => {
            warn!("Cache unavailable for snapshot, serving empty: {}", e);
            Vec::new()
        }
    };
    Json(SnapshotResponse { calendars })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    /// Legacy form: single date plus a day count in [1,7]
    date: Option<String>,
    days: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventsResponse {
    success: bool,
    events: Vec<CalendarEvent>,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    cached: bool,
}

/// GET /api/calendar/events?startDate&endDate (or legacy date+days)
async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, AppError> {
    let (start, end) = parse_date_range(&query)?;

    if !state.orchestrator.is_authorized().await {
        let body = Json(json!({
            "authRequired": true,
            "authUrl": state.orchestrator.auth_url(),
        }));
        return Ok((StatusCode::UNAUTHORIZED, body).into_response());
    }

    let events = state
        .orchestrator
        .get_events_for_date_range(start, end)
        .await?;

    Ok(Json(EventsResponse {
        success: true,
        events,
        start_date: start,
        end_date: end,
        cached: true,
    })
    .into_response())
}

/// POST /api/calendar/sync - begin the recurring background sync
async fn start_background_sync(State(state): State<AppState>) -> Json<serde_json::Value> {
    let started = state.orchestrator.start_background_sync();
    Json(json!({ "success": true, "started": started }))
}

/// GET /api/calendar/sync - run one manual sync pass
async fn manual_sync(State(state): State<AppState>) -> Result<Response, AppError> {
    run_sync_pass(&state, false).await
}

/// POST /api/calendar/sync/fresh - full resync, clearing sync tokens first
async fn fresh_sync(State(state): State<AppState>) -> Result<Response, AppError> {
    run_sync_pass(&state, true).await
}

async fn run_sync_pass(state: &AppState, force_fresh: bool) -> Result<Response, AppError> {
    if !state.orchestrator.is_authorized().await {
        let body = Json(json!({
            "authRequired": true,
            "authUrl": state.orchestrator.auth_url(),
        }));
        return Ok((StatusCode::UNAUTHORIZED, body).into_response());
    }

    let report = state.orchestrator.sync_all_calendars(force_fresh).await?;
    let failed: Vec<serde_json::Value> = report
        .failed
        .iter()
        .map(|(id, err)| json!({ "calendarId": id, "error": err }))
        .collect();

    Ok(Json(json!({
        "success": report.all_succeeded(),
        "synced": report.synced,
        "skipped": report.skipped,
        "failed": failed,
    }))
    .into_response())
}

/// GET /api/calendar/sync/interval
async fn get_interval(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "intervalMinutes": state.orchestrator.get_sync_interval() }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntervalRequest {
    interval_minutes: u32,
}

/// POST /api/calendar/sync/interval - update the cadence (minutes, >= 1)
async fn set_interval(
    State(state): State<AppState>,
    Json(request): Json<IntervalRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .orchestrator
        .set_sync_interval(request.interval_minutes)
        .await?;
    Ok(Json(json!({
        "success": true,
        "intervalMinutes": request.interval_minutes,
    })))
}

/// GET /api/calendar/sync/status
async fn sync_status(State(state): State<AppState>) -> Result<Json<SyncStatus>, AppError> {
    Ok(Json(state.orchestrator.status().await?))
}

#[derive(Serialize)]
struct DetailedStatusResponse {
    #[serde(flatten)]
    status: SyncStatus,
    calendars: Vec<CalendarSyncDetail>,
}

/// GET /api/calendar/sync/detailed-status
async fn detailed_status(
    State(state): State<AppState>,
) -> Result<Json<DetailedStatusResponse>, AppError> {
    let (status, calendars) = state.orchestrator.detailed_status().await?;
    Ok(Json(DetailedStatusResponse { status, calendars }))
}

/// Resolve the query into a concrete `[start, end]` range. Two forms are
/// accepted: explicit startDate/endDate, or the legacy date + days form where
/// `date=D&days=N` covers D 00:00:00 through D+N-1 23:59:59.999.
fn parse_date_range(query: &EventsQuery) -> Result<(DateTime<Utc>, DateTime<Utc>), CalsyncError> {
    let invalid = |field: &str, message: &str| CalsyncError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    };

    let (start, end) = match (&query.start_date, &query.end_date, &query.date) {
        (Some(start_raw), Some(end_raw), _) => {
            let start = parse_point(start_raw, false)
                .ok_or_else(|| invalid("startDate", "unrecognized date format"))?;
            let end = parse_point(end_raw, true)
                .ok_or_else(|| invalid("endDate", "unrecognized date format"))?;
            (start, end)
        }
        (None, None, Some(date_raw)) => {
            let days = query.days.unwrap_or(1);
            if !(1..=7).contains(&days) {
                return Err(invalid("days", "must be between 1 and 7"));
            }
            let date = NaiveDate::parse_from_str(date_raw, "%Y-%m-%d")
                .map_err(|_| invalid("date", "expected YYYY-MM-DD"))?;
            let start = day_start(date).ok_or_else(|| invalid("date", "out of range"))?;
            let end = day_end(date + ChronoDuration::days(days - 1))
                .ok_or_else(|| invalid("date", "out of range"))?;
            (start, end)
        }
        _ => {
            return Err(invalid(
                "date range",
                "provide startDate and endDate, or date with optional days",
            ))
        }
    };

    if start > end {
        return Err(invalid("date range", "startDate must not be after endDate"));
    }
    Ok((start, end))
}

/// Parse one range boundary: RFC 3339, naive datetime, or bare date. A bare
/// date expands to start-of-day or end-of-day depending on which boundary it
/// is.
fn parse_point(raw: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return if end_of_day { day_end(date) } else { day_start(date) };
    }
    None
}

fn day_start(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

fn day_end(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_milli_opt(23, 59, 59, 999)
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(
        start_date: Option<&str>,
        end_date: Option<&str>,
        date: Option<&str>,
        days: Option<i64>,
    ) -> EventsQuery {
        EventsQuery {
            start_date: start_date.map(String::from),
            end_date: end_date.map(String::from),
            date: date.map(String::from),
            days,
        }
    }

    #[test]
    fn test_legacy_form_matches_explicit_range() {
        let legacy = parse_date_range(&query(None, None, Some("2024-01-01"), Some(3))).unwrap();
        let explicit = parse_date_range(&query(
            Some("2024-01-01T00:00:00"),
            Some("2024-01-03T23:59:59.999"),
            None,
            None,
        ))
        .unwrap();

        assert_eq!(legacy, explicit);
    }

    #[test]
    fn test_days_defaults_to_one() {
        let (start, end) = parse_date_range(&query(None, None, Some("2024-01-01"), None)).unwrap();
        assert_eq!(start, day_start(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()).unwrap());
        assert_eq!(end, day_end(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()).unwrap());
    }

    #[test]
    fn test_days_out_of_bounds_is_invalid() {
        for days in [0, 8, -1] {
            let result = parse_date_range(&query(None, None, Some("2024-01-01"), Some(days)));
            assert!(matches!(result, Err(CalsyncError::Validation { .. })));
        }
    }

    #[test]
    fn test_rfc3339_boundaries_pass_through() {
        let (start, end) = parse_date_range(&query(
            Some("2024-01-01T08:00:00Z"),
            Some("2024-01-01T17:00:00Z"),
            None,
            None,
        ))
        .unwrap();
        assert_eq!(end - start, ChronoDuration::hours(9));
    }

    #[test]
    fn test_bare_dates_expand_to_full_days() {
        let (start, end) =
            parse_date_range(&query(Some("2024-01-01"), Some("2024-01-02"), None, None)).unwrap();
        assert_eq!(start, day_start(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()).unwrap());
        assert_eq!(end, day_end(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()).unwrap());
    }

    #[test]
    fn test_inverted_range_is_invalid() {
        let result = parse_date_range(&query(Some("2024-01-05"), Some("2024-01-01"), None, None));
        assert!(matches!(result, Err(CalsyncError::Validation { .. })));
    }

    #[test]
    fn test_missing_parameters_are_invalid() {
        let result = parse_date_range(&query(None, None, None, None));
        assert!(matches!(result, Err(CalsyncError::Validation { .. })));

        // startDate without endDate falls through to invalid as well
        let result = parse_date_range(&query(Some("2024-01-01"), None, None, None));
        assert!(matches!(result, Err(CalsyncError::Validation { .. })));
    }
}
