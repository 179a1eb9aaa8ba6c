use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::{
    basic::BasicClient, reqwest::async_http_client, AuthUrl, ClientId, ClientSecret, CsrfToken,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::cache::CalendarEvent;
use crate::config::GoogleCalendarConfig;
use crate::errors::{CalsyncError, CalsyncResult};
use crate::rate_limit::RateLimiter;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar.readonly";
const API_BASE: &str = "https://www.googleapis.com/calendar/v3";

/// Retries per API call when Google rate-limits us
const MAX_RETRIES: u32 = 3;
const PAGE_SIZE: u32 = 250;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

/// One calendar from the account's calendar list, with the metadata the
/// cache records carry
#[derive(Debug, Clone)]
pub struct CalendarListEntry {
    pub id: String,
    pub summary: String,
    pub color: Option<String>,
    pub time_zone: Option<String>,
    pub access_role: Option<String>,
}

/// Result of one event fetch against a calendar.
///
/// `full` means the fetch ran without a sync token (first sync, forced
/// refresh, or expired-token fallback) and `events` replaces the stored set
/// wholesale; otherwise `events` and `deleted_ids` are a delta.
#[derive(Debug, Clone)]
pub struct EventsDelta {
    pub events: Vec<CalendarEvent>,
    pub deleted_ids: Vec<String>,
    pub next_sync_token: Option<String>,
    pub full: bool,
}

#[derive(Debug, Deserialize)]
struct GoogleCalendarList {
    items: Option<Vec<GoogleCalendarListItem>>,
}

#[derive(Debug, Deserialize)]
struct GoogleCalendarListItem {
    id: Option<String>,
    summary: Option<String>,
    #[serde(rename = "backgroundColor")]
    background_color: Option<String>,
    #[serde(rename = "timeZone")]
    time_zone: Option<String>,
    #[serde(rename = "accessRole")]
    access_role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleEventsPage {
    items: Option<Vec<GoogleEvent>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "nextSyncToken")]
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleEvent {
    id: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    status: Option<String>,
    start: Option<GoogleEventDateTime>,
    end: Option<GoogleEventDateTime>,
}

#[derive(Debug, Deserialize)]
struct GoogleEventDateTime {
    #[serde(rename = "dateTime")]
    date_time: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Remote calendar backend as the orchestrator and the auth flow see it.
/// The Google implementation is the production one; tests substitute
/// in-memory fakes.
#[async_trait]
pub trait CalendarSource: Send + Sync {
    async fn is_authenticated(&self) -> bool;
    fn auth_url(&self) -> CalsyncResult<String>;
    async fn authenticate_with_code(&self, auth_code: &str) -> CalsyncResult<()>;
    async fn list_calendars(&self) -> CalsyncResult<Vec<CalendarListEntry>>;
    async fn fetch_events_delta(
        &self,
        calendar_id: &str,
        sync_token: Option<&str>,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> CalsyncResult<EventsDelta>;
}

pub struct GoogleCalendarService {
    config: GoogleCalendarConfig,
    token_file_path: PathBuf,
    http_client: reqwest::Client,
    limiter: RateLimiter<serde_json::Value>,
}

impl GoogleCalendarService {
    pub fn new(config: GoogleCalendarConfig, data_dir: PathBuf) -> Self {
        let token_file_path = data_dir.join("google_calendar_token.json");

        Self {
            config,
            token_file_path,
            http_client: reqwest::Client::new(),
            limiter: RateLimiter::new(),
        }
    }

    /// Check if we have usable authentication: an unexpired access token, or
    /// an expired one we can refresh
    pub async fn is_authenticated(&self) -> bool {
        match self.load_stored_token().await {
            Ok(token) => match token.expires_at {
                Some(expires_at) => Utc::now() < expires_at || token.refresh_token.is_some(),
                // No expiry means it's likely a long-lived token
                None => true,
            },
            Err(_) => false,
        }
    }

    /// Get OAuth2 authorization URL for initial setup
    pub fn get_auth_url(&self) -> CalsyncResult<(String, CsrfToken)> {
        let client = self.oauth_client()?;

        let (auth_url, csrf_token) = client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(CALENDAR_SCOPE.to_string()))
            .url();

        Ok((auth_url.to_string(), csrf_token))
    }

    /// Exchange authorization code for access token
    pub async fn authenticate_with_code(&self, auth_code: &str) -> CalsyncResult<()> {
        debug!("Exchanging authorization code for access token");

        // Manual token exchange to avoid oauth2 crate parsing issues
        let token_response = self.exchange_code_manually(auth_code).await?;

        let stored_token = StoredToken {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_at: token_response
                .expires_in
                .map(|seconds| Utc::now() + Duration::seconds(seconds)),
            scopes: vec![CALENDAR_SCOPE.to_string()],
        };

        self.store_token(&stored_token).await?;

        info!("Google Calendar authentication successful");
        Ok(())
    }

    /// Get calendar list with the metadata the cache records need
    pub async fn list_calendars(&self) -> CalsyncResult<Vec<CalendarListEntry>> {
        let token = self.get_valid_token().await?;
        let url = format!("{}/users/me/calendarList", API_BASE);

        let value = self
            .api_get("calendarList", url, Vec::new(), token.access_token)
            .await?;
        let list: GoogleCalendarList = serde_json::from_value(value)?;

        let mut calendars = Vec::new();
        for item in list.items.unwrap_or_default() {
            if let (Some(id), Some(summary)) = (item.id, item.summary) {
                calendars.push(CalendarListEntry {
                    id,
                    summary,
                    color: item.background_color,
                    time_zone: item.time_zone,
                    access_role: item.access_role,
                });
            }
        }

        Ok(calendars)
    }

    /// Fetch events for one calendar, incrementally when a sync token is
    /// held. A rejected token (410 Gone) transparently falls back to a full
    /// windowed fetch.
    pub async fn fetch_events_delta(
        &self,
        calendar_id: &str,
        sync_token: Option<&str>,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> CalsyncResult<EventsDelta> {
        match self.fetch_pages(calendar_id, sync_token, window).await {
            Err(CalsyncError::SyncTokenExpired) => {
                info!(
                    "Sync token for calendar {} expired, performing full re-fetch",
                    calendar_id
                );
                self.fetch_pages(calendar_id, None, window).await
            }
            other => other,
        }
    }

    async fn fetch_pages(
        &self,
        calendar_id: &str,
        sync_token: Option<&str>,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> CalsyncResult<EventsDelta> {
        let token = self.get_valid_token().await?;
        let url = format!(
            "{}/calendars/{}/events",
            API_BASE,
            urlencoding::encode(calendar_id)
        );
        let limiter_key = format!("events:{}", calendar_id);

        let mut delta = EventsDelta {
            events: Vec::new(),
            deleted_ids: Vec::new(),
            next_sync_token: None,
            full: sync_token.is_none(),
        };
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(String, String)> = vec![
                ("maxResults".to_string(), PAGE_SIZE.to_string()),
                ("singleEvents".to_string(), "true".to_string()),
            ];
            match sync_token {
                Some(sync_token) => {
                    query.push(("syncToken".to_string(), sync_token.to_string()));
                }
                None => {
                    // Time filters are only legal without a sync token
                    query.push(("timeMin".to_string(), window.0.to_rfc3339()));
                    query.push(("timeMax".to_string(), window.1.to_rfc3339()));
                }
            }
            if let Some(ref page) = page_token {
                query.push(("pageToken".to_string(), page.clone()));
            }

            let value = self
                .api_get(&limiter_key, url.clone(), query, token.access_token.clone())
                .await?;
            let page: GoogleEventsPage = serde_json::from_value(value)?;

            for raw in page.items.unwrap_or_default() {
                let Some(id) = raw.id.clone() else {
                    continue;
                };
                if raw.status.as_deref() == Some("cancelled") {
                    delta.deleted_ids.push(id);
                    continue;
                }
                match convert_google_event(raw, calendar_id) {
                    Ok(event) => delta.events.push(event),
                    Err(e) => warn!("Skipping malformed event {} in {}: {}", id, calendar_id, e),
                }
            }

            if let Some(next) = page.next_sync_token {
                delta.next_sync_token = Some(next);
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!(
            "Fetched {} events, {} deletions from calendar {} ({})",
            delta.events.len(),
            delta.deleted_ids.len(),
            calendar_id,
            if delta.full { "full" } else { "incremental" }
        );
        Ok(delta)
    }

    /// Issue one GET through the rate limiter, classifying the response
    async fn api_get(
        &self,
        key: &str,
        url: String,
        query: Vec<(String, String)>,
        access_token: String,
    ) -> CalsyncResult<serde_json::Value> {
        self.limiter
            .execute(
                key,
                || {
                    let client = self.http_client.clone();
                    let url = url.clone();
                    let query = query.clone();
                    let access_token = access_token.clone();
                    async move {
                        let response = client
                            .get(&url)
                            .bearer_auth(&access_token)
                            .query(&query)
                            .send()
                            .await?;
                        classify_response(response).await
                    }
                },
                MAX_RETRIES,
            )
            .await
    }

    /// Get a valid access token, refreshing if necessary
    async fn get_valid_token(&self) -> CalsyncResult<StoredToken> {
        let token = self.load_stored_token().await?;

        // Refresh a little early so a token never expires mid-pass
        if let Some(expires_at) = token.expires_at {
            if Utc::now() + Duration::minutes(5) >= expires_at {
                debug!("Access token expired, refreshing...");
                return self.refresh_token(&token).await;
            }
        }

        Ok(token)
    }

    /// Refresh expired access token
    async fn refresh_token(&self, current_token: &StoredToken) -> CalsyncResult<StoredToken> {
        let refresh_token =
            current_token
                .refresh_token
                .as_ref()
                .ok_or_else(|| CalsyncError::Authentication {
                    service: "Google Calendar".to_string(),
                    message: "No refresh token available".to_string(),
                })?;

        let client = self.oauth_client()?;

        let token_result = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .request_async(async_http_client)
            .await
            .map_err(|e| CalsyncError::Authentication {
                service: "Google Calendar".to_string(),
                message: format!("Failed to refresh token: {}", e),
            })?;

        let new_token = StoredToken {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: Some(refresh_token.clone()), // Keep existing refresh token
            expires_at: token_result
                .expires_in()
                .map(|d| Utc::now() + Duration::seconds(d.as_secs() as i64)),
            scopes: current_token.scopes.clone(),
        };

        self.store_token(&new_token).await?;
        info!("Google Calendar token refreshed successfully");
        Ok(new_token)
    }

    fn oauth_client(&self) -> CalsyncResult<BasicClient> {
        let parse_err = |e: oauth2::url::ParseError| CalsyncError::Config {
            message: format!("Invalid OAuth endpoint or redirect URI: {}", e),
        };

        Ok(BasicClient::new(
            ClientId::new(self.config.client_id.clone()),
            Some(ClientSecret::new(self.config.client_secret.clone())),
            AuthUrl::new(AUTH_URL.to_string()).map_err(parse_err)?,
            Some(TokenUrl::new(TOKEN_URL.to_string()).map_err(parse_err)?),
        )
        .set_redirect_uri(
            RedirectUrl::new(self.config.redirect_uri.clone()).map_err(parse_err)?,
        ))
    }

    /// Manual token exchange to avoid oauth2 crate JSON parsing issues
    async fn exchange_code_manually(&self, auth_code: &str) -> CalsyncResult<GoogleTokenResponse> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code", auth_code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];

        let response = self
            .http_client
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let response_text = response.text().await?;
        if !status.is_success() {
            return Err(CalsyncError::Authentication {
                service: "Google OAuth2".to_string(),
                message: format!("{} - {}", status, response_text),
            });
        }

        let token_response: GoogleTokenResponse =
            serde_json::from_str(&response_text).map_err(|e| CalsyncError::Parsing {
                format: "JSON".to_string(),
                message: format!("token response: {}", e),
            })?;

        debug!("Token exchange successful, received access token");
        Ok(token_response)
    }

    async fn store_token(&self, token: &StoredToken) -> CalsyncResult<()> {
        if let Some(parent) = self.token_file_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CalsyncError::Config {
                    message: format!("Failed to create data directory: {}", e),
                })?;
        }
        let token_json = serde_json::to_string_pretty(token)?;
        fs::write(&self.token_file_path, token_json)
            .await
            .map_err(|e| CalsyncError::Config {
                message: format!("Failed to write token file: {}", e),
            })?;
        debug!("Stored Google Calendar token to {:?}", self.token_file_path);
        Ok(())
    }

    async fn load_stored_token(&self) -> CalsyncResult<StoredToken> {
        let token_data = fs::read_to_string(&self.token_file_path).await.map_err(|_| {
            CalsyncError::Authentication {
                service: "Google Calendar".to_string(),
                message: "No stored token; run auth-google first".to_string(),
            }
        })?;
        Ok(serde_json::from_str(&token_data)?)
    }
}

#[async_trait]
impl CalendarSource for GoogleCalendarService {
    async fn is_authenticated(&self) -> bool {
        GoogleCalendarService::is_authenticated(self).await
    }

    fn auth_url(&self) -> CalsyncResult<String> {
        self.get_auth_url().map(|(url, _)| url)
    }

    async fn authenticate_with_code(&self, auth_code: &str) -> CalsyncResult<()> {
        GoogleCalendarService::authenticate_with_code(self, auth_code).await
    }

    async fn list_calendars(&self) -> CalsyncResult<Vec<CalendarListEntry>> {
        GoogleCalendarService::list_calendars(self).await
    }

    async fn fetch_events_delta(
        &self,
        calendar_id: &str,
        sync_token: Option<&str>,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> CalsyncResult<EventsDelta> {
        GoogleCalendarService::fetch_events_delta(self, calendar_id, sync_token, window).await
    }
}

/// Map an HTTP response onto the error taxonomy, honoring Retry-After on 429
async fn classify_response(response: reqwest::Response) -> CalsyncResult<serde_json::Value> {
    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Err(CalsyncError::RateLimited { retry_after_secs });
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        let body = response.text().await.unwrap_or_default();
        return Err(CalsyncError::Authentication {
            service: "Google Calendar".to_string(),
            message: format!("{} - {}", status, body),
        });
    }
    if status == reqwest::StatusCode::GONE {
        return Err(CalsyncError::SyncTokenExpired);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!("Google Calendar API error: {} - {}", status, body);
        return Err(CalsyncError::Api {
            service: "Google Calendar".to_string(),
            message: format!("{} - {}", status, body),
        });
    }

    Ok(response.json().await?)
}

fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

/// Convert one Google event into the cache representation. All-day events
/// carry date-only boundaries; they map to 00:00:00 and 23:59:59 UTC so
/// range queries see the whole day.
fn convert_google_event(raw: GoogleEvent, calendar_id: &str) -> CalsyncResult<CalendarEvent> {
    let id = raw.id.ok_or_else(|| CalsyncError::Parsing {
        format: "Google event".to_string(),
        message: "missing id".to_string(),
    })?;

    let start_field = raw.start.ok_or_else(|| CalsyncError::Parsing {
        format: "Google event".to_string(),
        message: "missing start".to_string(),
    })?;

    let all_day = start_field.date.is_some() && start_field.date_time.is_none();

    let start = parse_event_time(&start_field, false)?;
    let end = match raw.end {
        Some(ref end_field) => parse_event_time(end_field, true)?,
        None => start,
    };

    Ok(CalendarEvent {
        id,
        calendar_id: calendar_id.to_string(),
        start,
        end,
        title: raw.summary,
        description: raw.description,
        location: raw.location,
        all_day,
    })
}

fn parse_event_time(field: &GoogleEventDateTime, is_end: bool) -> CalsyncResult<DateTime<Utc>> {
    if let Some(ref datetime_str) = field.date_time {
        return DateTime::parse_from_rfc3339(datetime_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CalsyncError::Parsing {
                format: "Google event".to_string(),
                message: format!("invalid datetime: {}", e),
            });
    }
    if let Some(ref date_str) = field.date {
        let naive_date = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d").map_err(|e| {
            CalsyncError::Parsing {
                format: "Google event".to_string(),
                message: format!("invalid date: {}", e),
            }
        })?;
        let naive_datetime = if is_end {
            naive_date.and_hms_opt(23, 59, 59)
        } else {
            naive_date.and_hms_opt(0, 0, 0)
        }
        .ok_or_else(|| CalsyncError::Parsing {
            format: "Google event".to_string(),
            message: "invalid date".to_string(),
        })?;
        return Ok(DateTime::from_naive_utc_and_offset(naive_datetime, Utc));
    }
    Err(CalsyncError::Parsing {
        format: "Google event".to_string(),
        message: "event has no start time".to_string(),
    })
}
