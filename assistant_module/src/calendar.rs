//! Calendar booking. Event creation is idempotent: the event id is a
//! deterministic hash of the thread and the localized start time, and the
//! provider's "already exists" answer is success, not an error.

use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use serde_json::{json, Value};
use tracing::{info, warn};

use gmail_module::auth::GoogleAuth;
use gmail_module::backoff::{retryable_status, with_backoff};

const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
const REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);
const EVENT_DURATION_HOURS: i64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("calendar auth failed: {0}")]
    Auth(String),
    #[error("calendar api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("calendar transport error: {0}")]
    Transport(String),
    #[error("unexpected calendar response: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for CalendarError {
    fn from(err: reqwest::Error) -> Self {
        CalendarError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct EventRequest {
    pub thread_id: String,
    pub summary: String,
    /// Local wall-clock start, interpreted in `timezone`.
    pub start_local: NaiveDateTime,
    pub timezone: Tz,
    pub attendees: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created {
        event_id: String,
        meet_link: Option<String>,
    },
    /// A previous attempt (possibly a concurrent run) already booked this
    /// thread at this time.
    AlreadyExists { event_id: String },
}

pub trait CalendarSink {
    fn create_event(&self, request: &EventRequest) -> Result<CreateOutcome, CalendarError>;
}

/// md5 of `threadId-<localized start>`, first 20 hex chars. Stable for a
/// given thread and resolved time, and valid as a calendar event id.
pub fn deterministic_event_id(thread_id: &str, start_local_iso: &str) -> String {
    let digest = md5::compute(format!("{thread_id}-{start_local_iso}").as_bytes());
    format!("{digest:x}")[..20].to_string()
}

pub struct GoogleCalendar {
    http: reqwest::blocking::Client,
    auth: GoogleAuth,
    base_url: String,
}

impl GoogleCalendar {
    pub fn new(auth: GoogleAuth) -> Self {
        Self::with_base_url(auth, CALENDAR_API_BASE)
    }

    pub fn with_base_url(auth: GoogleAuth, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
            auth,
            base_url: base_url.into(),
        }
    }
}

impl CalendarSink for GoogleCalendar {
    fn create_event(&self, request: &EventRequest) -> Result<CreateOutcome, CalendarError> {
        let tz_name = request.timezone.name();
        let start_local = match request
            .timezone
            .from_local_datetime(&request.start_local)
            .earliest()
        {
            Some(start) => start,
            None => {
                return Err(CalendarError::BadResponse(format!(
                    "start time {} does not exist in {}",
                    request.start_local, tz_name
                )))
            }
        };
        let end_local = start_local + Duration::hours(EVENT_DURATION_HOURS);
        let event_id = deterministic_event_id(&request.thread_id, &start_local.to_rfc3339());

        let body = json!({
            "id": event_id,
            "summary": request.summary,
            "start": {"dateTime": start_local.to_rfc3339(), "timeZone": tz_name},
            "end": {"dateTime": end_local.to_rfc3339(), "timeZone": tz_name},
            "conferenceData": {
                "createRequest": {"requestId": format!("meet-{event_id}")}
            },
            "attendees": request
                .attendees
                .iter()
                .map(|email| json!({"email": email}))
                .collect::<Vec<_>>(),
            "reminders": {
                "useDefault": false,
                "overrides": [
                    {"method": "email", "minutes": 30},
                    {"method": "popup", "minutes": 10},
                ],
            },
        });
        info!(
            "creating event thread={} start={} eventId={} attendees={:?}",
            request.thread_id, start_local, event_id, request.attendees
        );

        let token = self
            .auth
            .access_token()
            .map_err(|err| CalendarError::Auth(err.to_string()))?;

        let result = with_backoff(
            || {
                let response = self
                    .http
                    .post(format!("{}/calendars/primary/events", self.base_url))
                    .bearer_auth(&token)
                    .query(&[("conferenceDataVersion", "1"), ("sendUpdates", "all")])
                    .json(&body)
                    .send()?;
                let status = response.status().as_u16();
                let text = response.text().unwrap_or_default();
                if status == 401 {
                    return Err(CalendarError::Auth(
                        "access token expired or invalid".to_string(),
                    ));
                }
                if !(200..300).contains(&status) {
                    return Err(CalendarError::Api {
                        status,
                        message: text,
                    });
                }
                serde_json::from_str::<Value>(&text)
                    .map_err(|err| CalendarError::BadResponse(err.to_string()))
            },
            |err| matches!(err, CalendarError::Api { status, .. } if retryable_status(*status)),
        );

        let event = match result {
            Ok(event) => event,
            Err(CalendarError::Api { status: 409, .. }) => {
                info!(
                    "event already exists for eventId={}; treating as success",
                    event_id
                );
                return Ok(CreateOutcome::AlreadyExists { event_id });
            }
            Err(err) => return Err(err),
        };

        let meet_link = extract_meet_link(&event);
        if meet_link.is_none() {
            warn!("event created but no meeting link returned");
        }
        let event_id = event["id"].as_str().unwrap_or(&event_id).to_string();
        Ok(CreateOutcome::Created {
            event_id,
            meet_link,
        })
    }
}

fn extract_meet_link(event: &Value) -> Option<String> {
    if let Some(link) = event["hangoutLink"].as_str() {
        return Some(link.to_string());
    }
    event["conferenceData"]["entryPoints"][0]["uri"]
        .as_str()
        .map(|uri| uri.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn request() -> EventRequest {
        EventRequest {
            thread_id: "thread-1".to_string(),
            summary: "Meeting Confirmation".to_string(),
            start_local: NaiveDate::from_ymd_opt(2025, 11, 7)
                .unwrap()
                .and_hms_opt(14, 0, 0)
                .unwrap(),
            timezone: "Etc/GMT-8".parse().unwrap(),
            attendees: vec!["a@example.com".to_string(), "b@example.com".to_string()],
        }
    }

    fn calendar_for(server: &mockito::Server) -> GoogleCalendar {
        let auth = GoogleAuth::with_token_uri(
            "cid",
            "secret",
            "1//r",
            format!("{}/token", server.url()),
        );
        GoogleCalendar::with_base_url(auth, server.url())
    }

    fn mock_token(server: &mut mockito::Server) -> mockito::Mock {
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token": "tok"}"#)
            .create()
    }

    #[test]
    fn event_id_is_deterministic_and_short() {
        let a = deterministic_event_id("t1", "2025-11-07T14:00:00+08:00");
        let b = deterministic_event_id("t1", "2025-11-07T14:00:00+08:00");
        let c = deterministic_event_id("t2", "2025-11-07T14:00:00+08:00");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 20);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn created_event_returns_id_and_link() {
        let mut server = mockito::Server::new();
        let _token = mock_token(&mut server);
        let _create = server
            .mock("POST", "/calendars/primary/events")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"id": "evt1", "hangoutLink": "https://meet.example/abc"}"#,
            )
            .create();

        let calendar = calendar_for(&server);
        let outcome = calendar.create_event(&request()).expect("create");
        assert_eq!(
            outcome,
            CreateOutcome::Created {
                event_id: "evt1".to_string(),
                meet_link: Some("https://meet.example/abc".to_string()),
            }
        );
    }

    #[test]
    fn conflict_reports_already_exists_as_success() {
        let mut server = mockito::Server::new();
        let _token = mock_token(&mut server);
        let _create = server
            .mock("POST", "/calendars/primary/events")
            .match_query(mockito::Matcher::Any)
            .with_status(409)
            .with_body(r#"{"error": {"code": 409, "message": "duplicate"}}"#)
            .create();

        let calendar = calendar_for(&server);
        let outcome = calendar.create_event(&request()).expect("idempotent hit");
        assert!(matches!(outcome, CreateOutcome::AlreadyExists { .. }));
    }

    #[test]
    fn server_error_surfaces_after_backoff() {
        let mut server = mockito::Server::new();
        let _token = mock_token(&mut server);
        let _create = server
            .mock("POST", "/calendars/primary/events")
            .match_query(mockito::Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error": {"code": 400}}"#)
            .create();

        let calendar = calendar_for(&server);
        let err = calendar.create_event(&request()).expect_err("error");
        assert!(matches!(err, CalendarError::Api { status: 400, .. }));
    }
}
