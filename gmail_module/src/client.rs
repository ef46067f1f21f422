//! Gmail REST transport and the `MailSource` seam the rest of the service
//! programs against.

use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth::GoogleAuth;
use crate::backoff::{retryable_status, with_backoff};
use crate::error::MailError;
use crate::message::{clean_email_address, ThreadMessage};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const MEETING_LABEL_NAME: &str = "MEETING_PROCESSED";
const CANDIDATE_QUERY: &str = "label:inbox is:unread (subject:confirmation OR subject:confirm)";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound/outbound mail operations needed by one run.
pub trait MailSource {
    /// Unread inbox messages whose subject passes the confirmation
    /// heuristic, newest first, optionally restricted to strictly after
    /// an epoch-seconds watermark.
    fn list_candidates(&self, after_epoch_secs: Option<i64>) -> Result<Vec<ThreadMessage>, MailError>;
    fn get(&self, id: &str) -> Result<ThreadMessage, MailError>;
    /// Label the message as handled and optionally mark it read.
    fn mark_processed(&self, id: &str, also_mark_read: bool) -> Result<(), MailError>;
    /// Send a plain-text reply on a thread. Returns false when no usable
    /// recipient remains after cleaning.
    fn send_reply(
        &self,
        thread_id: Option<&str>,
        to: &str,
        subject: &str,
        body: &str,
        in_reply_to: Option<&str>,
    ) -> Result<bool, MailError>;
    /// The provider's current history high-water mark.
    fn current_high_water_mark(&self) -> Result<String, MailError>;
}

pub struct GmailClient {
    http: reqwest::blocking::Client,
    auth: GoogleAuth,
    base_url: String,
    my_email: String,
    max_fetch: u32,
    token: Mutex<Option<String>>,
}

impl GmailClient {
    pub fn new(auth: GoogleAuth, my_email: impl Into<String>, max_fetch: u32) -> Self {
        Self::with_base_url(auth, my_email, max_fetch, GMAIL_API_BASE)
    }

    pub fn with_base_url(
        auth: GoogleAuth,
        my_email: impl Into<String>,
        max_fetch: u32,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
            auth,
            base_url: base_url.into(),
            my_email: my_email.into().to_lowercase(),
            max_fetch,
            token: Mutex::new(None),
        }
    }

    fn token(&self) -> Result<String, MailError> {
        let mut cached = self.token.lock().expect("token lock poisoned");
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.auth.access_token()?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Issue one API call with transport-level backoff. Rate-limit and
    /// server-error statuses are retried; 401 maps to a fatal auth error.
    fn call(
        &self,
        build: impl Fn(&reqwest::blocking::Client, &str) -> reqwest::blocking::RequestBuilder,
    ) -> Result<Value, MailError> {
        let token = self.token()?;
        with_backoff(
            || {
                let response = build(&self.http, &token).send()?;
                let status = response.status().as_u16();
                let text = response.text().unwrap_or_default();
                if status == 401 {
                    return Err(MailError::Auth(
                        "access token expired or invalid".to_string(),
                    ));
                }
                if !(200..300).contains(&status) {
                    return Err(MailError::Api {
                        status,
                        message: truncate_reason(&text),
                    });
                }
                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                serde_json::from_str(&text).map_err(|err| MailError::BadResponse(err.to_string()))
            },
            |err| matches!(err, MailError::Api { status, .. } if retryable_status(*status)),
        )
    }

    fn get_or_create_label(&self, label_name: &str) -> Result<String, MailError> {
        let labels = self.call(|http, token| {
            http.get(format!("{}/users/me/labels", self.base_url))
                .bearer_auth(token)
        })?;
        if let Some(list) = labels["labels"].as_array() {
            for label in list {
                if label["name"].as_str() == Some(label_name) {
                    if let Some(id) = label["id"].as_str() {
                        return Ok(id.to_string());
                    }
                }
            }
        }
        let created = self.call(|http, token| {
            http.post(format!("{}/users/me/labels", self.base_url))
                .bearer_auth(token)
                .json(&json!({
                    "name": label_name,
                    "labelListVisibility": "labelShow",
                    "messageListVisibility": "show",
                }))
        })?;
        created["id"]
            .as_str()
            .map(|id| id.to_string())
            .ok_or_else(|| MailError::BadResponse("label create returned no id".to_string()))
    }

    fn clean_to_header(&self, to_value: &str) -> String {
        let mut addrs: Vec<String> = Vec::new();
        for part in to_value.split(',') {
            if let Some(addr) = clean_email_address(part) {
                let addr = addr.to_lowercase();
                if addr != self.my_email && !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
        addrs.join(", ")
    }
}

impl MailSource for GmailClient {
    fn list_candidates(&self, after_epoch_secs: Option<i64>) -> Result<Vec<ThreadMessage>, MailError> {
        let mut query = CANDIDATE_QUERY.to_string();
        if let Some(after) = after_epoch_secs {
            query.push_str(&format!(" after:{after}"));
        }
        let max_results = self.max_fetch.to_string();

        let listing = self.call(|http, token| {
            http.get(format!("{}/users/me/messages", self.base_url))
                .bearer_auth(token)
                .query(&[
                    ("q", query.as_str()),
                    ("maxResults", max_results.as_str()),
                ])
        })?;

        let stubs: Vec<String> = listing["messages"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["id"].as_str())
                    .map(|id| id.to_string())
                    .collect()
            })
            .unwrap_or_default();
        debug!("candidate listing returned {} ids", stubs.len());

        let mut results = Vec::with_capacity(stubs.len());
        for id in stubs {
            match self.get(&id) {
                Ok(message) => results.push(message),
                Err(err @ MailError::Auth(_)) => return Err(err),
                Err(err) => warn!("failed to fetch message {}: {}", id, err),
            }
        }
        results.sort_by_key(|message| std::cmp::Reverse(message.internal_date_millis().unwrap_or(0)));
        Ok(results)
    }

    fn get(&self, id: &str) -> Result<ThreadMessage, MailError> {
        let value = self.call(|http, token| {
            http.get(format!("{}/users/me/messages/{}", self.base_url, id))
                .bearer_auth(token)
                .query(&[("format", "full")])
        })?;
        serde_json::from_value(value).map_err(|err| MailError::BadResponse(err.to_string()))
    }

    fn mark_processed(&self, id: &str, also_mark_read: bool) -> Result<(), MailError> {
        let label_id = self.get_or_create_label(MEETING_LABEL_NAME)?;
        let mut body = json!({ "addLabelIds": [label_id] });
        if also_mark_read {
            body["removeLabelIds"] = json!(["UNREAD"]);
        }
        self.call(|http, token| {
            http.post(format!(
                "{}/users/me/messages/{}/modify",
                self.base_url, id
            ))
            .bearer_auth(token)
            .json(&body)
        })?;
        info!(
            "email {} labeled as {}{}",
            id,
            MEETING_LABEL_NAME,
            if also_mark_read { " and marked read" } else { "" }
        );
        Ok(())
    }

    fn send_reply(
        &self,
        thread_id: Option<&str>,
        to: &str,
        subject: &str,
        body: &str,
        in_reply_to: Option<&str>,
    ) -> Result<bool, MailError> {
        let to_clean = self.clean_to_header(to);
        if to_clean.is_empty() {
            info!("send_reply cancelled: no usable recipient in '{}'", to);
            return Ok(false);
        }

        let mut mime = String::new();
        mime.push_str(&format!("To: {to_clean}\r\n"));
        mime.push_str(&format!("Subject: {subject}\r\n"));
        if let Some(reply_id) = in_reply_to {
            mime.push_str(&format!("In-Reply-To: {reply_id}\r\n"));
        }
        mime.push_str("MIME-Version: 1.0\r\n");
        mime.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n\r\n");
        mime.push_str(body);

        let raw = URL_SAFE.encode(mime.as_bytes());
        let mut payload = json!({ "raw": raw });
        if let Some(thread_id) = thread_id {
            payload["threadId"] = json!(thread_id);
        }

        self.call(|http, token| {
            http.post(format!("{}/users/me/messages/send", self.base_url))
                .bearer_auth(token)
                .json(&payload)
        })?;
        info!("replied on thread {:?} -> {}", thread_id, to_clean);
        Ok(true)
    }

    fn current_high_water_mark(&self) -> Result<String, MailError> {
        let profile = self.call(|http, token| {
            http.get(format!("{}/users/me/profile", self.base_url))
                .bearer_auth(token)
        })?;
        let history_id = match &profile["historyId"] {
            Value::String(id) => id.clone(),
            Value::Number(id) => id.to_string(),
            _ => String::new(),
        };
        if history_id.is_empty() {
            return Err(MailError::BadResponse(
                "profile returned no historyId".to_string(),
            ));
        }
        Ok(history_id)
    }
}

fn truncate_reason(text: &str) -> String {
    const MAX: usize = 300;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::Server) -> GmailClient {
        let auth = GoogleAuth::with_token_uri(
            "cid",
            "secret",
            "1//refresh",
            format!("{}/token", server.url()),
        );
        GmailClient::with_base_url(auth, "me@example.com", 10, server.url())
    }

    fn mock_token(server: &mut mockito::Server) -> mockito::Mock {
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token": "tok"}"#)
            .create()
    }

    fn encode(text: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(text.as_bytes())
    }

    #[test]
    fn list_candidates_fetches_full_messages_newest_first() {
        let mut server = mockito::Server::new();
        let _token = mock_token(&mut server);
        let _list = server
            .mock("GET", "/users/me/messages")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"messages": [{"id": "old"}, {"id": "new"}]}"#)
            .create();
        let _old = server
            .mock("GET", "/users/me/messages/old")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "id": "old", "threadId": "t1", "internalDate": "1000",
                    "payload": {"mimeType": "text/plain", "headers": [], "body": {"data": encode("a")}}
                })
                .to_string(),
            )
            .create();
        let _new = server
            .mock("GET", "/users/me/messages/new")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "id": "new", "threadId": "t2", "internalDate": "2000",
                    "payload": {"mimeType": "text/plain", "headers": [], "body": {"data": encode("b")}}
                })
                .to_string(),
            )
            .create();

        let client = client_for(&server);
        let messages = client.list_candidates(Some(123)).expect("list");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "new");
        assert_eq!(messages[1].id, "old");
    }

    #[test]
    fn mark_processed_reuses_existing_label() {
        let mut server = mockito::Server::new();
        let _token = mock_token(&mut server);
        let _labels = server
            .mock("GET", "/users/me/labels")
            .with_status(200)
            .with_body(r#"{"labels": [{"id": "L7", "name": "MEETING_PROCESSED"}]}"#)
            .create();
        let modify = server
            .mock("POST", "/users/me/messages/m1/modify")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"addLabelIds": ["L7"], "removeLabelIds": ["UNREAD"]}"#.to_string(),
            ))
            .with_status(200)
            .with_body("{}")
            .create();

        let client = client_for(&server);
        client.mark_processed("m1", true).expect("mark");
        modify.assert();
    }

    #[test]
    fn send_reply_skips_when_only_self_remains() {
        let server = mockito::Server::new();
        let client = client_for(&server);
        let sent = client
            .send_reply(Some("t1"), "Me <me@example.com>", "Subj", "body", None)
            .expect("send");
        assert!(!sent);
    }

    #[test]
    fn send_reply_posts_raw_message_on_thread() {
        let mut server = mockito::Server::new();
        let _token = mock_token(&mut server);
        let send = server
            .mock("POST", "/users/me/messages/send")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"threadId": "t9"}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"id": "sent1"}"#)
            .create();

        let client = client_for(&server);
        let sent = client
            .send_reply(
                Some("t9"),
                "A <a@example.com>, me@example.com, a@example.com",
                "Please clarify",
                "body text",
                None,
            )
            .expect("send");
        assert!(sent);
        send.assert();
    }

    #[test]
    fn high_water_mark_accepts_string_or_number() {
        let mut server = mockito::Server::new();
        let _token = mock_token(&mut server);
        let _profile = server
            .mock("GET", "/users/me/profile")
            .with_status(200)
            .with_body(r#"{"emailAddress": "me@example.com", "historyId": 424242}"#)
            .create();
        let client = client_for(&server);
        assert_eq!(client.current_high_water_mark().expect("hid"), "424242");
    }

    #[test]
    fn expired_token_maps_to_auth_error() {
        let mut server = mockito::Server::new();
        let _token = mock_token(&mut server);
        let _profile = server
            .mock("GET", "/users/me/profile")
            .with_status(401)
            .with_body(r#"{"error": {"code": 401}}"#)
            .create();
        let client = client_for(&server);
        assert!(matches!(
            client.current_high_water_mark(),
            Err(MailError::Auth(_))
        ));
    }
}
