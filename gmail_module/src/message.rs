//! Inbound message model: Gmail's full-format message shape, header
//! lookup, and plain-text body extraction.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use tracing::warn;

/// One inbound email as fetched from the provider. Immutable once built.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    /// Epoch milliseconds assigned by the provider.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<PayloadBody>,
    #[serde(default)]
    pub parts: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayloadBody {
    #[serde(default)]
    pub data: Option<String>,
}

impl ThreadMessage {
    /// Case-insensitive header lookup; duplicates resolve to the first
    /// occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload.as_ref().and_then(|payload| {
            payload
                .headers
                .iter()
                .find(|header| header.name.eq_ignore_ascii_case(name))
                .map(|header| header.value.as_str())
        })
    }

    pub fn internal_date_millis(&self) -> Option<i64> {
        self.internal_date.as_deref()?.trim().parse().ok()
    }

    /// Flatten the MIME tree to plain text: `text/plain` parts are decoded
    /// directly, `text/html` parts are tag-stripped, multipart nodes
    /// recurse. Parts are joined with blank lines.
    pub fn extract_text(&self) -> String {
        let Some(payload) = self.payload.as_ref() else {
            return String::new();
        };
        let mut parts_text: Vec<String> = Vec::new();
        walk_payload(payload, &mut parts_text);
        parts_text
            .iter()
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
            .trim()
            .to_string()
    }
}

fn walk_payload(part: &MessagePayload, out: &mut Vec<String>) {
    let data = part.body.as_ref().and_then(|body| body.data.as_deref());
    match (part.mime_type.as_str(), data) {
        ("text/plain", Some(data)) => {
            if let Some(text) = decode_body(data) {
                out.push(text);
            }
        }
        ("text/html", Some(data)) => {
            if let Some(html) = decode_body(data) {
                out.push(strip_html(&html));
            }
        }
        _ if !part.parts.is_empty() => {
            for sub in &part.parts {
                walk_payload(sub, out);
            }
        }
        ("", Some(data)) => {
            if let Some(text) = decode_body(data) {
                out.push(text);
            }
        }
        _ => {}
    }
}

fn decode_body(data: &str) -> Option<String> {
    match URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) => {
            warn!("failed to decode message body part: {}", err);
            None
        }
    }
}

/// Minimal HTML-to-text: drop script/style blocks, turn the common block
/// and break tags into newlines, strip the remaining tags, unescape the
/// handful of entities that matter for meeting text.
fn strip_html(html: &str) -> String {
    fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
        s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    }
    fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
        haystack
            .as_bytes()
            .windows(needle.len())
            .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
    }

    let mut text = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(pos) = rest.find('<') {
        text.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let dropped_block = ["script", "style"].iter().any(|name| {
            if !starts_with_ignore_case(rest, &format!("<{name}")) {
                return false;
            }
            let close = format!("</{name}>");
            match find_ignore_case(rest, &close) {
                Some(end) => rest = &rest[end + close.len()..],
                None => rest = "",
            }
            true
        });
        if dropped_block {
            continue;
        }

        match rest.find('>') {
            Some(end) => {
                let tag_name = rest[1..end]
                    .trim_start_matches('/')
                    .split([' ', '\t', '\n', '/'])
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                if matches!(
                    tag_name.as_str(),
                    "br" | "p" | "div" | "tr" | "li" | "h1" | "h2" | "h3"
                ) {
                    text.push('\n');
                }
                rest = &rest[end + 1..];
            }
            None => {
                text.push_str(rest);
                rest = "";
            }
        }
    }
    text.push_str(rest);

    for (entity, plain) in [
        ("&nbsp;", " "),
        ("&amp;", "&"),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#39;", "'"),
    ] {
        text = text.replace(entity, plain);
    }
    text
}

/// Extract a bare address from a display form, e.g.
/// `Peter <someone@example.com>` -> `someone@example.com`.
pub fn clean_email_address(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let at = raw.find('@')?;
    let is_addr_char =
        |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'+');

    let mut start = at;
    while start > 0 && is_addr_char(bytes[start - 1]) {
        start -= 1;
    }
    let mut end = at + 1;
    while end < bytes.len() && is_addr_char(bytes[end]) {
        end += 1;
    }
    if start == at || end == at + 1 {
        return None;
    }
    Some(raw[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(text: &str) -> String {
        URL_SAFE_NO_PAD.encode(text.as_bytes())
    }

    fn plain_message(body: &str) -> ThreadMessage {
        let json = serde_json::json!({
            "id": "m1",
            "threadId": "t1",
            "internalDate": "1762300000000",
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    {"name": "Subject", "value": "Meeting Confirmation"},
                    {"name": "From", "value": "Alice <alice@example.com>"},
                    {"name": "from", "value": "shadow@example.com"}
                ],
                "body": {"data": encode(body)}
            }
        });
        serde_json::from_value(json).expect("message")
    }

    #[test]
    fn header_lookup_is_case_insensitive_first_match() {
        let msg = plain_message("hello");
        assert_eq!(msg.header("subject"), Some("Meeting Confirmation"));
        assert_eq!(msg.header("FROM"), Some("Alice <alice@example.com>"));
    }

    #[test]
    fn extracts_plain_text_body() {
        let msg = plain_message("see you at 2pm");
        assert_eq!(msg.extract_text(), "see you at 2pm");
    }

    #[test]
    fn extracts_multipart_alternative_preferring_all_text() {
        let json = serde_json::json!({
            "id": "m2",
            "payload": {
                "mimeType": "multipart/alternative",
                "parts": [
                    {"mimeType": "text/plain", "body": {"data": encode("plain part")}},
                    {"mimeType": "text/html", "body": {"data": encode("<p>html&nbsp;part</p>")}}
                ]
            }
        });
        let msg: ThreadMessage = serde_json::from_value(json).expect("message");
        assert_eq!(msg.extract_text(), "plain part\n\nhtml part");
    }

    #[test]
    fn html_stripping_drops_script_and_tags() {
        let html = "<div>Meet <b>tomorrow</b></div><script>alert(1)</script><p>at 5pm</p>";
        let text = strip_html(html);
        assert!(text.contains("Meet tomorrow"));
        assert!(text.contains("at 5pm"));
        assert!(!text.contains("alert"));
    }

    #[test]
    fn empty_payload_extracts_empty_text() {
        let msg: ThreadMessage =
            serde_json::from_value(serde_json::json!({"id": "m3"})).expect("message");
        assert_eq!(msg.extract_text(), "");
    }

    #[test]
    fn internal_date_parses_millis() {
        let msg = plain_message("x");
        assert_eq!(msg.internal_date_millis(), Some(1762300000000));
    }

    #[test]
    fn clean_email_address_handles_display_names() {
        assert_eq!(
            clean_email_address("Peter <someone@gmail.com>").as_deref(),
            Some("someone@gmail.com")
        );
        assert_eq!(
            clean_email_address("  bob.smith+x@corp.example.org ").as_deref(),
            Some("bob.smith+x@corp.example.org")
        );
        assert_eq!(clean_email_address("not an address"), None);
        assert_eq!(clean_email_address(""), None);
    }
}
