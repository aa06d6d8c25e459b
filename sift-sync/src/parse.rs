//! Parsing of `format=full` message payloads into plaintext emails.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Nested multipart payloads deeper than this are not worth walking.
const MAX_PART_DEPTH: usize = 10;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Option<String>,
    pub thread_id: Option<String>,
    pub history_id: Option<String>,
    pub internal_date: Option<String>,
    pub payload: Option<MessagePart>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub mime_type: Option<String>,
    pub headers: Option<Vec<Header>>,
    pub body: Option<PartBody>,
    pub parts: Option<Vec<MessagePart>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PartBody {
    pub data: Option<String>,
}

/// A message reduced to the fields the pipeline stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEmail {
    pub provider_message_id: String,
    pub thread_id: Option<String>,
    pub history_id: Option<String>,
    pub received_at: String,
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    pub body_text: String,
}

/// Case-insensitive header lookup, empty when absent.
pub fn header_value(headers: &[Header], name: &str) -> String {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
        .unwrap_or_default()
}

fn decode_body(data: &str) -> String {
    let bytes = URL_SAFE
        .decode(data)
        .or_else(|_| URL_SAFE_NO_PAD.decode(data))
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

pub fn strip_html(html: &str) -> String {
    TAGS.replace_all(html, "").trim().to_owned()
}

/// Extract a plaintext body from a payload tree.
/// Priority: text/plain, then stripped text/html, then "". Recurses into
/// multipart children up to `MAX_PART_DEPTH`.
pub fn extract_plain_text(payload: &MessagePart, depth: usize) -> String {
    if depth > MAX_PART_DEPTH {
        return String::new();
    }

    if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_deref()) {
        if payload.mime_type.as_deref() == Some("text/plain") {
            return decode_body(data);
        }
    }

    let mut plain_text: Option<String> = None;
    let mut html_text: Option<String> = None;

    for part in payload.parts.as_deref().unwrap_or_default() {
        let data = part.body.as_ref().and_then(|b| b.data.as_deref());

        match (part.mime_type.as_deref(), data) {
            (Some("text/plain"), Some(data)) => plain_text = Some(decode_body(data)),
            (Some("text/html"), Some(data)) => html_text = Some(strip_html(&decode_body(data))),
            _ => {}
        }

        if part.parts.is_some() {
            let nested = extract_plain_text(part, depth + 1);
            if !nested.is_empty() && plain_text.is_none() {
                plain_text = Some(nested);
            }
        }
    }

    plain_text
        .or(html_text)
        .unwrap_or_default()
}

/// Reduce a full message to the normalized shape the fetcher stages.
/// Never fails: missing pieces come through as empty strings.
pub fn parse_message(message: &Message, fallback_id: &str) -> ParsedEmail {
    let payload = message.payload.clone().unwrap_or_default();
    let headers = payload.headers.clone().unwrap_or_default();

    ParsedEmail {
        provider_message_id: message
            .id
            .clone()
            .unwrap_or_else(|| fallback_id.to_owned()),
        thread_id: message.thread_id.clone(),
        history_id: message.history_id.clone(),
        received_at: message.internal_date.clone().unwrap_or_default(),
        subject: header_value(&headers, "Subject"),
        sender: header_value(&headers, "From"),
        recipient: header_value(&headers, "To"),
        body_text: extract_plain_text(&payload, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(text: &str) -> String {
        URL_SAFE.encode(text.as_bytes())
    }

    fn plain_part(text: &str) -> MessagePart {
        MessagePart {
            mime_type: Some("text/plain".to_owned()),
            headers: None,
            body: Some(PartBody { data: Some(b64(text)) }),
            parts: None,
        }
    }

    fn html_part(html: &str) -> MessagePart {
        MessagePart {
            mime_type: Some("text/html".to_owned()),
            headers: None,
            body: Some(PartBody { data: Some(b64(html)) }),
            parts: None,
        }
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let headers = vec![
            Header { name: "Subject".to_owned(), value: "Hi".to_owned() },
            Header { name: "FROM".to_owned(), value: "a@b.co".to_owned() },
        ];
        assert_eq!(header_value(&headers, "subject"), "Hi");
        assert_eq!(header_value(&headers, "From"), "a@b.co");
        assert_eq!(header_value(&headers, "To"), "");
    }

    #[test]
    fn test_simple_plain_body() {
        let payload = plain_part("hello there");
        assert_eq!(extract_plain_text(&payload, 0), "hello there");
    }

    #[test]
    fn test_prefers_plain_over_html() {
        let payload = MessagePart {
            mime_type: Some("multipart/alternative".to_owned()),
            headers: None,
            body: None,
            parts: Some(vec![html_part("<p>rich</p>"), plain_part("plain")]),
        };
        assert_eq!(extract_plain_text(&payload, 0), "plain");
    }

    #[test]
    fn test_falls_back_to_stripped_html() {
        let payload = MessagePart {
            mime_type: Some("multipart/alternative".to_owned()),
            headers: None,
            body: None,
            parts: Some(vec![html_part("<p>Application <b>received</b></p>")]),
        };
        assert_eq!(extract_plain_text(&payload, 0), "Application received");
    }

    #[test]
    fn test_recurses_into_nested_parts() {
        let nested = MessagePart {
            mime_type: Some("multipart/mixed".to_owned()),
            headers: None,
            body: None,
            parts: Some(vec![plain_part("deep body")]),
        };
        let payload = MessagePart {
            mime_type: Some("multipart/related".to_owned()),
            headers: None,
            body: None,
            parts: Some(vec![nested]),
        };
        assert_eq!(extract_plain_text(&payload, 0), "deep body");
    }

    #[test]
    fn test_depth_cap_returns_empty() {
        // Build a chain one deeper than the cap.
        let mut part = plain_part("too deep");
        for _ in 0..(MAX_PART_DEPTH + 2) {
            part = MessagePart {
                mime_type: Some("multipart/mixed".to_owned()),
                headers: None,
                body: None,
                parts: Some(vec![part]),
            };
        }
        assert_eq!(extract_plain_text(&part, 0), "");
    }

    #[test]
    fn test_parse_message_with_missing_pieces() {
        let message = Message {
            id: None,
            thread_id: None,
            history_id: None,
            internal_date: None,
            payload: None,
        };
        let parsed = parse_message(&message, "fallback-1");
        assert_eq!(parsed.provider_message_id, "fallback-1");
        assert_eq!(parsed.subject, "");
        assert_eq!(parsed.body_text, "");
    }

    #[test]
    fn test_parse_message_full() {
        let message = Message {
            id: Some("m-9".to_owned()),
            thread_id: Some("t-1".to_owned()),
            history_id: Some("h-1".to_owned()),
            internal_date: Some("1706745600000".to_owned()),
            payload: Some(MessagePart {
                mime_type: Some("multipart/alternative".to_owned()),
                headers: Some(vec![
                    Header { name: "Subject".to_owned(), value: "Application received".to_owned() },
                    Header { name: "From".to_owned(), value: "jobs@initech.example".to_owned() },
                    Header { name: "To".to_owned(), value: "me@example.com".to_owned() },
                ]),
                body: None,
                parts: Some(vec![plain_part("We received your application.")]),
            }),
        };

        let parsed = parse_message(&message, "ignored");
        assert_eq!(parsed.provider_message_id, "m-9");
        assert_eq!(parsed.received_at, "1706745600000");
        assert_eq!(parsed.subject, "Application received");
        assert_eq!(parsed.sender, "jobs@initech.example");
        assert_eq!(parsed.recipient, "me@example.com");
        assert_eq!(parsed.body_text, "We received your application.");
    }
}
