//! Mail provider client: token exchange, message id listing, and the
//! multipart batch get.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::GmailError;
use crate::parse::Message;

const LIST_PAGE_SIZE: u32 = 500;
const MESSAGE_FIELDS: &str = "id,threadId,historyId,internalDate,payload";

/// Outcome of one batched get, with each sub-response paired back to its
/// message id through the request's Content-ID.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub successful: Vec<(String, Message)>,
    pub retry: Vec<String>,
    pub skipped: Vec<String>,
}

/// What to do with one failed sub-response.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SubResponseDecision {
    Skip,
    Retry,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    messages: Option<Vec<MessageRef>>,
    next_page_token: Option<String>,
}

pub struct GmailClient {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    api_base: String,
}

impl GmailClient {
    pub fn new(
        client_id: String,
        client_secret: String,
        token_url: String,
        api_base: String,
        request_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("mailsift sync worker")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for gmail");

        Self {
            client,
            client_id,
            client_secret,
            token_url,
            api_base,
        }
    }

    /// Exchange the stored refresh credential for a short-lived access token.
    pub async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<String, GmailError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self.client.post(&self.token_url).form(&params).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(GmailError::TokenExchangeError { status });
        }

        let token: TokenResponse = response.json().await?;
        token
            .access_token
            .ok_or(GmailError::MissingAccessTokenError)
    }

    /// List candidate message ids newer than `after_unix`, paginating until
    /// the provider stops returning a page token.
    pub async fn list_message_ids(
        &self,
        access_token: &str,
        after_unix: i64,
        trace_id: &str,
    ) -> Result<Vec<String>, GmailError> {
        let url = format!("{}/gmail/v1/users/me/messages", self.api_base);
        let query = format!("after:{}", after_unix);

        let mut all_ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(access_token)
                .query(&[("q", query.as_str())])
                .query(&[("maxResults", LIST_PAGE_SIZE)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(GmailError::ListError { status });
            }

            let page: ListResponse = response.json().await?;
            if let Some(messages) = page.messages {
                all_ids.extend(messages.into_iter().map(|m| m.id));
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        info!(trace_id, count = all_ids.len(), "listed candidate message ids");
        Ok(all_ids)
    }

    /// Issue one multipart/mixed batch request for all message ids. Outcomes
    /// are paired back deterministically through the Content-ID headers.
    pub async fn batch_get(
        &self,
        access_token: &str,
        message_ids: &[String],
        trace_id: &str,
    ) -> Result<BatchOutcome, GmailError> {
        if message_ids.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let boundary = format!("batch_{}", Uuid::new_v4().simple());
        let body = build_batch_body(&boundary, message_ids);

        info!(trace_id, requests = message_ids.len(), "executing batch get");
        let response = self
            .client
            .post(format!("{}/batch/gmail/v1", self.api_base))
            .bearer_auth(access_token)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/mixed; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        let response_boundary = boundary_from_content_type(response.headers())
            .ok_or_else(|| GmailError::BatchDecodeError("missing response boundary".to_owned()))?;
        let payload = response.text().await?;

        let outcome = parse_batch_response(&response_boundary, &payload, trace_id)?;
        info!(
            trace_id,
            success = outcome.successful.len(),
            retry = outcome.retry.len(),
            skip = outcome.skipped.len(),
            "batch get results"
        );
        Ok(outcome)
    }
}

fn build_batch_body(boundary: &str, message_ids: &[String]) -> String {
    let mut body = String::new();
    for id in message_ids {
        body.push_str(&format!("--{}\r\n", boundary));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str(&format!("Content-ID: <item:{}>\r\n\r\n", id));
        body.push_str(&format!(
            "GET /gmail/v1/users/me/messages/{}?format=full&fields={}\r\n\r\n",
            id, MESSAGE_FIELDS
        ));
    }
    body.push_str(&format!("--{}--\r\n", boundary));
    body
}

fn boundary_from_content_type(headers: &header::HeaderMap) -> Option<String> {
    let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let marker = "boundary=";
    let start = content_type.find(marker)? + marker.len();
    let rest = &content_type[start..];
    let end = rest.find(';').unwrap_or(rest.len());
    Some(rest[..end].trim_matches('"').to_owned())
}

static CONTENT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^Content-ID:\s*<(?:response-)?item:([^>\s]+)>").unwrap());
static INNER_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^HTTP/[\d.]+\s+(\d{3})").unwrap());

/// Map a failed sub-response to SKIP or RETRY.
/// - 404/410/not-found: the message disappeared, skip it.
/// - 429/rate-limit/5xx: transient, retry it.
/// - anything else: skip with a warning.
pub fn classify_sub_error(status: u16, body: &str) -> SubResponseDecision {
    let lowered = body.to_ascii_lowercase();
    if status == 404 || status == 410 || lowered.contains("notfound") {
        return SubResponseDecision::Skip;
    }
    if status == 429 || (500..600).contains(&status) || lowered.contains("ratelimitexceeded") {
        return SubResponseDecision::Retry;
    }
    SubResponseDecision::Skip
}

/// Parse a multipart/mixed batch response into per-message outcomes.
pub fn parse_batch_response(
    boundary: &str,
    payload: &str,
    trace_id: &str,
) -> Result<BatchOutcome, GmailError> {
    let mut outcome = BatchOutcome::default();
    let delimiter = format!("--{}", boundary);

    for part in payload.split(delimiter.as_str()).skip(1) {
        let part = part.trim_start_matches(['\r', '\n']);
        if part.is_empty() || part.starts_with("--") {
            continue;
        }

        let Some(message_id) = CONTENT_ID
            .captures(part)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_owned())
        else {
            warn!(trace_id, "batch part without a content id, dropping");
            continue;
        };

        let Some(status) = INNER_STATUS
            .captures(part)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
        else {
            return Err(GmailError::BatchDecodeError(format!(
                "no inner status line for message {}",
                message_id
            )));
        };

        let json_body = part
            .find('{')
            .map(|start| part[start..].trim())
            .unwrap_or("");

        if (200..300).contains(&status) {
            match serde_json::from_str::<Message>(json_body) {
                Ok(message) => outcome.successful.push((message_id, message)),
                Err(error) => {
                    warn!(trace_id, message_id, "unparseable sub-response, skipping: {}", error);
                    outcome.skipped.push(message_id);
                }
            }
            continue;
        }

        match classify_sub_error(status, json_body) {
            SubResponseDecision::Retry => outcome.retry.push(message_id),
            SubResponseDecision::Skip => {
                if status != 404 && status != 410 {
                    warn!(trace_id, message_id, status, "non-retryable sub-response, skipping");
                }
                outcome.skipped.push(message_id);
            }
        }
    }

    Ok(outcome)
}

/// Chunk an id list into fetch-sized batches.
pub fn chunk_ids(ids: &[String], size: usize) -> Vec<Vec<String>> {
    if size == 0 {
        return vec![ids.to_vec()];
    }
    ids.chunks(size).map(|chunk| chunk.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sub_error() {
        assert_eq!(classify_sub_error(404, ""), SubResponseDecision::Skip);
        assert_eq!(classify_sub_error(410, ""), SubResponseDecision::Skip);
        assert_eq!(classify_sub_error(403, "notFound"), SubResponseDecision::Skip);
        assert_eq!(classify_sub_error(429, ""), SubResponseDecision::Retry);
        assert_eq!(classify_sub_error(500, ""), SubResponseDecision::Retry);
        assert_eq!(classify_sub_error(503, ""), SubResponseDecision::Retry);
        assert_eq!(
            classify_sub_error(403, "rateLimitExceeded"),
            SubResponseDecision::Retry
        );
        assert_eq!(classify_sub_error(400, "bad request"), SubResponseDecision::Skip);
    }

    #[test]
    fn test_chunk_ids() {
        let ids: Vec<String> = (0..25).map(|i| format!("m{}", i)).collect();
        let chunks = chunk_ids(&ids, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn test_build_batch_body_shape() {
        let body = build_batch_body("batch_x", &["m1".to_owned(), "m2".to_owned()]);
        assert_eq!(body.matches("--batch_x\r\n").count(), 2);
        assert!(body.contains("Content-ID: <item:m1>"));
        assert!(body.contains("GET /gmail/v1/users/me/messages/m2?format=full&fields=id,threadId,historyId,internalDate,payload"));
        assert!(body.ends_with("--batch_x--\r\n"));
    }

    fn batch_part(message_id: &str, status: u16, json: &str) -> String {
        format!(
            "--BOUNDARY\r\nContent-Type: application/http\r\nContent-ID: <response-item:{}>\r\n\r\nHTTP/1.1 {} STATUS\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{}\r\n",
            message_id, status, json
        )
    }

    #[test]
    fn test_parse_batch_response_pairs_outcomes() {
        let payload = format!(
            "{}{}{}--BOUNDARY--\r\n",
            batch_part("m1", 200, r#"{"id": "m1", "internalDate": "1706745600000"}"#),
            batch_part("m2", 404, r#"{"error": {"message": "notFound"}}"#),
            batch_part("m3", 429, r#"{"error": {"message": "rateLimitExceeded"}}"#),
        );

        let outcome = parse_batch_response("BOUNDARY", &payload, "trace-1").unwrap();
        assert_eq!(outcome.successful.len(), 1);
        assert_eq!(outcome.successful[0].0, "m1");
        assert_eq!(outcome.successful[0].1.id.as_deref(), Some("m1"));
        assert_eq!(outcome.skipped, vec!["m2".to_owned()]);
        assert_eq!(outcome.retry, vec!["m3".to_owned()]);
    }

    #[test]
    fn test_parse_batch_response_empty() {
        let outcome = parse_batch_response("BOUNDARY", "--BOUNDARY--\r\n", "trace-1").unwrap();
        assert!(outcome.successful.is_empty());
        assert!(outcome.retry.is_empty());
        assert!(outcome.skipped.is_empty());
    }
}
