//! Mailbox provider boundary: message listing, MIME payload decoding, and
//! the Gmail REST client.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "jobpath-mailbox";

/// Provider key stored on ledger rows and sync-state rows.
pub const PROVIDER_GMAIL: &str = "GMAIL";

const GMAIL_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Mailbox query grammar: a day-bounded recency filter or the entire inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailQuery {
    RecentDays(u32),
    FullInbox,
}

impl MailQuery {
    pub fn render(&self) -> String {
        match self {
            MailQuery::RecentDays(days) => format!("newer_than:{days}d"),
            MailQuery::FullInbox => "in:inbox".to_string(),
        }
    }
}

/// One page of message identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Recursive MIME payload node: a mime type, optional base64url body data,
/// and ordered child parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePart {
    pub mime_type: String,
    pub body_data: Option<String>,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

/// Full detail of one fetched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDetail {
    pub id: String,
    pub headers: Vec<MessageHeader>,
    pub snippet: String,
    pub internal_date: DateTime<Utc>,
    pub payload: Option<MessagePart>,
}

impl MessageDetail {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn subject(&self) -> &str {
        self.header("Subject").unwrap_or("")
    }

    pub fn from_address(&self) -> &str {
        self.header("From").unwrap_or("")
    }

    /// Concatenated decoded text of every text/plain and text/html leaf.
    /// Decode failures degrade to an empty contribution; headers and the
    /// snippet remain usable either way.
    pub fn body_text(&self) -> String {
        self.payload
            .as_ref()
            .map(extract_payload_text)
            .unwrap_or_default()
    }
}

/// Decodes Gmail's base64url body encoding, tolerating padded input.
/// Returns `None` when the data is not valid base64url or UTF-8.
pub fn decode_base64url(input: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(input.trim_end_matches('=')).ok()?;
    String::from_utf8(bytes).ok()
}

/// Walks the payload tree collecting decoded text leaves. Nodes without a
/// mime type are treated as text; non-text leaves and undecodable data are
/// skipped rather than failing the walk.
pub fn extract_payload_text(root: &MessagePart) -> String {
    let mut chunks = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        let mime = node.mime_type.to_ascii_lowercase();
        if let Some(data) = &node.body_data {
            if mime.is_empty() || mime.starts_with("text/plain") || mime.starts_with("text/html") {
                if let Some(text) = decode_base64url(data) {
                    chunks.push(text);
                } else {
                    debug!(mime_type = %node.mime_type, "skipping undecodable body part");
                }
            }
        }
        // Reverse keeps sibling order after the stack pop.
        stack.extend(node.parts.iter().rev());
    }
    chunks.join(" ")
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox access token is missing or expired")]
    Unauthorized,
    #[error("mailbox token lacks the scope required to read messages")]
    InsufficientScope,
    #[error("mailbox request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("mailbox responded with status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Pull-based mailbox provider. One implementation per mail backend; the
/// sync engine only sees this trait.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn list_messages(
        &self,
        query: &MailQuery,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<MessagePage, MailboxError>;

    async fn get_message(&self, id: &str) -> Result<MessageDetail, MailboxError>;
}

// Gmail REST wire shapes.

#[derive(Debug, Deserialize)]
struct RawListResponse {
    #[serde(default)]
    messages: Vec<RawListedMessage>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawListedMessage {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: String,
    #[serde(default)]
    snippet: String,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    payload: Option<RawPart>,
}

#[derive(Debug, Deserialize)]
struct RawPart {
    #[serde(rename = "mimeType", default)]
    mime_type: Option<String>,
    #[serde(default)]
    headers: Vec<RawHeader>,
    body: Option<RawBody>,
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct RawBody {
    data: Option<String>,
}

fn raw_part_to_tree(raw: RawPart) -> MessagePart {
    MessagePart {
        mime_type: raw.mime_type.unwrap_or_default(),
        body_data: raw.body.and_then(|b| b.data),
        parts: raw.parts.into_iter().map(raw_part_to_tree).collect(),
    }
}

fn raw_message_to_detail(raw: RawMessage) -> MessageDetail {
    let headers = raw
        .payload
        .as_ref()
        .map(|p| {
            p.headers
                .iter()
                .map(|h| MessageHeader {
                    name: h.name.clone(),
                    value: h.value.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    let internal_date = raw
        .internal_date
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    MessageDetail {
        id: raw.id,
        headers,
        snippet: raw.snippet,
        internal_date,
        payload: raw.payload.map(raw_part_to_tree),
    }
}

/// Gmail REST client scoped to one access token.
#[derive(Debug)]
pub struct GmailMailbox {
    client: reqwest::Client,
    access_token: String,
    base_url: String,
}

impl GmailMailbox {
    pub fn new(access_token: impl Into<String>) -> Result<Self, MailboxError> {
        Self::with_base_url(access_token, GMAIL_BASE_URL)
    }

    pub fn with_base_url(
        access_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, MailboxError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            access_token: access_token.into(),
            base_url: base_url.into(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        params: &[(&str, String)],
    ) -> Result<T, MailboxError> {
        let resp = self
            .client
            .get(&url)
            .query(params)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(MailboxError::Unauthorized);
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(MailboxError::InsufficientScope);
        }
        if !status.is_success() {
            return Err(MailboxError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl MailboxProvider for GmailMailbox {
    fn provider_id(&self) -> &'static str {
        PROVIDER_GMAIL
    }

    async fn list_messages(
        &self,
        query: &MailQuery,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<MessagePage, MailboxError> {
        let url = format!("{}/users/me/messages", self.base_url);
        let mut params = vec![
            ("maxResults", page_size.to_string()),
            ("q", query.render()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let raw: RawListResponse = self.get_json(url, &params).await?;
        Ok(MessagePage {
            ids: raw.messages.into_iter().filter_map(|m| m.id).collect(),
            next_page_token: raw.next_page_token,
        })
    }

    async fn get_message(&self, id: &str) -> Result<MessageDetail, MailboxError> {
        let url = format!("{}/users/me/messages/{id}", self.base_url);
        let params = [("format", "full".to_string())];
        let raw: RawMessage = self.get_json(url, &params).await?;
        Ok(raw_message_to_detail(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(text: &str) -> String {
        URL_SAFE_NO_PAD.encode(text)
    }

    fn leaf(mime: &str, text: &str) -> MessagePart {
        MessagePart {
            mime_type: mime.to_string(),
            body_data: Some(b64(text)),
            parts: Vec::new(),
        }
    }

    #[test]
    fn query_grammar_renders_recency_and_full_inbox() {
        assert_eq!(MailQuery::RecentDays(30).render(), "newer_than:30d");
        assert_eq!(MailQuery::FullInbox.render(), "in:inbox");
    }

    #[test]
    fn payload_walk_collects_text_leaves_in_order() {
        let root = MessagePart {
            mime_type: "multipart/alternative".to_string(),
            body_data: None,
            parts: vec![
                leaf("text/plain", "hello"),
                MessagePart {
                    mime_type: "multipart/related".to_string(),
                    body_data: None,
                    parts: vec![leaf("text/html", "<p>world</p>")],
                },
                leaf("image/png", "not-text"),
            ],
        };
        assert_eq!(extract_payload_text(&root), "hello <p>world</p>");
    }

    #[test]
    fn payload_walk_skips_undecodable_leaves() {
        let root = MessagePart {
            mime_type: "multipart/mixed".to_string(),
            body_data: None,
            parts: vec![
                MessagePart {
                    mime_type: "text/plain".to_string(),
                    body_data: Some("!!! not base64 !!!".to_string()),
                    parts: Vec::new(),
                },
                leaf("text/plain", "still here"),
            ],
        };
        assert_eq!(extract_payload_text(&root), "still here");
    }

    #[test]
    fn base64url_decoding_tolerates_padding() {
        let padded = format!("{}==", URL_SAFE_NO_PAD.encode("pad me"));
        assert_eq!(decode_base64url(&padded).as_deref(), Some("pad me"));
        assert_eq!(decode_base64url("####"), None);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let detail = MessageDetail {
            id: "m1".to_string(),
            headers: vec![
                MessageHeader {
                    name: "Subject".to_string(),
                    value: "Interview invitation".to_string(),
                },
                MessageHeader {
                    name: "FROM".to_string(),
                    value: "Acme Recruiting <careers@acme.com>".to_string(),
                },
            ],
            snippet: String::new(),
            internal_date: Utc::now(),
            payload: None,
        };
        assert_eq!(detail.subject(), "Interview invitation");
        assert_eq!(detail.from_address(), "Acme Recruiting <careers@acme.com>");
        assert_eq!(detail.header("x-missing"), None);
    }

    #[test]
    fn raw_message_mapping_handles_missing_fields() {
        let raw: RawMessage = serde_json::from_str(
            r#"{
                "id": "abc",
                "snippet": "snippet text",
                "internalDate": "1700000000000",
                "payload": {
                    "mimeType": "text/plain",
                    "headers": [{"name": "Subject", "value": "Hi"}],
                    "body": {"data": null}
                }
            }"#,
        )
        .expect("raw message parses");
        let detail = raw_message_to_detail(raw);
        assert_eq!(detail.id, "abc");
        assert_eq!(detail.subject(), "Hi");
        assert_eq!(detail.internal_date.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(detail.body_text(), "");
    }
}
