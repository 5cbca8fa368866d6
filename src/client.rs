//! Mailbox boundary and the Gmail implementation behind it

use async_trait::async_trait;
use chrono::{DateTime, Days, Utc};
use futures::stream::{self, StreamExt};
use google_gmail1::api::{Label, Message as GmailMessage, MessagePart, ModifyMessageRequest};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::auth::GmailHub;
use crate::error::{LabellerError, Result};
use crate::models::{Message, MessageBody, UnreadFilter};

const SCOPE_MODIFY: &str = "https://www.googleapis.com/auth/gmail.modify";
const SCOPE_LABELS: &str = "https://www.googleapis.com/auth/gmail.labels";
const API_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    System,
    User,
}

/// Label info returned from the mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelInfo {
    pub id: String,
    pub name: String,
    pub kind: LabelKind,
}

impl LabelInfo {
    pub fn is_user(&self) -> bool {
        self.kind == LabelKind::User
    }
}

/// Mailbox operations the pipeline depends on
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Unread messages matching the filter, newest first, at most `max_count`
    async fn list_unread(&self, filter: &UnreadFilter) -> Result<Vec<Message>>;

    /// All labels in the account, system and user
    async fn list_labels(&self) -> Result<Vec<LabelInfo>>;

    /// Create a label and return its id
    async fn create_label(&self, name: &str) -> Result<String>;

    /// Add the given labels to a message in one call
    async fn apply_labels(&self, message_id: &str, label_ids: &[String]) -> Result<()>;
}

/// Gmail search query for unread mail inside the filter's date window.
/// `date_to` is inclusive, so `before:` is set to the following day.
pub fn build_unread_query(filter: &UnreadFilter) -> String {
    let mut query = String::from("is:unread");
    if let Some(from) = filter.date_from {
        query.push_str(&format!(" after:{}", from.format("%Y/%m/%d")));
    }
    if let Some(to) = filter.date_to {
        let before = to.checked_add_days(Days::new(1)).unwrap_or(to);
        query.push_str(&format!(" before:{}", before.format("%Y/%m/%d")));
    }
    query
}

/// Gmail client with a concurrency cap, per-call timeouts and retry of
/// transient failures
pub struct ProductionGmailClient {
    hub: GmailHub,
    rate_limiter: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ProductionGmailClient {
    pub fn new(hub: GmailHub, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            hub,
            rate_limiter: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Check if an error is retryable
    fn should_retry(error: &LabellerError) -> bool {
        matches!(
            error,
            LabellerError::ServerError { .. }
                | LabellerError::RateLimitExceeded { .. }
                | LabellerError::NetworkError(_)
        )
    }

    /// Execute an async operation with exponential backoff retry
    async fn with_retry<T, F, Fut>(operation_name: &str, max_retries: u32, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_secs(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if Self::should_retry(&e) && attempts <= max_retries => {
                    if let LabellerError::RateLimitExceeded { retry_after } = &e {
                        delay = delay.max(Duration::from_secs(*retry_after));
                    }
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name,
                        attempts,
                        max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bound a Gmail call so a stalled connection surfaces as a network error
    async fn with_timeout<T, Fut>(operation_name: &str, call: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, google_gmail1::Error>>,
    {
        match tokio::time::timeout(API_TIMEOUT, call).await {
            Ok(result) => result.map_err(LabellerError::from),
            Err(_) => {
                warn!("Gmail API {} call timed out after {:?}", operation_name, API_TIMEOUT);
                Err(LabellerError::NetworkError(format!(
                    "API call timed out after {:?}",
                    API_TIMEOUT
                )))
            }
        }
    }

    async fn list_unread_ids(&self, filter: &UnreadFilter) -> Result<Vec<String>> {
        let query = build_unread_query(filter);
        debug!("Listing unread messages with query '{}'", query);

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while ids.len() < filter.max_count {
            let page_size = (filter.max_count - ids.len()).min(MAX_PAGE_SIZE) as u32;
            let token = page_token.clone();
            let (_, response) = Self::with_retry("list_messages", 3, || {
                let mut call = self
                    .hub
                    .users()
                    .messages_list("me")
                    .q(&query)
                    .max_results(page_size);
                for label_id in &filter.label_ids {
                    call = call.add_label_ids(label_id);
                }
                if let Some(token) = token.as_ref() {
                    call = call.page_token(token);
                }
                Self::with_timeout("list_messages", call.add_scope(SCOPE_MODIFY).doit())
            })
            .await?;

            ids.extend(
                response
                    .messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| m.id),
            );

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        ids.truncate(filter.max_count);
        Ok(ids)
    }

    async fn fetch_message(&self, id: &str) -> Result<Message> {
        let _permit = self.rate_limiter.acquire().await.map_err(|e| {
            LabellerError::ApiError(format!("Failed to acquire rate limit permit: {}", e))
        })?;

        let (_, message) = Self::with_retry("get_message", 3, || {
            Self::with_timeout(
                "get_message",
                self.hub
                    .users()
                    .messages_get("me", id)
                    .format("full")
                    .add_scope(SCOPE_MODIFY)
                    .doit(),
            )
        })
        .await?;

        parse_message(message)
    }
}

/// Convert a Gmail API message (format=full) into a pipeline Message
fn parse_message(msg: GmailMessage) -> Result<Message> {
    let id = msg
        .id
        .ok_or_else(|| LabellerError::ApiError("Missing message ID".to_string()))?;

    let headers = msg
        .payload
        .as_ref()
        .and_then(|p| p.headers.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    let header = |wanted: &str| {
        headers
            .iter()
            .find(|h| h.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(wanted)))
            .and_then(|h| h.value.clone())
            .unwrap_or_default()
    };

    let timestamp = msg
        .internal_date
        .and_then(DateTime::from_timestamp_millis)
        .or_else(|| parse_date(&header("Date")).ok())
        .unwrap_or_else(Utc::now);

    Ok(Message {
        sender: header("From"),
        subject: header("Subject"),
        timestamp,
        body: msg.payload.as_ref().and_then(extract_body),
        snippet: msg.snippet.unwrap_or_default(),
        id,
    })
}

/// Prefer text/plain, then text/html, then whatever the top-level body holds
fn extract_body(payload: &MessagePart) -> Option<MessageBody> {
    if let Some(text) = find_part(payload, "text/plain").and_then(part_text) {
        return Some(MessageBody::Plain(text));
    }
    if let Some(html) = find_part(payload, "text/html").and_then(part_text) {
        return Some(MessageBody::Html(html));
    }
    part_text(payload).map(|text| {
        if payload.mime_type.as_deref() == Some("text/html") {
            MessageBody::Html(text)
        } else {
            MessageBody::Plain(text)
        }
    })
}

fn find_part<'a>(part: &'a MessagePart, mime_type: &str) -> Option<&'a MessagePart> {
    if part.mime_type.as_deref() == Some(mime_type) && part_text(part).is_some() {
        return Some(part);
    }
    part.parts
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find_map(|child| find_part(child, mime_type))
}

fn part_text(part: &MessagePart) -> Option<String> {
    part.body
        .as_ref()
        .and_then(|b| b.data.as_ref())
        .map(|data| String::from_utf8_lossy(data).into_owned())
        .filter(|text| !text.trim().is_empty())
}

/// Parse RFC 2822 date string
fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc3339(date_str).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| LabellerError::ApiError(format!("Invalid date format: {}", e)))
}

#[async_trait]
impl MailboxClient for ProductionGmailClient {
    async fn list_unread(&self, filter: &UnreadFilter) -> Result<Vec<Message>> {
        let ids = self.list_unread_ids(filter).await?;
        info!("Found {} unread messages", ids.len());

        let messages: Vec<Message> = stream::iter(ids)
            .map(|id| async move {
                match self.fetch_message(&id).await {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("Skipping message {}: {}", id, e);
                        None
                    }
                }
            })
            .buffered(self.max_concurrent)
            .filter_map(|message| async move { message })
            .collect()
            .await;

        Ok(messages)
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        let (_, response) = Self::with_retry("list_labels", 3, || {
            Self::with_timeout(
                "list_labels",
                self.hub
                    .users()
                    .labels_list("me")
                    .add_scope(SCOPE_LABELS)
                    .doit(),
            )
        })
        .await?;

        let labels: Vec<LabelInfo> = response
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter_map(|label| match (label.id, label.name) {
                (Some(id), Some(name)) => Some(LabelInfo {
                    id,
                    name,
                    kind: if label.type_.as_deref() == Some("system") {
                        LabelKind::System
                    } else {
                        LabelKind::User
                    },
                }),
                _ => None,
            })
            .collect();

        debug!("Successfully parsed {} labels", labels.len());
        Ok(labels)
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        Self::with_retry("create_label", 3, || {
            let label = Label {
                name: Some(name.to_string()),
                message_list_visibility: Some("show".to_string()),
                label_list_visibility: Some("labelShow".to_string()),
                ..Default::default()
            };
            async move {
                let (_, created) = Self::with_timeout(
                    "create_label",
                    self.hub
                        .users()
                        .labels_create(label, "me")
                        .add_scope(SCOPE_LABELS)
                        .doit(),
                )
                .await?;
                created
                    .id
                    .ok_or_else(|| LabellerError::ApiError("Created label has no ID".to_string()))
            }
        })
        .await
    }

    async fn apply_labels(&self, message_id: &str, label_ids: &[String]) -> Result<()> {
        if label_ids.is_empty() {
            return Ok(());
        }

        Self::with_retry("apply_labels", 3, || {
            let request = ModifyMessageRequest {
                add_label_ids: Some(label_ids.to_vec()),
                remove_label_ids: None,
            };
            Self::with_timeout(
                "apply_labels",
                self.hub
                    .users()
                    .messages_modify(request, "me", message_id)
                    .add_scope(SCOPE_MODIFY)
                    .doit(),
            )
        })
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use google_gmail1::api::{MessagePartBody, MessagePartHeader};

    fn part(mime: &str, data: Option<&str>, parts: Option<Vec<MessagePart>>) -> MessagePart {
        MessagePart {
            mime_type: Some(mime.to_string()),
            body: data.map(|d| MessagePartBody {
                data: Some(d.as_bytes().to_vec()),
                ..Default::default()
            }),
            parts,
            ..Default::default()
        }
    }

    fn header(name: &str, value: &str) -> MessagePartHeader {
        MessagePartHeader {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    #[test]
    fn test_should_retry_transient_errors() {
        assert!(ProductionGmailClient::should_retry(&LabellerError::ServerError {
            status: 500,
            message: "Internal error".to_string(),
        }));
        assert!(ProductionGmailClient::should_retry(
            &LabellerError::RateLimitExceeded { retry_after: 5 }
        ));
        assert!(ProductionGmailClient::should_retry(
            &LabellerError::NetworkError("connection reset".to_string())
        ));
    }

    #[test]
    fn test_should_not_retry_permanent_errors() {
        assert!(!ProductionGmailClient::should_retry(&LabellerError::AuthError(
            "invalid token".to_string()
        )));
        assert!(!ProductionGmailClient::should_retry(&LabellerError::BadRequest(
            "bad label".to_string()
        )));
    }

    #[test]
    fn test_build_unread_query() {
        let mut filter = UnreadFilter {
            max_count: 15,
            date_from: NaiveDate::from_ymd_opt(2024, 3, 1),
            date_to: None,
            label_ids: vec!["UNREAD".to_string()],
        };
        assert_eq!(build_unread_query(&filter), "is:unread after:2024/03/01");

        filter.date_to = NaiveDate::from_ymd_opt(2024, 3, 31);
        assert_eq!(
            build_unread_query(&filter),
            "is:unread after:2024/03/01 before:2024/04/01"
        );
    }

    #[test]
    fn test_extract_body_prefers_plain_text() {
        let payload = part(
            "multipart/alternative",
            None,
            Some(vec![
                part("text/html", Some("<p>Hello</p>"), None),
                part("text/plain", Some("Hello"), None),
            ]),
        );
        assert_eq!(
            extract_body(&payload),
            Some(MessageBody::Plain("Hello".to_string()))
        );
    }

    #[test]
    fn test_extract_body_falls_back_to_nested_html() {
        let payload = part(
            "multipart/mixed",
            None,
            Some(vec![part(
                "multipart/alternative",
                None,
                Some(vec![part("text/html", Some("<b>Due</b>"), None)]),
            )]),
        );
        assert_eq!(
            extract_body(&payload),
            Some(MessageBody::Html("<b>Due</b>".to_string()))
        );
    }

    #[test]
    fn test_extract_body_top_level_html() {
        let payload = part("text/html", Some("<p>Hi</p>"), None);
        assert_eq!(
            extract_body(&payload),
            Some(MessageBody::Html("<p>Hi</p>".to_string()))
        );
        assert_eq!(extract_body(&part("text/plain", Some("   "), None)), None);
    }

    #[test]
    fn test_parse_message_uses_internal_date_and_headers() {
        let mut payload = part("text/plain", Some("Your bill is due"), None);
        payload.headers = Some(vec![
            header("From", "Power Co <billing@power.example>"),
            header("subject", "March bill"),
        ]);
        let msg = GmailMessage {
            id: Some("18c1".to_string()),
            snippet: Some("Your bill is due".to_string()),
            internal_date: Some(1_709_640_000_000),
            payload: Some(payload),
            ..Default::default()
        };

        let message = parse_message(msg).unwrap();
        assert_eq!(message.id, "18c1");
        assert_eq!(message.sender, "Power Co <billing@power.example>");
        assert_eq!(message.subject, "March bill");
        assert_eq!(message.timestamp.timestamp_millis(), 1_709_640_000_000);
        assert_eq!(
            message.body,
            Some(MessageBody::Plain("Your bill is due".to_string()))
        );
    }

    #[test]
    fn test_parse_message_requires_id() {
        assert!(parse_message(GmailMessage::default()).is_err());
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("Tue, 5 Mar 2024 10:00:00 +0000").is_ok());
        assert!(parse_date("2024-03-05T10:00:00Z").is_ok());
        assert!(parse_date("yesterday").is_err());
    }
}
