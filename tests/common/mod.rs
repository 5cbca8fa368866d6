//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use gmail_labeller::client::{LabelInfo, LabelKind, MailboxClient};
use gmail_labeller::config::{Config, RunContext};
use gmail_labeller::error::{LabellerError, Result};
use gmail_labeller::gateway::{ModelConfig, ModelGateway};
use gmail_labeller::models::{Message, MessageBody, UnreadFilter};
use mockall::mock;

mock! {
    pub Mailbox {}

    #[async_trait]
    impl MailboxClient for Mailbox {
        async fn list_unread(&self, filter: &UnreadFilter) -> Result<Vec<Message>>;
        async fn list_labels(&self) -> Result<Vec<LabelInfo>>;
        async fn create_label(&self, name: &str) -> Result<String>;
        async fn apply_labels(&self, message_id: &str, label_ids: &[String]) -> Result<()>;
    }
}

mock! {
    pub Gateway {}

    #[async_trait]
    impl ModelGateway for Gateway {
        async fn generate(&self, prompt: &str, config: &ModelConfig) -> Result<String>;
    }
}

/// Fixed "today" so date windows are stable
pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
}

/// Snippet-only message received on the given March 2024 day
pub fn create_test_message(id: &str, day: u32, sender: &str, subject: &str, snippet: &str) -> Message {
    Message {
        id: id.to_string(),
        timestamp: Utc.with_ymd_and_hms(2024, 3, day, 8, 30, 0).unwrap(),
        sender: sender.to_string(),
        subject: subject.to_string(),
        body: None,
        snippet: snippet.to_string(),
    }
}

pub fn electricity_bill(id: &str) -> Message {
    create_test_message(
        id,
        4,
        "Power Co <billing@power.example>",
        "Your March electricity bill",
        "Your electricity bill of $84.20 is due March 5",
    )
}

pub fn promotion(id: &str) -> Message {
    create_test_message(
        id,
        6,
        "Deals <offers@shop.example>",
        "50% off everything this weekend",
        "Don't miss our biggest sale of the season",
    )
}

pub fn html_message(id: &str, html: &str) -> Message {
    let mut message = create_test_message(id, 5, "news@paper.example", "Morning brief", "");
    message.body = Some(MessageBody::Html(html.to_string()));
    message
}

pub fn user_label(id: &str, name: &str) -> LabelInfo {
    LabelInfo {
        id: id.to_string(),
        name: name.to_string(),
        kind: LabelKind::User,
    }
}

pub fn system_label(id: &str) -> LabelInfo {
    LabelInfo {
        id: id.to_string(),
        name: id.to_string(),
        kind: LabelKind::System,
    }
}

/// Config with fast retries, adjusted by `configure`
pub fn context(configure: impl FnOnce(&mut Config)) -> RunContext {
    let mut config = Config::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config.cache.enabled = false;
    configure(&mut config);
    RunContext::from_config_on(&config, today()).unwrap()
}

/// Context with predefined labels, applying for real
pub fn predefined_context(labels: &[&str]) -> RunContext {
    context(|config| {
        config.labels.predefined = labels.iter().map(|l| l.to_string()).collect();
        config.execution.dry_run = false;
    })
}

pub fn categories_json(categories: &[&str]) -> String {
    serde_json::json!({ "categories": categories }).to_string()
}

pub fn retryable_error() -> LabellerError {
    LabellerError::ModelCall {
        message: "openai/gpt-4o-mini: HTTP 503".to_string(),
        retryable: true,
    }
}

pub fn non_retryable_error() -> LabellerError {
    LabellerError::ModelCall {
        message: "openai/gpt-4o-mini: invalid request".to_string(),
        retryable: false,
    }
}
