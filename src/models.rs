use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, LabellerError};

/// A fetched mailbox message. Never mutated after fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub subject: String,
    pub body: Option<MessageBody>,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "content", rename_all = "lowercase")]
pub enum MessageBody {
    Plain(String),
    Html(String),
}

/// Which part of the message is fed to the extractor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    Snippet,
    FullBody,
}

/// Filter passed to the mailbox when listing unread messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadFilter {
    pub max_count: usize,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub message_id: String,
    pub text: String,
    #[serde(default)]
    pub entities: Vec<String>,
    pub mode: ContentMode,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryPair {
    pub major: String,
    pub minor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub message_id: String,
    pub text: String,
    #[serde(default)]
    pub entities: Vec<String>,
    pub category_pair: Option<CategoryPair>,
    /// None when the extracted text was passed through without a model call
    pub model_id: Option<String>,
    pub prompt_version: Option<String>,
}

impl Summary {
    /// Summary that reuses the extracted text verbatim
    pub fn passthrough(content: &ExtractedContent) -> Self {
        Self {
            message_id: content.message_id.clone(),
            text: content.text.clone(),
            entities: content.entities.clone(),
            category_pair: None,
            model_id: None,
            prompt_version: None,
        }
    }
}

/// Raw classifier output, not yet checked against the label registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub message_id: String,
    pub categories: Vec<String>,
    pub category_pair: Option<CategoryPair>,
    pub model_id: String,
    pub prompt_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    Predefined,
    AccountSourced,
}

/// Concrete label drawn from the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRef {
    pub name: String,
    /// Normalized comparison key
    pub key: String,
    pub source: LabelSource,
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLabels {
    pub message_id: String,
    pub labels: Vec<LabelRef>,
}

impl ResolvedLabels {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// No predefined label matches
    NotPredefined,
    /// No account label matches and creation is disallowed
    NotInAccount,
    /// Nothing left of the name after sanitizing
    InvalidName,
    /// Per-message label cap reached
    OverCap,
    /// Name belongs to a Gmail system label and cannot be created
    Reserved,
}

/// A raw category that did not make it into ResolvedLabels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedCategory {
    pub raw: String,
    pub reason: DropReason,
}

/// What the run did (or would have done) with the resolved labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LabelAction {
    Applied { label_ids: Vec<String> },
    DryRun { labels: Vec<String> },
    NoLabels,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&LabellerError> for FailureCause {
    fn from(error: &LabellerError) -> Self {
        Self {
            kind: error.failure_kind(),
            message: error.to_string(),
        }
    }
}
