//! Versioned prompt templates
//!
//! The version tag (`name@version`) is stored on every Summary and
//! ClassificationResult, so any wording change must bump the version.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::error::{LabellerError, Result};

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*\n?(.*?)\s*```$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTemplate {
    pub name: &'static str,
    pub version: u32,
    body: &'static str,
}

impl PromptTemplate {
    pub fn tag(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Substitute `{key}` placeholders. Unknown placeholders are left as is.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        vars.iter().fold(self.body.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{}}}", key), value)
        })
    }
}

pub const SUMMARIZE: PromptTemplate = PromptTemplate {
    name: "summarize",
    version: 2,
    body: r#"You are an expert at reading email. Summarize the email below.

Rules for summarizing:
- Write one paragraph of plain text. No links, no markup.
- Keep every important point: names, organizations, amounts, balances, deadlines and dates.
- List the named entities (people, companies, amounts, dates) that matter for understanding the email.

Rules for categorizing:
- category_major names who the email is about, such as a company or service (Chase, Discover, Cox, LinkedIn).
- category_minor names what kind of email it is (Promotions, Bills, Updates, Receipts, Reminders).

Sender: {sender}
Subject: {subject}
Email content:
{content}

Respond with only a JSON object of this shape and nothing else:
{"summary": "...", "entities": ["..."], "category_major": "...", "category_minor": "..."}"#,
};

pub const CLASSIFY: PromptTemplate = PromptTemplate {
    name: "classify",
    version: 2,
    body: r#"You are an email classifier. Given the email below and the available labels, choose the most appropriate labels.

Read the content carefully. Do not pick a label only because the sender looks related. A promotional email from discover.com belongs under a general finance label, not a Discover-specific one. Routine network updates from linkedin.com are not job postings.

Choose at most {max_labels} labels, most relevant first. Use only labels from the list, spelled exactly as listed. If no label fits, return ["NONE"].

Available labels:
{labels}

Sender: {sender}
Subject: {subject}
Email content:
{content}

Respond with only a JSON object of this shape and nothing else:
{"categories": ["..."]}"#,
};

pub const CLASSIFY_OPEN: PromptTemplate = PromptTemplate {
    name: "classify-open",
    version: 1,
    body: r#"You are an email classifier. Given the email below, propose the most appropriate label.

Read the content carefully. Do not pick a label only because of the sender's domain. A promotional email from discover.com is "Financials/Promotions", not "Financials/Discover". Routine network updates from linkedin.com are "Misc/Updates", not "Misc/Jobs".

Give a major category (the broad area, such as Financials, Utilities, Shopping, Social, Misc) and a minor category (the kind of email, such as Bills, Promotions, Updates, Receipts). Labels are written as "Major/Minor". Return at most {max_labels} labels, most relevant first.

Sender: {sender}
Subject: {subject}
Email content:
{content}

Respond with only a JSON object of this shape and nothing else:
{"categories": ["Major/Minor"], "category_major": "...", "category_minor": "..."}"#,
};

/// Parse a model response into `T`, tolerating a surrounding Markdown fence.
/// Anything that is not exactly the expected JSON shape is a parse error.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let trimmed = raw.trim();
    let body = CODE_FENCE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map_or(trimmed, |m| m.as_str());

    serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(120).collect();
        LabellerError::Parse(format!("{} in response '{}'", e, preview))
    })
}

/// Drop blank and "NONE" entries
pub fn meaningful(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("none"))
        .collect()
}
