//! Turns a fetched message into bounded plain text for prompting

use html2text::render::text_renderer::TrivialDecorator;
use once_cell::sync::Lazy;
use regex::Regex;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

use crate::error::{LabellerError, Result};
use crate::models::{ContentMode, ExtractedContent, Message, MessageBody};

const RENDER_WIDTH: usize = 10_000;
const MAX_ENTITIES: usize = 10;

static SCRIPT_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|head)\b.*?</(script|style|head)\s*>").unwrap());
static BLOCK_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?(p|div|br|tr|li|h[1-6]|table|td)\b[^>]*>").unwrap());
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static NUMERIC_ENTITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"&#(x?)([0-9a-fA-F]+);").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static ZERO_WIDTH: Lazy<Regex> =
    Lazy::new(|| Regex::new("[\u{200b}\u{200c}\u{200d}\u{2060}\u{feff}\u{034f}\u{00ad}]").unwrap());

static ENTITY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // amounts
        Regex::new(r"[$€£]\s?\d[\d,]*(?:\.\d{1,2})?").unwrap(),
        // month-name dates
        Regex::new(
            r"(?i)\b(?:jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+\d{1,2}(?:st|nd|rd|th)?(?:,?\s+\d{4})?\b",
        )
        .unwrap(),
        // numeric dates
        Regex::new(r"\b\d{1,2}/\d{1,2}/\d{2,4}\b").unwrap(),
        Regex::new(r"[\w.+-]+@[\w-]+\.[\w.-]+").unwrap(),
    ]
});

/// Extracts plain text from snippets or full bodies
#[derive(Debug, Clone)]
pub struct ContentExtractor {
    max_chars: usize,
}

impl ContentExtractor {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    /// Extract text according to `mode`. Full-body mode falls back to the
    /// snippet when the message has no body. Empty output is an error.
    pub fn extract(&self, message: &Message, mode: ContentMode) -> Result<ExtractedContent> {
        let raw = match (mode, &message.body) {
            (ContentMode::FullBody, Some(MessageBody::Html(html))) => html_to_text(html),
            (ContentMode::FullBody, Some(MessageBody::Plain(text))) => decode_entities(text),
            _ => decode_entities(&message.snippet),
        };

        let normalized = normalize_whitespace(&raw);
        if normalized.is_empty() {
            return Err(LabellerError::Extraction(format!(
                "message {} has no text after extraction",
                message.id
            )));
        }

        let (text, truncated) = truncate_chars(&normalized, self.max_chars);
        if truncated {
            debug!(
                "Truncated message {} to {} characters",
                message.id, self.max_chars
            );
        }

        Ok(ExtractedContent {
            message_id: message.id.clone(),
            entities: entity_hints(&text),
            text,
            mode,
            truncated,
        })
    }
}

/// Render HTML to text, falling back to tag stripping if the renderer gives up
pub fn html_to_text(html: &str) -> String {
    let cleaned = SCRIPT_STYLE.replace_all(html, " ");
    let rendered = panic::catch_unwind(AssertUnwindSafe(|| {
        html2text::from_read_with_decorator(
            cleaned.as_bytes(),
            RENDER_WIDTH,
            TrivialDecorator::new(),
        )
    }));

    match rendered {
        Ok(text) if !text.trim().is_empty() => decode_entities(&text),
        Ok(_) => strip_tags(html),
        Err(_) => {
            warn!("HTML renderer failed, stripping tags instead");
            strip_tags(html)
        }
    }
}

/// Conservative tag removal for markup the renderer cannot handle
pub fn strip_tags(html: &str) -> String {
    let without_code = SCRIPT_STYLE.replace_all(html, " ");
    let with_breaks = BLOCK_TAG.replace_all(&without_code, "\n");
    let text = ANY_TAG.replace_all(&with_breaks, " ");
    decode_entities(&text)
}

pub fn decode_entities(text: &str) -> String {
    let numeric = NUMERIC_ENTITY.replace_all(text, |caps: &regex::Captures| {
        let radix = if caps[1].is_empty() { 10 } else { 16 };
        u32::from_str_radix(&caps[2], radix)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });

    numeric
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Collapse whitespace runs to single spaces and drop invisible characters
pub fn normalize_whitespace(text: &str) -> String {
    let visible = ZERO_WIDTH.replace_all(text, "");
    WHITESPACE.replace_all(&visible, " ").trim().to_string()
}

/// Cut to at most `max_chars` characters on a char boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => (text[..byte_index].trim_end().to_string(), true),
        None => (text.to_string(), false),
    }
}

/// Amounts, dates and addresses found in the text, in order of appearance
pub fn entity_hints(text: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = ENTITY_PATTERNS
        .iter()
        .flat_map(|pattern| {
            pattern
                .find_iter(text)
                .map(|m| (m.start(), m.as_str().trim().to_string()))
        })
        .collect();
    found.sort_by_key(|(start, _)| *start);

    let mut entities: Vec<String> = Vec::new();
    for (_, entity) in found {
        if !entities.contains(&entity) {
            entities.push(entity);
        }
        if entities.len() == MAX_ENTITIES {
            break;
        }
    }
    entities
}
