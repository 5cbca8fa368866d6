use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::{LabellerError, Result};
use crate::gateway::{ModelConfig, ModelGateway};
use crate::models::{CategoryPair, ExtractedContent, Message, Summary};
use crate::orchestrator::RunSignal;
use crate::prompts::{self, SUMMARIZE};
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SummaryResponse {
    summary: String,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    category_major: Option<String>,
    #[serde(default)]
    category_minor: Option<String>,
}

/// Major/minor pair, present only when both halves carry a real value
pub(crate) fn category_pair(major: Option<String>, minor: Option<String>) -> Option<CategoryPair> {
    let clean = |value: Option<String>| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("none"))
    };
    Some(CategoryPair {
        major: clean(major)?,
        minor: clean(minor)?,
    })
}

/// One-paragraph summaries through the model gateway
pub struct Summarizer {
    gateway: Arc<dyn ModelGateway>,
    config: ModelConfig,
    retry: RetryPolicy,
}

impl Summarizer {
    pub fn new(gateway: Arc<dyn ModelGateway>, config: ModelConfig, retry: RetryPolicy) -> Self {
        Self {
            gateway,
            retry: retry.for_model(&config),
            config,
        }
    }

    pub fn model(&self) -> &ModelConfig {
        &self.config
    }

    /// Summarize extracted content. Malformed responses count against the
    /// retry budget like transient provider errors.
    pub async fn summarize(
        &self,
        message: &Message,
        content: &ExtractedContent,
        signal: &RunSignal,
    ) -> Result<Summary> {
        let prompt = SUMMARIZE.render(&[
            ("sender", message.sender.as_str()),
            ("subject", message.subject.as_str()),
            ("content", content.text.as_str()),
        ]);
        let prompt = &prompt;

        let response = self
            .retry
            .run("summarize", signal, |attempt| async move {
                debug!("Summarizing {} (attempt {})", message.id, attempt);
                let raw = self.gateway.generate(prompt, &self.config).await?;
                parse_summary(&raw)
            })
            .await?;

        let entities = match prompts::meaningful(response.entities) {
            entities if entities.is_empty() => content.entities.clone(),
            entities => entities,
        };

        Ok(Summary {
            message_id: message.id.clone(),
            text: response.summary.trim().to_string(),
            entities,
            category_pair: category_pair(response.category_major, response.category_minor),
            model_id: Some(self.config.qualified_id()),
            prompt_version: Some(SUMMARIZE.tag()),
        })
    }
}

fn parse_summary(raw: &str) -> Result<SummaryResponse> {
    let response: SummaryResponse = prompts::parse_structured(raw)?;
    if response.summary.trim().is_empty() {
        return Err(LabellerError::Parse("summary is empty".to_string()));
    }
    Ok(response)
}
