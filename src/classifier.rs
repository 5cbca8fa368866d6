//! Category assignment through the model gateway

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{LabellerError, Result};
use crate::gateway::{ModelConfig, ModelGateway};
use crate::models::{CategoryPair, ClassificationResult, Message, Summary};
use crate::orchestrator::RunSignal;
use crate::prompts::{self, PromptTemplate, CLASSIFY, CLASSIFY_OPEN};
use crate::retry::RetryPolicy;
use crate::summarizer::category_pair;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassifyResponse {
    categories: Vec<String>,
    #[serde(default)]
    category_major: Option<String>,
    #[serde(default)]
    category_minor: Option<String>,
}

/// What the classifier is allowed to choose from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelChoice<'a> {
    /// Pick from these names
    Known(&'a [String]),
    /// No labels exist yet and new ones may be created; propose a
    /// `Major/Minor` label
    OpenEnded,
}

impl LabelChoice<'_> {
    fn template(&self) -> PromptTemplate {
        match self {
            LabelChoice::Known(_) => CLASSIFY,
            LabelChoice::OpenEnded => CLASSIFY_OPEN,
        }
    }
}

pub struct Classifier {
    gateway: Arc<dyn ModelGateway>,
    config: ModelConfig,
    retry: RetryPolicy,
    max_labels: usize,
}

impl Classifier {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        config: ModelConfig,
        retry: RetryPolicy,
        max_labels: usize,
    ) -> Self {
        Self {
            gateway,
            retry: retry.for_model(&config),
            config,
            max_labels: max_labels.max(1),
        }
    }

    pub fn model(&self) -> &ModelConfig {
        &self.config
    }

    /// Ask the model for up to `max_labels` raw categories. Output is not
    /// checked against the registry here.
    pub async fn classify(
        &self,
        message: &Message,
        summary: &Summary,
        choice: LabelChoice<'_>,
        signal: &RunSignal,
    ) -> Result<ClassificationResult> {
        let template = choice.template();
        let labels = match choice {
            LabelChoice::Known(names) if !names.is_empty() => names.join("\n"),
            LabelChoice::Known(_) => "(none)".to_string(),
            LabelChoice::OpenEnded => String::new(),
        };
        let max_labels = self.max_labels.to_string();
        let prompt = template.render(&[
            ("labels", labels.as_str()),
            ("sender", message.sender.as_str()),
            ("subject", message.subject.as_str()),
            ("content", summary.text.as_str()),
            ("max_labels", max_labels.as_str()),
        ]);
        let prompt = &prompt;
        let open_ended = choice == LabelChoice::OpenEnded;

        let (mut categories, pair) = self
            .retry
            .run("classify", signal, |attempt| async move {
                debug!(
                    "Classifying {} with {} (attempt {})",
                    message.id,
                    template.tag(),
                    attempt
                );
                let raw = self.gateway.generate(prompt, &self.config).await?;
                parse_classification(&raw, open_ended)
            })
            .await?;

        if categories.len() > self.max_labels {
            warn!(
                "Model returned {} categories for {}, keeping the first {}",
                categories.len(),
                message.id,
                self.max_labels
            );
            categories.truncate(self.max_labels);
        }

        Ok(ClassificationResult {
            message_id: message.id.clone(),
            categories,
            category_pair: pair.or_else(|| summary.category_pair.clone()),
            model_id: self.config.qualified_id(),
            prompt_version: template.tag(),
        })
    }
}

type Parsed = (Vec<String>, Option<CategoryPair>);

/// Open-ended output must carry the major/minor pair; when it lists no
/// categories the pair itself becomes the label.
fn parse_classification(raw: &str, open_ended: bool) -> Result<Parsed> {
    let response: ClassifyResponse = prompts::parse_structured(raw)?;
    let pair = category_pair(response.category_major, response.category_minor);
    let mut categories = prompts::meaningful(response.categories);

    if open_ended {
        let pair = pair.ok_or_else(|| {
            LabellerError::Parse(
                "open-ended classification is missing category_major/category_minor".to_string(),
            )
        })?;
        if categories.is_empty() {
            categories.push(format!("{}/{}", pair.major, pair.minor));
        }
        return Ok((categories, Some(pair)));
    }

    Ok((categories, pair))
}
