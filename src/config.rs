use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LabellerError, Result};
use crate::gateway::{ErrorClass, ModelConfig};
use crate::label_manager::LabelMode;
use crate::models::{ContentMode, UnreadFilter};
use crate::retry::RetryPolicy;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_emails")]
    pub max_emails: usize,
    /// Defaults to 7 days when no explicit window is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_old: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<String>,
    #[serde(default)]
    pub use_full_content: bool,
    #[serde(default = "default_label_ids")]
    pub label_ids: Vec<String>,
    #[serde(default = "default_extract_max_chars")]
    pub extract_max_chars: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_emails: default_max_emails(),
            days_old: None,
            date_from: None,
            date_to: None,
            use_full_content: false,
            label_ids: default_label_ids(),
            extract_max_chars: default_extract_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// `model` or `provider:model`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classify_model: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<ErrorClass>,
    #[serde(default = "default_summary_generation")]
    pub summary: GenerationConfig,
    #[serde(default = "default_classify_generation")]
    pub classify: GenerationConfig,
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            default_model: default_model(),
            summary_model: None,
            classify_model: None,
            api_key_env: default_api_key_env(),
            retryable_errors: default_retryable_errors(),
            summary: default_summary_generation(),
            classify: default_classify_generation(),
            providers: default_providers(),
        }
    }
}

/// Sampling parameters forwarded untouched to the model provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    /// Accepted model ids; empty accepts any
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    #[serde(default)]
    pub predefined: Vec<String>,
    #[serde(default)]
    pub use_user_labels: bool,
    #[serde(default)]
    pub create_labels: bool,
    #[serde(default = "default_max_per_message")]
    pub max_per_message: usize,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            predefined: Vec::new(),
            use_user_labels: false,
            create_labels: false,
            max_per_message: default_max_per_message(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_deadline_secs: Option<u64>,
    #[serde(default)]
    pub save_steps: bool,
    #[serde(default)]
    pub print: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dry_run: default_dry_run(),
            max_concurrent: default_max_concurrent(),
            run_deadline_secs: None,
            save_steps: false,
            print: false,
            output_dir: default_output_dir(),
            state_file: default_state_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    File,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            backend: default_cache_backend(),
            path: default_cache_path(),
            capacity: default_cache_capacity(),
        }
    }
}

fn default_max_emails() -> usize {
    15
}

fn default_days_old() -> u32 {
    7
}

fn default_label_ids() -> Vec<String> {
    vec!["UNREAD".to_string()]
}

fn default_extract_max_chars() -> usize {
    4000
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_retryable_errors() -> Vec<ErrorClass> {
    vec![
        ErrorClass::RateLimit,
        ErrorClass::Server,
        ErrorClass::Network,
        ErrorClass::Timeout,
        ErrorClass::MalformedResponse,
    ]
}

fn default_summary_generation() -> GenerationConfig {
    GenerationConfig {
        temperature: 0.3,
        top_p: 1.0,
        max_tokens: 512,
    }
}

fn default_classify_generation() -> GenerationConfig {
    GenerationConfig {
        temperature: 0.0,
        top_p: 1.0,
        max_tokens: 128,
    }
}

fn default_providers() -> BTreeMap<String, ProviderConfig> {
    let mut providers = BTreeMap::new();
    providers.insert(
        "openai".to_string(),
        ProviderConfig {
            api_base: None,
            models: ["gpt-4o-mini", "gpt-4o", "gpt-4.1-mini", "gpt-4.1", "gpt-3.5-turbo"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
        },
    );
    providers.insert(
        "ollama".to_string(),
        ProviderConfig {
            api_base: Some("http://localhost:11434/v1".to_string()),
            models: ["llama3.1", "llama3.2", "mistral", "qwen2.5"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
        },
    );
    providers
}

fn default_max_per_message() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_attempt_timeout_secs() -> u64 {
    60
}

fn default_dry_run() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    4
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".gmail-labeller/state.json")
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::File
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".gmail-labeller/classification-cache.json")
}

fn default_cache_capacity() -> usize {
    1024
}

/// `provider:model` or a bare model id on the default provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelector {
    pub provider: String,
    pub model: String,
}

impl ModelSelector {
    pub fn parse(selector: &str, default_provider: &str) -> Self {
        match selector.split_once(':') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Self {
                provider: provider.to_string(),
                model: model.to_string(),
            },
            _ => Self {
                provider: default_provider.to_string(),
                model: selector.to_string(),
            },
        }
    }
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub max_emails: Option<usize>,
    pub days_old: Option<u32>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub use_full_content: bool,
    pub summary_model: Option<String>,
    pub classify_model: Option<String>,
    pub use_user_labels: bool,
    pub create_labels: bool,
    pub apply: bool,
    pub save_steps: bool,
    pub print: bool,
    pub max_concurrent: Option<usize>,
    pub run_deadline_secs: Option<u64>,
    pub no_cache: bool,
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            LabellerError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            LabellerError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                LabellerError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            LabellerError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;

        tokio::fs::write(path, content).await.map_err(|e| {
            LabellerError::ConfigError(format!("Failed to write config file: {}", e))
        })?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let mut config = Self::default();
        config.labels.predefined = vec![
            "Financials".to_string(),
            "Utilities".to_string(),
            "Personal".to_string(),
        ];
        config.save(path).await
    }

    /// Apply command-line overrides. A date flag on the command line replaces
    /// the file's whole date filter.
    pub fn apply_overrides(&mut self, overrides: &RunOverrides) {
        if let Some(max) = overrides.max_emails {
            self.fetch.max_emails = max;
        }
        if overrides.days_old.is_some() {
            self.fetch.days_old = overrides.days_old;
            self.fetch.date_from = None;
            self.fetch.date_to = None;
        }
        if overrides.date_from.is_some() || overrides.date_to.is_some() {
            self.fetch.days_old = None;
            self.fetch.date_from = overrides.date_from.clone();
            self.fetch.date_to = overrides.date_to.clone();
        }
        if overrides.use_full_content {
            self.fetch.use_full_content = true;
        }
        if overrides.summary_model.is_some() {
            self.llm.summary_model = overrides.summary_model.clone();
        }
        if overrides.classify_model.is_some() {
            self.llm.classify_model = overrides.classify_model.clone();
        }
        if overrides.use_user_labels {
            self.labels.use_user_labels = true;
        }
        if overrides.create_labels {
            self.labels.create_labels = true;
        }
        if overrides.apply {
            self.execution.dry_run = false;
        }
        if overrides.save_steps {
            self.execution.save_steps = true;
        }
        if overrides.print {
            self.execution.print = true;
        }
        if let Some(n) = overrides.max_concurrent {
            self.execution.max_concurrent = n;
        }
        if overrides.run_deadline_secs.is_some() {
            self.execution.run_deadline_secs = overrides.run_deadline_secs;
        }
        if overrides.no_cache {
            self.cache.enabled = false;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.fetch.max_emails == 0 {
            return Err(LabellerError::ConfigError(
                "fetch.max_emails must be at least 1".to_string(),
            ));
        }
        if self.fetch.extract_max_chars == 0 {
            return Err(LabellerError::ConfigError(
                "fetch.extract_max_chars must be greater than 0".to_string(),
            ));
        }
        self.date_range()?;

        if !self.llm.providers.contains_key(&self.llm.provider) {
            return Err(LabellerError::ConfigError(format!(
                "Unknown llm.provider '{}'. Configured providers: {}",
                self.llm.provider,
                self.provider_names()
            )));
        }
        let summary = self.summary_selector();
        self.validate_model(&summary.provider, &summary.model)?;
        let classify = self.classify_selector();
        self.validate_model(&classify.provider, &classify.model)?;

        for (name, generation) in [("summary", &self.llm.summary), ("classify", &self.llm.classify)]
        {
            if !(0.0..=2.0).contains(&generation.temperature) {
                return Err(LabellerError::ConfigError(format!(
                    "llm.{}.temperature must be between 0 and 2",
                    name
                )));
            }
            if !(0.0..=1.0).contains(&generation.top_p) {
                return Err(LabellerError::ConfigError(format!(
                    "llm.{}.top_p must be between 0 and 1",
                    name
                )));
            }
            if generation.max_tokens == 0 {
                return Err(LabellerError::ConfigError(format!(
                    "llm.{}.max_tokens must be greater than 0",
                    name
                )));
            }
        }

        self.label_mode()?;
        if self.labels.max_per_message == 0 {
            return Err(LabellerError::ConfigError(
                "labels.max_per_message must be greater than 0".to_string(),
            ));
        }
        if self.labels.predefined.iter().any(|l| l.trim().is_empty()) {
            return Err(LabellerError::ConfigError(
                "labels.predefined cannot contain empty strings".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(LabellerError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(LabellerError::ConfigError(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.retry.attempt_timeout_secs == 0 {
            return Err(LabellerError::ConfigError(
                "retry.attempt_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.execution.max_concurrent == 0 {
            return Err(LabellerError::ConfigError(
                "execution.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.execution.max_concurrent > 32 {
            return Err(LabellerError::ConfigError(
                "execution.max_concurrent cannot exceed 32".to_string(),
            ));
        }

        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(LabellerError::ConfigError(
                "cache.capacity must be greater than 0".to_string(),
            ));
        }
        if self.cache.backend == CacheBackend::Sqlite && !cfg!(feature = "cache") {
            return Err(LabellerError::ConfigError(
                "cache.backend = \"sqlite\" requires the `cache` feature".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Reject models that are not listed for their provider
    pub fn validate_model(&self, provider: &str, model: &str) -> Result<()> {
        let Some(provider_config) = self.llm.providers.get(provider) else {
            return Err(LabellerError::ConfigError(format!(
                "Unknown provider '{}'. Configured providers: {}",
                provider,
                self.provider_names()
            )));
        };
        if model.trim().is_empty() {
            return Err(LabellerError::ConfigError(format!(
                "Empty model id for provider '{}'",
                provider
            )));
        }
        if !provider_config.models.is_empty() && !provider_config.models.iter().any(|m| m == model)
        {
            return Err(LabellerError::ConfigError(format!(
                "Invalid model '{}' for provider '{}'. Valid models: {}",
                model,
                provider,
                provider_config.models.join(", ")
            )));
        }
        Ok(())
    }

    pub fn summary_selector(&self) -> ModelSelector {
        let selector = self
            .llm
            .summary_model
            .as_deref()
            .unwrap_or(&self.llm.default_model);
        ModelSelector::parse(selector, &self.llm.provider)
    }

    pub fn classify_selector(&self) -> ModelSelector {
        let selector = self
            .llm
            .classify_model
            .as_deref()
            .unwrap_or(&self.llm.default_model);
        ModelSelector::parse(selector, &self.llm.provider)
    }

    /// Predefined and account-sourced labels are one exclusive choice
    pub fn label_mode(&self) -> Result<LabelMode> {
        let account = self.labels.use_user_labels || self.labels.create_labels;
        if !self.labels.predefined.is_empty() && account {
            return Err(LabellerError::ConfigError(
                "labels.predefined cannot be combined with use_user_labels or create_labels; \
                 pick either a predefined label list or the mailbox's own labels"
                    .to_string(),
            ));
        }
        if !self.labels.predefined.is_empty() {
            return Ok(LabelMode::Predefined(self.labels.predefined.clone()));
        }
        Ok(LabelMode::AccountSourced {
            create: self.labels.create_labels,
        })
    }

    /// Resolve the date filter into an inclusive window relative to `today`
    pub fn date_range_from(&self, today: NaiveDate) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let fetch = &self.fetch;
        match (&fetch.date_from, &fetch.date_to) {
            (Some(from), Some(to)) => {
                if fetch.days_old.is_some() {
                    return Err(LabellerError::ConfigError(
                        "fetch.days_old cannot be combined with date_from/date_to".to_string(),
                    ));
                }
                let from = parse_date("fetch.date_from", from)?;
                let to = parse_date("fetch.date_to", to)?;
                if from > to {
                    return Err(LabellerError::ConfigError(format!(
                        "fetch.date_from ({}) is after fetch.date_to ({})",
                        from, to
                    )));
                }
                Ok((Some(from), Some(to)))
            }
            (Some(_), None) | (None, Some(_)) => Err(LabellerError::ConfigError(
                "fetch.date_from and fetch.date_to must be given together".to_string(),
            )),
            (None, None) => {
                let days = fetch.days_old.unwrap_or_else(default_days_old);
                Ok((Some(today - ChronoDuration::days(i64::from(days))), None))
            }
        }
    }

    pub fn date_range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        self.date_range_from(Utc::now().date_naive())
    }

    fn provider_names(&self) -> String {
        self.llm
            .providers
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn model_config(&self, selector: ModelSelector, generation: GenerationConfig) -> ModelConfig {
        ModelConfig {
            provider: selector.provider,
            model_id: selector.model,
            temperature: generation.temperature,
            top_p: generation.top_p,
            max_tokens: generation.max_tokens,
            retryable_error_classes: self.llm.retryable_errors.clone(),
        }
    }
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|e| {
        LabellerError::ConfigError(format!(
            "{} must be YYYY-MM-DD, got '{}': {}",
            field, value, e
        ))
    })
}

/// Frozen configuration for a single invocation
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub filter: UnreadFilter,
    pub dry_run: bool,
    pub content_mode: ContentMode,
    /// Call the summarizer; otherwise the extracted text is the summary
    pub summarize: bool,
    pub save_steps: bool,
    pub print: bool,
    pub summary_model: ModelConfig,
    pub classify_model: ModelConfig,
    pub label_mode: LabelMode,
    pub max_labels: usize,
    pub retry: RetryPolicy,
    pub max_concurrent: usize,
    pub run_deadline: Option<Duration>,
    pub cache_enabled: bool,
    pub extract_max_chars: usize,
    pub output_dir: PathBuf,
}

impl RunContext {
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_on(config, Utc::now().date_naive())
    }

    pub fn from_config_on(config: &Config, today: NaiveDate) -> Result<Self> {
        config.validate()?;
        let (date_from, date_to) = config.date_range_from(today)?;
        let content_mode = if config.fetch.use_full_content {
            ContentMode::FullBody
        } else {
            ContentMode::Snippet
        };

        Ok(Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            filter: UnreadFilter {
                max_count: config.fetch.max_emails,
                date_from,
                date_to,
                label_ids: config.fetch.label_ids.clone(),
            },
            dry_run: config.execution.dry_run,
            content_mode,
            summarize: config.fetch.use_full_content,
            save_steps: config.execution.save_steps,
            print: config.execution.print,
            summary_model: config.model_config(config.summary_selector(), config.llm.summary),
            classify_model: config.model_config(config.classify_selector(), config.llm.classify),
            label_mode: config.label_mode()?,
            max_labels: config.labels.max_per_message,
            retry: RetryPolicy::from_config(&config.retry),
            max_concurrent: config.execution.max_concurrent,
            run_deadline: config.execution.run_deadline_secs.map(Duration::from_secs),
            cache_enabled: config.cache.enabled,
            extract_max_chars: config.fetch.extract_max_chars,
            output_dir: config.execution.output_dir.clone(),
        })
    }
}
