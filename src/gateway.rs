//! Model provider boundary
//!
//! [`ModelGateway`] sends a rendered prompt to a provider and returns raw text.
//! Errors come back as [`LabellerError::ModelCall`] tagged retryable or not,
//! or as [`LabellerError::AuthError`] when the provider rejects credentials.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LabellerError, Result};

/// Provider failure categories. Whether a class is retried is decided per
/// model configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RateLimit,
    Server,
    Network,
    Timeout,
    MalformedResponse,
    InvalidRequest,
    Auth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model_id: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u16,
    pub retryable_error_classes: Vec<ErrorClass>,
}

impl ModelConfig {
    /// `provider:model`, as recorded on results and compared on cache hits
    pub fn qualified_id(&self) -> String {
        format!("{}:{}", self.provider, self.model_id)
    }

    /// Turn a classified provider failure into the pipeline error
    pub fn provider_error(&self, class: ErrorClass, message: impl Into<String>) -> LabellerError {
        let message = message.into();
        match class {
            ErrorClass::Auth => LabellerError::AuthError(format!(
                "{} rejected credentials: {}",
                self.provider, message
            )),
            _ => LabellerError::ModelCall {
                retryable: self.retryable_error_classes.contains(&class),
                message: format!("{}/{}: {}", self.provider, self.model_id, message),
            },
        }
    }
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn generate(&self, prompt: &str, config: &ModelConfig) -> Result<String>;
}

#[cfg(feature = "ml")]
pub use openai::OpenAiGateway;

#[cfg(feature = "ml")]
mod openai {
    use super::*;
    use crate::config::LlmConfig;
    use async_openai::config::OpenAIConfig;
    use async_openai::error::OpenAIError;
    use async_openai::types::{ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs};
    use async_openai::Client;
    use std::collections::HashMap;
    use std::time::Duration;

    /// OpenAI and OpenAI-compatible endpoints (Ollama serves `/v1`)
    pub struct OpenAiGateway {
        clients: HashMap<String, Client<OpenAIConfig>>,
    }

    impl OpenAiGateway {
        /// Build one client per configured provider
        pub fn from_config(llm: &LlmConfig) -> Result<Self> {
            let api_key = std::env::var(&llm.api_key_env).ok();
            let mut clients = HashMap::new();

            for (name, provider) in &llm.providers {
                let mut config = OpenAIConfig::new();
                if let Some(base) = &provider.api_base {
                    config = config.with_api_base(base);
                }
                match (&api_key, name.as_str()) {
                    (Some(key), _) => config = config.with_api_key(key),
                    (None, "ollama") => config = config.with_api_key("ollama"),
                    (None, _) => {
                        tracing::warn!(
                            "{} is not set; calls to provider '{}' will be rejected",
                            llm.api_key_env,
                            name
                        );
                    }
                }
                clients.insert(name.clone(), Self::client(config));
            }

            Ok(Self { clients })
        }

        /// Single provider against an explicit endpoint
        pub fn with_endpoint(provider: &str, api_base: &str, api_key: &str) -> Self {
            let config = OpenAIConfig::new()
                .with_api_base(api_base)
                .with_api_key(api_key);
            let mut clients = HashMap::new();
            clients.insert(provider.to_string(), Self::client(config));
            Self { clients }
        }

        // Attempts are counted by the caller's retry policy, so the client's
        // own backoff gives up immediately.
        fn client(config: OpenAIConfig) -> Client<OpenAIConfig> {
            let no_retry = backoff::ExponentialBackoffBuilder::new()
                .with_max_elapsed_time(Some(Duration::ZERO))
                .build();
            Client::with_config(config).with_backoff(no_retry)
        }
    }

    /// Sort an async-openai failure into an [`ErrorClass`]
    pub(crate) fn classify_error(error: &OpenAIError) -> ErrorClass {
        match error {
            OpenAIError::Reqwest(e) if e.is_timeout() => ErrorClass::Timeout,
            OpenAIError::Reqwest(_) => ErrorClass::Network,
            OpenAIError::JSONDeserialize(_) => ErrorClass::MalformedResponse,
            OpenAIError::InvalidArgument(_) => ErrorClass::InvalidRequest,
            OpenAIError::ApiError(api) => {
                let code = api
                    .code
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_default()
                    .to_lowercase();
                let kind = api.r#type.clone().unwrap_or_default().to_lowercase();
                let message = api.message.to_lowercase();

                if code.contains("invalid_api_key")
                    || kind.contains("authentication")
                    || message.contains("api key")
                {
                    ErrorClass::Auth
                } else if kind == "insufficient_quota" {
                    ErrorClass::InvalidRequest
                } else if code.contains("rate_limit")
                    || kind.contains("rate_limit")
                    || message.contains("rate limit")
                {
                    ErrorClass::RateLimit
                } else if kind.contains("server_error") || message.contains("overloaded") {
                    ErrorClass::Server
                } else if kind.contains("invalid_request") {
                    ErrorClass::InvalidRequest
                } else {
                    ErrorClass::Server
                }
            }
            _ => ErrorClass::InvalidRequest,
        }
    }

    #[async_trait]
    impl ModelGateway for OpenAiGateway {
        async fn generate(&self, prompt: &str, config: &ModelConfig) -> Result<String> {
            let client = self.clients.get(&config.provider).ok_or_else(|| {
                LabellerError::ConfigError(format!(
                    "No client configured for provider '{}'",
                    config.provider
                ))
            })?;

            let message = ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(|e| config.provider_error(ErrorClass::InvalidRequest, e.to_string()))?;

            let request = CreateChatCompletionRequestArgs::default()
                .model(config.model_id.as_str())
                .messages(vec![message.into()])
                .temperature(config.temperature)
                .top_p(config.top_p)
                .max_tokens(config.max_tokens)
                .build()
                .map_err(|e| config.provider_error(ErrorClass::InvalidRequest, e.to_string()))?;

            tracing::debug!(
                "Calling {}/{} ({} prompt chars)",
                config.provider,
                config.model_id,
                prompt.len()
            );

            let response = client.chat().create(request).await.map_err(|e| {
                let class = classify_error(&e);
                tracing::debug!("Provider error classified as {:?}: {}", class, e);
                config.provider_error(class, e.to_string())
            })?;

            response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .filter(|text| !text.trim().is_empty())
                .ok_or_else(|| {
                    config.provider_error(ErrorClass::MalformedResponse, "empty completion")
                })
        }
    }
}
