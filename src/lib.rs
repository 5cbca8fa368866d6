//! Gmail Labeller
//!
//! Fetches unread Gmail messages, condenses each one with a language model,
//! classifies it into a bounded set of labels and applies those labels back
//! to the mailbox (or only reports them, in dry-run mode).
//!
//! # Pipeline
//!
//! Every message moves through a forward-only state machine:
//!
//! ```text
//! Fetched -> Extracted -> Summarized -> Classified -> LabelsResolved -> Applied | Skipped
//!            (any non-terminal state) -> Failed
//! ```
//!
//! A failure on one message never stops the others. Only authentication and
//! configuration errors abort a run.
//!
//! # Example Usage
//!
//! ```no_run
//! use gmail_labeller::{auth, client::ProductionGmailClient, config::{Config, RunContext}};
//! use gmail_labeller::gateway::OpenAiGateway;
//! use gmail_labeller::orchestrator::{RunOrchestrator, RunSignal};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let ctx = RunContext::from_config(&config)?;
//!
//!     let hub = auth::connect(
//!         "credentials.json".as_ref(),
//!         ".gmail-labeller/token.json".as_ref(),
//!     ).await?;
//!     let mailbox = Arc::new(ProductionGmailClient::new(hub, ctx.max_concurrent));
//!     let gateway = Arc::new(OpenAiGateway::from_config(&config.llm)?);
//!
//!     let outcome = RunOrchestrator::new(ctx, mailbox, gateway)
//!         .run(&RunSignal::unbounded())
//!         .await?;
//!     println!("{} messages labelled", outcome.run.messages_applied);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth2 authentication and Gmail API initialization
//! - [`cache`] - Idempotency cache for classifications
//! - [`classifier`] - Category assignment through the model gateway
//! - [`cli`] - Command-line interface, progress and run report
//! - [`client`] - Mailbox boundary and the Gmail backend
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases
//! - [`extractor`] - Message content extraction
//! - [`gateway`] - Language model boundary and the OpenAI-compatible backend
//! - [`label_manager`] - Label registry and reconciliation
//! - [`models`] - Core data structures
//! - [`orchestrator`] - Per-message pipeline driver
//! - [`prompts`] - Versioned prompt templates
//! - [`retry`] - Retry policy for model calls
//! - [`state`] - Message state machine and run checkpoint
//! - [`store`] - Run artifacts on disk
//! - [`summarizer`] - Message summaries

pub mod auth;
pub mod cache;
pub mod classifier;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod extractor;
pub mod gateway;
pub mod label_manager;
pub mod models;
pub mod orchestrator;
pub mod prompts;
pub mod retry;
pub mod state;
pub mod store;
pub mod summarizer;

// Re-export commonly used types for convenience
pub use error::{FailureKind, LabellerError, Result};

// Core data models
pub use models::{
    CategoryPair, ClassificationResult, ContentMode, ExtractedContent, LabelAction, LabelRef,
    Message, MessageBody, ResolvedLabels, Summary, UnreadFilter,
};

// Config types
pub use config::{Config, RunContext, RunOverrides};

// Boundaries
pub use client::{LabelInfo, LabelKind, MailboxClient, ProductionGmailClient};
pub use gateway::{ErrorClass, ModelConfig, ModelGateway};

// Pipeline components
pub use cache::ClassificationCache;
pub use classifier::{Classifier, LabelChoice};
pub use extractor::ContentExtractor;
pub use label_manager::{LabelMode, LabelReconciler, LabelRegistry};
pub use orchestrator::{ProgressSink, RunOrchestrator, RunOutcome, RunSignal};
pub use retry::RetryPolicy;
pub use store::{FileResultStore, ResultStore};
pub use summarizer::Summarizer;

// State management
pub use state::{MessageRecord, MessageState, RunState};

// CLI types (for binary usage)
pub use cli::{Cli, Commands, ProgressReporter};
