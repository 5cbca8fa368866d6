//! Drives each message through extract, summarize, classify, reconcile and
//! apply, with bounded concurrency across messages.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{self, ClassificationCache};
use crate::classifier::{Classifier, LabelChoice};
use crate::client::MailboxClient;
use crate::config::RunContext;
use crate::error::{LabellerError, Result};
use crate::extractor::ContentExtractor;
use crate::gateway::ModelGateway;
use crate::label_manager::{LabelReconciler, LabelRegistry};
use crate::models::{LabelAction, Message, Summary};
use crate::state::{MessageRecord, MessageState, RunState};
use crate::store::ResultStore;
use crate::summarizer::Summarizer;

/// Cancellation token plus optional run deadline
#[derive(Debug, Clone)]
pub struct RunSignal {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunSignal {
    pub fn new(token: CancellationToken, deadline: Option<Duration>) -> Self {
        Self {
            token,
            deadline: deadline.map(|d| Instant::now() + d),
        }
    }

    /// No deadline, cancelled only through [`RunSignal::cancel`]
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline_passed()
    }

    /// `Cancelled` once the token fires or the deadline passes
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(LabellerError::Cancelled("run cancelled".to_string()));
        }
        if self.deadline_passed() {
            return Err(LabellerError::Cancelled("run deadline reached".to_string()));
        }
        Ok(())
    }

    /// Resolves when the run is cancelled or the deadline passes
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

/// Receives progress as messages reach a terminal state
pub trait ProgressSink: Send + Sync {
    fn on_fetched(&self, _total: usize) {}
    fn on_message(&self, _record: &MessageRecord) {}
}

pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Result of a completed (possibly cancelled) run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: RunState,
    /// Terminal records, newest message first
    pub records: Vec<MessageRecord>,
    /// Registry names at the end of the run
    pub labels: Vec<String>,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn count(&self, state: MessageState) -> usize {
        self.records.iter().filter(|r| r.state == state).count()
    }
}

pub struct RunOrchestrator {
    ctx: RunContext,
    mailbox: Arc<dyn MailboxClient>,
    extractor: ContentExtractor,
    summarizer: Summarizer,
    classifier: Classifier,
    reconciler: LabelReconciler,
    cache: Option<Arc<ClassificationCache>>,
    store: Option<Arc<dyn ResultStore>>,
    progress: Arc<dyn ProgressSink>,
}

impl RunOrchestrator {
    pub fn new(
        ctx: RunContext,
        mailbox: Arc<dyn MailboxClient>,
        gateway: Arc<dyn ModelGateway>,
    ) -> Self {
        Self {
            extractor: ContentExtractor::new(ctx.extract_max_chars),
            summarizer: Summarizer::new(
                gateway.clone(),
                ctx.summary_model.clone(),
                ctx.retry.clone(),
            ),
            classifier: Classifier::new(
                gateway,
                ctx.classify_model.clone(),
                ctx.retry.clone(),
                ctx.max_labels,
            ),
            reconciler: LabelReconciler::new(ctx.label_mode.clone(), ctx.max_labels),
            mailbox,
            cache: None,
            store: None,
            progress: Arc::new(NoProgress),
            ctx,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ClassificationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Fetch unread mail, load the label registry and process the batch
    pub async fn run(&self, signal: &RunSignal) -> Result<RunOutcome> {
        info!(
            "Starting run {} (dry_run={}, max_emails={})",
            self.ctx.run_id, self.ctx.dry_run, self.ctx.filter.max_count
        );
        signal.check()?;

        let messages = self.mailbox.list_unread(&self.ctx.filter).await?;
        info!("Fetched {} unread messages", messages.len());

        let account_labels = self.mailbox.list_labels().await?;
        let registry = LabelRegistry::for_mode(&self.ctx.label_mode, &account_labels);

        self.process_batch(messages, registry, signal).await
    }

    /// Process already-fetched messages against `registry`. Per-message
    /// failures are recorded on the message; only authentication and
    /// configuration failures abort the run.
    pub async fn process_batch(
        &self,
        messages: Vec<Message>,
        registry: LabelRegistry,
        signal: &RunSignal,
    ) -> Result<RunOutcome> {
        let mut run = RunState::new(self.ctx.run_id.clone(), self.ctx.dry_run);
        run.messages_fetched = messages.len();
        self.progress.on_fetched(messages.len());

        // Prompt choice is fixed from the labels as loaded; labels created
        // during the run never change it.
        let known = registry.names();
        let choice = if registry.is_empty() && self.ctx.label_mode.allows_creation() {
            LabelChoice::OpenEnded
        } else {
            LabelChoice::Known(&known)
        };

        let registry = Mutex::new(registry);
        let mut records = Vec::with_capacity(messages.len());

        {
            let registry = &registry;
            let mut pipeline = stream::iter(messages)
                .map(|message| async move {
                    self.process_message(message, choice, registry, signal).await
                })
                .buffer_unordered(self.ctx.max_concurrent.max(1));

            while let Some(result) = pipeline.next().await {
                let record = match result {
                    Ok(record) => record,
                    Err(e) => {
                        error!("Run {} aborted: {}", self.ctx.run_id, e);
                        return Err(e);
                    }
                };

                run.record(&record);
                self.progress.on_message(&record);
                if let Some(store) = &self.store {
                    if let Err(e) = store.save_message(&self.ctx.run_id, &record).await {
                        warn!("Failed to save record for {}: {}", record.message_id, e);
                    }
                }
                records.push(record);
            }
        }

        let registry = registry.into_inner();
        run.labels_created = registry.created_in_run();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        if let Some(store) = &self.store {
            if let Err(e) = store.save_steps(&self.ctx.run_id, &records).await {
                warn!("Failed to save step files: {}", e);
            }
            if let Err(e) = store.save_run(&run).await {
                warn!("Failed to save run summary: {}", e);
            }
        }
        if let Some(cache) = self.active_cache() {
            if let Err(e) = cache.flush().await {
                warn!("Failed to persist classification cache: {}", e);
            }
        }

        let cancelled = signal.is_cancelled();
        info!(
            "Run {} finished: {} applied, {} skipped, {} failed{}",
            self.ctx.run_id,
            run.messages_applied,
            run.messages_skipped,
            run.messages_failed,
            if cancelled { " (cancelled)" } else { "" }
        );

        Ok(RunOutcome {
            run,
            records,
            labels: registry.names(),
            cancelled,
        })
    }

    fn active_cache(&self) -> Option<&ClassificationCache> {
        self.cache
            .as_deref()
            .filter(|_| self.ctx.cache_enabled)
    }

    /// Run one message to a terminal state. Err only for run-fatal errors.
    async fn process_message(
        &self,
        message: Message,
        choice: LabelChoice<'_>,
        registry: &Mutex<LabelRegistry>,
        signal: &RunSignal,
    ) -> Result<MessageRecord> {
        let mut record = MessageRecord::new(&message);

        match self.drive(&message, &mut record, choice, registry, signal).await {
            Ok(()) => {}
            Err(e) if e.is_run_fatal() => return Err(e),
            Err(e) => {
                if !record.is_terminal() {
                    error!("message {} failed at {}: {}", message.id, record.state, e);
                    record.fail(&e)?;
                }
            }
        }

        Ok(record)
    }

    async fn drive(
        &self,
        message: &Message,
        record: &mut MessageRecord,
        choice: LabelChoice<'_>,
        registry: &Mutex<LabelRegistry>,
        signal: &RunSignal,
    ) -> Result<()> {
        signal.check()?;

        let content = match self.extractor.extract(message, self.ctx.content_mode) {
            Ok(content) => content,
            Err(e) => {
                warn!("Skipping message {}: {}", message.id, e);
                return record.skip(Some(&e));
            }
        };
        record.extracted = Some(content.clone());
        record.advance(MessageState::Extracted)?;

        let cache_key = cache::cache_key(message, &content);
        let cached = match self.active_cache() {
            Some(cache) => cache
                .lookup(&cache_key, &self.classifier.model().qualified_id())
                .await
                .unwrap_or_else(|e| {
                    warn!("Cache lookup failed for {}: {}", message.id, e);
                    None
                }),
            None => None,
        };

        let (summary, classification) = match cached {
            Some(hit) => {
                debug!("Cache hit for {}", message.id);
                record.cache_hit = true;
                (hit.summary, hit.classification)
            }
            None => {
                let summary = self.summarize(message, &content, signal).await?;
                record.summary = Some(summary.clone());
                record.advance(MessageState::Summarized)?;

                signal.check()?;
                let classification = self
                    .classifier
                    .classify(message, &summary, choice, signal)
                    .await?;

                if let Some(cache) = self.active_cache() {
                    if let Err(e) = cache.insert(&cache_key, &summary, &classification).await {
                        warn!("Cache write failed for {}: {}", message.id, e);
                    }
                }
                (summary, classification)
            }
        };

        if record.state == MessageState::Extracted {
            record.summary = Some(summary);
            record.advance(MessageState::Summarized)?;
        }
        record.classification = Some(classification.clone());
        record.advance(MessageState::Classified)?;

        let reconciliation = {
            let mut registry = registry.lock().await;
            self.reconciler.reconcile(&classification, &mut registry)
        };
        let resolved = reconciliation.resolved;
        record.dropped = reconciliation.dropped;
        record.resolved = Some(resolved.clone());
        record.advance(MessageState::LabelsResolved)?;

        if resolved.is_empty() {
            record.action = Some(LabelAction::NoLabels);
            let cause = (!record.dropped.is_empty()).then(|| {
                LabellerError::LabelResolution(format!(
                    "no usable label among {} proposed categories",
                    record.dropped.len()
                ))
            });
            return record.skip(cause.as_ref());
        }

        if self.ctx.dry_run {
            info!(
                "[dry run] would label {} with {:?}",
                message.id,
                resolved.names()
            );
            record.action = Some(LabelAction::DryRun {
                labels: resolved.names(),
            });
            return record.skip(None);
        }

        signal.check()?;
        let label_ids = {
            let mut registry = registry.lock().await;
            registry
                .ensure_created(&resolved.labels, self.mailbox.as_ref())
                .await?
        };

        self.mailbox
            .apply_labels(&message.id, &label_ids)
            .await
            .map_err(|e| {
                if e.is_run_fatal() {
                    e
                } else {
                    LabellerError::MailboxApply(format!(
                        "failed to label message {}: {}",
                        message.id, e
                    ))
                }
            })?;

        info!("Labelled {} with {:?}", message.id, resolved.names());
        record.action = Some(LabelAction::Applied { label_ids });
        record.advance(MessageState::Applied)
    }

    async fn summarize(
        &self,
        message: &Message,
        content: &crate::models::ExtractedContent,
        signal: &RunSignal,
    ) -> Result<Summary> {
        if !self.ctx.summarize {
            return Ok(Summary::passthrough(content));
        }
        signal.check()?;
        self.summarizer.summarize(message, content, signal).await
    }
}
