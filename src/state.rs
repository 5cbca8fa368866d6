use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{LabellerError, Result};
use crate::models::{
    ClassificationResult, DroppedCategory, ExtractedContent, FailureCause, LabelAction, Message,
    ResolvedLabels, Summary,
};

/// Pipeline position of a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    Fetched,
    Extracted,
    Summarized,
    Classified,
    LabelsResolved,
    Applied,
    Skipped,
    Failed,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageState::Applied | MessageState::Skipped | MessageState::Failed
        )
    }

    /// Position in the forward order
    pub fn rank(self) -> u8 {
        match self {
            MessageState::Fetched => 0,
            MessageState::Extracted => 1,
            MessageState::Summarized => 2,
            MessageState::Classified => 3,
            MessageState::LabelsResolved => 4,
            MessageState::Applied => 5,
            MessageState::Skipped => 6,
            MessageState::Failed => 7,
        }
    }

    /// Terminal states accept nothing; Failed is reachable from any other state.
    /// Skipped is entered after label resolution, or straight from Fetched when
    /// extraction left nothing to classify.
    pub fn can_transition_to(self, next: MessageState) -> bool {
        use MessageState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (Fetched, Extracted)
                | (Fetched, Skipped)
                | (Extracted, Summarized)
                | (Summarized, Classified)
                | (Classified, LabelsResolved)
                | (LabelsResolved, Applied)
                | (LabelsResolved, Skipped)
        )
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: MessageState,
    pub at: DateTime<Utc>,
}

/// Everything the run produced for one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub subject: String,
    pub snippet: String,
    pub state: MessageState,
    pub history: Vec<StateChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted: Option<ExtractedContent>,
    pub summary: Option<Summary>,
    pub classification: Option<ClassificationResult>,
    pub resolved: Option<ResolvedLabels>,
    #[serde(default)]
    pub dropped: Vec<DroppedCategory>,
    pub action: Option<LabelAction>,
    #[serde(default)]
    pub cache_hit: bool,
    pub failure: Option<FailureCause>,
}

impl MessageRecord {
    pub fn new(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            timestamp: message.timestamp,
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            snippet: message.snippet.clone(),
            state: MessageState::Fetched,
            history: vec![StateChange {
                state: MessageState::Fetched,
                at: Utc::now(),
            }],
            extracted: None,
            summary: None,
            classification: None,
            resolved: None,
            dropped: Vec::new(),
            action: None,
            cache_hit: false,
            failure: None,
        }
    }

    /// Move to `next`, rejecting regressions and moves out of terminal states
    pub fn advance(&mut self, next: MessageState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(LabellerError::StateError(format!(
                "message {}: illegal transition {} -> {}",
                self.message_id, self.state, next
            )));
        }
        tracing::debug!("message {}: {} -> {}", self.message_id, self.state, next);
        self.state = next;
        self.history.push(StateChange {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Terminal failure with the error recorded as the cause
    pub fn fail(&mut self, error: &LabellerError) -> Result<()> {
        self.advance(MessageState::Failed)?;
        self.failure = Some(FailureCause::from(error));
        Ok(())
    }

    /// Skip with an optional cause
    pub fn skip(&mut self, cause: Option<&LabellerError>) -> Result<()> {
        self.advance(MessageState::Skipped)?;
        self.failure = cause.map(FailureCause::from);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Copy without the extracted content
    pub fn without_extracted(&self) -> Self {
        Self {
            extracted: None,
            ..self.clone()
        }
    }
}

/// Checkpoint of the latest run, shown by the `status` command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dry_run: bool,
    pub messages_fetched: usize,
    pub messages_applied: usize,
    pub messages_skipped: usize,
    pub messages_failed: usize,
    pub cache_hits: usize,
    pub labels_created: Vec<String>,
    pub failed_message_ids: Vec<String>,
    pub completed: bool,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
            dry_run,
            messages_fetched: 0,
            messages_applied: 0,
            messages_skipped: 0,
            messages_failed: 0,
            cache_hits: 0,
            labels_created: Vec::new(),
            failed_message_ids: Vec::new(),
            completed: false,
        }
    }

    /// Fold a terminal message record into the counters
    pub fn record(&mut self, record: &MessageRecord) {
        match record.state {
            MessageState::Applied => self.messages_applied += 1,
            MessageState::Skipped => self.messages_skipped += 1,
            MessageState::Failed => {
                self.messages_failed += 1;
                self.failed_message_ids.push(record.message_id.clone());
            }
            _ => {}
        }
        if record.cache_hit {
            self.cache_hits += 1;
        }
        self.updated_at = Utc::now();
    }

    /// Save state to disk
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::debug!("Saved run state to {:?}", path);
        Ok(())
    }

    /// Load state from disk, None when no run has been recorded yet
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            tracing::info!("No run state found at {:?}", path);
            return Ok(None);
        }

        let json = tokio::fs::read_to_string(path).await?;
        let state: Self = serde_json::from_str(&json)?;

        tracing::info!(
            "Loaded run state: run_id={}, fetched={}, completed={}",
            state.run_id,
            state.messages_fetched,
            state.completed
        );

        Ok(Some(state))
    }

    /// Mark as completed and save
    pub async fn complete(&mut self, path: &Path) -> Result<()> {
        self.completed = true;
        self.updated_at = Utc::now();
        self.save(path).await?;
        tracing::info!("Run {} completed", self.run_id);
        Ok(())
    }
}
