//! Run artifacts on disk
//!
//! Layout under the output directory:
//!
//! ```text
//! <run_id>/run.json
//! <run_id>/messages/<message_id>.json
//! <run_id>/emails_<timestamp>.json           (save_steps only)
//! <run_id>/summaries_<timestamp>.json        (save_steps only)
//! <run_id>/classifications_<timestamp>.json  (save_steps only)
//! <run_id>/report.md
//! ```

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{LabellerError, Result};
use crate::state::{MessageRecord, RunState};

/// Persists per-message records and run summaries
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Write one terminal message record. Each message is written once.
    async fn save_message(&self, run_id: &str, record: &MessageRecord) -> Result<()>;

    /// Write the intermediate step files for the whole batch
    async fn save_steps(&self, run_id: &str, records: &[MessageRecord]) -> Result<()>;

    async fn save_run(&self, run: &RunState) -> Result<()>;
}

pub struct FileResultStore {
    root: PathBuf,
    save_steps: bool,
}

#[derive(Serialize)]
struct EmailStep<'a> {
    id: &'a str,
    timestamp: String,
    sender: &'a str,
    subject: &'a str,
    snippet: &'a str,
    content: Option<&'a str>,
}

#[derive(Serialize)]
struct ClassificationStep<'a> {
    id: &'a str,
    subject: &'a str,
    categories: &'a [String],
    labels: Vec<String>,
    state: String,
}

impl FileResultStore {
    pub fn new(root: impl Into<PathBuf>, save_steps: bool) -> Self {
        Self {
            root: root.into(),
            save_steps,
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Write the Markdown report and return its path
    pub async fn save_report(&self, run_id: &str, markdown: &str) -> Result<PathBuf> {
        let dir = self.run_dir(run_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("report.md");
        tokio::fs::write(&path, markdown).await?;
        info!("Saved report to {:?}", path);
        Ok(path)
    }

    async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(path, json).await?;
        debug!("Wrote {:?}", path);
        Ok(())
    }
}

/// Message ids are provider-assigned; keep only filename-safe characters
fn file_stem(message_id: &str) -> String {
    message_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn save_message(&self, run_id: &str, record: &MessageRecord) -> Result<()> {
        let dir = self.run_dir(run_id).join("messages");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", file_stem(&record.message_id)));

        let json = if self.save_steps {
            serde_json::to_vec_pretty(record)?
        } else {
            serde_json::to_vec_pretty(&record.without_extracted())?
        };

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => LabellerError::StateError(format!(
                    "record for message {} already written in run {}",
                    record.message_id, run_id
                )),
                _ => LabellerError::IoError(e),
            })?;
        file.write_all(&json).await?;
        file.flush().await?;
        Ok(())
    }

    async fn save_steps(&self, run_id: &str, records: &[MessageRecord]) -> Result<()> {
        if !self.save_steps {
            return Ok(());
        }
        let dir = self.run_dir(run_id);
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");

        let emails: Vec<EmailStep> = records
            .iter()
            .map(|r| EmailStep {
                id: &r.message_id,
                timestamp: r.timestamp.to_rfc3339(),
                sender: &r.sender,
                subject: &r.subject,
                snippet: &r.snippet,
                content: r.extracted.as_ref().map(|e| e.text.as_str()),
            })
            .collect();
        self.write_json(&dir.join(format!("emails_{}.json", stamp)), &emails)
            .await?;

        let summaries: Vec<_> = records.iter().filter_map(|r| r.summary.as_ref()).collect();
        self.write_json(&dir.join(format!("summaries_{}.json", stamp)), &summaries)
            .await?;

        let classifications: Vec<ClassificationStep> = records
            .iter()
            .filter_map(|r| {
                r.classification.as_ref().map(|c| ClassificationStep {
                    id: &r.message_id,
                    subject: &r.subject,
                    categories: &c.categories,
                    labels: r.resolved.as_ref().map(|l| l.names()).unwrap_or_default(),
                    state: r.state.to_string(),
                })
            })
            .collect();
        self.write_json(
            &dir.join(format!("classifications_{}.json", stamp)),
            &classifications,
        )
        .await?;

        info!("Saved step files for {} messages to {:?}", records.len(), dir);
        Ok(())
    }

    async fn save_run(&self, run: &RunState) -> Result<()> {
        self.write_json(&self.run_dir(&run.run_id).join("run.json"), run)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentMode, ExtractedContent, Message};
    use crate::state::MessageState;
    use tempfile::TempDir;

    fn record(id: &str) -> MessageRecord {
        let message = Message {
            id: id.to_string(),
            timestamp: Utc::now(),
            sender: "billing@power.example".to_string(),
            subject: "March bill".to_string(),
            body: None,
            snippet: "Your bill is due".to_string(),
        };
        let mut record = MessageRecord::new(&message);
        record.extracted = Some(ExtractedContent {
            message_id: id.to_string(),
            text: "Your bill is due".to_string(),
            entities: vec![],
            mode: ContentMode::Snippet,
            truncated: false,
        });
        record.advance(MessageState::Extracted).unwrap();
        record
    }

    #[tokio::test]
    async fn test_message_record_written_once() {
        let dir = TempDir::new().unwrap();
        let store = FileResultStore::new(dir.path(), false);
        let rec = record("18c1");

        store.save_message("run-1", &rec).await.unwrap();
        let path = dir.path().join("run-1/messages/18c1.json");
        let json = tokio::fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["message_id"], "18c1");
        // extracted text is only kept with save_steps
        assert!(value.get("extracted").is_none());

        let again = store.save_message("run-1", &rec).await;
        assert!(matches!(again, Err(LabellerError::StateError(_))));
    }

    #[tokio::test]
    async fn test_save_steps_keeps_extracted_and_writes_step_files() {
        let dir = TempDir::new().unwrap();
        let store = FileResultStore::new(dir.path(), true);
        let rec = record("a/b");

        store.save_message("run-2", &rec).await.unwrap();
        let json = tokio::fs::read_to_string(dir.path().join("run-2/messages/a_b.json"))
            .await
            .unwrap();
        assert!(json.contains("\"extracted\""));

        store.save_steps("run-2", &[rec]).await.unwrap();
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path().join("run-2")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert!(names.iter().any(|n| n.starts_with("emails_")));
        assert!(names.iter().any(|n| n.starts_with("summaries_")));
        assert!(names.iter().any(|n| n.starts_with("classifications_")));
    }

    #[tokio::test]
    async fn test_save_steps_disabled_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = FileResultStore::new(dir.path(), false);
        store.save_steps("run-3", &[record("m1")]).await.unwrap();
        assert!(!dir.path().join("run-3").exists());
    }

    #[tokio::test]
    async fn test_save_run_and_report() {
        let dir = TempDir::new().unwrap();
        let store = FileResultStore::new(dir.path(), false);
        let run = RunState::new("run-4", true);

        store.save_run(&run).await.unwrap();
        let loaded = RunState::load(&dir.path().join("run-4/run.json"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.run_id, "run-4");

        let path = store.save_report("run-4", "# Report\n").await.unwrap();
        assert!(path.ends_with("run-4/report.md"));
    }
}
