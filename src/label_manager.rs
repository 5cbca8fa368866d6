//! Label registry and reconciliation of classifier output against it
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::client::{LabelInfo, MailboxClient};
use crate::error::{LabellerError, Result};
use crate::models::{
    ClassificationResult, DropReason, DroppedCategory, LabelRef, LabelSource, ResolvedLabels,
};

const MAX_LABEL_NAME_CHARS: usize = 100;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static INVALID_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s/\-&.']").unwrap());
static SLASH_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*/[\s/]*").unwrap());

// Gmail rejects user labels with these names
const RESERVED_NAMES: &[&str] = &[
    "inbox",
    "spam",
    "trash",
    "unread",
    "starred",
    "important",
    "sent",
    "draft",
    "drafts",
    "chat",
    "chats",
    "all mail",
    "scheduled",
    "snoozed",
];

/// Where the run's candidate labels come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelMode {
    Predefined(Vec<String>),
    AccountSourced { create: bool },
}

impl LabelMode {
    pub fn allows_creation(&self) -> bool {
        matches!(self, LabelMode::AccountSourced { create: true })
    }
}

/// Comparison key: trimmed, case-folded, inner whitespace collapsed
pub fn normalize_label_name(name: &str) -> String {
    WHITESPACE
        .replace_all(name.trim(), " ")
        .to_lowercase()
}

/// Clean up a model-proposed name so Gmail accepts it as a new label
///
/// - Invalid characters become spaces, whitespace runs collapse
/// - Leading, trailing and repeated slashes are removed
/// - The result is cut to 100 characters on a char boundary
pub fn sanitize_label_name(name: &str) -> Result<String> {
    let cleaned = INVALID_CHARS.replace_all(name.trim(), " ");
    let cleaned = SLASH_RUNS.replace_all(&cleaned, "/");
    let cleaned = WHITESPACE.replace_all(&cleaned, " ");
    let mut sanitized = cleaned
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    if sanitized.chars().count() > MAX_LABEL_NAME_CHARS {
        sanitized = sanitized.chars().take(MAX_LABEL_NAME_CHARS).collect();
        sanitized = sanitized.trim_end_matches(['/', ' ']).to_string();
    }

    if sanitized.is_empty() {
        return Err(LabellerError::LabelResolution(format!(
            "label name '{}' is empty after sanitizing",
            name
        )));
    }
    Ok(sanitized)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEntry {
    pub name: String,
    pub key: String,
    pub source: LabelSource,
    pub provider_id: Option<String>,
    pub created_in_run: bool,
}

impl LabelEntry {
    fn to_ref(&self) -> LabelRef {
        LabelRef {
            name: self.name.clone(),
            key: self.key.clone(),
            source: self.source,
            provider_id: self.provider_id.clone(),
        }
    }
}

/// Labels known to the run, keyed by normalized name
///
/// Entries are only ever added. A provider id is filled in once the label
/// exists in the mailbox.
#[derive(Debug, Clone, Default)]
pub struct LabelRegistry {
    entries: Vec<LabelEntry>,
    index: HashMap<String, usize>,
    // Parents of nested labels created in the mailbox; never classification targets
    parents: HashMap<String, String>,
    // Normalized system label names seen in the mailbox
    system: HashSet<String>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the predefined list, with provider ids taken from any
    /// mailbox label of the same normalized name
    pub fn predefined(names: &[String], account: &[LabelInfo]) -> Self {
        let existing: HashMap<String, &LabelInfo> = account
            .iter()
            .map(|label| (normalize_label_name(&label.name), label))
            .collect();

        let mut registry = Self::new();
        for name in names {
            let key = normalize_label_name(name);
            if registry.index.contains_key(&key) {
                warn!("Duplicate predefined label '{}' ignored", name);
                continue;
            }
            registry.insert(LabelEntry {
                name: name.trim().to_string(),
                provider_id: existing.get(&key).map(|label| label.id.clone()),
                key,
                source: LabelSource::Predefined,
                created_in_run: false,
            });
        }
        registry
    }

    /// Registry of the mailbox's user labels; system labels are left out
    pub fn from_account(account: &[LabelInfo]) -> Self {
        let mut registry = Self::new();
        registry.system = account
            .iter()
            .filter(|label| !label.is_user())
            .map(|label| normalize_label_name(&label.name))
            .collect();
        for label in account.iter().filter(|label| label.is_user()) {
            let key = normalize_label_name(&label.name);
            if registry.index.contains_key(&key) {
                continue;
            }
            registry.insert(LabelEntry {
                name: label.name.clone(),
                key,
                source: LabelSource::AccountSourced,
                provider_id: Some(label.id.clone()),
                created_in_run: false,
            });
        }
        registry
    }

    pub fn for_mode(mode: &LabelMode, account: &[LabelInfo]) -> Self {
        let registry = match mode {
            LabelMode::Predefined(names) => Self::predefined(names, account),
            LabelMode::AccountSourced { .. } => Self::from_account(account),
        };
        info!("Label registry loaded with {} labels", registry.len());
        registry
    }

    fn insert(&mut self, entry: LabelEntry) -> usize {
        let position = self.entries.len();
        self.index.insert(entry.key.clone(), position);
        self.entries.push(entry);
        position
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Look up by any spelling that normalizes to a known label
    pub fn get(&self, name: &str) -> Option<&LabelEntry> {
        self.position(&normalize_label_name(name))
            .map(|position| &self.entries[position])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True for names Gmail keeps for its own labels
    pub fn is_reserved(&self, name: &str) -> bool {
        let key = normalize_label_name(name);
        RESERVED_NAMES.contains(&key.as_str())
            || key.starts_with("category_")
            || self.system.contains(&key)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Names of labels created in the mailbox during this run
    pub fn created_in_run(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.created_in_run && e.provider_id.is_some())
            .map(|e| e.name.clone())
            .collect()
    }

    /// Make sure every label exists in the mailbox and return their ids in order.
    /// Missing labels (and missing parents of nested names) are created.
    pub async fn ensure_created(
        &mut self,
        labels: &[LabelRef],
        mailbox: &dyn MailboxClient,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(labels.len());

        for label in labels {
            let position = self.position(&label.key).ok_or_else(|| {
                LabellerError::LabelResolution(format!(
                    "label '{}' is not in the registry",
                    label.name
                ))
            })?;

            if let Some(id) = &self.entries[position].provider_id {
                ids.push(id.clone());
                continue;
            }

            let name = self.entries[position].name.clone();
            if name.contains('/') {
                self.ensure_parent_labels(&name, mailbox).await?;
            }

            info!("Creating label: {}", name);
            let id = mailbox.create_label(&name).await.map_err(|e| {
                LabellerError::MailboxApply(format!("Failed to create label '{}': {}", name, e))
            })?;

            let entry = &mut self.entries[position];
            entry.provider_id = Some(id.clone());
            entry.created_in_run = true;
            info!("Created label '{}' with ID: {}", name, id);
            ids.push(id);
        }

        Ok(ids)
    }

    /// For "Bills/Power/Electric", make sure "Bills" and "Bills/Power" exist
    async fn ensure_parent_labels(
        &mut self,
        label_name: &str,
        mailbox: &dyn MailboxClient,
    ) -> Result<()> {
        let parts: Vec<&str> = label_name.split('/').collect();

        for i in 1..parts.len() {
            let parent_path = parts[..i].join("/");
            let key = normalize_label_name(&parent_path);

            let known = self
                .position(&key)
                .and_then(|p| self.entries[p].provider_id.as_ref())
                .is_some()
                || self.parents.contains_key(&key);
            if known {
                continue;
            }

            debug!("Creating parent label: {}", parent_path);
            let id = mailbox.create_label(&parent_path).await.map_err(|e| {
                LabellerError::MailboxApply(format!(
                    "Failed to create parent label '{}': {}",
                    parent_path, e
                ))
            })?;

            match self.position(&key) {
                Some(p) => {
                    self.entries[p].provider_id = Some(id);
                    self.entries[p].created_in_run = true;
                }
                None => {
                    self.parents.insert(key, id);
                }
            }
        }

        Ok(())
    }
}

/// Outcome of reconciling one classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub resolved: ResolvedLabels,
    pub dropped: Vec<DroppedCategory>,
    /// Names added to the registry by this call
    pub added: Vec<String>,
}

/// Maps raw category strings onto registry labels
#[derive(Debug, Clone)]
pub struct LabelReconciler {
    mode: LabelMode,
    max_labels: usize,
}

impl LabelReconciler {
    pub fn new(mode: LabelMode, max_labels: usize) -> Self {
        Self {
            mode,
            max_labels: max_labels.max(1),
        }
    }

    /// Resolve categories in first-appearance order, deduplicated by
    /// normalized name and capped at `max_labels`
    pub fn reconcile(
        &self,
        result: &ClassificationResult,
        registry: &mut LabelRegistry,
    ) -> Reconciliation {
        let mut seen = HashSet::new();
        let mut labels = Vec::new();
        let mut dropped = Vec::new();
        let mut added = Vec::new();

        for raw in &result.categories {
            let key = normalize_label_name(raw);
            if key.is_empty() {
                dropped.push(drop_category(raw, DropReason::InvalidName));
                continue;
            }
            if seen.contains(&key) {
                continue;
            }
            if labels.len() >= self.max_labels {
                let already_resolved = registry
                    .position(&key)
                    .map(|p| labels.iter().any(|l: &LabelRef| l.key == registry.entries[p].key))
                    .unwrap_or(false);
                if !already_resolved {
                    dropped.push(drop_category(raw, DropReason::OverCap));
                }
                continue;
            }

            let position = match (registry.position(&key), &self.mode) {
                (Some(position), _) => position,
                (None, LabelMode::Predefined(_)) => {
                    dropped.push(drop_category(raw, DropReason::NotPredefined));
                    continue;
                }
                (None, LabelMode::AccountSourced { create: false }) => {
                    dropped.push(drop_category(raw, DropReason::NotInAccount));
                    continue;
                }
                (None, LabelMode::AccountSourced { create: true }) => {
                    match sanitize_label_name(raw) {
                        Ok(clean) if registry.is_reserved(&clean) => {
                            dropped.push(drop_category(raw, DropReason::Reserved));
                            continue;
                        }
                        Ok(clean) => {
                            let clean_key = normalize_label_name(&clean);
                            match registry.position(&clean_key) {
                                Some(position) => position,
                                None => {
                                    debug!("Registering new label '{}'", clean);
                                    added.push(clean.clone());
                                    registry.insert(LabelEntry {
                                        name: clean,
                                        key: clean_key,
                                        source: LabelSource::AccountSourced,
                                        provider_id: None,
                                        created_in_run: true,
                                    })
                                }
                            }
                        }
                        Err(_) => {
                            dropped.push(drop_category(raw, DropReason::InvalidName));
                            continue;
                        }
                    }
                }
            };

            seen.insert(key);
            let entry = &registry.entries[position];
            if labels.iter().all(|l: &LabelRef| l.key != entry.key) {
                labels.push(entry.to_ref());
            }
        }

        for drop in &dropped {
            warn!(
                "message {}: dropped category '{}' ({:?})",
                result.message_id, drop.raw, drop.reason
            );
        }

        Reconciliation {
            resolved: ResolvedLabels {
                message_id: result.message_id.clone(),
                labels,
            },
            dropped,
            added,
        }
    }
}

fn drop_category(raw: &str, reason: DropReason) -> DroppedCategory {
    DroppedCategory {
        raw: raw.to_string(),
        reason,
    }
}
