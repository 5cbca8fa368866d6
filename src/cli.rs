//! Command-line interface

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth;
use crate::cache::ClassificationCache;
use crate::client::{MailboxClient, ProductionGmailClient};
use crate::config::{Config, RunContext, RunOverrides};
use crate::error::{LabellerError, Result};
use crate::gateway::ModelGateway;
use crate::models::LabelAction;
use crate::orchestrator::{ProgressSink, RunOrchestrator, RunOutcome, RunSignal};
use crate::state::{MessageRecord, MessageState};
use crate::store::FileResultStore;

#[derive(Parser, Debug)]
#[command(name = "gmail-labeller")]
#[command(version)]
#[command(about = "Summarize and label unread Gmail messages with a language model", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    /// Path to OAuth2 credentials file
    #[arg(long, default_value = "credentials.json", global = true)]
    pub credentials: PathBuf,

    /// Path to token cache file
    #[arg(long, default_value = ".gmail-labeller/token.json", global = true)]
    pub token_cache: PathBuf,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate with Gmail API
    Auth {
        /// Force re-authentication even if token exists
        #[arg(long)]
        force: bool,
    },

    /// Summarize, classify and label unread messages
    Run(RunArgs),

    /// List the mailbox's user labels
    Labels,

    /// Show the latest run checkpoint
    Status,

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Maximum number of unread messages to process
    #[arg(long)]
    pub max_emails: Option<usize>,

    /// Only messages received in the last N days
    #[arg(long, conflicts_with_all = ["date_from", "date_to"])]
    pub days_old: Option<u32>,

    /// Window start (YYYY-MM-DD), requires --date-to
    #[arg(long, requires = "date_to")]
    pub date_from: Option<String>,

    /// Window end (YYYY-MM-DD, inclusive), requires --date-from
    #[arg(long, requires = "date_from")]
    pub date_to: Option<String>,

    /// Summarize the full body instead of using the snippet
    #[arg(long)]
    pub use_full_content: bool,

    /// Model for summaries (`model` or `provider:model`)
    #[arg(long)]
    pub summary_model: Option<String>,

    /// Model for classification (`model` or `provider:model`)
    #[arg(long)]
    pub classify_model: Option<String>,

    /// Classify against the mailbox's existing user labels
    #[arg(long)]
    pub use_user_labels: bool,

    /// Allow creating labels the mailbox does not have yet
    #[arg(long)]
    pub create_labels: bool,

    /// Apply labels (the default is a dry run)
    #[arg(long)]
    pub apply: bool,

    /// Write intermediate step files
    #[arg(long)]
    pub save_steps: bool,

    /// Print a per-message table after the run
    #[arg(long)]
    pub print: bool,

    /// Messages processed concurrently
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Stop starting new work after this many seconds
    #[arg(long)]
    pub deadline_secs: Option<u64>,

    /// Ignore and do not update the classification cache
    #[arg(long)]
    pub no_cache: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> RunOverrides {
        RunOverrides {
            max_emails: self.max_emails,
            days_old: self.days_old,
            date_from: self.date_from.clone(),
            date_to: self.date_to.clone(),
            use_full_content: self.use_full_content,
            summary_model: self.summary_model.clone(),
            classify_model: self.classify_model.clone(),
            use_user_labels: self.use_user_labels,
            create_labels: self.create_labels,
            apply: self.apply,
            save_steps: self.save_steps,
            print: self.print,
            max_concurrent: self.concurrency,
            run_deadline_secs: self.deadline_secs,
            no_cache: self.no_cache,
        }
    }
}

/// Truncate a string to max_len characters, adding "..." if truncated
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
    bar: Mutex<Option<ProgressBar>>,
}

impl ProgressReporter {
    pub fn new(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
            bar: Mutex::new(None),
        }
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }

    /// Clear the per-message bar once the batch is done
    pub fn finish(&self) {
        if let Ok(mut bar) = self.bar.lock() {
            if let Some(pb) = bar.take() {
                pb.finish_and_clear();
            }
        }
    }
}

impl ProgressSink for ProgressReporter {
    fn on_fetched(&self, total: usize) {
        let pb = self.add_progress_bar(total as u64, "Labelling messages...");
        if let Ok(mut bar) = self.bar.lock() {
            *bar = Some(pb);
        }
    }

    fn on_message(&self, record: &MessageRecord) {
        if let Ok(bar) = self.bar.lock() {
            if let Some(pb) = bar.as_ref() {
                pb.set_message(truncate_string(&record.subject, 40));
                pb.inc(1);
            }
        }
    }
}

/// Labels shown for a record: applied or would-be-applied names
fn record_labels(record: &MessageRecord) -> Vec<String> {
    match &record.action {
        Some(LabelAction::DryRun { labels }) => labels.clone(),
        _ => record
            .resolved
            .as_ref()
            .map(|r| r.names())
            .unwrap_or_default(),
    }
}

/// Post-run summary in Markdown
pub struct RunReport<'a> {
    pub outcome: &'a RunOutcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunReport<'_> {
    pub fn to_markdown(&self) -> String {
        let run = &self.outcome.run;
        let mut md = String::new();

        if run.dry_run {
            md.push_str("# Labelling Report (DRY RUN)\n\n");
            md.push_str("> **DRY RUN MODE** - No labels were applied. This report shows what WOULD happen.\n\n");
        } else {
            md.push_str("# Labelling Report\n\n");
        }
        md.push_str(&format!(
            "Generated: {}\n\n",
            self.completed_at.format("%Y-%m-%d %H:%M:%S")
        ));

        let duration = (self.completed_at - self.started_at).num_seconds();
        md.push_str("## Summary\n\n");
        md.push_str(&format!("- **Run ID:** {}\n", run.run_id));
        md.push_str(&format!("- **Messages fetched:** {}\n", run.messages_fetched));
        md.push_str(&format!("- **Labelled:** {}\n", run.messages_applied));
        md.push_str(&format!("- **Skipped:** {}\n", run.messages_skipped));
        md.push_str(&format!("- **Failed:** {}\n", run.messages_failed));
        md.push_str(&format!("- **Cache hits:** {}\n", run.cache_hits));
        md.push_str(&format!(
            "- **Processing time:** {} minutes {} seconds\n",
            duration / 60,
            duration % 60
        ));
        if self.outcome.cancelled {
            md.push_str("- **Cancelled:** yes, remaining messages were not processed\n");
        }
        md.push('\n');

        let mut by_label: BTreeMap<String, Vec<&MessageRecord>> = BTreeMap::new();
        for record in &self.outcome.records {
            for label in record_labels(record) {
                by_label.entry(label).or_default().push(record);
            }
        }

        md.push_str("## Labels\n\n");
        if by_label.is_empty() {
            md.push_str("_No labels were proposed._\n\n");
        }
        for (label, records) in &by_label {
            md.push_str(&format!("### {} ({} messages)\n\n", label, records.len()));
            md.push_str("| Sender | Subject |\n");
            md.push_str("|--------|---------|\n");
            for record in records.iter().take(10) {
                md.push_str(&format!(
                    "| {} | {} |\n",
                    record.sender.replace('|', "\\|"),
                    truncate_string(&record.subject, 60).replace('|', "\\|")
                ));
            }
            md.push('\n');
        }

        if !run.labels_created.is_empty() {
            md.push_str("## Labels Created\n\n");
            for label in &run.labels_created {
                md.push_str(&format!("- `{}`\n", label));
            }
            md.push('\n');
        }

        let failed: Vec<&MessageRecord> = self
            .outcome
            .records
            .iter()
            .filter(|r| r.state == MessageState::Failed || r.failure.is_some())
            .collect();
        if !failed.is_empty() {
            md.push_str("## Problems\n\n");
            md.push_str("| Message | State | Cause |\n");
            md.push_str("|---------|-------|-------|\n");
            for record in failed {
                let cause = record
                    .failure
                    .as_ref()
                    .map(|f| f.message.replace('|', "\\|"))
                    .unwrap_or_default();
                md.push_str(&format!(
                    "| {} | {} | {} |\n",
                    record.message_id, record.state, cause
                ));
            }
            md.push('\n');
        }

        if run.dry_run {
            md.push_str("---\n\n");
            md.push_str("_To apply these labels, run the command again with `--apply`._\n");
        }

        md
    }
}

/// Per-message table, newest first
pub fn format_table(records: &[MessageRecord]) -> String {
    let mut records: Vec<&MessageRecord> = records.iter().collect();
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut out = String::new();
    out.push_str(&format!(
        "{:<17} | {:<50} | {:<100} | {}\n",
        "Timestamp", "Subject", "Snippet", "Labels"
    ));
    out.push_str(&format!("{}\n", "-".repeat(190)));
    for record in records {
        let labels = record_labels(record);
        out.push_str(&format!(
            "{:<17} | {:<50} | {:<100} | {}\n",
            record.timestamp.format("%Y-%m-%d %H:%M"),
            truncate_string(&record.subject, 50),
            truncate_string(&record.snippet.replace('\n', " "), 100),
            if labels.is_empty() {
                "-".to_string()
            } else {
                labels.join(", ")
            }
        ));
    }
    out
}

fn print_summary(outcome: &RunOutcome) {
    let run = &outcome.run;
    println!();
    println!("Run {}{}", run.run_id, if run.dry_run { " (dry run)" } else { "" });
    println!("  Fetched:    {}", run.messages_fetched);
    println!("  Labelled:   {}", run.messages_applied);
    println!("  Skipped:    {}", run.messages_skipped);
    println!("  Failed:     {}", run.messages_failed);
    println!("  Cache hits: {}", run.cache_hits);
    if !run.labels_created.is_empty() {
        println!("  Created labels: {}", run.labels_created.join(", "));
    }
    if outcome.cancelled {
        println!("  Run was cancelled before all messages finished");
    }
}

#[cfg(feature = "ml")]
fn model_gateway(config: &Config) -> Result<Arc<dyn ModelGateway>> {
    Ok(Arc::new(crate::gateway::OpenAiGateway::from_config(&config.llm)?))
}

#[cfg(not(feature = "ml"))]
fn model_gateway(_config: &Config) -> Result<Arc<dyn ModelGateway>> {
    Err(LabellerError::ConfigError(
        "no model backend compiled in; rebuild with the `ml` feature".to_string(),
    ))
}

/// Load config, connect both backends and process one batch of unread mail
pub async fn run_labeller(
    cli: &Cli,
    args: &RunArgs,
    multi: MultiProgress,
    token: CancellationToken,
) -> Result<RunOutcome> {
    let reporter = Arc::new(ProgressReporter::new(multi));
    let started_at = Utc::now();

    let config_spinner = reporter.add_spinner("Loading configuration...");
    let mut config = Config::load(&cli.config).await?;
    config.apply_overrides(&args.overrides());
    let ctx = RunContext::from_config(&config)?;
    reporter.finish_spinner(&config_spinner, &format!("Configuration loaded from {:?}", cli.config));

    if ctx.dry_run {
        info!("Dry run: labels will not be applied (pass --apply to change this)");
    }

    let auth_spinner = reporter.add_spinner("Authenticating with Gmail API...");
    let hub = auth::connect(&cli.credentials, &cli.token_cache).await?;
    reporter.finish_spinner(&auth_spinner, "Gmail API authenticated successfully");

    let mailbox: Arc<dyn MailboxClient> =
        Arc::new(ProductionGmailClient::new(hub, ctx.max_concurrent));
    let gateway = model_gateway(&config)?;
    let store = Arc::new(FileResultStore::new(&ctx.output_dir, ctx.save_steps));

    let mut orchestrator = RunOrchestrator::new(ctx.clone(), mailbox, gateway)
        .with_store(store.clone())
        .with_progress(reporter.clone());
    if ctx.cache_enabled {
        match ClassificationCache::open(&config.cache).await {
            Ok(cache) => orchestrator = orchestrator.with_cache(Arc::new(cache)),
            Err(e) => warn!("Classification cache unavailable, continuing without it: {}", e),
        }
    }

    let signal = RunSignal::new(token, ctx.run_deadline);
    let fetch_spinner = reporter.add_spinner("Fetching unread messages...");
    let result = orchestrator.run(&signal).await;
    fetch_spinner.finish_and_clear();
    reporter.finish();
    let mut outcome = result?;

    outcome.run.complete(&config.execution.state_file).await?;

    print_summary(&outcome);
    if ctx.print {
        println!();
        print!("{}", format_table(&outcome.records));
    }

    let report = RunReport {
        outcome: &outcome,
        started_at,
        completed_at: Utc::now(),
    };
    let path = store.save_report(&ctx.run_id, &report.to_markdown()).await?;
    println!("\nReport saved to {:?}", path);

    Ok(outcome)
}

/// Print the mailbox's user labels
pub async fn list_labels(cli: &Cli) -> Result<()> {
    let config = Config::load(&cli.config).await?;
    let hub = auth::connect(&cli.credentials, &cli.token_cache).await?;
    let client = ProductionGmailClient::new(hub, config.execution.max_concurrent);

    let mut labels: Vec<_> = client
        .list_labels()
        .await?
        .into_iter()
        .filter(|l| l.is_user())
        .collect();
    labels.sort_by(|a, b| a.name.cmp(&b.name));

    if labels.is_empty() {
        println!("No user labels found");
        return Ok(());
    }
    println!("{} user labels:", labels.len());
    for label in labels {
        println!("  {:<40} {}", label.name, label.id);
    }
    Ok(())
}

/// Print the checkpoint of the latest run
pub async fn show_status(cli: &Cli) -> Result<()> {
    let config = Config::load(&cli.config).await?;
    let Some(run) = crate::state::RunState::load(&config.execution.state_file).await? else {
        println!("No runs recorded yet");
        return Ok(());
    };

    println!("Run ID:      {}", run.run_id);
    println!("Started:     {}", run.started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Updated:     {}", run.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Mode:        {}", if run.dry_run { "dry run" } else { "apply" });
    println!("Completed:   {}", run.completed);
    println!("Fetched:     {}", run.messages_fetched);
    println!("Labelled:    {}", run.messages_applied);
    println!("Skipped:     {}", run.messages_skipped);
    println!("Failed:      {}", run.messages_failed);
    println!("Cache hits:  {}", run.cache_hits);
    if !run.labels_created.is_empty() {
        println!("Created:     {}", run.labels_created.join(", "));
    }
    if !run.failed_message_ids.is_empty() {
        println!("Failed ids:  {}", run.failed_message_ids.join(", "));
    }
    Ok(())
}

/// Write an example config, refusing to overwrite unless forced
pub async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(LabellerError::ConfigError(format!(
            "{:?} already exists; pass --force to overwrite",
            output
        )));
    }
    Config::create_example(output).await?;
    println!("Example configuration written to {:?}", output);
    Ok(())
}
