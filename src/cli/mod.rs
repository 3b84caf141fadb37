//! Command-line interface for deepdive.
//!
//! Provides commands for running research sessions, checking session status,
//! listing sessions and stored artifacts, and showing the configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::adapters::{FabricReasoner, HttpSearchProvider};
use crate::config::{load_config, ResolvedConfig};
use crate::core::{
    BudgetGuard, CancelFlag, DocumentStore, FanoutSink, HypothesisEngine, ResearchOutcome,
    ResearchWorkflow, SessionJournal, StopPolicy, TracingSink,
};
use crate::dedup::DeduplicationEngine;
use crate::domain::{ArtifactId, ArtifactMetadata, SessionState};
use crate::index::{Embedder, MemoryIndex, OllamaEmbedder};
use crate::merge::MergeEngine;
use crate::store::FileDocumentStore;

/// deepdive - Multi-hop research with deduplicated, conflict-aware artifacts
#[derive(Parser, Debug)]
#[command(name = "deepdive")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Research a question and store the findings
    Research {
        /// The research question
        query: String,

        /// Artifact title (defaults to the question)
        #[arg(short, long)]
        title: Option<String>,

        /// Topic tags (repeatable)
        #[arg(long = "topic")]
        topics: Vec<String>,

        /// Why the artifact exists
        #[arg(long)]
        purpose: Option<String>,

        /// Override the configured hop limit
        #[arg(long)]
        max_hops: Option<u32>,

        /// Session budget in USD
        #[arg(long)]
        budget: Option<f64>,

        /// Run the session and decide, but do not store anything
        #[arg(long)]
        dry_run: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the status of a session
    Status {
        /// Session ID (UUID)
        session_id: String,
    },

    /// List recorded sessions
    Sessions {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List stored artifacts
    Artifacts {
        /// Filter by title or topic
        #[arg(short, long)]
        search: Option<String>,

        /// Maximum number of artifacts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Print a stored artifact
    Show {
        /// Artifact ID
        artifact_id: String,

        /// Print the raw JSON instead of markdown
        #[arg(long)]
        json: bool,
    },

    /// Show the resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = load_config()?;

        match self.command {
            Commands::Research {
                query,
                title,
                topics,
                purpose,
                max_hops,
                budget,
                dry_run,
                json,
            } => {
                let metadata = ArtifactMetadata {
                    title: title.unwrap_or_default(),
                    topics,
                    purpose: purpose.unwrap_or_default(),
                };
                run_research(&config, &query, metadata, max_hops, budget, dry_run, json).await
            }
            Commands::Status { session_id } => show_status(&config, &session_id).await,
            Commands::Sessions { limit } => list_sessions(&config, limit).await,
            Commands::Artifacts { search, limit } => list_artifacts(&config, search.as_deref(), limit).await,
            Commands::Show { artifact_id, json } => show_artifact(&config, &artifact_id, json).await,
            Commands::Config => show_config(&config),
        }
    }
}

/// Run a session, then store its findings
async fn run_research(
    config: &ResolvedConfig,
    query: &str,
    metadata: ArtifactMetadata,
    max_hops: Option<u32>,
    budget: Option<f64>,
    dry_run: bool,
    as_json: bool,
) -> Result<()> {
    let providers = &config.providers;
    let call_timeout = config.research.call_timeout();

    let reasoner = Arc::new(FabricReasoner::with_binary_path(
        providers.fabric_binary.clone(),
        providers.patterns.clone(),
        call_timeout,
    ));
    let search = Arc::new(HttpSearchProvider::new(providers.search_url.clone(), call_timeout));
    let embedder: Arc<dyn Embedder> = Arc::new(OllamaEmbedder::new(
        providers.embedding_url.clone(),
        providers.embedding_model.clone(),
        Duration::from_secs(30),
    ));

    let index = Arc::new(MemoryIndex::load(embedder.clone(), &config.index_path()).await?);
    let store = Arc::new(FileDocumentStore::new(config.artifacts_dir()));
    let journal = Arc::new(SessionJournal::new(config.sessions_dir()));
    let progress = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(journal);

    let engine = HypothesisEngine::new(
        search,
        reasoner,
        Arc::new(BudgetGuard::new(config.budget.clone())),
        config.research.clone(),
    )
    .with_progress(Arc::new(progress));

    let mut policy = StopPolicy::from_settings(&config.research);
    if let Some(max_hops) = max_hops {
        policy = policy.with_max_hops(max_hops);
    }
    if let Some(budget) = budget {
        policy = policy.with_budget(budget);
    }

    let workflow = ResearchWorkflow::new(
        engine,
        DeduplicationEngine::new(index.clone(), config.dedup.clone()),
        MergeEngine::new(embedder, config.merge.clone()),
        index.clone(),
        store,
        policy,
    );

    // Ctrl-C stops after the in-flight hop
    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[Cancelling after the current hop...]");
            on_interrupt.cancel();
        }
    });

    let outcome = workflow.research(query, metadata, &cancel).await?;

    let report = if dry_run {
        None
    } else {
        let report = workflow.save(&outcome).await?;
        if let Err(e) = index.save(&config.index_path()).await {
            warn!(error = %e, "Failed to save similarity index");
        }
        Some(report)
    };

    if as_json {
        let value = json!({
            "session_id": outcome.context.session_id,
            "stop_reason": outcome.context.stop_reason,
            "hops": outcome.context.current_hop(),
            "within_budget": outcome.within_budget,
            "synthesis": outcome.context.final_synthesis,
            "decision": outcome.decision,
            "artifact_id": report.as_ref().map(|r| r.artifact_id.clone()),
            "operation": report.as_ref().map(|r| r.operation),
            "conflicts": report.as_ref().map(|r| r.conflicts.clone()).unwrap_or_default(),
            "warnings": all_warnings(&outcome, report.as_ref().map(|r| r.warnings.as_slice())),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    print_outcome(&outcome);
    match report {
        Some(report) => {
            println!();
            println!("Artifact: {} ({})", report.artifact_id, report.operation);
            println!("Changes:  {}", report.diff);
            for conflict in &report.conflicts {
                println!(
                    "  ! {} [{:?}] in '{}': \"{}\" vs \"{}\"",
                    conflict.conflict_type, conflict.severity, conflict.section, conflict.existing, conflict.incoming
                );
            }
            print_warnings(&all_warnings(&outcome, Some(&report.warnings)));
        }
        None => {
            print_warnings(&outcome.warnings);
            eprintln!("\n[Dry run: nothing stored]");
        }
    }

    Ok(())
}

fn print_outcome(outcome: &ResearchOutcome) {
    let context = &outcome.context;
    if let Some(synthesis) = &context.final_synthesis {
        println!("# {}", context.query);
        println!();
        for finding in &synthesis.key_findings {
            println!("- {}", finding);
        }
        if !synthesis.remaining_gaps.is_empty() {
            println!("\nOpen questions:");
            for gap in &synthesis.remaining_gaps {
                println!("- {}", gap);
            }
        }
        println!();
        println!("Confidence: {:.2}", synthesis.confidence);
    }
    println!(
        "Session {}: {} hops, stopped: {}",
        context.session_id,
        context.current_hop(),
        context
            .stop_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "Decision: {} (confidence {:.2}) - {}",
        outcome.decision.action, outcome.decision.confidence, outcome.decision.rationale
    );
}

fn all_warnings(outcome: &ResearchOutcome, save_warnings: Option<&[String]>) -> Vec<String> {
    let mut warnings = outcome.warnings.clone();
    warnings.extend(save_warnings.unwrap_or_default().iter().cloned());
    warnings
}

fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    eprintln!();
    for warning in warnings {
        eprintln!("warning: {}", warning);
    }
}

/// Show the status of a session
async fn show_status(config: &ResolvedConfig, session_id_str: &str) -> Result<()> {
    let session_id = Uuid::parse_str(session_id_str)
        .with_context(|| format!("Invalid session ID: {}", session_id_str))?;

    let journal = SessionJournal::new(config.sessions_dir());
    let status = journal
        .status(session_id)
        .await?
        .with_context(|| format!("Session not found: {}", session_id))?;

    println!("Session ID: {}", status.session_id);
    println!("Query: {}", status.query);
    println!("State: {}", state_label(&status.state));
    println!("Started: {}", status.started_at);
    if let Some(completed) = status.completed_at {
        println!("Completed: {}", completed);
    }
    println!("Hops completed: {}", status.hops_completed);
    if let Some(confidence) = status.confidence {
        println!("Confidence: {:.2}", confidence);
    }
    if let Some(cost) = status.cost_usd {
        println!("Cost: ${:.4}", cost);
    }
    if status.budget_warnings > 0 {
        println!("Budget warnings: {}", status.budget_warnings);
    }

    Ok(())
}

fn state_label(state: &SessionState) -> String {
    match state {
        SessionState::Running => "running".to_string(),
        SessionState::Cancelling => "cancelling".to_string(),
        SessionState::Finished { reason: Some(reason) } => format!("finished ({})", reason),
        SessionState::Finished { reason: None } => "finished".to_string(),
    }
}

/// List recorded sessions, most recent first
async fn list_sessions(config: &ResolvedConfig, limit: usize) -> Result<()> {
    let journal = SessionJournal::new(config.sessions_dir());

    let mut sessions = Vec::new();
    for session_id in journal.list_sessions().await? {
        if let Some(status) = journal.status(session_id).await? {
            sessions.push(status);
        }
    }
    sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    sessions.truncate(limit);

    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }

    println!("{:<38} {:<28} {:<6} {:<40}", "SESSION ID", "STATE", "HOPS", "QUERY");
    println!("{}", "-".repeat(112));

    for status in sessions {
        println!(
            "{:<38} {:<28} {:<6} {:<40}",
            status.session_id,
            state_label(&status.state),
            status.hops_completed,
            truncate(&status.query, 40)
        );
    }

    Ok(())
}

/// List stored artifacts
async fn list_artifacts(config: &ResolvedConfig, search: Option<&str>, limit: usize) -> Result<()> {
    let store = FileDocumentStore::new(config.artifacts_dir());
    let catalog = store.catalog().await?;

    let mut items = match search {
        Some(query) => catalog.search(query),
        None => catalog.list(None),
    };
    items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    items.truncate(limit);

    if items.is_empty() {
        println!("No artifacts found");
        return Ok(());
    }

    println!("{:<18} {:<40} {:<6} {:<5} {:<20}", "ID", "TITLE", "CONF", "REV", "UPDATED");
    println!("{}", "-".repeat(92));

    for item in items {
        println!(
            "{:<18} {:<40} {:<6.2} {:<5} {:<20}",
            item.id,
            truncate(&item.title, 40),
            item.confidence,
            item.revision,
            item.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

/// Print a stored artifact
async fn show_artifact(config: &ResolvedConfig, artifact_id: &str, as_json: bool) -> Result<()> {
    let store = FileDocumentStore::new(config.artifacts_dir());
    let artifact = store.load(&ArtifactId::new(artifact_id)).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&artifact)?);
    } else {
        println!("{}", artifact.to_markdown());
    }
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!("deepdive configuration");
    println!();
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", config.home.display());
    println!("  Sessions:  {}", config.sessions_dir().display());
    println!("  Artifacts: {}", config.artifacts_dir().display());
    println!("  Index:     {}", config.index_path().display());
    println!();

    let research = &config.research;
    println!("Research:");
    println!("  Max hops:             {}", research.max_hops);
    println!("  Confidence target:    {:.2}", research.confidence_target);
    println!("  Early stop:           {:.2}", research.early_stop_confidence);
    println!("  Hypotheses per hop:   {}", research.max_hypotheses_per_hop);
    println!("  Evidence per item:    {}", research.max_evidence_per_hypothesis);
    println!("  Call timeout:         {}s", research.call_timeout_seconds);
    println!("  Retry attempts:       {}", research.retry_policy.max_attempts);
    println!();
    println!("Budget:");
    println!("  Session limit: ${:.2}", config.budget.session_limit_usd);
    println!("  Global limit:  ${:.2}", config.budget.global_limit_usd);
    println!("  Warn at:       {:.0}%", config.budget.warn_fraction * 100.0);
    println!();
    println!("Deduplication:");
    println!("  Update threshold: {:.2}", config.dedup.thresholds.update);
    println!("  Merge threshold:  {:.2}", config.dedup.thresholds.merge);
    println!(
        "  Weights:          topic {:.2} / content {:.2} / question {:.2}",
        config.dedup.weights.topic, config.dedup.weights.content, config.dedup.weights.question
    );
    println!("  Section match:    {:.2}", config.merge.section_match_threshold);
    println!();
    println!("Providers:");
    println!("  Fabric:     {}", config.providers.fabric_binary);
    println!("  Search:     {}", config.providers.search_url);
    println!(
        "  Embeddings: {} ({})",
        config.providers.embedding_url, config.providers.embedding_model
    );

    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
