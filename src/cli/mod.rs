//! Command-line interface for termtagger.
//!
//! Provides commands for annotating record batches, serving the interactive
//! API, listing terminologies, checking backends and managing the cache.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::adapters::list_terminologies;
use crate::config::{load_config, ResolvedConfig};
use crate::core::{LookupCache, Orchestrator};
use crate::domain::{AnnotationOutcome, LanguageTag, OutcomeStatus, Record};
use crate::server::{self, ServerState};

/// termtagger - Annotate free-text records with terminology matches
#[derive(Parser, Debug)]
#[command(name = "termtagger")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to the nearest .termtagger/config.yaml)
    #[arg(short, long, global = true, env = "TERMTAGGER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Annotate a JSON array of records
    Annotate {
        /// Input file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output file for annotated records (stdout if not provided)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write per-record outcomes (matches, failures, validation) here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Only annotate this many records (overrides config)
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Concurrent record tasks (overrides config)
        #[arg(short, long)]
        threads: Option<usize>,
    },

    /// Start the interactive HTTP API
    Serve {
        /// Address to bind to (overrides config)
        #[arg(short, long)]
        address: Option<String>,
    },

    /// List terminologies offered by the terminology service
    Terminologies,

    /// Check extraction backends and terminology sources
    Check,

    /// Show resolved configuration (debug)
    Config,

    /// Inspect or maintain the persisted lookup cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Summarize cache entries
    Show {
        /// List every entry
        #[arg(short, long)]
        all: bool,
    },

    /// Drop stale entries and rewrite the cache file
    Prune,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;

        match self.command {
            Commands::Annotate {
                input,
                output,
                report,
                max_iterations,
                threads,
            } => annotate(config, input, output, report, max_iterations, threads).await,
            Commands::Serve { address } => serve(config, address).await,
            Commands::Terminologies => show_terminologies(&config).await,
            Commands::Check => check(&config).await,
            Commands::Config => show_config(&config),
            Commands::Cache { command } => match command {
                CacheCommands::Show { all } => show_cache(&config, all).await,
                CacheCommands::Prune => prune_cache(&config).await,
            },
        }
    }
}

/// Read the input as a JSON array of records
fn read_records(input_file: Option<&Path>) -> Result<Vec<Record>> {
    let input = if let Some(path) = input_file {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    };

    serde_json::from_str(&input).context("Input must be a JSON array of objects")
}

fn write_json<T: serde::Serialize + ?Sized>(value: &T, output_file: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    match output_file {
        Some(path) => std::fs::write(path, json).with_context(|| format!("Failed to write: {}", path.display())),
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}", json).context("Failed to write to stdout")
        }
    }
}

/// Annotate a batch of records
async fn annotate(
    mut config: ResolvedConfig,
    input_file: Option<PathBuf>,
    output_file: Option<PathBuf>,
    report_file: Option<PathBuf>,
    max_iterations: Option<usize>,
    threads: Option<usize>,
) -> Result<()> {
    if max_iterations.is_some() {
        config.settings.annotation.max_iterations = max_iterations;
    }
    if threads.is_some() {
        config.settings.max_threads = threads;
    }
    config.settings.validate_batch()?;

    let records = read_records(input_file.as_deref())?;
    let orchestrator = Orchestrator::from_config(&config).await?;

    let stop = orchestrator.stop_signal();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing records in flight");
            stop.stop();
        }
    });

    let outcomes = orchestrator.run(records).await;
    interrupt.abort();

    let annotated: Vec<&Record> = outcomes.iter().map(|o| &o.annotated).collect();
    write_json(&annotated, output_file.as_deref())?;
    if let Some(path) = &report_file {
        write_json(&outcomes, Some(path))?;
    }

    orchestrator.shutdown().await?;
    print_summary(&orchestrator, &outcomes);
    Ok(())
}

/// Run summary on stderr, stdout carries the records
fn print_summary(orchestrator: &Orchestrator, outcomes: &[AnnotationOutcome]) {
    let stats = orchestrator.statistics();
    let failed = outcomes.iter().filter(|o| o.status == OutcomeStatus::Failure).count();

    eprintln!();
    eprintln!("Records:     {} ({} failed)", outcomes.len(), failed);
    eprintln!(
        "Phrases:     {} ({} matched, {} missed, {} unplaced)",
        stats.phrases_total, stats.matched, stats.missed, stats.unplaced
    );
    eprintln!(
        "Cache:       {} hits, {} misses ({:.0}%)",
        stats.cache_hits,
        stats.cache_misses,
        stats.hit_rate() * 100.0
    );
    if stats.validation_failures > 0 {
        eprintln!("Validation:  {} failures", stats.validation_failures);
    }
    for (source, errors) in &stats.source_errors {
        eprintln!("Source {}: {} errors", source, errors);
    }
}

/// Serve the interactive API
async fn serve(config: ResolvedConfig, address: Option<String>) -> Result<()> {
    config.settings.validate()?;

    let address = address.unwrap_or_else(|| config.settings.server.address.clone());
    let language = LanguageTag::new(&config.settings.annotation.default_language);
    let orchestrator = Arc::new(Orchestrator::from_config(&config).await?);

    let state = ServerState::new(
        Arc::clone(&orchestrator),
        config.settings.ts_sources.base_url.clone(),
        language,
    );
    server::run(&address, state).await?;

    info!("Server stopped");
    orchestrator.shutdown().await
}

/// List terminologies of the configured service
async fn show_terminologies(config: &ResolvedConfig) -> Result<()> {
    let client = reqwest::Client::new();
    let ids = list_terminologies(&client, &config.settings.ts_sources.base_url).await?;

    if ids.is_empty() {
        println!("No terminologies found");
        return Ok(());
    }
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}

/// Health of every backend and source
async fn check(config: &ResolvedConfig) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config).await?;
    let report = orchestrator.health_check().await;

    println!("{:<40} {:<8} {}", "COMPONENT", "STATUS", "DETAIL");
    println!("{}", "-".repeat(75));
    for status in &report {
        println!(
            "{:<40} {:<8} {}",
            status.component,
            if status.healthy { "ok" } else { "FAILED" },
            status.detail.as_deref().unwrap_or("")
        );
    }

    let unhealthy = report.iter().filter(|s| !s.healthy).count();
    if unhealthy > 0 {
        anyhow::bail!("{} component(s) unhealthy", unhealthy);
    }
    Ok(())
}

/// Show resolved configuration
fn show_config(config: &ResolvedConfig) -> Result<()> {
    let mut settings = config.settings.clone();
    if settings.extraction.ollama.api_key.is_some() {
        settings.extraction.ollama.api_key = Some("<redacted>".to_string());
    }

    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Home:        {}", config.home.display());
    println!("Cache:       {}", config.cache_path().display());
    println!("Statistics:  {}", config.statistics_path().display());
    println!();
    println!("Sources:");
    let specs = settings.ts_sources.source_specs();
    if specs.is_empty() {
        println!("  (none configured)");
    }
    for spec in specs {
        println!("  {} ({:?}, {:?})", spec.id, spec.scope, spec.shape);
    }
    println!();
    print!(
        "{}",
        serde_yaml::to_string(&settings).context("Failed to serialize settings")?
    );

    if let Err(e) = settings.validate() {
        println!();
        println!("Invalid configuration: {}", e);
    }
    Ok(())
}

async fn load_cache(config: &ResolvedConfig) -> Result<LookupCache> {
    let cache = &config.settings.cache;
    LookupCache::load(&config.cache_path(), cache.staleness(), cache.enabled).await
}

/// Summarize the persisted cache
async fn show_cache(config: &ResolvedConfig, all: bool) -> Result<()> {
    let cache = load_cache(config).await?;
    println!("Cache file: {}", config.cache_path().display());
    println!("Entries:    {}", cache.len());

    if all && !cache.is_empty() {
        println!();
        println!("{:<30} {:<6} {:<8} {:<25}", "PHRASE", "LANG", "MATCHES", "CREATED");
        println!("{}", "-".repeat(75));
        for entry in cache.entries() {
            println!(
                "{:<30} {:<6} {:<8} {:<25}",
                entry.key.phrase,
                entry.key.language.as_str(),
                entry.matches.len(),
                entry.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

/// Drop stale entries and rewrite the cache file
async fn prune_cache(config: &ResolvedConfig) -> Result<()> {
    let path = config.cache_path();
    let cache = load_cache(config).await?;
    let removed = cache.prune();
    let kept = cache.save(&path).await?;

    println!("Removed {} stale entries, {} kept", removed, kept);
    Ok(())
}
