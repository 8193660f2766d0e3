//! CLI command definitions for trajforge.
//!
//! `run` drives a generation run; `status` summarizes an existing
//! checkpoint log.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::checkpoint::{JsonlCheckpointStore, RunLock};
use crate::pipeline::{Orchestrator, RunConfig};
use crate::scheduler::{CheckpointStats, RunSummary, ShutdownSignal};

/// Multi-turn tool-calling trajectory generator.
#[derive(Parser)]
#[command(name = "trajforge")]
#[command(about = "Generate tool-calling agent trajectories with checkpointed, resumable runs")]
#[command(version)]
#[command(
    long_about = "trajforge drives a language model through tool-calling rollouts over a dataset of prompts.\n\nFinished trajectories are appended to a JSON Lines checkpoint log, so an interrupted run can be resumed with --resume.\n\nExample usage:\n  trajforge run --dataset prompts.jsonl --model openai/gpt-4o-mini --workers 8 --checkpoint out.jsonl"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Generate trajectories for a dataset of prompts.
    #[command(alias = "gen")]
    Run(RunArgs),

    /// Show counts from an existing checkpoint log.
    Status(StatusArgs),
}

/// Arguments for the `run` command. Flags override the config file and
/// `TRAJFORGE_*` environment variables.
#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Dataset of prompts (JSON Lines or a JSON array).
    #[arg(short, long)]
    pub dataset: Option<PathBuf>,

    /// YAML file with category weights and toolsets.
    #[arg(long)]
    pub distribution: Option<PathBuf>,

    /// Checkpoint log path.
    #[arg(short = 'o', long)]
    pub checkpoint: Option<PathBuf>,

    /// Continue an existing checkpoint log, skipping finished tasks.
    #[arg(long)]
    pub resume: bool,

    /// Model identifier sent to the completion endpoint.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint.
    #[arg(long)]
    pub api_base: Option<String>,

    /// API key (can also be set via OPENAI_API_KEY or OPENROUTER_API_KEY env var).
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// System prompt text.
    #[arg(long, conflicts_with = "system_prompt_file")]
    pub system_prompt: Option<String>,

    /// File whose contents become the system prompt.
    #[arg(long)]
    pub system_prompt_file: Option<PathBuf>,

    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Maximum trajectories executing at once.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Model turns per trajectory before truncation.
    #[arg(long)]
    pub max_turns: Option<u32>,

    /// Completion attempts per model turn, first try included.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Delay before the first retry, in milliseconds.
    #[arg(long)]
    pub retry_base_delay_ms: Option<u64>,

    /// Cap on any single retry delay, in milliseconds.
    #[arg(long)]
    pub retry_max_delay_ms: Option<u64>,

    /// Per-call completion timeout in seconds.
    #[arg(long)]
    pub completion_timeout: Option<u64>,

    /// Per-call tool timeout in seconds.
    #[arg(long)]
    pub tool_timeout: Option<u64>,

    /// Sampler seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Sample only this many tasks.
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Stop dispatching once this many tokens have been consumed.
    #[arg(long)]
    pub token_budget: Option<u64>,

    /// Pace completion requests to this rate.
    #[arg(long)]
    pub requests_per_minute: Option<u32>,

    /// Seconds between progress log lines.
    #[arg(long)]
    pub progress_interval: Option<u64>,

    /// Write the run summary as JSON to this file.
    #[arg(long)]
    pub summary_out: Option<PathBuf>,

    /// Sample the dataset and print the plan without dispatching anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the `status` command.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Checkpoint log to inspect.
    #[arg(short = 'o', long)]
    pub checkpoint: PathBuf,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_generation_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
    }
}

/// Builds the run configuration: config file, then environment, then flags.
pub fn build_config(args: &RunArgs) -> anyhow::Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_yaml_file(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?,
        None => RunConfig::default(),
    };
    config.apply_env()?;
    apply_flags(&mut config, args)?;
    config.validate()?;
    Ok(config)
}

fn apply_flags(config: &mut RunConfig, args: &RunArgs) -> anyhow::Result<()> {
    if let Some(path) = &args.dataset {
        config.dataset_path = Some(path.clone());
    }
    if let Some(path) = &args.distribution {
        config.distribution = crate::pipeline::DistributionSource::File(path.clone());
    }
    if let Some(path) = &args.checkpoint {
        config.checkpoint_path = path.clone();
    }
    if args.resume {
        config.resume = true;
    }
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(base) = &args.api_base {
        config.api_base = base.clone();
    }
    if let Some(key) = &args.api_key {
        config.api_key = Some(key.clone());
    }
    if let Some(prompt) = &args.system_prompt {
        config.system_prompt = Some(prompt.clone());
    }
    if let Some(path) = &args.system_prompt_file {
        let prompt = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read system prompt {}", path.display()))?;
        config.system_prompt = Some(prompt.trim().to_string());
    }
    if let Some(temperature) = args.temperature {
        config.temperature = Some(temperature);
    }
    if let Some(max_tokens) = args.max_tokens {
        config.max_tokens = Some(max_tokens);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(max_turns) = args.max_turns {
        config.max_turns = max_turns;
    }
    if let Some(attempts) = args.max_attempts {
        config.retry.max_attempts = attempts;
    }
    if let Some(ms) = args.retry_base_delay_ms {
        config.retry.base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = args.retry_max_delay_ms {
        config.retry.max_delay = Duration::from_millis(ms);
    }
    if let Some(secs) = args.completion_timeout {
        config.completion_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.tool_timeout {
        config.tool_timeout = Duration::from_secs(secs);
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(limit) = args.limit {
        config.limit = Some(limit);
    }
    if let Some(tokens) = args.token_budget {
        config.token_budget = Some(tokens);
    }
    if let Some(rpm) = args.requests_per_minute {
        config.requests_per_minute = Some(rpm);
    }
    if let Some(secs) = args.progress_interval {
        config.progress_interval = Duration::from_secs(secs);
    }
    Ok(())
}

async fn run_generation_command(args: RunArgs) -> anyhow::Result<()> {
    let config = build_config(&args)?;
    let orchestrator = Orchestrator::new(config);

    if args.dry_run {
        let prepared = orchestrator.prepare().await?;
        println!("Loaded {} tasks, sampled {}", prepared.loaded, prepared.plan.len());
        for (bucket, count) in &prepared.plan.counts {
            println!("  {:<20} {}", bucket, count);
        }
        for shortfall in &prepared.plan.shortfalls {
            println!(
                "  shortfall: {} requested {} available {}",
                shortfall.category, shortfall.requested, shortfall.available
            );
        }
        return Ok(());
    }

    let shutdown = orchestrator.shutdown_signal();
    let signal_task = tokio::spawn(wait_for_interrupt(shutdown));

    let result = orchestrator.run().await;
    signal_task.abort();
    let summary = result?;

    print_summary(&summary);
    if let Some(path) = &args.summary_out {
        write_summary(path, &summary).await?;
        info!(path = %path.display(), "Wrote run summary");
    }
    Ok(())
}

/// Triggers `shutdown` on the first Ctrl-C.
async fn wait_for_interrupt(shutdown: ShutdownSignal) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("Interrupt received, finishing in-flight calls and stopping dispatch");
            shutdown.trigger();
        }
        Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Run summary");
    println!("  input:         {}", summary.total_input);
    println!("  skipped:       {}", summary.skipped_as_checkpointed);
    println!("  dispatched:    {}", summary.dispatched);
    println!("  completed:     {}", summary.completed);
    println!("  truncated:     {}", summary.truncated);
    println!("  failed:        {}", summary.failed);
    println!("  interrupted:   {}", summary.interrupted);
    println!("  not dispatched: {}", summary.not_dispatched);
    println!("  tokens:        {}", summary.total_tokens);
    println!("  elapsed:       {:.1}s", summary.elapsed.as_secs_f64());
    for shortfall in &summary.shortfalls {
        println!(
            "  shortfall:     {} ({} of {} available)",
            shortfall.category, shortfall.available, shortfall.requested
        );
    }
}

async fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let json = serde_json::to_string_pretty(summary)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("failed to write summary {}", path.display()))?;
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    if !args.checkpoint.exists() {
        anyhow::bail!("Checkpoint log not found: {}", args.checkpoint.display());
    }
    let records = JsonlCheckpointStore::read_records(&args.checkpoint)
        .await
        .with_context(|| format!("failed to read {}", args.checkpoint.display()))?;
    let stats = CheckpointStats::from_records(&records);
    let holder = RunLock::holder(&args.checkpoint);

    if args.json {
        let mut value = serde_json::to_value(&stats)?;
        value["locked_by"] = serde_json::json!(holder);
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Checkpoint: {}", args.checkpoint.display());
    println!("  records:   {}", stats.total);
    println!("  completed: {}", stats.completed);
    println!("  truncated: {}", stats.truncated);
    println!("  failed:    {}", stats.failed);
    for (category, count) in &stats.by_category {
        println!("  {:<20} {}", category, count);
    }
    if let Some(pid) = holder {
        println!("  locked by running process {}", pid);
    }
    Ok(())
}
