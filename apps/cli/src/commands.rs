//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use knowtree_completion::{CompletionService, OpenRouterClient};
use knowtree_core::assembler::{load_tree, validate_run};
use knowtree_core::pipeline::{
    PipelineConfig, PipelineResult, ProgressReporter, explore_only, run_pipeline,
};
use knowtree_shared::{
    AppConfig, ExploreConfig, expand_tilde, init_config, load_config, validate_api_key,
};
use knowtree_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// KnowTree — explain a concept from its foundations up.
#[derive(Parser)]
#[command(
    name = "knowtree",
    version,
    about = "Build a prerequisite tree for a concept and turn it into an ordered explanation.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Explore, enrich and narrate a request, writing a run directory.
    Explain {
        /// What to explain, e.g. "how does a Fourier transform work".
        request: String,

        #[command(flatten)]
        explore: ExploreArgs,

        /// Parent directory for the run directory (defaults to config output_dir).
        #[arg(short, long)]
        out: Option<String>,

        /// Skip animation script generation.
        #[arg(long)]
        no_codegen: bool,

        /// Also generate an interactive Three.js page and module.
        #[arg(long)]
        threejs: bool,

        /// Use the request verbatim as the root concept.
        #[arg(long)]
        no_analyze: bool,

        /// Do not read or write the persistent concept cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Build and print the prerequisite tree only.
    Tree {
        /// Root concept.
        concept: String,

        #[command(flatten)]
        explore: ExploreArgs,

        /// Print the tree as JSON.
        #[arg(long)]
        json: bool,

        /// Do not read or write the persistent concept cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Validate a run directory and print its tree.
    Show {
        /// Run directory.
        path: PathBuf,
    },

    /// Persistent concept cache management.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// List recent runs.
    Runs {
        /// Number of runs to show.
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Exploration overrides shared by `explain` and `tree`.
#[derive(clap::Args, Debug, Clone, Default)]
pub(crate) struct ExploreArgs {
    /// Maximum tree depth (root is depth 0).
    #[arg(short = 'd', long)]
    pub max_depth: Option<u32>,

    /// Maximum completion calls in flight.
    #[arg(long)]
    pub fan_out: Option<u32>,
}

impl ExploreArgs {
    fn resolve(&self, config: &AppConfig) -> Result<ExploreConfig> {
        let mut explore = ExploreConfig::from(config);
        if let Some(depth) = self.max_depth {
            if depth == 0 {
                return Err(eyre!("--max-depth must be at least 1"));
            }
            explore.max_depth = depth;
        }
        if let Some(fan_out) = self.fan_out {
            explore.fan_out = fan_out.max(1) as usize;
        }
        Ok(explore)
    }
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Show cached entry counts.
    Stats,
    /// Remove cached entries.
    Clear {
        /// Only remove entries produced by this model.
        #[arg(long)]
        model: Option<String>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "knowtree=info",
        1 => "knowtree=debug",
        _ => "knowtree=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Explain {
            request,
            explore,
            out,
            no_codegen,
            threejs,
            no_analyze,
            no_cache,
        } => {
            let options = ExplainOptions {
                out,
                no_codegen,
                threejs,
                no_analyze,
                no_cache,
            };
            cmd_explain(&request, &explore, &options).await
        }
        Command::Tree {
            concept,
            explore,
            json,
            no_cache,
        } => cmd_tree(&concept, &explore, json, no_cache).await,
        Command::Show { path } => cmd_show(&path),
        Command::Cache { action } => match action {
            CacheAction::Stats => cmd_cache_stats().await,
            CacheAction::Clear { model } => cmd_cache_clear(model.as_deref()).await,
        },
        Command::Runs { limit } => cmd_runs(limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

fn completion_service(config: &AppConfig) -> Result<Arc<dyn CompletionService>> {
    let api_key = validate_api_key(config)?;
    Ok(Arc::new(OpenRouterClient::new(&config.completion, api_key)?))
}

/// Open the persistent store unless disabled by config or flag.
async fn open_store(config: &AppConfig, no_cache: bool) -> Result<Option<Arc<Storage>>> {
    if no_cache || !config.cache.persistent {
        return Ok(None);
    }
    let path = config.cache.resolve_path()?;
    Ok(Some(Arc::new(Storage::open(&path).await?)))
}

/// Read-only store for inspection commands; `None` if it was never created.
async fn open_store_readonly(config: &AppConfig) -> Result<Option<Storage>> {
    let path = config.cache.resolve_path()?;
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(Storage::open_readonly(&path).await?))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling run");
            child.cancel();
        }
    });
    token
}

// ---------------------------------------------------------------------------
// explain / tree
// ---------------------------------------------------------------------------

struct ExplainOptions {
    out: Option<String>,
    no_codegen: bool,
    threejs: bool,
    no_analyze: bool,
    no_cache: bool,
}

async fn cmd_explain(request: &str, explore: &ExploreArgs, options: &ExplainOptions) -> Result<()> {
    if request.trim().is_empty() {
        return Err(eyre!("request is empty"));
    }
    let config = load_config()?;
    let service = completion_service(&config)?;
    let store = open_store(&config, options.no_cache).await?;

    let output_root = match &options.out {
        Some(p) => PathBuf::from(p),
        None => expand_tilde(&config.defaults.output_dir),
    };

    let pipeline_config = PipelineConfig {
        request: request.to_string(),
        explore: explore.resolve(&config)?,
        analyze: config.defaults.analyze && !options.no_analyze,
        codegen: config.defaults.codegen && !options.no_codegen,
        threejs: config.defaults.threejs || options.threejs,
        output_root: Some(output_root),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    info!(
        request,
        model = %config.completion.model,
        max_depth = pipeline_config.explore.max_depth,
        "explaining"
    );

    let reporter = CliProgress::new();
    let result = run_pipeline(
        &pipeline_config,
        service,
        store,
        &reporter,
        cancel_on_ctrl_c(),
    )
    .await;
    reporter.finish();
    let result = result?;

    let stats = &result.stats;
    println!();
    println!("  Explanation ready!");
    println!("  Concept:     {}", result.target_concept);
    println!(
        "  Tree:        {} nodes, {} foundations, depth {}",
        stats.explore.nodes, stats.explore.foundations, stats.explore.max_depth_reached
    );
    println!("  Order:       {}", result.concept_order.join(" → "));
    match &result.narrative {
        Some(n) => println!(
            "  Narrative:   {} scenes, {}s",
            n.scene_count, n.total_duration_secs
        ),
        None => println!("  Narrative:   unavailable"),
    }
    for artifact in &result.artifacts {
        println!("  Script:      {} ({})", artifact.file_name, artifact.language);
    }
    for error in &stats.codegen_errors {
        println!("  Codegen:     failed, {error}");
    }
    println!(
        "  Calls:       {} ({} failed, {} cache hits)",
        stats.calls, stats.failed_calls, stats.explore.cache.hits
    );
    if let Some(path) = &result.output_path {
        println!("  Path:        {}", path.display());
    }
    println!("  Time:        {:.1}s", result.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_tree(concept: &str, explore: &ExploreArgs, json: bool, no_cache: bool) -> Result<()> {
    let config = load_config()?;
    let service = completion_service(&config)?;
    let store = open_store(&config, no_cache).await?;
    let explore = explore.resolve(&config)?;

    let reporter = CliProgress::new();
    let outcome = explore_only(
        concept,
        &explore,
        service,
        store,
        &reporter,
        cancel_on_ctrl_c(),
    )
    .await;
    reporter.finish();
    let outcome = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.tree)?);
    } else {
        print!("{}", outcome.tree.render());
        println!();
        println!(
            "  {} nodes, {} foundations, {} cache hits",
            outcome.stats.nodes, outcome.stats.foundations, outcome.stats.cache.hits
        );
        if outcome.stats.degraded > 0 {
            println!(
                "  {} nodes degraded to foundations after failed calls",
                outcome.stats.degraded
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// show / runs / cache
// ---------------------------------------------------------------------------

fn cmd_show(path: &Path) -> Result<()> {
    let manifest = validate_run(path)?;
    let tree = load_tree(path)?;

    println!();
    println!("  Run:      {}", manifest.id);
    println!("  Request:  {}", manifest.request);
    println!("  Concept:  {}", manifest.target_concept);
    println!("  Model:    {}", manifest.model);
    println!("  Created:  {}", manifest.created_at.to_rfc3339());
    println!("  Nodes:    {}", manifest.node_count);
    println!();
    print!("{}", tree.render());

    let degraded: Vec<_> = tree.iter().filter(|n| !n.diagnostics.is_empty()).collect();
    if !degraded.is_empty() {
        println!();
        println!("  Diagnostics:");
        for node in degraded {
            for d in &node.diagnostics {
                println!("    {}: {}", node.concept, d.message);
            }
        }
    }
    Ok(())
}

async fn cmd_runs(limit: u32) -> Result<()> {
    let config = load_config()?;
    let Some(store) = open_store_readonly(&config).await? else {
        println!("No runs recorded yet.");
        return Ok(());
    };

    let runs = store.list_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }
    for run in runs {
        let status = if run.finished_at.is_none() {
            "unfinished"
        } else if run.output_path.is_some() {
            "ok"
        } else {
            "failed"
        };
        println!(
            "{}  {:<10}  {}  ({})",
            run.started_at, status, run.target_concept, run.model_id
        );
        if let Some(path) = run.output_path {
            println!("    {path}");
        }
    }
    Ok(())
}

async fn cmd_cache_stats() -> Result<()> {
    let config = load_config()?;
    let Some(store) = open_store_readonly(&config).await? else {
        println!("Cache is empty.");
        return Ok(());
    };

    let counts = store.concept_counts().await?;
    if counts.is_empty() {
        println!("Cache is empty.");
    }
    for (kind, count) in counts {
        println!("  {kind:<14} {count}");
    }
    Ok(())
}

async fn cmd_cache_clear(model: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let path = config.cache.resolve_path()?;
    if !path.exists() {
        println!("Cache is empty.");
        return Ok(());
    }
    let store = Storage::open(&path).await?;
    let removed = store.clear_concepts(model).await?;
    println!("Removed {removed} cached entries.");
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    nodes: AtomicUsize,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self {
            spinner,
            nodes: AtomicUsize::new(0),
        }
    }

    fn finish(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn node_explored(&self, concept: &str, depth: u32, is_foundation: bool) {
        let n = self.nodes.fetch_add(1, Ordering::Relaxed) + 1;
        let marker = if is_foundation { " [foundation]" } else { "" };
        self.spinner
            .set_message(format!("Exploring [{n}] {concept} (depth {depth}){marker}"));
    }

    fn stage_progress(&self, stage: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Enriching: {stage} [{current}/{total}]"));
    }

    fn done(&self, _result: &PipelineResult) {
        self.spinner.finish_and_clear();
    }
}
