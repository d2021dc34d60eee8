//! Rubric Grader CLI
//!
//! The `grader` command grades a pasted code submission against per-file
//! rubrics using a panel of model evaluators.
//!
//! ## Commands
//!
//! - `evaluate`: grade a submission and write feedback.json
//! - `rubrics check`: validate a rubrics file
//! - `cache stats` / `cache clear`: inspect or empty the on-disk cache

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use grader_core::{
    render_summary_md, write_feedback_json, BatchReport, CacheBackend, CacheLayer, CacheSite,
    CachedRubricStore, ConsensusPolicy, FsCacheBackend, GraderConfig, MemoryCacheBackend,
    MemoryRubricStore, ModelClient, OpenAiClient, Orchestrator, RubricSet, StoredRubric,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

const DEFAULT_CONFIG: &str = "grader.toml";
const DEFAULT_CACHE_DIR: &str = ".grader-cache";

#[derive(Parser)]
#[command(name = "grader")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Consensus grading of code submissions against rubrics", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: ./grader.toml when present)
    #[arg(long, global = true, env = "GRADER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a submission and write feedback
    Evaluate(EvaluateArgs),

    /// Work with rubric files
    Rubrics {
        #[command(subcommand)]
        action: RubricsAction,
    },

    /// Inspect or clear the on-disk cache
    Cache {
        /// Cache directory
        #[arg(long, default_value = DEFAULT_CACHE_DIR)]
        cache_dir: PathBuf,

        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct EvaluateArgs {
    /// Submission text: `<name>.py` / `Download` / code blocks
    #[arg(short, long)]
    input: PathBuf,

    /// Rubrics file (JSON, keyed by file name)
    #[arg(short, long)]
    rubrics: PathBuf,

    /// Where to write feedback.json
    #[arg(short, long, default_value = "feedback.json")]
    output: PathBuf,

    /// Consensus policy: double_pass, adjudicated or adjudicated:<n>
    #[arg(long)]
    policy: Option<ConsensusPolicy>,

    /// Files graded concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Whole-batch deadline in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Persist the cache under this directory (in-memory when omitted)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Print the full report as JSON instead of a summary
    #[arg(long)]
    report_json: bool,
}

#[derive(Subcommand)]
enum RubricsAction {
    /// Validate a rubrics file and list what it grades
    Check {
        /// Rubrics file
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry counts per cache site
    Stats,

    /// Remove cached entries
    Clear {
        /// Only clear one site: api, db or llm
        #[arg(long)]
        prefix: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    grader_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Evaluate(args) => {
            let config = resolve_config(cli.config.as_deref(), &args)?;
            let model = OpenAiClient::new(config.model.clone())
                .context("Failed to configure model client")?;
            let report = cmd_evaluate(&config, Arc::new(model), &args).await?;
            print_report(&report, args.report_json)
        }
        Commands::Rubrics {
            action: RubricsAction::Check { path },
        } => cmd_rubrics_check(&path),
        Commands::Cache { cache_dir, action } => match action {
            CacheAction::Stats => cmd_cache_stats(&cache_dir).await,
            CacheAction::Clear { prefix } => cmd_cache_clear(&cache_dir, prefix.as_deref()).await,
        },
    }
}

/// Config file (explicit, or `grader.toml` if present), then environment,
/// then command-line flags.
fn resolve_config(path: Option<&Path>, args: &EvaluateArgs) -> Result<GraderConfig> {
    let base = match path {
        Some(path) => GraderConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None if Path::new(DEFAULT_CONFIG).exists() => GraderConfig::load(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("Failed to load {}", DEFAULT_CONFIG))?,
        None => GraderConfig::default(),
    };
    let mut config = base.merge_env().context("Invalid GRADER_* environment")?;

    if let Some(policy) = args.policy {
        config.policy = policy;
    }
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    if let Some(timeout) = args.timeout {
        config.batch_timeout_secs = Some(timeout);
    }
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn open_backend(cache_dir: Option<&Path>) -> Result<Arc<dyn CacheBackend>> {
    match cache_dir {
        Some(dir) => {
            let backend = FsCacheBackend::new(dir)
                .with_context(|| format!("Failed to open cache at {:?}", dir))?;
            Ok(Arc::new(backend))
        }
        None => Ok(Arc::new(MemoryCacheBackend::new())),
    }
}

async fn cmd_evaluate(
    config: &GraderConfig,
    model: Arc<dyn ModelClient>,
    args: &EvaluateArgs,
) -> Result<BatchReport> {
    let text = std::fs::read_to_string(&args.input)
        .with_context(|| format!("Failed to read submission {:?}", args.input))?;
    let rubrics = RubricSet::load(&args.rubrics)
        .with_context(|| format!("Failed to load rubrics {:?}", args.rubrics))?;

    let backend = open_backend(config.cache_dir.as_deref())?;
    let store = MemoryRubricStore::with_rubrics(rubrics.iter().map(|(_, r)| StoredRubric::from(r)));
    let rubric_store = CachedRubricStore::new(
        Arc::new(store),
        CacheLayer::new(Arc::clone(&backend), CacheSite::Query)
            .with_ttl(config.cache.for_site(CacheSite::Query)),
    );
    let orchestrator = Orchestrator::from_config(config, model, backend)?;

    info!(
        input = %args.input.display(),
        policy = %config.policy,
        workers = config.max_workers,
        "grading submission"
    );
    let report = orchestrator.evaluate_submission(&text, &rubric_store).await?;

    write_feedback_json(&args.output, &report)?;
    info!(output = %args.output.display(), "feedback written");
    Ok(report)
}

fn print_report(report: &BatchReport, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", render_summary_md(report));
    }
    Ok(())
}

fn cmd_rubrics_check(path: &Path) -> Result<()> {
    let rubrics =
        RubricSet::load(path).with_context(|| format!("Invalid rubrics file {:?}", path))?;
    if rubrics.is_empty() {
        bail!("{:?} defines no rubrics", path);
    }
    for (name, rubric) in rubrics.iter() {
        println!(
            "{}: {} points across {} criteria",
            name,
            rubric.total_points(),
            rubric.criteria().len()
        );
    }
    let digest = rubrics.digest().context("Failed to digest rubrics")?;
    println!("{} rubrics OK (digest {})", rubrics.len(), &digest[..12]);
    Ok(())
}

async fn cmd_cache_stats(cache_dir: &Path) -> Result<()> {
    let backend = FsCacheBackend::new(cache_dir)
        .with_context(|| format!("Failed to open cache at {:?}", cache_dir))?;
    let stats = backend.stats().await.context("Failed to read cache stats")?;

    println!("Cache: {}", cache_dir.display());
    println!("Live entries:    {}", stats.live_entries);
    println!("Expired entries: {}", stats.expired_entries);
    if stats.corrupt_entries > 0 {
        println!("Corrupt entries: {}", stats.corrupt_entries);
    }
    for site in CacheSite::ALL {
        let count = stats.entries_by_prefix.get(site.prefix()).copied().unwrap_or(0);
        println!("  {:<4} {}", site.prefix(), count);
    }
    Ok(())
}

async fn cmd_cache_clear(cache_dir: &Path, prefix: Option<&str>) -> Result<()> {
    if let Some(p) = prefix {
        if CacheSite::from_prefix(p).is_none() {
            bail!("Unknown cache prefix '{}' (expected api, db or llm)", p);
        }
    }
    let backend = FsCacheBackend::new(cache_dir)
        .with_context(|| format!("Failed to open cache at {:?}", cache_dir))?;
    let removed = backend.clear(prefix).await.context("Failed to clear cache")?;
    println!(
        "Removed {} entries{}",
        removed,
        prefix.map(|p| format!(" with prefix '{}'", p)).unwrap_or_default()
    );
    Ok(())
}
