#![deny(unsafe_code)]

//! repodoc CLI: documentation runs, replays and document chat.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use repodoc_config::AppConfig;
use repodoc_core::agent::replay_run;
use repodoc_core::retrieval::IndexOrigin;
use repodoc_core::{
    AgentSettings, CancelToken, ChatSession, DocAgent, DocumentationArtifact, IndexStore,
    ModelHub, RetrievalIndex, RetrievalSettings, RunContext, RunLog, RunLogHandle, Snapshot,
};
use tracing::{Level, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Entries kept in memory before a run directory is attached.
const RUN_LOG_CAPACITY: usize = 10_000;

/// repodoc: generate documentation for a repository with a tool-using model.
#[derive(Parser)]
#[command(name = "repodoc", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "repodoc.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Document a repository snapshot.
    Generate {
        /// Identifier of the run, used in the run directory name.
        #[arg(long)]
        task_id: String,

        /// Root directory of the repository snapshot.
        #[arg(long)]
        snapshot: PathBuf,

        /// Revision the snapshot was taken at.
        #[arg(long)]
        revision: Option<String>,

        /// Model id from the catalog (defaults to `default_model`).
        #[arg(long)]
        model: Option<String>,

        /// Parent directory for run directories (defaults to `output.dir`).
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Override `agent.max_steps`.
        #[arg(long)]
        max_steps: Option<u32>,
    },

    /// Ask questions about a folder of documents.
    Chat {
        /// Folder holding the documents to index.
        #[arg(long)]
        document_folder: PathBuf,

        /// Model id from the catalog (defaults to `default_model`).
        #[arg(long)]
        model: Option<String>,

        /// Discard the persisted index and build it again.
        #[arg(long)]
        rebuild: bool,
    },

    /// Re-run a recorded run against a snapshot using its recorded replies.
    Replay {
        /// Run directory to replay.
        #[arg(long)]
        run_dir: PathBuf,

        /// Root directory of the repository snapshot.
        #[arg(long)]
        snapshot: PathBuf,

        /// Parent directory for the new run directory (defaults to `output.dir`).
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, found) = load_config(&cli.config).await?;
    let run_log = init_tracing(cli.verbose, &config.logging.level);
    if !found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Generate {
            task_id,
            snapshot,
            revision,
            model,
            output_dir,
            max_steps,
        } => {
            let args = GenerateArgs {
                task_id,
                snapshot,
                revision,
                model,
                output_dir,
                max_steps,
            };
            cmd_generate(&config, args, &run_log).await?
        }
        Commands::Chat {
            document_folder,
            model,
            rebuild,
        } => cmd_chat(&config, &document_folder, model, rebuild).await?,
        Commands::Replay {
            run_dir,
            snapshot,
            output_dir,
        } => cmd_replay(&config, &run_dir, &snapshot, output_dir, &run_log).await?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
    }

    Ok(())
}

/// Install the stderr formatter and the run log layer.
///
/// `RUST_LOG` wins over `-v`, which wins over `logging.level`. The run log
/// always captures INFO and above.
fn init_tracing(verbose: u8, configured: &str) -> RunLogHandle {
    let level = match verbose {
        0 => configured,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let run_log = RunLog::new(RUN_LOG_CAPACITY, Level::INFO);
    let handle = run_log.handle();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .with(run_log)
        .init();
    handle
}

struct GenerateArgs {
    task_id: String,
    snapshot: PathBuf,
    revision: Option<String>,
    model: Option<String>,
    output_dir: Option<PathBuf>,
    max_steps: Option<u32>,
}

async fn cmd_generate(config: &AppConfig, args: GenerateArgs, run_log: &RunLogHandle) -> Result<()> {
    let model = resolve_model(config, args.model)?;
    let snapshot = Snapshot::new(&args.snapshot, args.revision)
        .with_context(|| format!("cannot open snapshot {}", args.snapshot.display()))?;
    let parent = args
        .output_dir
        .unwrap_or_else(|| PathBuf::from(&config.output.dir));

    let hub = Arc::new(ModelHub::from_config(config));
    let agent = DocAgent::new(hub, AgentSettings::from_config(config));
    let mut ctx = RunContext::new(
        args.task_id,
        snapshot,
        &parent,
        model,
        args.max_steps.unwrap_or(config.agent.max_steps),
    )
    .with_failure_cap(config.agent.max_consecutive_failures);
    agent.preflight(&ctx).context("invalid run")?;

    let run_dir = create_run_dir(&parent, &ctx.task_id, Local::now()).await?;
    let log_path = run_log.attach(&run_dir)?;
    info!(run_dir = %run_dir.display(), log = %log_path.display(), "run directory created");
    ctx.output_dir = run_dir;

    let cancel = CancelToken::new();
    spawn_ctrl_c(cancel.clone());

    let outcome = agent.run(ctx, &cancel).await;
    run_log.detach();
    match outcome {
        Ok(artifact) => {
            print_summary(&artifact);
            Ok(())
        }
        Err(failure) => {
            print_summary(&failure.artifact);
            Err(anyhow::Error::new(failure).context("documentation run failed"))
        }
    }
}

async fn cmd_chat(
    config: &AppConfig,
    folder: &Path,
    model: Option<String>,
    rebuild: bool,
) -> Result<()> {
    let model = resolve_model(config, model)?;
    let hub = Arc::new(ModelHub::from_config(config));
    let store = Arc::new(IndexStore::new(&config.retrieval.store_dir));
    let settings = RetrievalSettings::from_config(config);

    let (mut index, mut origin) = RetrievalIndex::open(
        Arc::clone(&hub),
        Arc::clone(&store),
        folder,
        &model,
        settings.clone(),
    )
    .await?;
    if rebuild && origin == IndexOrigin::Reused {
        index.invalidate().await?;
        (index, origin) = RetrievalIndex::open(hub, store, folder, &model, settings).await?;
    }
    info!(
        index = %index.key().dir.display(),
        chunks = index.index().len(),
        built = origin == IndexOrigin::Built,
        "index ready"
    );

    let session = ChatSession::new(index);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let answered = session.run(stdin, tokio::io::stdout()).await?;
    info!(answered, "chat session ended");
    Ok(())
}

async fn cmd_replay(
    config: &AppConfig,
    run_dir: &Path,
    snapshot: &Path,
    output_dir: Option<PathBuf>,
    run_log: &RunLogHandle,
) -> Result<()> {
    let snapshot = Snapshot::new(snapshot, None)
        .with_context(|| format!("cannot open snapshot {}", snapshot.display()))?;
    let name = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string());
    let parent = output_dir.unwrap_or_else(|| PathBuf::from(&config.output.dir));
    let target = create_run_dir(&parent, &format!("replay-{name}"), Local::now()).await?;
    run_log.attach(&target)?;
    info!(from = %run_dir.display(), into = %target.display(), "replaying run");

    let outcome = replay_run(
        run_dir,
        snapshot,
        &target,
        AgentSettings::from_config(config),
        &config.models,
    )
    .await;
    run_log.detach();
    let artifact = outcome?;
    print_summary(&artifact);
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load the config file, or the defaults when it does not exist.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if path.exists() {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("cannot load {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

fn resolve_model(config: &AppConfig, requested: Option<String>) -> Result<String> {
    let model = requested.unwrap_or_else(|| config.default_model.clone());
    if config.model(&model).is_none() {
        let known: Vec<&str> = config.models.iter().map(|m| m.id.as_str()).collect();
        bail!("unknown model {model:?}; the catalog has {}", known.join(", "));
    }
    Ok(model)
}

/// `<parent>/<task_id>_<YYYY-MM-DD_HH-MM-SS>`.
fn run_dir_name(task_id: &str, started: DateTime<Local>) -> String {
    format!("{task_id}_{}", started.format("%Y-%m-%d_%H-%M-%S"))
}

async fn create_run_dir(parent: &Path, task_id: &str, started: DateTime<Local>) -> Result<PathBuf> {
    let dir = parent.join(run_dir_name(task_id, started));
    if dir.exists() {
        bail!("run directory {} already exists", dir.display());
    }
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("cannot create {}", dir.display()))?;
    Ok(dir)
}

fn spawn_ctrl_c(cancel: CancelToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received, stopping after the current step");
                cancel.cancel();
            }
            Err(err) => error!(error = %err, "cannot listen for Ctrl-C"),
        }
    });
}

fn print_summary(artifact: &DocumentationArtifact) {
    let status = if artifact.complete { "complete" } else { "partial" };
    println!(
        "{} documentation: {} section(s) in {} step(s)",
        status,
        artifact.sections.len(),
        artifact.steps
    );
    for title in artifact.titles() {
        println!("  - {title}");
    }
    println!(
        "model calls: {}, tokens: {} in / {} out, cost: {:.6}",
        artifact.totals.calls,
        artifact.totals.prompt_tokens,
        artifact.totals.completion_tokens,
        artifact.totals.cost
    );
    println!("written to {}", artifact.documentation_path().display());
}
