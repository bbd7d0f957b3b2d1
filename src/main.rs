use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use claude_foreman::config::ForemanConfig;
use claude_foreman::controller::ContinuousController;
use claude_foreman::error::{ForemanError, Result};
use claude_foreman::git::GitRunner;
use claude_foreman::limits::CircuitBreakerSet;
use claude_foreman::merge::GreenBranchManager;
use claude_foreman::planner::BacklogPlanner;
use claude_foreman::review::DiffReviewer;
use claude_foreman::store::Store;
use claude_foreman::worker::LocalBackend;
use claude_foreman::workspace::WorkspacePool;

#[derive(Parser)]
#[command(name = "claude-foreman", about = "Continuous self-driving development orchestrator")]
struct Cli {
    #[arg(long, global = true)]
    verbose: bool,

    /// Target repository (defaults to the current directory).
    #[arg(long, global = true)]
    target: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state directory and default configuration.
    Init,
    /// Run a mission against the target repository.
    Run {
        /// Natural-language objective for the mission.
        objective: String,
        /// Override the configured worker count.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Show recent missions.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            ExitCode::from(64)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("claude_foreman=debug")
    } else {
        EnvFilter::new("claude_foreman=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let target = match cli.target {
        Some(path) => tokio::fs::canonicalize(&path).await?,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Init => cmd_init(target).await,
        Commands::Run { objective, workers } => cmd_run(target, objective, workers).await,
        Commands::Status => cmd_status(target).await,
    }
}

async fn cmd_init(target: PathBuf) -> Result<ExitCode> {
    let mut config = ForemanConfig::default();
    config.target.path = target;
    let state_dir = config.target.state_dir();
    tokio::fs::create_dir_all(&state_dir).await?;
    config.save(&state_dir).await?;

    println!(
        "{} Initialized claude-foreman at {}",
        style("ok:").green().bold(),
        state_dir.display()
    );
    Ok(ExitCode::SUCCESS)
}

async fn cmd_run(target: PathBuf, objective: String, workers: Option<usize>) -> Result<ExitCode> {
    if !target.join(".git").exists() {
        return Err(ForemanError::Config(format!(
            "{} is not a git repository",
            target.display()
        )));
    }

    let state_dir = target.join(".foreman");
    let mut config = ForemanConfig::load(&state_dir).await?;
    config.target.path = target.clone();
    if let Some(workers) = workers {
        config.scheduler.parallel.num_workers = workers;
    }
    config.validate()?;

    let store = Store::open(state_dir.join("foreman.db"))?;

    let pool_dir = if config.scheduler.parallel.pool_dir.as_os_str().is_empty() {
        state_dir.join("pool")
    } else {
        config.scheduler.parallel.pool_dir.clone()
    };
    let pool = Arc::new(WorkspacePool::new(
        &target,
        &pool_dir,
        config.scheduler.parallel.num_workers + config.green_branch.fixup_candidates,
        &config.target.branch,
        &config.green_branch.green_branch,
    ));
    pool.initialize(config.scheduler.parallel.warm_clones).await?;

    // The integration workspace is a long-lived clone outside the pool;
    // the green-branch manager is its only writer.
    let integration = state_dir.join("integration");
    if !integration.exists() {
        GitRunner::new(&state_dir)
            .clone_shared(&target, &integration)
            .await?;
    }

    let breakers = Arc::new(CircuitBreakerSet::new(
        config.degradation.failure_threshold,
        Duration::from_secs(config.degradation.reset_timeout_secs),
    ));
    let green = Arc::new(GreenBranchManager::new(
        config.green_branch.clone(),
        config.target.verification.clone(),
        config.continuous.verify_before_merge,
        &config.target.branch,
        &integration,
        &target,
        Arc::clone(&breakers),
    ));
    let backend = Arc::new(LocalBackend::new(&config.scheduler, config.pricing.clone()));
    let planner = Arc::new(BacklogPlanner::new(store.clone()));
    let reviewer = Arc::new(DiffReviewer::new(config.review.clone()));

    let controller = ContinuousController::new(
        config,
        store,
        pool,
        backend,
        planner,
        green,
        reviewer,
        breakers,
    );

    let outcome = controller.run(&objective).await?;

    println!(
        "{} mission {} stopped: {} ({} completed, {} failed, ${:.2})",
        if outcome.exit_code() == 0 {
            style("ok:").green().bold()
        } else {
            style("stopped:").yellow().bold()
        },
        outcome.mission_id,
        outcome.stop_reason,
        outcome.completed_units,
        outcome.failed_units,
        outcome.total_cost_usd,
    );

    Ok(ExitCode::from(outcome.exit_code()))
}

async fn cmd_status(target: PathBuf) -> Result<ExitCode> {
    let state_dir = target.join(".foreman");
    if !state_dir.exists() {
        println!(
            "{} not initialized; run `claude-foreman init` first",
            style("warning:").yellow().bold()
        );
        return Ok(ExitCode::SUCCESS);
    }

    let store = Store::open(state_dir.join("foreman.db"))?;
    let missions = store.list_missions().await?;
    if missions.is_empty() {
        println!("No missions recorded.");
        return Ok(ExitCode::SUCCESS);
    }

    for mission in missions.iter().take(10) {
        let reason = mission
            .stop_reason
            .map(|r| r.as_str())
            .unwrap_or("-");
        println!(
            "{}  {:<9}  {:<22}  epochs {:<3} ${:<8.2} {}",
            mission.id,
            mission.status.as_str(),
            reason,
            mission.total_epochs,
            mission.total_cost_usd,
            mission.objective.chars().take(60).collect::<String>(),
        );
    }

    Ok(ExitCode::SUCCESS)
}
