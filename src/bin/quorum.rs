#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use quorum_harness::cache::SqliteResponseCache;
use quorum_harness::config::HarnessConfig;
use quorum_harness::ledger::{BucketPeriod, CostLedger, SqliteLedger};
use quorum_harness::run::{self, RunEvent, RunStore, SqliteRunStore};

#[derive(Parser)]
#[command(name = "quorum", version, about = "Multi-pass verified reasoning harness")]
struct Cli {
    /// Config file (TOML). Falls back to $QUORUM_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a goal and stream its events until done
    Run {
        /// The goal text. Use --goal-file for long goals.
        #[arg(long, conflicts_with = "goal_file")]
        goal: Option<String>,
        #[arg(long)]
        goal_file: Option<PathBuf>,
        #[arg(long, default_value = "default")]
        lane: String,
        /// JSON object passed as the run context
        #[arg(long)]
        context: Option<PathBuf>,
        /// Human-readable output instead of JSON lines
        #[arg(long)]
        text: bool,
    },
    /// Print a stored run with its passes, artifacts and checks
    Show {
        #[arg(long = "run")]
        run_id: Uuid,
    },
    /// List recent runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Aggregate ledger spend by time bucket
    Ledger {
        #[arg(long, default_value = "day")]
        period: String,
        #[arg(long)]
        lane: Option<String>,
    },
    /// List configured lanes
    Lanes,
    /// Export the response cache to JSONL
    CacheExport {
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the response cache by age and/or size
    CachePrune {
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("QUORUM_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let cli = Cli::parse();
    let config = HarnessConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            goal,
            goal_file,
            lane,
            context,
            text,
        } => {
            let goal = match (goal, goal_file) {
                (Some(goal), _) => goal,
                (None, Some(path)) => std::fs::read_to_string(path)?,
                (None, None) => return Err("run requires --goal or --goal-file".into()),
            };
            let context = match context {
                Some(path) => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
                None => None,
            };

            let orchestrator = run::open(&config)?;
            let run_id = orchestrator.submit_run(&goal, &lane, context).await?;
            eprintln!("[quorum] run {run_id} on lane {lane}");

            let mut events = orchestrator
                .subscribe(run_id)
                .ok_or("run vanished after submission")?;
            let mut interrupted = false;
            let mut saw_result = false;
            loop {
                let event = tokio::select! {
                    event = events.next() => event,
                    _ = tokio::signal::ctrl_c(), if !interrupted => {
                        interrupted = true;
                        eprintln!("[quorum] cancelling run {run_id}...");
                        orchestrator.cancel(run_id);
                        continue;
                    }
                };
                let Some(event) = event else { break };
                saw_result |= matches!(event, RunEvent::Result { .. });
                if text {
                    print_event(&event);
                } else {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }

            let view = orchestrator.wait(run_id).await?;
            eprintln!(
                "[quorum] {} · cost ${:.6}",
                view.run.status.as_str(),
                view.total_cost_nanodollars as f64 / 1e9
            );
            // done without a result is a failed run
            if !saw_result {
                std::process::exit(1);
            }
        }
        Commands::Show { run_id } => {
            let store = SqliteRunStore::new(&config.store.path)?;
            let ledger = SqliteLedger::new(config.ledger_path())?;
            let mut view = store.get_view(run_id).await?;
            view.total_cost_nanodollars = ledger.run_total(run_id).await?.cost_nanodollars;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Runs { limit } => {
            let store = SqliteRunStore::new(&config.store.path)?;
            for r in store.list_runs(limit).await? {
                println!(
                    "{}  {:<10} {:<12} {}",
                    r.id,
                    r.status.as_str(),
                    r.lane_id,
                    r.goal.lines().next().unwrap_or("")
                );
            }
        }
        Commands::Ledger { period, lane } => {
            let period = BucketPeriod::parse(&period)
                .ok_or("--period must be one of hour, day, month")?;
            let ledger = SqliteLedger::new(config.ledger_path())?;
            let rows = ledger.aggregate(period, lane.as_deref()).await?;
            for row in rows {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Commands::Lanes => {
            let registry = config.lane_registry()?;
            for lane in registry.list() {
                println!(
                    "{} v{}  solvers={} threshold={:.2}  {}",
                    lane.id,
                    lane.version,
                    lane.solver_count(),
                    lane.verification_threshold,
                    lane.description
                );
            }
        }
        Commands::CacheExport { out } => {
            let cache = SqliteResponseCache::new(&config.cache.path)?;
            let written = cache.export_jsonl(&out).await?;
            println!("exported {written} rows to {}", out.display());
        }
        Commands::CachePrune {
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let cache = SqliteResponseCache::new(&config.cache.path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} expired and {} other rows; {} rows remain",
                stats.expired, stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Phase { phase } => eprintln!("[phase] {phase:?}"),
        RunEvent::Progress { percent, step } => eprintln!("[{percent:>3}%] {step}"),
        RunEvent::Candidate { index, status } => eprintln!("[candidate {index}] {status:?}"),
        RunEvent::Result {
            output,
            score,
            citations,
            degraded,
        } => {
            if *degraded {
                eprintln!("[result] degraded, score {score:.2}");
            } else {
                eprintln!("[result] score {score:.2}");
            }
            println!("{output}");
            for c in citations {
                println!("  [{}] {}", c.label, c.source);
            }
        }
        RunEvent::Error { code, message } => eprintln!("[error] {code}: {message}"),
        RunEvent::Done => {}
    }
}
