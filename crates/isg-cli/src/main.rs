mod serve;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use isg_core::config::LoggingConfig;
use isg_core::gate::{CandidateSubmission, Decision, GateState};
use isg_core::{ingest, Config, ContextEngine, QueryRequest};

#[derive(Parser)]
#[command(name = "isg")]
#[command(about = "Persistent interface signature graph for code context and safe edits", long_about = None)]
struct Cli {
    /// Config file (defaults to ./isg.toml, then the user config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default isg.toml and create the database
    Init {
        /// Overwrite an existing isg.toml
        #[arg(long)]
        force: bool,
    },
    /// Index a Rust workspace into the graph
    Index {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Ingest a batch JSON file of nodes and edges
    Ingest { batch: PathBuf },
    /// Print a ranked context shortlist
    Query {
        /// Seed node keys
        #[arg(short, long = "seed")]
        seeds: Vec<String>,
        /// Free-text hints
        #[arg(long = "hint")]
        hints: Vec<String>,
        /// Token budget for the shortlist
        #[arg(short, long)]
        budget: Option<i64>,
    },
    /// Validate a candidate submission and print its report
    Check {
        submission: PathBuf,
        /// Commit the candidate if validation passes
        #[arg(long)]
        approve: bool,
    },
    /// List retained graph versions
    Versions,
    /// Move the graph head back to a retained version
    Rollback { version: u64 },
    /// Export the graph as JSON
    Export { file: PathBuf },
    /// Replace the graph with a JSON export
    Import { file: PathBuf },
    /// Serve the JSON API
    Serve {
        #[arg(short, long, default_value_t = serve::DEFAULT_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load()?,
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Init { force } => init(config, force).await,
        Commands::Index { dir } => {
            let engine = ContextEngine::open(config).await?;
            let report = engine.index_directory(&dir).await?;
            println!(
                "Indexed {} files: {} nodes, {} edges ({} skipped)",
                report.files,
                report.nodes,
                report.edges,
                report.skipped.len()
            );
            print_outcome_version(report.outcome.version.as_ref().map(|v| v.number));
            Ok(())
        }
        Commands::Ingest { batch } => {
            let batch = ingest::load_batch(&batch)?;
            let engine = ContextEngine::open(config).await?;
            let outcome = engine.ingest(batch).await?;
            println!(
                "Added {} nodes, updated {}, {} new edges",
                outcome.nodes_added, outcome.nodes_updated, outcome.edges_added
            );
            print_outcome_version(outcome.version.as_ref().map(|v| v.number));
            Ok(())
        }
        Commands::Query { seeds, hints, budget } => {
            let engine = ContextEngine::open(config).await?;
            let shortlist = engine
                .query(QueryRequest {
                    seed_keys: seeds.into_iter().map(Into::into).collect(),
                    hints,
                    token_budget: budget,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&shortlist)?);
            Ok(())
        }
        Commands::Check { submission, approve } => check(config, &submission, approve).await,
        Commands::Versions => {
            let engine = ContextEngine::open(config).await?;
            let head = engine.stats().head;
            for v in engine.versions() {
                let marker = if v.number == head { "*" } else { " " };
                let rollback = if v.rollback_available { "" } else { " (no rollback)" };
                println!(
                    "{marker} {:>4}  {}  {}{rollback}",
                    v.number,
                    v.created_at.format("%Y-%m-%d %H:%M:%S"),
                    v.summary
                );
            }
            Ok(())
        }
        Commands::Rollback { version } => {
            let engine = ContextEngine::open(config).await?;
            engine.rollback_to(version).await?;
            println!("Head is now version {version}");
            Ok(())
        }
        Commands::Export { file } => {
            let engine = ContextEngine::open(config).await?;
            let stats = engine.export(&file)?;
            println!(
                "Exported version {} ({} nodes, {} edges) to {}",
                stats.head,
                stats.nodes,
                stats.edges,
                file.display()
            );
            Ok(())
        }
        Commands::Import { file } => {
            let mut engine = ContextEngine::open(config).await?;
            let stats = engine.import(&file).await?;
            println!("Imported version {} ({} nodes, {} edges)", stats.head, stats.nodes, stats.edges);
            Ok(())
        }
        Commands::Serve { port } => {
            let engine = ContextEngine::open(config).await?;
            serve::start_server(engine, port).await
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn init(config: Config, force: bool) -> Result<()> {
    let path = Path::new("isg.toml");
    if path.exists() && !force {
        println!("isg.toml already exists (use --force to overwrite)");
    } else {
        std::fs::write(path, Config::default_config_string()).context("writing isg.toml")?;
        println!("Wrote isg.toml");
    }

    let db_path = config.store.db_path();
    let engine = ContextEngine::open(config).await?;
    println!(
        "Graph at version {} ({} nodes) in {}",
        engine.stats().head,
        engine.stats().nodes,
        db_path.display()
    );
    Ok(())
}

async fn check(config: Config, submission: &Path, approve: bool) -> Result<()> {
    let content = std::fs::read_to_string(submission).with_context(|| format!("reading {}", submission.display()))?;
    let submission: CandidateSubmission = serde_json::from_str(&content)?;

    let engine = ContextEngine::open(config).await?;
    let (id, report) = engine.check(submission).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("Candidate {id}: {}", report.summary());

    if !report.passed {
        engine.decide(id, Decision::Reject).await?;
        bail!("candidate {id} failed validation");
    }

    let decision = if approve { Decision::Approve } else { Decision::Reject };
    let record = engine.decide(id, decision).await?;
    match (record.state, record.committed_version) {
        (GateState::Committed, Some(version)) => println!("Committed as version {version}"),
        _ => println!("Not committed; rerun with --approve to apply"),
    }
    Ok(())
}

fn print_outcome_version(version: Option<u64>) {
    match version {
        Some(v) => println!("Graph version {v}"),
        None => println!("No changes"),
    }
}
