//! Binary entry point for notegraph.
//!
//! A thin command-line front end over [`notegraph::KnowledgeBase`].

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stdout and print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use notegraph::models::{ChangeReport, parse_datetime};
use notegraph::observability;
use notegraph::{KnowledgeBase, NoteGraphConfig};
use std::path::PathBuf;
use std::process::ExitCode;

/// Notegraph - a local-first knowledge graph over a directory of notes.
#[derive(Parser)]
#[command(name = "notegraph")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "NOTEGRAPH_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Project to operate on (defaults to `default_project`).
    #[arg(short, long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Synchronize a project directory with the graph.
    Sync {
        /// Register the project at this directory first.
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Show what a sync would change, without changing anything.
    Scan,

    /// Parse every note and report problems.
    Validate,

    /// Sync once, then keep syncing as files change until interrupted.
    Watch,

    /// Show the graph context around a permalink, pattern, or `recent`.
    Context {
        /// Seed: permalink, `memory://` URL, glob pattern, or `recent`.
        seed: String,

        /// Relation hops to follow.
        #[arg(short, long)]
        depth: Option<usize>,

        /// Only items touched since: a date, RFC 3339 time, or `7d`/`12h`.
        #[arg(short, long)]
        since: Option<String>,

        /// Page number.
        #[arg(long, default_value = "1")]
        page: usize,

        /// Seeds per page.
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Full-text search.
    Search {
        /// The search query.
        query: String,

        /// Maximum number of results.
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show sync status of every project.
    Status,

    /// Rebuild the search index from the graph.
    Reindex,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match NoteGraphConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    if let Err(e) = observability::init_logging(&config.logging, cli.verbose) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run_command(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

async fn run_command(cli: Cli, config: NoteGraphConfig) -> Result<()> {
    let project = config.project_name(cli.project.as_deref());
    let kb = KnowledgeBase::open(config).context("opening knowledge base")?;

    match cli.command {
        Commands::Sync { path } => {
            let project = project?;
            if let Some(path) = path {
                kb.ensure_project(&project, &path)?;
            }
            let report = kb.sync(&project).await?;
            print_report("Synced", &project, &report);
        },
        Commands::Scan => {
            let project = project?;
            let report = kb.scan(&project).await?;
            print_report("Pending", &project, &report);
        },
        Commands::Validate => {
            let project = project?;
            let problems = kb.validate(&project).await?;
            if problems.is_empty() {
                println!("{project}: all notes parsed cleanly");
            } else {
                for (path, problem) in &problems {
                    println!("{path}: {problem}");
                }
                bail!("{} file(s) with problems", problems.len());
            }
        },
        Commands::Watch => {
            let project = project?;
            let report = kb.sync(&project).await?;
            print_report("Synced", &project, &report);
            let handle = kb.watch(&project)?;
            println!("Watching {project}; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            handle.stop().await?;
        },
        Commands::Context {
            seed,
            depth,
            since,
            page,
            page_size,
        } => {
            let project = project?;
            let mut request = kb.context_request(&seed);
            if let Some(depth) = depth {
                request = request.with_depth(depth);
            }
            if let Some(since) = since {
                request = request.with_since(parse_since(&since, Utc::now())?);
            }
            let page_size = page_size.unwrap_or(request.page_size);
            request = request.with_page(page, page_size);

            let context = kb.get_context(&project, &request).await?;
            println!("{}", serde_json::to_string_pretty(&context)?);
        },
        Commands::Search { query, limit } => {
            let project = project?;
            let hits = kb.search(&project, &query, limit)?;
            if hits.is_empty() {
                println!("No results");
            }
            for hit in hits {
                println!(
                    "{:.3}  {:<11} {}  ({})",
                    hit.score,
                    hit.kind.as_str(),
                    hit.permalink,
                    hit.title
                );
            }
        },
        Commands::Status => {
            for registered in kb.projects()? {
                let status = kb.sync_status(&registered.name);
                println!(
                    "{:<20} {:<10} {}",
                    registered.name,
                    status.state.as_str(),
                    registered.path
                );
            }
        },
        Commands::Reindex => {
            let project = project?;
            let indexed = kb.reindex(&project).await?;
            println!("{project}: reindexed {indexed} entities");
        },
    }

    Ok(())
}

fn print_report(verb: &str, project: &str, report: &ChangeReport) {
    println!(
        "{verb} {project}: {} new, {} modified, {} deleted, {} moved",
        report.new.len(),
        report.modified.len(),
        report.deleted.len(),
        report.moves.len()
    );
    for (from, to) in &report.moves {
        println!("  moved {from} -> {to}");
    }
    for (path, error) in &report.errors {
        println!("  error {path}: {error}");
    }
}

/// Parses `--since`: an absolute date or time, or a relative `<n>d`,
/// `<n>h`, `<n>m` or `<n>w`.
fn parse_since(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Some(at) = parse_datetime(value) {
        return Ok(at);
    }
    let value = value.trim();
    let Some((split, _)) = value.char_indices().last() else {
        bail!("empty --since value");
    };
    let (amount, unit) = value.split_at(split);
    let amount: i64 = amount
        .parse()
        .with_context(|| format!("invalid --since value '{value}'"))?;
    let span = match unit {
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        "w" => Duration::weeks(amount),
        _ => bail!("invalid --since unit in '{value}' (use m, h, d or w)"),
    };
    Ok(now - span)
}
