//! # docqa CLI
//!
//! ```bash
//! docqa --config ./config/docqa.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa init` | Create or validate the vector index |
//! | `docqa ingest [PATH...]` | Ingest changed documents under the root |
//! | `docqa delete <id>` | Remove a document from the index |
//! | `docqa get <id>` | Show a document's indexed chunks |
//! | `docqa search "<query>"` | Retrieval only, with scores |
//! | `docqa ask "<question>"` | One grounded answer with sources |
//! | `docqa chat` | Interactive questions on stdin |
//!
//! Logs go to stderr (`RUST_LOG` overrides the level); command output goes
//! to stdout.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docqa::config::{self, Config};
use docqa::ingest::{prime_ephemeral_index, run_delete, run_ingest, IngestRequest};
use docqa::progress::ProgressMode;
use docqa::search::filter_from_tags;
use docqa::services::Services;
use docqa::{chat, get, search};

/// Answer questions from your own documents.
#[derive(Parser)]
#[command(name = "docqa", version, about)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means all defaults.
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    /// Debug-level logging for docqa.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the index, or check that an existing one matches the
    /// configured dimensionality and metric.
    Init,

    /// Load, chunk, embed and index documents.
    ///
    /// Documents whose bytes are unchanged since the last successful run
    /// are skipped unless `--force` is given.
    Ingest {
        /// Files or directories under the document root. Defaults to the whole root.
        paths: Vec<PathBuf>,

        /// Re-ingest unchanged documents too.
        #[arg(long)]
        force: bool,

        /// Load and chunk only; report chunk counts without embedding or writing.
        #[arg(long)]
        dry_run: bool,

        /// Progress on stderr. Defaults to `human` on a terminal, otherwise `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Remove every indexed record of a document.
    Delete { document_id: String },

    /// Show the indexed chunks of a document.
    Get { document_id: String },

    /// Rank indexed chunks against a query without generating an answer.
    Search {
        query: String,

        #[arg(long)]
        top_k: Option<usize>,

        /// Restrict to records tagged `KEY=VALUE`. Repeat to allow several values.
        #[arg(long = "tag", value_parser = parse_key_val)]
        tags: Vec<(String, String)>,
    },

    /// Answer one question.
    Ask {
        question: String,

        #[arg(long, default_value = "cli")]
        conversation: String,

        #[arg(long = "tag", value_parser = parse_key_val)]
        tags: Vec<(String, String)>,
    },

    /// Answer questions from stdin, remembering the conversation.
    Chat {
        #[arg(long)]
        conversation: Option<String>,

        #[arg(long = "tag", value_parser = parse_key_val)]
        tags: Vec<(String, String)>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "docqa=debug,warn" } else { "docqa=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::warn!(path = %path.display(), "config file not found; using defaults");
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let services = Services::open(&cfg).await?;
            println!(
                "Index ready: backend={} dims={} metric={}",
                cfg.index.backend,
                services.index.dims(),
                services.index.metric()
            );
            if Services::is_ephemeral(&cfg) {
                println!("Note: the memory backend keeps nothing between runs.");
            }
        }
        Commands::Ingest {
            paths,
            force,
            dry_run,
            progress,
        } => {
            let services = Services::open(&cfg).await?;
            if Services::is_ephemeral(&cfg) && !dry_run {
                tracing::warn!("memory backend: ingested documents are lost when this command exits");
            }
            let reporter = progress
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter();
            let request = IngestRequest {
                paths,
                force,
                dry_run,
            };
            let summary = run_ingest(&cfg, &services, &request, reporter.as_ref()).await?;

            println!("ingest{}", if dry_run { " (dry-run)" } else { "" });
            for report in &summary.reports {
                match &report.error {
                    None => println!(
                        "  {:<13} {:>5} chunks  {}",
                        report.status.to_string(),
                        report.chunks,
                        report.document_id
                    ),
                    Some(err) => println!(
                        "  {:<13} {:>5}         {}: {}",
                        report.status.to_string(),
                        "-",
                        report.document_id,
                        err
                    ),
                }
            }
            println!("  unchanged: {}", summary.unchanged);
            let failed = summary.failed();
            if failed > 0 {
                bail!("{} of {} documents failed", failed, summary.reports.len());
            }
            println!("ok");
        }
        Commands::Delete { document_id } => {
            let services = Services::open(&cfg).await?;
            let removed = run_delete(&cfg, &services, &document_id).await?;
            println!("deleted {} records for {}", removed, document_id);
        }
        Commands::Get { document_id } => {
            let services = Services::open(&cfg).await?;
            prime_ephemeral_index(&cfg, &services).await?;
            get::run_get(&cfg, &services, &document_id).await?;
        }
        Commands::Search {
            query,
            top_k,
            tags,
        } => {
            let services = Services::open(&cfg).await?;
            prime_ephemeral_index(&cfg, &services).await?;
            search::run_search(&cfg, &services, &query, top_k, &tags).await?;
        }
        Commands::Ask {
            question,
            conversation,
            tags,
        } => {
            let services = Services::open(&cfg).await?;
            prime_ephemeral_index(&cfg, &services).await?;
            let engine = services.engine(&cfg)?;
            let filter = filter_from_tags(&tags);
            chat::run_ask(&engine, &conversation, &question, filter.as_ref()).await?;
        }
        Commands::Chat { conversation, tags } => {
            let services = Services::open(&cfg).await?;
            prime_ephemeral_index(&cfg, &services).await?;
            let engine = services.engine(&cfg)?;
            let filter = filter_from_tags(&tags);
            let conversation = conversation.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            chat::run_chat(&engine, &conversation, filter.as_ref()).await?;
        }
    }

    Ok(())
}
