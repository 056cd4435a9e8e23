//! Recollect CLI
//!
//! Command-line surface over the indexer and the query engine.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use recollect::embedding::create_text_embedder;
use recollect::graph::ChatGraph;
use recollect::index::SearchIndex;
use recollect::indexer::{IndexRunOptions, Indexer};
use recollect::query::{execute_query, format_hits, QueryParser, QUERY_TIMEOUT};
use recollect::types::AppConfig;

#[derive(Parser)]
#[command(name = "recollect")]
#[command(about = "Local chat-history indexing and hybrid search")]
#[command(version)]
struct Cli {
    /// Platform message database
    #[arg(long, env = "RECOLLECT_CHAT_DB")]
    chat_db: Option<String>,

    /// Directory for the index, state, and graph databases
    #[arg(long, env = "RECOLLECT_DATA_DIR")]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run incremental indexing (or a full reindex)
    Index {
        /// Clear all state and rebuild the index from scratch
        #[arg(short, long)]
        full: bool,
        /// Stop after this many messages
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print the indexing status block
    Status,
    /// Cross-check message store, state, and index counts
    Verify,
    /// Parse a natural-language query and search the index
    Search {
        /// The question, quoted
        query: String,
        /// Maximum results
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(chat_db) = &cli.chat_db {
        config.chat_db_path = PathBuf::from(shellexpand::tilde(chat_db).to_string());
    }
    if let Some(data_dir) = &cli.data_dir {
        let dir = PathBuf::from(shellexpand::tilde(data_dir).to_string());
        config.index_db_path = dir.join("index.db");
        config.state_db_path = dir.join("state.db");
        config.graph_db_path = dir.join("graph.db");
    }

    match cli.command {
        Commands::Index { full, limit } => {
            let mut indexer = Indexer::open(&config).map_err(with_hint)?;

            let cancel = indexer.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupt received; finishing current batch");
                    cancel.store(true, Ordering::Relaxed);
                }
            });

            let report = indexer
                .run(&IndexRunOptions {
                    full_reindex: full,
                    max_messages: limit,
                    ..Default::default()
                })
                .await
                .map_err(with_hint)?;

            println!(
                "Indexed {} chunks from {} messages in {:.1}s",
                report.chunks_indexed,
                report.messages_read,
                report.duration.as_secs_f64()
            );
            indexer.close();
        }

        Commands::Status => {
            let indexer = Indexer::open(&config).map_err(with_hint)?;
            let status = indexer.status().map_err(with_hint)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            indexer.close();
        }

        Commands::Verify => {
            let indexer = Indexer::open(&config).map_err(with_hint)?;
            let report = indexer.verify().map_err(with_hint)?;
            for check in &report.checks {
                println!(
                    "[{}] {}: {}",
                    if check.passed { "ok" } else { "FAIL" },
                    check.name,
                    check.detail
                );
            }
            indexer.close();
            if !report.passed() {
                anyhow::bail!("verification found divergent counts");
            }
        }

        Commands::Search { query, limit } => {
            let index = SearchIndex::open(&config.index_db_path).map_err(with_hint)?;
            index.health_check().map_err(with_hint)?;
            index.initialize().map_err(with_hint)?;
            let graph = ChatGraph::open(&config.graph_db_path).map_err(with_hint)?;
            let embedder = create_text_embedder(&config);
            let parser = QueryParser::new(&config);

            let parsed = tokio::time::timeout(QUERY_TIMEOUT, parser.parse(&query))
                .await
                .context("query timed out")?;

            let hits = execute_query(&parsed, &index, &graph, embedder.as_ref(), limit)
                .map_err(with_hint)?;
            println!("{}", format_hits(&hits));

            graph.close();
            index.close();
        }
    }

    Ok(())
}

/// Attach one-line operator guidance to fatal errors
fn with_hint(e: recollect::RecollectError) -> anyhow::Error {
    match e.hint() {
        Some(hint) => anyhow::anyhow!("{} ({})", e, hint),
        None => anyhow::anyhow!(e),
    }
}
