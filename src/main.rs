//! # askdocs CLI
//!
//! ## Usage
//!
//! ```bash
//! askdocs --config ./config/askdocs.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `askdocs init` | Create the SQLite database and run schema migrations |
//! | `askdocs index <paths>...` | Chunk, embed and index text/markdown files |
//! | `askdocs validate` | Check that vectors and chunk metadata agree |
//! | `askdocs clear` | Drop the index, chunk metadata and derived markdown |
//! | `askdocs summary` | Show the chunk count and chunk contents |
//! | `askdocs serve` | Start the HTTP server |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); command output goes to
//! stdout.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use askdocs::config::{self, SharedConfig};
use askdocs::embedding::{create_provider, EmbeddingProvider};
use askdocs::indexing::{DocumentState, DocumentStatus, IndexReport, IndexingEngine};
use askdocs::migrate;
use askdocs::models::SourceDocument;
use askdocs::server;
use askdocs::store::{IndexStore, Validation};

/// askdocs: question answering over your documents, with streamed,
/// cited answers.
#[derive(Parser)]
#[command(
    name = "askdocs",
    about = "Retrieval-augmented question answering over an indexed document corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/askdocs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the request and conversation
    /// tables. Idempotent.
    Init,

    /// Index text and markdown files.
    ///
    /// Directories are walked recursively. Every chunk of every file is
    /// embedded in one batch; if embedding fails nothing is indexed.
    Index {
        /// Files or directories to index.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Check that the vector index and the chunk metadata agree.
    Validate,

    /// Drop the index, the chunk metadata and derived markdown files.
    Clear,

    /// Show the number of chunks and their contents.
    Summary {
        /// Show only the first N chunks.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Start the HTTP server.
    Serve,
}

const INDEXABLE_EXTENSIONS: &[&str] = &["txt", "md", "markdown"];

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index { paths } => {
            let documents = collect_documents(&paths)?;
            if documents.is_empty() {
                bail!("no indexable files found (expected .txt, .md or .markdown)");
            }

            let store = Arc::new(open_store(&cfg)?);
            let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&cfg.embedding)?);
            let engine = IndexingEngine::new(store.clone(), embedder);
            let report = match engine.index(&documents, &cfg.chunking).await {
                Ok(report) => report,
                Err(e) => {
                    print_statuses(&IndexReport::failed(&documents, &cfg.chunking, &e).documents);
                    return Err(e.into());
                }
            };

            print_statuses(&report.documents);
            println!(
                "Indexed {} documents: {} chunks added, {} total.",
                report.documents.len(),
                report.chunks_added,
                store.len().await
            );
        }
        Commands::Validate => {
            let store = open_store(&cfg)?;
            match store.validate().await {
                Validation::Ok { vectors } => {
                    println!("Index OK: {} vectors match {} chunks.", vectors, vectors);
                }
                Validation::Invalid { reason } => {
                    bail!("Index invalid: {}. Clear and rebuild the index.", reason);
                }
            }
        }
        Commands::Clear => {
            let store = open_store(&cfg)?;
            store.clear().await?;
            println!("Index cleared.");
        }
        Commands::Summary { limit } => {
            let store = open_store(&cfg)?;
            let summary = store.summary(limit).await;
            println!("Chunks: {}", summary.count);
            for (i, content) in summary.chunks.iter().enumerate() {
                println!("--- chunk {} ---", i);
                println!("{}", content);
            }
        }
        Commands::Serve => {
            let shared = Arc::new(SharedConfig::load(&cli.config)?);
            let state = server::build_state(shared).await?;
            server::run_server(state).await?;
        }
    }

    Ok(())
}

fn print_statuses(documents: &[DocumentStatus]) {
    for doc in documents {
        let status = match doc.status {
            DocumentState::Indexed => "indexed",
            DocumentState::Empty => "empty",
            DocumentState::Failed => "failed",
        };
        match &doc.error {
            Some(error) => println!("  {:<8} {} ({})", status, doc.source_file, error),
            None => println!("  {:<8} {} ({} chunks)", status, doc.source_file, doc.chunks),
        }
    }
}

fn open_store(cfg: &config::Config) -> anyhow::Result<IndexStore> {
    IndexStore::open(&cfg.store.data_dir, cfg.store.markdown_dir.as_deref())
}

fn is_indexable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| INDEXABLE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Read every indexable file under `paths`, in a stable order.
fn collect_documents(paths: &[PathBuf]) -> anyhow::Result<Vec<SourceDocument>> {
    let mut files = Vec::new();
    for root in paths {
        if !root.exists() {
            bail!("path does not exist: {}", root.display());
        }
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() && is_indexable(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }

    files
        .iter()
        .map(|path| {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let markdown_file = if name.to_lowercase().ends_with(".md") {
                name.clone()
            } else {
                String::new()
            };
            Ok(SourceDocument {
                content,
                source_file: name,
                markdown_file,
            })
        })
        .collect()
}
