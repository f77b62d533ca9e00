use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;

use codegrounds::config::load_config;
use codegrounds::core::Core;
use codegrounds::diff::DiffEngine;
use codegrounds::embedder::LocalEmbeddingProvider;
use codegrounds::llm::HttpChatProvider;
use codegrounds::retriever::{format_context, RetrieveOptions};

#[derive(Debug, Parser)]
#[command(name = "codegrounds")]
#[command(version)]
#[command(about = "Code-intelligence server core: index, retrieve, assemble, and apply")]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Index the workspace into the vector store and code graph.
    Index,
    /// Retrieve the most relevant chunks for a query.
    Search {
        query: String,
        /// Number of chunks to return.
        #[arg(long, short = 'k')]
        top_k: Option<usize>,
        /// Disable the keyword (hybrid) stage.
        #[arg(long)]
        no_hybrid: bool,
        /// Disable code-graph expansion.
        #[arg(long)]
        no_graph: bool,
        /// Restrict results to one file.
        #[arg(long)]
        file: Option<String>,
        /// Print a prompt-ready context block instead of a result list.
        #[arg(long)]
        context: bool,
    },
    /// Index, then watch the workspace and reindex changed files.
    Watch,
    /// Show what a unified diff would change, without applying it.
    Preview { diff_file: PathBuf },
    /// Validate a unified diff (syntax plus external checkers when present).
    Validate { diff_file: PathBuf },
    /// Apply a unified diff; all files or none.
    Apply {
        diff_file: PathBuf,
        /// Validate deeply before applying.
        #[arg(long)]
        validate: bool,
    },
    /// Print index statistics.
    Stats,
}

fn open_core(root: &PathBuf) -> Result<Core> {
    let config = load_config(root);
    let provider = Arc::new(
        LocalEmbeddingProvider::load(&config.embedding_model_id)
            .context("failed to load the embedding model")?,
    );

    // Summaries are optional: wire a chat provider only when configured.
    let chat = std::env::var("CODEGROUNDS_CHAT_API_KEY").ok().map(|key| {
        let endpoint = std::env::var("CODEGROUNDS_CHAT_ENDPOINT")
            .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string());
        let model = std::env::var("CODEGROUNDS_CHAT_MODEL")
            .unwrap_or_else(|_| "gpt-4o-mini".to_string());
        (
            Arc::new(HttpChatProvider::new(endpoint, key)) as Arc<dyn codegrounds::llm::ChatProvider>,
            model,
        )
    });

    Ok(Core::open(root, config, provider, chat)?)
}

fn index_with_progress(core: &Core) -> Result<()> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg} [{bar:30}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message("indexing");

    let report = core.engine.index_workspace(Some(&|done, total| {
        bar.set_length(total as u64);
        bar.set_position(done as u64);
    }))?;
    bar.finish_and_clear();

    println!(
        "indexed {} files ({} failed), {} chunks, {} embeddings in {:.2}s",
        report.files_indexed,
        report.files_failed,
        report.chunks_created,
        report.embeddings_stored,
        report.duration.as_secs_f64()
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("failed to get current dir")?,
    };

    match cli.cmd {
        Command::Index => {
            let core = open_core(&root)?;
            index_with_progress(&core)?;
        }
        Command::Search {
            query,
            top_k,
            no_hybrid,
            no_graph,
            file,
            context,
        } => {
            let core = open_core(&root)?;
            if core.engine.store().is_empty() {
                index_with_progress(&core)?;
            }
            let opts = RetrieveOptions {
                top_k: top_k.unwrap_or(core.config.top_k_retrieval),
                file_filter: file,
                hybrid: !no_hybrid,
                graph: !no_graph,
            };
            let hits = core.retrieve(&query, &opts)?;
            if context {
                println!("{}", format_context(&hits));
            } else {
                for hit in &hits {
                    println!(
                        "{:.3}  {}:{}-{}  {}",
                        hit.rerank_score,
                        hit.chunk.file_path,
                        hit.chunk.start_line,
                        hit.chunk.end_line,
                        hit.chunk.symbol_name.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Command::Watch => {
            let core = open_core(&root)?;
            index_with_progress(&core)?;
            let _session = core.watch()?;
            println!("watching {} (Ctrl-C to stop)", core.workspace_root.display());
            loop {
                std::thread::sleep(std::time::Duration::from_secs(60));
            }
        }
        Command::Preview { diff_file } => {
            let diff_text = std::fs::read_to_string(&diff_file)
                .with_context(|| format!("failed to read {}", diff_file.display()))?;
            let engine = DiffEngine::new(&root);
            for entry in engine.preview(&diff_text)? {
                let marker = if entry.creates_file { " (new file)" } else { "" };
                println!(
                    "{}{}  +{} -{} ({} context, {} hunks)",
                    entry.file,
                    marker,
                    entry.additions,
                    entry.deletions,
                    entry.context_lines,
                    entry.hunks
                );
            }
        }
        Command::Validate { diff_file } => {
            let diff_text = std::fs::read_to_string(&diff_file)
                .with_context(|| format!("failed to read {}", diff_file.display()))?;
            let engine = DiffEngine::new(&root);
            let validation = engine.validate(&diff_text, true)?;
            for file in &validation.files {
                if file.issues.is_empty() {
                    println!("{}: ok", file.file);
                    continue;
                }
                for issue in &file.issues {
                    println!(
                        "{}:{}: {:?}: {}",
                        file.file, issue.line, issue.severity, issue.message
                    );
                }
            }
            if !validation.valid {
                anyhow::bail!("diff failed validation");
            }
        }
        Command::Apply {
            diff_file,
            validate,
        } => {
            let diff_text = std::fs::read_to_string(&diff_file)
                .with_context(|| format!("failed to read {}", diff_file.display()))?;
            let engine = DiffEngine::new(&root);
            if validate {
                let validation = engine.validate(&diff_text, true)?;
                if !validation.valid {
                    anyhow::bail!("diff failed validation; nothing applied");
                }
            }
            for applied in engine.apply(&diff_text)? {
                let marker = if applied.created { "created" } else { "patched" };
                println!("{} {} ({} hunks)", marker, applied.file, applied.hunks_applied);
            }
        }
        Command::Stats => {
            let core = open_core(&root)?;
            println!(
                "chunks: {}\nfiles: {}\nindex: {}",
                core.engine.store().chunk_count(),
                core.engine.store().file_count(),
                core.engine.store().index_path().display()
            );
        }
    }

    Ok(())
}
