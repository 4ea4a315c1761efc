use crate::progress_bar::RunProgress;
use crate::{print_stdout, FindArgs, IndexArgs, RunOptions, StatusArgs, WatchArgs};
use anyhow::{bail, Context as AnyhowContext, Result};
use context_indexer::{
    clamp_concurrency, configured_embedders, ChangeWatcher, FileScanner, IndexingConfig,
    PhaseStats, PipelineOrchestrator, RepoHash, RetrievalAgent, RunRequest, RunSummary,
    ScanOptions, StartOutcome, WatcherConfig,
};
use context_llm::{LlmClient, OpenAiCompatibleClient};
use context_vector_store::VectorStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

async fn load_config(root: &Path, no_context: bool) -> Result<IndexingConfig> {
    let mut config = IndexingConfig::load(root)
        .await
        .with_context(|| format!("Failed to load configuration for {}", root.display()))?;
    if no_context {
        config.context_enabled = false;
    }
    Ok(config)
}

async fn run_config(root: &Path, options: &RunOptions) -> Result<IndexingConfig> {
    let mut config = load_config(root, options.no_context).await?;
    if let Some(concurrency) = options.concurrency {
        config.augment_concurrency = clamp_concurrency(concurrency);
    }
    Ok(config)
}

fn llm_client(config: &IndexingConfig) -> Result<Arc<dyn LlmClient>> {
    let client = OpenAiCompatibleClient::new(config.llm.clone())
        .context("Failed to create the LLM client")?;
    Ok(Arc::new(client))
}

fn orchestrator(config: IndexingConfig) -> Result<Arc<PipelineOrchestrator>> {
    let llm = llm_client(&config)?;
    Ok(Arc::new(PipelineOrchestrator::new(
        config,
        llm,
        configured_embedders(),
    )?))
}

fn abort_on_interrupt(orchestrator: &Arc<PipelineOrchestrator>) -> tokio::task::JoinHandle<()> {
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received; aborting the current run");
            orchestrator.abort();
        }
    })
}

pub(crate) async fn index(root: &Path, args: IndexArgs, quiet: bool) -> Result<()> {
    let config = run_config(root, &args.options).await?;
    let context_enabled = config.context_enabled;
    let orchestrator = orchestrator(config)?;

    let cwd = std::env::current_dir().context("Failed to resolve the current directory")?;
    let request = if args.paths.is_empty() {
        RunRequest::full()
    } else {
        RunRequest::scoped(args.paths.iter().map(|path| cwd.join(path)).collect())
    };

    let mut handle = match orchestrator.start(request).await {
        Ok(StartOutcome::Started(handle)) => handle,
        Ok(StartOutcome::AlreadyRunning) => bail!("An indexing run is already active"),
        Err(err) if context_enabled => {
            return Err(err).context(
                "Cannot start indexing; configure the LLM (CONTEXT_LLM_API_KEY) or pass --no-context",
            )
        }
        Err(err) => return Err(err.into()),
    };

    let interrupt = abort_on_interrupt(&orchestrator);
    let progress = RunProgress::new(quiet || args.json);
    while let Some(event) = handle.next_event().await {
        progress.apply(&event);
    }
    let summary = handle.wait().await;
    interrupt.abort();

    let summary = summary?;
    progress.finish(summary.aborted);
    if args.json {
        print_stdout(&serde_json::to_string_pretty(&summary)?)
    } else {
        print_stdout(&render_summary(&summary))
    }
}

pub(crate) async fn find(root: &Path, args: FindArgs) -> Result<()> {
    let config = load_config(root, args.no_context).await?;
    let embedder = config
        .embedding
        .build()
        .context("Failed to create the embedding client")?;
    let agent = RetrievalAgent::new(&config, embedder, llm_client(&config)?);

    let files = agent.find_files(&args.task).await;
    let shown: Vec<String> = files
        .iter()
        .map(|path| display_relative(&config.root, path))
        .collect();

    if args.json {
        print_stdout(&serde_json::to_string(&shown)?)
    } else if shown.is_empty() {
        log::info!("No relevant files found");
        Ok(())
    } else {
        print_stdout(&shown.join("\n"))
    }
}

pub(crate) async fn watch(root: &Path, args: WatchArgs, quiet: bool) -> Result<()> {
    let config = run_config(root, &args.options).await?;
    let scanner = FileScanner::new(&config.root, ScanOptions::for_sources(&config))?;
    let orchestrator = orchestrator(config)?;

    if let StartOutcome::Started(mut handle) = orchestrator.start(RunRequest::full()).await? {
        let progress = RunProgress::new(quiet);
        while let Some(event) = handle.next_event().await {
            progress.apply(&event);
        }
        let summary = handle.wait().await?;
        progress.finish(summary.aborted);
        print_stdout(&render_summary(&summary))?;
    }

    let (changes_tx, changes_rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
    let watcher = ChangeWatcher::start(scanner, WatcherConfig::default(), changes_tx)?;
    let listener = orchestrator.listen_for_changes(changes_rx);
    log::info!("Watching {} (Ctrl-C to stop)", root.display());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Stopping watcher");
    orchestrator.abort();
    drop(watcher);
    if let Err(err) = listener.await {
        log::warn!("Change listener failed: {err}");
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusOutput {
    root: PathBuf,
    context_enabled: bool,
    store_path: PathBuf,
    indexed_files: Option<usize>,
    stored_chunks: Option<usize>,
    augmented_files: usize,
    embedding_provider: String,
    embedding_model: String,
    llm_model: String,
    llm_configured: bool,
}

pub(crate) async fn status(root: &Path, args: StatusArgs) -> Result<()> {
    let config = load_config(root, args.no_context).await?;
    let store_path = config.store_path();
    let store = match VectorStore::load(&store_path).await {
        Ok(store) => store,
        Err(err) => {
            log::warn!("Store {} is unreadable: {err}", store_path.display());
            None
        }
    };
    let hashes = RepoHash::load(config.repo_hash_path()).await;

    let output = StatusOutput {
        root: config.root.clone(),
        context_enabled: config.context_enabled,
        indexed_files: store.as_ref().map(VectorStore::source_count),
        stored_chunks: store.as_ref().map(VectorStore::len),
        store_path,
        augmented_files: hashes.len(),
        embedding_provider: config.embedding.provider.to_string(),
        embedding_model: config.embedding.model.clone(),
        llm_model: config.llm.model.clone(),
        llm_configured: config.llm.is_configured(),
    };

    if args.json {
        return print_stdout(&serde_json::to_string_pretty(&output)?);
    }
    let mut text = format!(
        "Root: {}\nMode: {}\n",
        output.root.display(),
        if output.context_enabled {
            "with context"
        } else {
            "without context"
        }
    );
    match (output.indexed_files, output.stored_chunks) {
        (Some(files), Some(chunks)) => {
            text.push_str(&format!("Index: {files} files, {chunks} chunks\n"));
        }
        _ => text.push_str("Index: not built yet\n"),
    }
    if output.context_enabled {
        text.push_str(&format!("Augmented files: {}\n", output.augmented_files));
    }
    text.push_str(&format!(
        "Embedding: {} / {}\nLLM: {}{}",
        output.embedding_provider,
        output.embedding_model,
        output.llm_model,
        if output.llm_configured {
            ""
        } else {
            " (not configured)"
        }
    ));
    print_stdout(&text)
}

fn display_relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn render_phase(label: &str, stats: &PhaseStats, verb: &str) -> String {
    let mut line = format!(
        "{label}: {} {verb}, {} unchanged, {} removed",
        stats.processed, stats.skipped, stats.deleted
    );
    if stats.copied > 0 {
        line.push_str(&format!(", {} copied", stats.copied));
    }
    if stats.chunks > 0 {
        line.push_str(&format!(", {} chunks", stats.chunks));
    }
    if !stats.errors.is_empty() {
        line.push_str(&format!(", {} failed", stats.errors.len()));
        for error in &stats.errors {
            line.push_str(&format!("\n  - {error}"));
        }
    }
    line
}

fn render_summary(summary: &RunSummary) -> String {
    let mut lines = Vec::new();
    if let Some(stats) = &summary.augmentation {
        lines.push(render_phase("Context addition", stats, "augmented"));
    }
    if let Some(stats) = &summary.vectorization {
        lines.push(render_phase("Vectorization", stats, "embedded"));
    }
    lines.push(format!(
        "{} in {} ms",
        if summary.aborted {
            "Aborted"
        } else {
            "Finished"
        },
        summary.time_ms
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_phases_and_failures() {
        let summary = RunSummary {
            augmentation: Some(PhaseStats {
                total: 3,
                processed: 1,
                copied: 2,
                ..PhaseStats::default()
            }),
            vectorization: Some(PhaseStats {
                total: 3,
                processed: 2,
                skipped: 1,
                chunks: 5,
                errors: vec!["/r/big.md: store full".to_string()],
                ..PhaseStats::default()
            }),
            aborted: false,
            time_ms: 42,
        };

        assert_eq!(
            render_summary(&summary),
            "Context addition: 1 augmented, 0 unchanged, 0 removed, 2 copied\n\
             Vectorization: 2 embedded, 1 unchanged, 0 removed, 5 chunks, 1 failed\n  \
             - /r/big.md: store full\n\
             Finished in 42 ms"
        );
    }

    #[test]
    fn relative_display_falls_back_to_absolute() {
        let root = Path::new("/repo");
        assert_eq!(display_relative(root, Path::new("/repo/src/a.rs")), "src/a.rs");
        assert_eq!(display_relative(root, Path::new("/other/b.rs")), "/other/b.rs");
    }
}
