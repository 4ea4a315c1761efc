//! Context augmentation: mirrors the source tree into the shadow directory, with every text
//! file rewritten by the model to carry explanatory comments.

use crate::config::IndexingConfig;
use crate::error::{IndexerError, Result};
use crate::hasher::{fingerprint, ContentFingerprint, FingerprintSalt};
use crate::progress::{Phase, PipelineState, ProgressReporter, StateCell};
use crate::repo_hash::RepoHash;
use crate::scanner::{CandidateFile, FileScanner, ScanOptions};
use crate::stats::PhaseStats;
use crate::work_queue::{WorkOutcome, WorkQueue};
use context_llm::{estimate_tokens, LlmClient, Message, MessageStream, StreamChunk};
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const PHASE_TAG: &str = "context-addition";

/// Bumped whenever the prompt changes meaningfully, so existing shadow documents are rebuilt.
const PROMPT_VERSION: u32 = 1;

const PARTIAL_SUFFIX: &str = ".partial";

const SYSTEM_PROMPT: &str = "You annotate source files for a code search index. \
Return the complete file exactly as given, adding concise comments that explain the purpose \
of the file, its main types and functions, and how they relate to the rest of the \
application. Use the comment syntax of the file's language. Do not change, reorder or remove \
any existing line. Do not wrap the answer in Markdown fences and do not add any text before \
or after the file.";

#[derive(Serialize)]
struct AugmentationSalt<'a> {
    path: &'a str,
    app_context: &'a str,
    model: &'a str,
    prompt_version: u32,
}

struct AugmentJob {
    source: PathBuf,
    relative: PathBuf,
    fingerprint: ContentFingerprint,
}

impl fmt::Display for AugmentJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source.display())
    }
}

/// Shared by every worker of one run.
struct Augmenter {
    llm: Arc<dyn LlmClient>,
    shadow_root: PathBuf,
    app_context: String,
}

pub struct AugmentationPipeline {
    root: PathBuf,
    shadow_root: PathBuf,
    hash_path: PathBuf,
    scanner: FileScanner,
    shadow_scanner: FileScanner,
    llm: Arc<dyn LlmClient>,
    app_context: String,
    concurrency: usize,
    cancel: CancellationToken,
    progress: ProgressReporter,
    state: StateCell,
}

impl AugmentationPipeline {
    pub fn new(
        config: &IndexingConfig,
        llm: Arc<dyn LlmClient>,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Result<Self> {
        let shadow_root = config.shadow_dir();
        Ok(Self {
            root: config.root.clone(),
            scanner: FileScanner::new(&config.root, ScanOptions::for_sources(config))?,
            shadow_scanner: FileScanner::new(&shadow_root, ScanOptions::for_shadow(config))?,
            shadow_root,
            hash_path: config.repo_hash_path(),
            llm,
            app_context: config.app_context.clone(),
            concurrency: config.augment_concurrency,
            cancel,
            progress,
            state: StateCell::default(),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// Brings the shadow tree up to date with the sources. `scope` limits the run to the given
    /// paths (files or directories, absolute or relative to the root).
    ///
    /// Per-file failures are recorded in the returned stats and never stop the run.
    pub async fn run(&self, scope: Option<&[PathBuf]>) -> Result<PhaseStats> {
        self.state.set(Phase::ContextAddition, PipelineState::Starting);
        self.progress.start().await;

        let result = self.execute(scope).await;
        match &result {
            Ok(stats) => log::info!(
                "Context addition: {} augmented, {} copied, {} unchanged, {} removed, {} failed{}",
                stats.processed,
                stats.copied,
                stats.skipped,
                stats.deleted,
                stats.errors.len(),
                if stats.aborted { " (aborted)" } else { "" }
            ),
            Err(err) => {
                log::error!("Context addition failed: {err}");
                self.progress
                    .error(format!("context addition failed: {err}"))
                    .await;
            }
        }

        self.progress.done().await;
        self.state.set(Phase::ContextAddition, PipelineState::Idle);
        result
    }

    async fn execute(&self, scope: Option<&[PathBuf]>) -> Result<PhaseStats> {
        let mut stats = PhaseStats::default();
        let candidates = self.resolve(scope).await?;
        let mut hashes = RepoHash::load(&self.hash_path).await;

        stats.deleted = self.prune(&mut hashes, &candidates, scope).await?;
        stats.total = candidates.len();
        self.progress.total(stats.total).await;
        self.state.set(Phase::ContextAddition, PipelineState::Running);

        let mut jobs = Vec::new();
        for candidate in candidates {
            if self.cancel.is_cancelled() {
                break;
            }
            let Ok(relative) = candidate.path.strip_prefix(&self.root).map(Path::to_path_buf)
            else {
                continue;
            };
            let bytes = match tokio::fs::read(&candidate.path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.fail(&mut stats, &candidate.path, &err.to_string()).await;
                    continue;
                }
            };

            let fingerprint = fingerprint(&bytes, &self.salt_for(&relative)?);
            let shadow = self.shadow_root.join(&relative);
            if hashes.matches(&candidate.path, &fingerprint)
                && tokio::fs::try_exists(&shadow).await.unwrap_or(false)
            {
                stats.skipped += 1;
                continue;
            }

            if let Some(reason) = self.copy_reason(&candidate, &bytes) {
                log::debug!("Copying {} unchanged ({reason})", candidate.path.display());
                match write_atomically(&shadow, &bytes).await {
                    Ok(()) => {
                        hashes.record(&candidate.path, &fingerprint);
                        hashes.save().await?;
                        stats.copied += 1;
                        self.progress.advance(1).await;
                    }
                    Err(err) => self.fail(&mut stats, &candidate.path, &err.to_string()).await,
                }
                continue;
            }

            jobs.push(AugmentJob {
                source: candidate.path,
                relative,
                fingerprint,
            });
        }
        self.progress.advance(stats.skipped).await;

        if !jobs.is_empty() && !self.cancel.is_cancelled() {
            self.augment_all(jobs, &mut hashes, &mut stats).await?;
        }

        if self.cancel.is_cancelled() {
            self.state.set(Phase::ContextAddition, PipelineState::Aborting);
            stats.aborted = true;
        } else {
            self.state.set(Phase::ContextAddition, PipelineState::Completing);
        }
        Ok(stats)
    }

    async fn augment_all(
        &self,
        jobs: Vec<AugmentJob>,
        hashes: &mut RepoHash,
        stats: &mut PhaseStats,
    ) -> Result<()> {
        let augmenter = Arc::new(Augmenter {
            llm: Arc::clone(&self.llm),
            shadow_root: self.shadow_root.clone(),
            app_context: self.app_context.clone(),
        });
        // A failed hash save stops the queue without marking the whole run aborted.
        let queue_cancel = self.cancel.child_token();
        let queue = WorkQueue::new(self.concurrency, queue_cancel.clone());
        let mut run = queue.spawn(jobs, move |job, cancel| {
            let augmenter = Arc::clone(&augmenter);
            async move { augmenter.augment(job, cancel).await }
        });

        let mut fatal = None;
        while let Some(outcome) = run.next().await {
            match outcome {
                WorkOutcome::Completed(job) => {
                    hashes.record(&job.source, &job.fingerprint);
                    if let Err(err) = hashes.save().await {
                        queue_cancel.cancel();
                        fatal = Some(err);
                    }
                    stats.processed += 1;
                    self.progress.advance(1).await;
                }
                WorkOutcome::Failed { item, error } => {
                    self.fail(stats, Path::new(&item), &error).await;
                }
                WorkOutcome::Cancelled { item } => {
                    log::debug!("Augmentation of {item} cancelled");
                }
            }
        }
        let report = run.finish().await;
        log::debug!("Augmentation queue finished: {report:?}");

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn resolve(&self, scope: Option<&[PathBuf]>) -> Result<Vec<CandidateFile>> {
        let scanner = self.scanner.clone();
        let scope = scope.map(<[PathBuf]>::to_vec);
        let files = tokio::task::spawn_blocking(move || match scope {
            Some(paths) => scanner.filter_paths(&paths),
            None => scanner.scan(),
        })
        .await
        .map_err(|err| IndexerError::Other(format!("file scan failed: {err}")))?;
        Ok(files)
    }

    /// Removes shadow documents and hash entries whose source is gone or no longer a
    /// candidate. Full runs also sweep shadow files that have no hash entry.
    async fn prune(
        &self,
        hashes: &mut RepoHash,
        candidates: &[CandidateFile],
        scope: Option<&[PathBuf]>,
    ) -> Result<usize> {
        let live: HashSet<&Path> = candidates.iter().map(|c| c.path.as_path()).collect();
        let scope: Option<Vec<PathBuf>> =
            scope.map(|paths| paths.iter().map(|p| self.scanner.absolute(p)).collect());
        let in_scope = |path: &Path| {
            scope
                .as_ref()
                .map_or(true, |paths| paths.iter().any(|s| path.starts_with(s)))
        };

        let mut stale: HashSet<PathBuf> = hashes
            .files()
            .filter(|file| in_scope(file.as_path()) && !live.contains(file.as_path()))
            .collect();

        match &scope {
            None if tokio::fs::try_exists(&self.shadow_root).await.unwrap_or(false) => {
                let shadow_scanner = self.shadow_scanner.clone();
                let mirrored = tokio::task::spawn_blocking(move || shadow_scanner.scan())
                    .await
                    .map_err(|err| IndexerError::Other(format!("shadow scan failed: {err}")))?;
                for file in mirrored {
                    let Ok(relative) = file.path.strip_prefix(&self.shadow_root) else {
                        continue;
                    };
                    let source = self.root.join(relative);
                    if !live.contains(source.as_path()) {
                        stale.insert(source);
                    }
                }
            }
            Some(paths) => {
                for path in paths {
                    if !live.contains(path.as_path())
                        && !tokio::fs::try_exists(path).await.unwrap_or(true)
                    {
                        stale.insert(path.clone());
                    }
                }
            }
            None => {}
        }

        let mut removed = 0;
        for source in stale {
            let had_entry = hashes.remove(&source);
            let removed_doc = match source.strip_prefix(&self.root) {
                Ok(relative) => remove_shadow(&self.shadow_root.join(relative)).await,
                Err(_) => false,
            };
            if had_entry || removed_doc {
                log::debug!("Pruned shadow document for {}", source.display());
                removed += 1;
            }
        }
        if removed > 0 {
            hashes.save().await?;
        }
        Ok(removed)
    }

    fn salt_for(&self, relative: &Path) -> Result<FingerprintSalt> {
        FingerprintSalt::new(
            PHASE_TAG,
            &AugmentationSalt {
                path: &relative.to_string_lossy(),
                app_context: &self.app_context,
                model: self.llm.model(),
                prompt_version: PROMPT_VERSION,
            },
        )
    }

    /// Files that are mirrored verbatim instead of being sent to the model.
    fn copy_reason(&self, candidate: &CandidateFile, bytes: &[u8]) -> Option<&'static str> {
        if candidate.is_binary {
            return Some("binary");
        }
        match std::str::from_utf8(bytes) {
            Err(_) => Some("not UTF-8"),
            Ok(text) if estimate_tokens(text) > self.token_limit() => {
                Some("over the model token budget")
            }
            Ok(_) => None,
        }
    }

    /// The rewrite has to fit in one response as well as in the prompt.
    fn token_limit(&self) -> usize {
        self.llm.max_input_tokens().min(self.llm.max_output_tokens())
    }

    async fn fail(&self, stats: &mut PhaseStats, path: &Path, error: &str) {
        log::warn!("Failed to augment {}: {error}", path.display());
        let message = format!("{}: {error}", path.display());
        stats.add_error(message.clone());
        self.progress.error(message).await;
        self.progress.advance(1).await;
    }
}

impl Augmenter {
    async fn augment(&self, job: AugmentJob, cancel: CancellationToken) -> Result<AugmentJob> {
        if cancel.is_cancelled() {
            return Err(IndexerError::Cancelled);
        }
        let content = tokio::fs::read_to_string(&job.source).await?;
        let prompt = build_prompt(&self.app_context, &job.relative, &content);

        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(IndexerError::Cancelled),
            stream = self.llm.create_message(SYSTEM_PROMPT, vec![Message::user(prompt)]) => stream?,
        };

        let target = self.shadow_root.join(&job.relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&target);
        match write_stream(stream, &partial, &cancel).await {
            Ok(written) if written > 0 => {
                tokio::fs::rename(&partial, &target).await?;
                log::debug!("Augmented {} ({written} bytes)", job.source.display());
                Ok(job)
            }
            Ok(_) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(IndexerError::Other(
                    "model returned an empty document".to_string(),
                ))
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(err)
            }
        }
    }
}

fn build_prompt(app_context: &str, relative: &Path, content: &str) -> String {
    let mut prompt = String::new();
    if !app_context.trim().is_empty() {
        prompt.push_str("Application context:\n");
        prompt.push_str(app_context.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!("File: {}\n\n", relative.display()));
    prompt.push_str(content);
    prompt
}

/// Streams model output into `path`, checking for cancellation between chunks.
async fn write_stream(
    mut stream: MessageStream,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<usize> {
    let file = tokio::fs::File::create(path).await?;
    let mut writer = tokio::io::BufWriter::new(file);
    let mut written = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                writer.flush().await?;
                return Err(IndexerError::Cancelled);
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(StreamChunk::Text(text))) => {
                writer.write_all(text.as_bytes()).await?;
                written += text.len();
            }
            Some(Ok(StreamChunk::Usage(usage))) => log::debug!(
                "Model usage: {} input / {} output tokens",
                usage.input_tokens,
                usage.output_tokens
            ),
            Some(Err(err)) => return Err(err.into()),
            None => break,
        }
    }

    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    Ok(written)
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}

/// Writes `bytes` through a sibling temp file, so readers never see a torn document.
async fn write_atomically(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, target).await
}

/// Removes a shadow file, or a whole shadow directory when the source was a directory.
async fn remove_shadow(path: &Path) -> bool {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return false,
    };
    match result {
        Ok(()) => true,
        Err(err) => {
            log::warn!("Failed to remove {}: {err}", path.display());
            false
        }
    }
}
