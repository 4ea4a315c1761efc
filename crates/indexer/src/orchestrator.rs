use crate::augment::AugmentationPipeline;
use crate::config::IndexingConfig;
use crate::error::{IndexerError, Result};
use crate::progress::{
    HostEvent, Phase, PhaseEvent, ProgressReporter, ProgressState, ProgressTracker,
};
use crate::stats::RunSummary;
use crate::vectorize::VectorizationPipeline;
use crate::watcher::FilesChanged;
use context_llm::LlmClient;
use context_vector_store::{vector_store_path, Embedder, EmbeddingConfig};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PHASE_CHANNEL_CAPACITY: usize = 256;
const HOST_CHANNEL_CAPACITY: usize = 256;

/// Builds the embedding client for one run.
pub type EmbedderFactory = Arc<
    dyn Fn(&EmbeddingConfig) -> context_vector_store::Result<Arc<dyn Embedder>> + Send + Sync,
>;

/// Factory that builds the provider named in the config.
#[must_use]
pub fn configured_embedders() -> EmbedderFactory {
    Arc::new(EmbeddingConfig::build)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    /// `None` indexes the whole project; otherwise only these paths (files or directories).
    pub paths: Option<Vec<PathBuf>>,
}

impl RunRequest {
    #[must_use]
    pub const fn full() -> Self {
        Self { paths: None }
    }

    #[must_use]
    pub fn scoped(paths: Vec<PathBuf>) -> Self {
        Self { paths: Some(paths) }
    }
}

pub enum StartOutcome {
    Started(RunHandle),
    /// Another run of this workspace is active; the request was ignored.
    AlreadyRunning,
}

/// Handle to a started run. Hosts should drain [`RunHandle::next_event`] (or call
/// [`RunHandle::wait`]); terminal events wait for channel space.
pub struct RunHandle {
    events: mpsc::Receiver<HostEvent>,
    handle: JoinHandle<Result<RunSummary>>,
}

impl RunHandle {
    pub async fn next_event(&mut self) -> Option<HostEvent> {
        self.events.recv().await
    }

    /// Discards remaining events and waits for the run to end.
    pub async fn wait(mut self) -> Result<RunSummary> {
        while self.events.recv().await.is_some() {}
        self.handle
            .await
            .map_err(|err| IndexerError::Other(format!("indexing task failed: {err}")))?
    }
}

/// Sequences context augmentation and vectorization for one workspace, with at most one run
/// active at a time.
pub struct PipelineOrchestrator {
    config: Arc<IndexingConfig>,
    llm: Arc<dyn LlmClient>,
    embedders: EmbedderFactory,
    active: Arc<Mutex<Option<CancellationToken>>>,
    progress: Arc<watch::Sender<ProgressState>>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: IndexingConfig,
        llm: Arc<dyn LlmClient>,
        embedders: EmbedderFactory,
    ) -> Result<Self> {
        config.validate()?;
        let (progress, _) = watch::channel(ProgressState::default());
        Ok(Self {
            config: Arc::new(config),
            llm,
            embedders,
            active: Arc::new(Mutex::new(None)),
            progress: Arc::new(progress),
        })
    }

    pub fn config(&self) -> &IndexingConfig {
        &self.config
    }

    /// Starts a run in the background. Returns [`StartOutcome::AlreadyRunning`] without side
    /// effects when a run is active, and an error when a collaborator is not usable.
    pub async fn start(&self, request: RunRequest) -> Result<StartOutcome> {
        let cancel = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.is_some() {
                debug!("Indexing already running; ignoring request");
                return Ok(StartOutcome::AlreadyRunning);
            }
            let token = CancellationToken::new();
            *active = Some(token.clone());
            token
        };
        let slot = ActiveRun(Arc::clone(&self.active));

        let embedder = self.prepare().await?;

        self.progress.send_replace(ProgressState {
            is_in_progress: true,
            ..ProgressState::default()
        });
        let (host_tx, host_rx) = mpsc::channel(HOST_CHANNEL_CAPACITY);
        let job = RunJob {
            config: Arc::clone(&self.config),
            llm: Arc::clone(&self.llm),
            embedder,
            cancel,
            progress: Arc::clone(&self.progress),
            host_tx,
            scope: request.paths,
        };
        let handle = tokio::spawn(async move {
            let _slot = slot;
            job.execute().await
        });

        Ok(StartOutcome::Started(RunHandle {
            events: host_rx,
            handle,
        }))
    }

    /// Runs to completion; `None` when another run was already active.
    pub async fn run(&self, request: RunRequest) -> Result<Option<RunSummary>> {
        match self.start(request).await? {
            StartOutcome::Started(handle) => handle.wait().await.map(Some),
            StartOutcome::AlreadyRunning => Ok(None),
        }
    }

    /// Requests cancellation of the active run. In-flight files finish or stop at their next
    /// checkpoint; nothing new is started.
    pub fn abort(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_ref() {
            Some(token) => {
                info!("Abort requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressState> {
        self.progress.subscribe()
    }

    /// Starts a scoped run for every change batch. Batches arriving while a run is active
    /// are dropped.
    pub fn listen_for_changes(
        self: &Arc<Self>,
        mut changes: mpsc::Receiver<FilesChanged>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(batch) = changes.recv().await {
                if batch.paths.is_empty() {
                    continue;
                }
                let count = batch.paths.len();
                match orchestrator.start(RunRequest::scoped(batch.paths)).await {
                    Ok(StartOutcome::Started(handle)) => {
                        info!("Reindexing {count} changed paths");
                        tokio::spawn(async move {
                            if let Err(err) = handle.wait().await {
                                warn!("Change-triggered run failed: {err}");
                            }
                        });
                    }
                    Ok(StartOutcome::AlreadyRunning) => {
                        debug!("Run in progress; ignoring {count} changed paths");
                    }
                    Err(err) => warn!("Failed to start change-triggered run: {err}"),
                }
            }
        })
    }

    async fn prepare(&self) -> Result<Arc<dyn Embedder>> {
        if self.config.context_enabled && !self.llm.is_configured() {
            return Err(IndexerError::ConfigError(format!(
                "context augmentation needs a configured LLM (model '{}')",
                self.llm.model()
            )));
        }
        let embedder = (self.embedders)(&self.config.embedding)?;
        if !embedder.validate_credentials().await {
            return Err(IndexerError::ConfigError(format!(
                "embedding provider '{}' rejected the configured credentials",
                embedder.provider()
            )));
        }
        Ok(embedder)
    }
}

/// Frees the single-run slot when the run ends, however it ends.
struct ActiveRun(Arc<Mutex<Option<CancellationToken>>>);

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

struct RunJob {
    config: Arc<IndexingConfig>,
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn Embedder>,
    cancel: CancellationToken,
    progress: Arc<watch::Sender<ProgressState>>,
    host_tx: mpsc::Sender<HostEvent>,
    scope: Option<Vec<PathBuf>>,
}

impl RunJob {
    async fn execute(self) -> Result<RunSummary> {
        let started = Instant::now();
        let (phase_tx, phase_rx) = mpsc::channel(PHASE_CHANNEL_CAPACITY);
        let forwarder = tokio::spawn(forward_progress(
            phase_rx,
            self.host_tx.clone(),
            Arc::clone(&self.progress),
            self.cancel.clone(),
            self.config.context_enabled,
        ));

        let result = self.run_phases(phase_tx).await;
        if let Err(err) = forwarder.await {
            warn!("Progress forwarder failed: {err}");
        }

        let mut summary = result?;
        summary.time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            "Indexing run finished in {} ms{}",
            summary.time_ms,
            if summary.aborted { " (aborted)" } else { "" }
        );
        Ok(summary)
    }

    async fn run_phases(&self, phase_tx: mpsc::Sender<PhaseEvent>) -> Result<RunSummary> {
        let scope = self.scope.as_deref();
        let mut summary = RunSummary::default();

        let inactive = vector_store_path(&self.config.root, !self.config.context_enabled);
        if tokio::fs::try_exists(&inactive).await.unwrap_or(false) {
            info!(
                "Leaving the inactive namespace at {} untouched",
                inactive.display()
            );
        }

        if self.config.context_enabled {
            let reporter = ProgressReporter::new(Phase::ContextAddition, phase_tx.clone());
            let pipeline = match AugmentationPipeline::new(
                &self.config,
                Arc::clone(&self.llm),
                self.cancel.clone(),
                reporter.clone(),
            ) {
                Ok(pipeline) => pipeline,
                Err(err) => {
                    reporter.error(err.to_string()).await;
                    return Err(err);
                }
            };
            summary.augmentation = Some(pipeline.run(scope).await?);
            if self.cancel.is_cancelled() {
                summary.aborted = true;
                return Ok(summary);
            }
        }

        let reporter = ProgressReporter::new(Phase::Vectorization, phase_tx);
        let pipeline = match VectorizationPipeline::new(
            &self.config,
            Arc::clone(&self.embedder),
            self.cancel.clone(),
            reporter.clone(),
        ) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                reporter.error(err.to_string()).await;
                return Err(err);
            }
        };
        summary.vectorization = Some(pipeline.run(scope).await?);
        summary.aborted = self.cancel.is_cancelled();
        Ok(summary)
    }
}

/// Single consumer of phase events: folds them into the shared state and relays host events.
async fn forward_progress(
    mut phase_rx: mpsc::Receiver<PhaseEvent>,
    host_tx: mpsc::Sender<HostEvent>,
    progress: Arc<watch::Sender<ProgressState>>,
    cancel: CancellationToken,
    context_enabled: bool,
) {
    let mut tracker = ProgressTracker::new(context_enabled);
    while let Some(event) = phase_rx.recv().await {
        if cancel.is_cancelled() {
            tracker.mark_aborted();
        }
        let host_event = tracker.apply(&event);
        progress.send_replace(tracker.state().clone());
        if let Some(host_event) = host_event {
            relay(&host_tx, host_event).await;
        }
    }

    if cancel.is_cancelled() {
        tracker.mark_aborted();
    }
    let last = tracker.finish();
    progress.send_replace(tracker.state().clone());
    if let Some(host_event) = last {
        relay(&host_tx, host_event).await;
    }
}

/// Percent updates are dropped when the host lags; everything else waits for space.
async fn relay(host_tx: &mpsc::Sender<HostEvent>, event: HostEvent) {
    match event {
        HostEvent::Progress { .. } => {
            let _ = host_tx.try_send(event);
        }
        _ => {
            let _ = host_tx.send(event).await;
        }
    }
}
