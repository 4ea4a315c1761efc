use crate::error::{IndexerError, Result};
use crate::scanner::FileScanner;
use ignore::WalkBuilder;
use log::{debug, warn};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time;

/// Batch of project paths that changed on disk (created, modified or removed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesChanged {
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    pub debounce: Duration,
    pub max_batch_wait: Duration,
    pub notify_poll_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(750),
            max_batch_wait: Duration::from_secs(3),
            notify_poll_interval: Duration::from_secs(2),
        }
    }
}

enum WatcherCommand {
    Flush,
    Shutdown,
}

type SharedWatcher = Arc<Mutex<Option<RecommendedWatcher>>>;
type WatchState = Arc<Mutex<HashSet<PathBuf>>>;

/// Watches the project tree and emits debounced [`FilesChanged`] batches.
///
/// Paths the scanner would ignore (engine output, dependency folders, dot-files) never make it
/// into a batch, so the engine's own writes cannot retrigger it.
pub struct ChangeWatcher {
    command_tx: mpsc::Sender<WatcherCommand>,
    _watcher: SharedWatcher,
}

impl ChangeWatcher {
    pub fn start(
        scanner: FileScanner,
        config: WatcherConfig,
        changes: mpsc::Sender<FilesChanged>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (command_tx, command_rx) = mpsc::channel(16);

        let (watcher, watch_state) =
            create_fs_watcher(&scanner, event_tx, config.notify_poll_interval)?;
        let watcher = Arc::new(Mutex::new(Some(watcher)));

        spawn_watch_loop(
            scanner,
            config,
            event_rx,
            command_rx,
            changes,
            Arc::clone(&watcher),
            watch_state,
        );

        Ok(Self {
            command_tx,
            _watcher: watcher,
        })
    }

    /// Emits the pending batch now instead of waiting for the debounce window.
    pub async fn flush(&self) -> Result<()> {
        self.command_tx
            .send(WatcherCommand::Flush)
            .await
            .map_err(|e| IndexerError::Other(format!("failed to send flush: {e}")))
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        let _ = self.command_tx.try_send(WatcherCommand::Shutdown);
    }
}

fn create_fs_watcher(
    scanner: &FileScanner,
    sender: mpsc::Sender<notify::Result<Event>>,
    poll_interval: Duration,
) -> Result<(RecommendedWatcher, WatchState)> {
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = sender.blocking_send(res);
        },
        NotifyConfig::default().with_poll_interval(poll_interval),
    )
    .map_err(|e| IndexerError::Other(format!("watcher init failed: {e}")))?;

    let watch_state = Arc::new(Mutex::new(HashSet::new()));
    {
        let mut guard = watch_state
            .lock()
            .map_err(|_| IndexerError::Other("watch state lock poisoned".to_string()))?;
        for dir in watchable_dirs(scanner, scanner.root()) {
            if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                warn!("failed to watch {}: {err}", dir.display());
                continue;
            }
            guard.insert(dir);
        }
        debug!("Watching {} directories", guard.len());
    }
    Ok((watcher, watch_state))
}

fn watchable_dirs(scanner: &FileScanner, start: &Path) -> Vec<PathBuf> {
    let filter = scanner.clone();
    let mut builder = WalkBuilder::new(start);
    builder.hidden(true).require_git(false);
    builder.filter_entry(move |entry| !filter.is_ignored(entry.path()));

    builder
        .build()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_dir()))
        .map(|entry| entry.path().to_path_buf())
        .collect()
}

/// Directories created after startup need their own watch.
fn maybe_add_watches(
    scanner: &FileScanner,
    evt: &Event,
    watcher: &SharedWatcher,
    watch_state: &WatchState,
) {
    for path in &evt.paths {
        if !path.is_dir() || scanner.is_ignored(path) {
            continue;
        }
        let new_dirs: Vec<PathBuf> = {
            let Ok(mut guard) = watch_state.lock() else {
                warn!("watch state lock poisoned");
                return;
            };
            watchable_dirs(scanner, path)
                .into_iter()
                .filter(|dir| guard.insert(dir.clone()))
                .collect()
        };
        if new_dirs.is_empty() {
            continue;
        }

        let Ok(mut watcher_guard) = watcher.lock() else {
            warn!("watcher lock poisoned");
            return;
        };
        let Some(watcher) = watcher_guard.as_mut() else {
            return;
        };
        for dir in new_dirs {
            if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                warn!("failed to watch {}: {err}", dir.display());
                if let Ok(mut guard) = watch_state.lock() {
                    guard.remove(&dir);
                }
            }
        }
    }
}

fn spawn_watch_loop(
    scanner: FileScanner,
    config: WatcherConfig,
    mut event_rx: mpsc::Receiver<notify::Result<Event>>,
    mut command_rx: mpsc::Receiver<WatcherCommand>,
    changes: mpsc::Sender<FilesChanged>,
    watcher: SharedWatcher,
    watch_state: WatchState,
) {
    tokio::spawn(async move {
        let mut state = DebounceState::new(config.debounce, config.max_batch_wait);

        loop {
            let next_deadline = state.next_deadline();

            tokio::select! {
                Some(event) = event_rx.recv() => {
                    handle_event(&scanner, event, &mut state, &watcher, &watch_state);
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(WatcherCommand::Flush) => state.force_run(),
                        Some(WatcherCommand::Shutdown) | None => break,
                    }
                }
                () = async {
                    if let Some(deadline) = next_deadline {
                        time::sleep_until(deadline).await;
                    }
                }, if next_deadline.is_some() => {
                    let paths = state.take_paths();
                    if paths.is_empty() {
                        continue;
                    }
                    debug!("Emitting {} changed paths", paths.len());
                    if changes.send(FilesChanged { paths }).await.is_err() {
                        debug!("Change receiver dropped; stopping watcher");
                        break;
                    }
                }
            }
        }

        if let Ok(mut guard) = watcher.lock() {
            guard.take();
        }
    });
}

fn handle_event(
    scanner: &FileScanner,
    event: notify::Result<Event>,
    state: &mut DebounceState,
    watcher: &SharedWatcher,
    watch_state: &WatchState,
) {
    match event {
        Ok(evt) => {
            if evt.kind.is_access() {
                return;
            }
            maybe_add_watches(scanner, &evt, watcher, watch_state);
            for path in evt.paths {
                if is_relevant_path(scanner, &path) {
                    state.record_path(path);
                }
            }
        }
        Err(err) => warn!("Watcher error: {err}"),
    }
}

fn is_relevant_path(scanner: &FileScanner, path: &Path) -> bool {
    path.starts_with(scanner.root()) && path != scanner.root() && !scanner.is_ignored(path)
}

struct DebounceState {
    debounce: Duration,
    max_batch: Duration,
    last_event: Option<Instant>,
    first_event: Option<Instant>,
    force_immediate: bool,
    pending_paths: BTreeSet<PathBuf>,
}

impl DebounceState {
    const fn new(debounce: Duration, max_batch: Duration) -> Self {
        Self {
            debounce,
            max_batch,
            last_event: None,
            first_event: None,
            force_immediate: false,
            pending_paths: BTreeSet::new(),
        }
    }

    fn record_path(&mut self, path: PathBuf) {
        let now = Instant::now();
        self.pending_paths.insert(path);
        self.last_event = Some(now);
        self.first_event.get_or_insert(now);
    }

    fn force_run(&mut self) {
        self.force_immediate = true;
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.pending_paths.len()
    }

    /// Quiet period after the last event, capped by the max wait after the first one.
    fn next_deadline(&self) -> Option<time::Instant> {
        if self.force_immediate {
            return Some(time::Instant::now());
        }
        if self.pending_paths.is_empty() {
            return None;
        }

        let mut deadline = self.last_event.map(|last| last + self.debounce);
        if let Some(first) = self.first_event {
            let forced = first + self.max_batch;
            deadline = Some(match deadline {
                Some(current) if forced < current => forced,
                Some(current) => current,
                None => forced,
            });
        }
        deadline.map(time::Instant::from_std)
    }

    fn take_paths(&mut self) -> Vec<PathBuf> {
        self.last_event = None;
        self.first_event = None;
        self.force_immediate = false;
        std::mem::take(&mut self.pending_paths).into_iter().collect()
    }
}
