use crate::error::Result;
use futures_util::FutureExt;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Result of one item, delivered in completion order.
#[derive(Debug)]
pub enum WorkOutcome<T> {
    Completed(T),
    /// The worker returned an error or panicked. Sibling items are unaffected.
    Failed { item: String, error: String },
    /// The worker observed cancellation and stopped early.
    Cancelled { item: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Items never dispatched because cancellation was requested first.
    pub not_started: usize,
}

/// Runs per-item async work with at most `concurrency` items in flight.
///
/// Cancellation stops dispatch of new items; items already running receive the token and
/// decide themselves how to wind down.
#[derive(Clone)]
pub struct WorkQueue {
    concurrency: usize,
    cancel: CancellationToken,
}

impl WorkQueue {
    #[must_use]
    pub fn new(concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Spawns the dispatcher and returns a handle yielding outcomes as items finish.
    pub fn spawn<I, T, F, Fut>(&self, items: Vec<I>, worker: F) -> QueueRun<T>
    where
        I: Display + Send + 'static,
        T: Send + 'static,
        F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.concurrency);
        let concurrency = self.concurrency;
        let cancel = self.cancel.clone();
        let worker = Arc::new(worker);

        let handle = tokio::spawn(async move {
            let mut report = QueueReport::default();
            let mut tasks = JoinSet::new();
            let mut pending = items.into_iter();

            loop {
                while tasks.len() >= concurrency {
                    if let Some(joined) = tasks.join_next().await {
                        deliver(&tx, &mut report, joined).await;
                    }
                }
                if cancel.is_cancelled() {
                    report.not_started = pending.len();
                    break;
                }
                let Some(item) = pending.next() else {
                    break;
                };

                let label = item.to_string();
                let token = cancel.clone();
                let worker = Arc::clone(&worker);
                tasks.spawn(async move {
                    let outcome = AssertUnwindSafe(worker(item, token)).catch_unwind().await;
                    match outcome {
                        Ok(Ok(value)) => WorkOutcome::Completed(value),
                        Ok(Err(err)) if err.is_cancelled() => WorkOutcome::Cancelled { item: label },
                        Ok(Err(err)) => WorkOutcome::Failed {
                            item: label,
                            error: err.to_string(),
                        },
                        Err(_) => WorkOutcome::Failed {
                            item: label,
                            error: "worker panicked".to_string(),
                        },
                    }
                });
            }

            while let Some(joined) = tasks.join_next().await {
                deliver(&tx, &mut report, joined).await;
            }
            report
        });

        QueueRun {
            outcomes: rx,
            handle,
        }
    }
}

async fn deliver<T>(
    tx: &mpsc::Sender<WorkOutcome<T>>,
    report: &mut QueueReport,
    joined: std::result::Result<WorkOutcome<T>, tokio::task::JoinError>,
) {
    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(err) => WorkOutcome::Failed {
            item: "<unknown>".to_string(),
            error: format!("task failed: {err}"),
        },
    };
    match &outcome {
        WorkOutcome::Completed(_) => report.completed += 1,
        WorkOutcome::Failed { .. } => report.failed += 1,
        WorkOutcome::Cancelled { .. } => report.cancelled += 1,
    }
    // A dropped receiver means nobody wants the outcomes; keep draining so workers finish.
    let _ = tx.send(outcome).await;
}

/// Outcome stream of a running queue.
pub struct QueueRun<T> {
    outcomes: mpsc::Receiver<WorkOutcome<T>>,
    handle: JoinHandle<QueueReport>,
}

impl<T> QueueRun<T> {
    /// Next finished item; `None` once every dispatched item has been delivered.
    pub async fn next(&mut self) -> Option<WorkOutcome<T>> {
        self.outcomes.recv().await
    }

    /// Waits for the dispatcher and returns its tally. Undelivered outcomes are dropped.
    pub async fn finish(mut self) -> QueueReport {
        self.outcomes.close();
        while self.outcomes.recv().await.is_some() {}
        self.handle.await.unwrap_or_else(|err| {
            log::error!("Work queue dispatcher failed: {err}");
            QueueReport::default()
        })
    }
}
