//! Progress events emitted by the pipelines, and their fold into a single run-level view.
//!
//! Pipelines push [`PhaseEvent`]s into a bounded channel. The orchestrator is the only
//! consumer: it folds them into a [`ProgressState`] through a [`ProgressTracker`] and
//! forwards [`HostEvent`]s to whoever started the run.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    ContextAddition,
    Vectorization,
}

impl Phase {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ContextAddition => "context addition",
            Self::Vectorization => "vectorization",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseEventKind {
    Start,
    /// Number of work units in the phase; sent once, after filtering.
    Total(usize),
    /// Units completed since the previous event.
    Advance(usize),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseEvent {
    pub phase: Phase,
    pub kind: PhaseEventKind,
}

/// Sending half handed to a pipeline. A reporter without a channel drops every event.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    phase: Phase,
    tx: Option<mpsc::Sender<PhaseEvent>>,
}

impl ProgressReporter {
    #[must_use]
    pub const fn new(phase: Phase, tx: mpsc::Sender<PhaseEvent>) -> Self {
        Self {
            phase,
            tx: Some(tx),
        }
    }

    #[must_use]
    pub const fn disabled(phase: Phase) -> Self {
        Self { phase, tx: None }
    }

    pub async fn start(&self) {
        self.send(PhaseEventKind::Start).await;
    }

    pub async fn total(&self, total: usize) {
        self.send(PhaseEventKind::Total(total)).await;
    }

    pub async fn advance(&self, units: usize) {
        if units > 0 {
            self.send(PhaseEventKind::Advance(units)).await;
        }
    }

    pub async fn done(&self) {
        self.send(PhaseEventKind::Done).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.send(PhaseEventKind::Error(message.into())).await;
    }

    async fn send(&self, kind: PhaseEventKind) {
        let Some(tx) = &self.tx else {
            return;
        };
        // The receiver only goes away once the run is over.
        if tx
            .send(PhaseEvent {
                phase: self.phase,
                kind,
            })
            .await
            .is_err()
        {
            log::debug!("Progress receiver closed; dropping {} event", self.phase.label());
        }
    }
}

/// Lifecycle of a pipeline within one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineState {
    #[default]
    Idle,
    Starting,
    Running,
    Completing,
    Aborting,
}

#[derive(Debug, Default)]
pub(crate) struct StateCell(std::sync::Mutex<PipelineState>);

impl StateCell {
    pub(crate) fn set(&self, phase: Phase, state: PipelineState) {
        let mut current = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if *current != state {
            log::debug!("{}: {:?} -> {:?}", phase.label(), *current, state);
            *current = state;
        }
    }

    pub(crate) fn get(&self) -> PipelineState {
        *self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Run-level progress snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub phase: Option<Phase>,
    pub completed_units: usize,
    pub total_units: usize,
    /// Combined percentage across the enabled phases, 0..=100.
    pub percent: f64,
    pub is_in_progress: bool,
    pub is_aborted: bool,
    pub last_error: Option<String>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            phase: None,
            completed_units: 0,
            total_units: 0,
            percent: 0.0,
            is_in_progress: false,
            is_aborted: false,
            last_error: None,
        }
    }
}

/// Messages delivered to the host that started a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostEvent {
    Start,
    Total { total: usize },
    Progress { value: f64 },
    Done,
    Error { message: String },
}

/// Folds phase events into a [`ProgressState`].
///
/// With augmentation enabled the context phase covers 0..50% and vectorization 50..100%;
/// otherwise vectorization covers the full range. An empty phase counts as complete.
#[derive(Debug)]
pub struct ProgressTracker {
    context_enabled: bool,
    state: ProgressState,
    started: bool,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(context_enabled: bool) -> Self {
        Self {
            context_enabled,
            state: ProgressState::default(),
            started: false,
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Applies one event and returns the host event to forward, if any.
    pub fn apply(&mut self, event: &PhaseEvent) -> Option<HostEvent> {
        match &event.kind {
            PhaseEventKind::Start => {
                self.state.phase = Some(event.phase);
                self.state.completed_units = 0;
                self.state.total_units = 0;
                self.state.is_in_progress = true;
                self.state.percent = self
                    .state
                    .percent
                    .max(self.percent_for(event.phase, 0, 0, false));
                if self.started {
                    None
                } else {
                    self.started = true;
                    Some(HostEvent::Start)
                }
            }
            PhaseEventKind::Total(total) => {
                self.state.total_units = *total;
                Some(HostEvent::Total { total: *total })
            }
            PhaseEventKind::Advance(units) => {
                self.state.completed_units =
                    (self.state.completed_units + units).min(self.state.total_units);
                let percent = self.percent_for(
                    event.phase,
                    self.state.completed_units,
                    self.state.total_units,
                    false,
                );
                self.state.percent = self.state.percent.max(percent);
                Some(HostEvent::Progress {
                    value: self.state.percent,
                })
            }
            PhaseEventKind::Done => {
                let percent = self.percent_for(
                    event.phase,
                    self.state.completed_units,
                    self.state.total_units,
                    !self.state.is_aborted,
                );
                self.state.percent = self.state.percent.max(percent);
                let last_phase = !self.context_enabled || event.phase == Phase::Vectorization;
                if last_phase {
                    self.state.is_in_progress = false;
                    Some(HostEvent::Done)
                } else {
                    Some(HostEvent::Progress {
                        value: self.state.percent,
                    })
                }
            }
            PhaseEventKind::Error(message) => {
                self.state.last_error = Some(message.clone());
                Some(HostEvent::Error {
                    message: message.clone(),
                })
            }
        }
    }

    pub fn mark_aborted(&mut self) {
        self.state.is_aborted = true;
    }

    /// Freezes the state at the end of a run; returns a terminal host event when the phases
    /// never reported one themselves.
    pub fn finish(&mut self) -> Option<HostEvent> {
        let was_running = self.state.is_in_progress;
        self.state.is_in_progress = false;
        (was_running || !self.started).then_some(HostEvent::Done)
    }

    fn percent_for(&self, phase: Phase, completed: usize, total: usize, complete: bool) -> f64 {
        let fraction = if complete {
            1.0
        } else if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        };
        if !self.context_enabled {
            return 100.0 * fraction;
        }
        match phase {
            Phase::ContextAddition => 50.0 * fraction,
            Phase::Vectorization => 50.0 + 50.0 * fraction,
        }
    }
}
