use serde::{Deserialize, Serialize};

/// Counters for one pipeline phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStats {
    /// Candidate files after filtering
    pub total: usize,

    /// Files sent to the model (augmentation) or embedded (vectorization)
    pub processed: usize,

    /// Files whose fingerprint was unchanged, or that cannot be embedded
    pub skipped: usize,

    /// Binary or over-budget files mirrored without augmentation
    pub copied: usize,

    /// Files whose derived artifacts were removed because the source is gone
    pub deleted: usize,

    /// Chunks written to the vector store
    pub chunks: usize,

    /// Per-file failures; the run continued past them
    pub errors: Vec<String>,

    /// The phase stopped early on an abort request
    pub aborted: bool,
}

impl PhaseStats {
    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    /// Files whose progress unit has been accounted for.
    #[must_use]
    pub fn settled(&self) -> usize {
        self.processed + self.skipped + self.copied + self.errors.len()
    }
}

/// Outcome of one orchestrated run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// `None` when context augmentation is disabled
    pub augmentation: Option<PhaseStats>,

    pub vectorization: Option<PhaseStats>,

    pub aborted: bool,

    /// Time taken in milliseconds
    pub time_ms: u64,
}
