use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Absolute path of the source file this chunk came from.
    pub source: String,
    pub file_name: String,
    /// File-level fingerprint at embedding time; identical on every chunk of a file.
    pub fingerprint: String,
    pub chunk_index: usize,
}

/// One chunk of one file. `id` is the source file path, so a file owns many records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub record: VectorRecord,
    pub score: f32,
}
