use crate::error::Result;
use crate::hasher::ContentFingerprint;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Persisted map of source path to the fingerprint its shadow document was built from.
///
/// An entry is written only after the shadow document for that fingerprint is fully on disk,
/// so a present entry always describes a complete document.
#[derive(Debug)]
pub struct RepoHash {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl RepoHash {
    /// Missing or unreadable files load as an empty map; the next run rebuilds it.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    log::warn!(
                        "Ignoring corrupt hash file {}: {err}; all files will be reprocessed",
                        path.display()
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                log::warn!("Failed to read hash file {}: {err}", path.display());
                BTreeMap::new()
            }
        };
        Self { path, entries }
    }

    pub fn get(&self, file: &Path) -> Option<&str> {
        self.entries.get(&key(file)).map(String::as_str)
    }

    pub fn matches(&self, file: &Path, fingerprint: &ContentFingerprint) -> bool {
        self.get(file) == Some(fingerprint.as_str())
    }

    pub fn record(&mut self, file: &Path, fingerprint: &ContentFingerprint) {
        self.entries
            .insert(key(file), fingerprint.as_str().to_string());
    }

    pub fn remove(&mut self, file: &Path) -> bool {
        self.entries.remove(&key(file)).is_some()
    }

    pub fn files(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.entries.keys().map(PathBuf::from)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Atomic write: readers see either the previous or the new map, never a torn file.
    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        let tmp = self.path.with_extension("hash.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn key(file: &Path) -> String {
    file.to_string_lossy().into_owned()
}
