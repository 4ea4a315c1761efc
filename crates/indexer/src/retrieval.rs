use crate::config::IndexingConfig;
use crate::scanner::{FileScanner, ScanOptions};
use context_llm::{collect_text, LlmClient, Message};
use context_vector_store::{Embedder, SearchResult, VectorStore};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Upper bound on folder listing lines included in a prompt.
const MAX_TREE_ENTRIES: usize = 400;

/// Characters of each hit shown to the model.
const SNIPPET_CHARS: usize = 400;

const SYSTEM_PROMPT: &str = "You select the files of a software project that are relevant to \
a task. Answer with a JSON array of file paths relative to the project root, most relevant \
first, and nothing else. Answer [] when no file is relevant.";

const RETRY_PROMPT: &str = "That answer was not a JSON array of strings. Reply with only the \
JSON array of relative file paths.";

/// Answers "which files matter for this task?" from the vector store plus one model call.
pub struct RetrievalAgent {
    root: PathBuf,
    store_path: PathBuf,
    scanner: Option<FileScanner>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmClient>,
    top_k: usize,
    max_attempts: usize,
}

impl RetrievalAgent {
    #[must_use]
    pub fn new(
        config: &IndexingConfig,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let scanner = FileScanner::new(&config.root, ScanOptions::for_sources(config))
            .map_err(|err| log::warn!("Folder summary disabled: {err}"))
            .ok();
        Self {
            root: config
                .root
                .canonicalize()
                .unwrap_or_else(|_| config.root.clone()),
            store_path: config.store_path(),
            scanner,
            embedder,
            llm,
            top_k: config.retrieval.top_k,
            max_attempts: config.retrieval.max_attempts.max(1),
        }
    }

    /// Absolute paths of existing project files relevant to `task`, most relevant first.
    ///
    /// Never fails: a missing store, a failed search or exhausted model attempts all yield an
    /// empty list.
    pub async fn find_files(&self, task: &str) -> Vec<PathBuf> {
        let store = match VectorStore::load(&self.store_path).await {
            Ok(Some(store)) => store,
            Ok(None) => {
                log::info!("No index at {}; run indexing first", self.store_path.display());
                return Vec::new();
            }
            Err(err) => {
                log::warn!("Failed to load {}: {err}", self.store_path.display());
                return Vec::new();
            }
        };

        let hits = match store.search(self.embedder.as_ref(), task, self.top_k).await {
            Ok(hits) => hits,
            Err(err) => {
                log::warn!("Vector search failed: {err}");
                return Vec::new();
            }
        };

        let tree = self.folder_summary().await;
        let mut messages = vec![Message::user(self.build_prompt(task, &hits, &tree))];

        for attempt in 1..=self.max_attempts {
            let reply = match self.ask(messages.clone()).await {
                Ok(reply) => reply,
                Err(err) => {
                    log::warn!("Retrieval attempt {attempt}/{} failed: {err}", self.max_attempts);
                    continue;
                }
            };
            match parse_path_array(&reply) {
                Some(paths) => return self.existing_files(paths),
                None => {
                    log::warn!(
                        "Retrieval attempt {attempt}/{} returned an unparseable answer",
                        self.max_attempts
                    );
                    messages.push(Message::assistant(reply));
                    messages.push(Message::user(RETRY_PROMPT));
                }
            }
        }
        Vec::new()
    }

    async fn ask(&self, messages: Vec<Message>) -> context_llm::Result<String> {
        let stream = self.llm.create_message(SYSTEM_PROMPT, messages).await?;
        collect_text(stream).await
    }

    fn build_prompt(&self, task: &str, hits: &[SearchResult], tree: &[String]) -> String {
        let mut prompt = format!("Task:\n{}\n\n", task.trim());

        prompt.push_str("Search results (path, similarity, excerpt):\n");
        if hits.is_empty() {
            prompt.push_str("(none)\n");
        }
        for hit in hits {
            let path = self.display_path(Path::new(&hit.record.metadata.source));
            let excerpt: String = hit.record.text.chars().take(SNIPPET_CHARS).collect();
            prompt.push_str(&format!(
                "--- {path} ({:.3})\n{}\n",
                hit.score,
                excerpt.trim_end()
            ));
        }

        prompt.push_str("\nProject files:\n");
        for line in tree {
            prompt.push_str(line);
            prompt.push('\n');
        }
        if tree.len() >= MAX_TREE_ENTRIES {
            prompt.push_str("...\n");
        }
        prompt
    }

    async fn folder_summary(&self) -> Vec<String> {
        let Some(scanner) = self.scanner.clone() else {
            return Vec::new();
        };
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            scanner
                .scan()
                .into_iter()
                .take(MAX_TREE_ENTRIES)
                .filter_map(|file| {
                    file.path
                        .strip_prefix(&root)
                        .ok()
                        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
                })
                .collect()
        })
        .await
        .unwrap_or_default()
    }

    fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Keeps paths that name existing files inside the root; order preserved, duplicates
    /// dropped.
    fn existing_files(&self, paths: Vec<String>) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        paths
            .into_iter()
            .filter_map(|raw| {
                let trimmed = raw.trim().trim_start_matches("./");
                if trimmed.is_empty() {
                    return None;
                }
                let path = Path::new(trimmed);
                let absolute = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.root.join(path)
                };
                let canonical = absolute.canonicalize().ok()?;
                (canonical.starts_with(&self.root) && canonical.is_file()).then_some(canonical)
            })
            .filter(|path| seen.insert(path.clone()))
            .collect()
    }
}

/// Extracts a JSON array of strings from a model reply, tolerating code fences and prose
/// around it.
#[must_use]
pub fn parse_path_array(reply: &str) -> Option<Vec<String>> {
    let start = reply.find('[')?;
    let end = reply.rfind(']')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_bare_array() {
        assert_eq!(
            parse_path_array(r#"["src/a.rs", "b.md"]"#),
            Some(vec!["src/a.rs".to_string(), "b.md".to_string()])
        );
    }

    #[test]
    fn parses_fenced_array_with_prose() {
        let reply = "Here you go:\n```json\n[\"a.js\"]\n```\nHope this helps.";
        assert_eq!(parse_path_array(reply), Some(vec!["a.js".to_string()]));
    }

    #[test]
    fn parses_empty_array() {
        assert_eq!(parse_path_array("[]"), Some(Vec::new()));
    }

    #[test]
    fn rejects_non_arrays() {
        assert_eq!(parse_path_array("I could not decide."), None);
        assert_eq!(parse_path_array("] backwards ["), None);
        assert_eq!(parse_path_array("[1, 2]"), None);
        assert_eq!(parse_path_array(r#"{"files": "a"}"#), None);
    }
}
