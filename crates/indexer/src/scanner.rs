use crate::config::IndexingConfig;
use crate::error::Result;
use context_vector_store::context_dir_for_project_root;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use std::fmt;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// How much of a file is inspected to decide whether it is binary.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// A file that passed every filter and is eligible for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub len: u64,
    /// Content looked binary; binaries are mirrored, never sent to a model.
    pub is_binary: bool,
}

impl fmt::Display for CandidateFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub exclude_patterns: Vec<String>,
    /// Directories the engine writes into. They are skipped unless they contain the root.
    pub output_dirs: Vec<PathBuf>,
    pub max_file_size_bytes: u64,
    /// Honour `.gitignore` files found above the scan root.
    pub parent_ignores: bool,
}

impl ScanOptions {
    /// Options for scanning the project sources.
    #[must_use]
    pub fn for_sources(config: &IndexingConfig) -> Self {
        Self {
            exclude_patterns: config.exclude_patterns.clone(),
            output_dirs: vec![context_dir_for_project_root(&config.root)],
            max_file_size_bytes: config.max_file_size_bytes,
            parent_ignores: true,
        }
    }

    /// Options for scanning the shadow mirror. The mirror only ever holds files that passed
    /// the source filters, so the project's ignore files must not be applied a second time.
    #[must_use]
    pub fn for_shadow(config: &IndexingConfig) -> Self {
        Self {
            exclude_patterns: config.exclude_patterns.clone(),
            output_dirs: Vec::new(),
            max_file_size_bytes: config.max_file_size_bytes,
            parent_ignores: false,
        }
    }
}

/// Scanner for finding candidate files in a tree (.gitignore aware)
#[derive(Clone)]
pub struct FileScanner {
    root: PathBuf,
    excludes: GlobSet,
    output_dirs: Vec<PathBuf>,
    gitignore: Option<Gitignore>,
    max_file_size_bytes: u64,
    parent_ignores: bool,
}

impl FileScanner {
    pub fn new(root: impl AsRef<Path>, options: ScanOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        let mut builder = GlobSetBuilder::new();
        for pattern in &options.exclude_patterns {
            builder.add(Glob::new(pattern)?);
        }
        let excludes = builder.build()?;

        let output_dirs = options
            .output_dirs
            .into_iter()
            .filter(|dir| !root.starts_with(dir))
            .collect();

        let gitignore = if options.parent_ignores {
            let mut builder = GitignoreBuilder::new(&root);
            builder.add(root.join(".gitignore"));
            builder.build().ok()
        } else {
            None
        };

        Ok(Self {
            root,
            excludes,
            output_dirs,
            gitignore,
            max_file_size_bytes: options.max_file_size_bytes,
            parent_ignores: options.parent_ignores,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walks the whole tree. Results are sorted by path.
    pub fn scan(&self) -> Vec<CandidateFile> {
        let mut files = self.walk(&self.root);
        files.sort_by(|a, b| a.path.cmp(&b.path));
        log::info!(
            "Found {} candidate files under {}",
            files.len(),
            self.root.display()
        );
        files
    }

    /// Applies the scan filters to an explicit path list (scoped runs, watcher batches).
    /// Directories are walked; paths that no longer exist or are filtered out are dropped.
    pub fn filter_paths(&self, paths: &[PathBuf]) -> Vec<CandidateFile> {
        let mut files = Vec::new();
        for path in paths.iter().map(|path| self.absolute(path)) {
            if !path.starts_with(&self.root) || self.is_ignored(&path) {
                continue;
            }
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            if meta.is_dir() {
                files.extend(self.walk(&path));
            } else if meta.is_file() {
                files.extend(self.candidate(&path, meta.len()));
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|a, b| a.path == b.path);
        files
    }

    fn walk(&self, start: &Path) -> Vec<CandidateFile> {
        let mut files = Vec::new();

        let filter = self.clone();
        let mut builder = WalkBuilder::new(start);
        builder
            .hidden(true) // dot-files and dot-dirs are never indexed
            .parents(self.parent_ignores)
            .git_ignore(self.parent_ignores)
            .git_global(self.parent_ignores)
            .git_exclude(self.parent_ignores)
            .require_git(false);
        builder.filter_entry(move |entry| !filter.is_excluded(entry.path()));

        for result in builder.build() {
            match result {
                Ok(entry) => {
                    let Some(file_type) = entry.file_type() else {
                        continue;
                    };
                    if !file_type.is_file() {
                        continue;
                    }
                    let Ok(meta) = entry.metadata() else {
                        continue;
                    };
                    if let Some(candidate) = self.candidate(entry.path(), meta.len()) {
                        files.push(candidate);
                    }
                }
                Err(e) => log::warn!("Failed to read entry: {e}"),
            }
        }
        files
    }

    /// Resolves `path` against the root when relative.
    #[must_use]
    pub fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// True for paths inside an ignored scope, an output directory, or matching an exclude
    /// pattern. Only the part of `path` below the root is inspected.
    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.output_dirs.iter().any(|dir| path.starts_with(dir)) {
            return true;
        }
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        if relative.as_os_str().is_empty() {
            return false;
        }
        if is_ignored_scope(relative) {
            return true;
        }
        self.excludes.is_match(relative)
    }

    /// Every filter that does not need file contents: exclusions, dot-paths and the root
    /// `.gitignore`.
    pub fn is_ignored(&self, path: &Path) -> bool {
        self.is_excluded(path) || self.is_hidden(path) || self.is_git_ignored(path)
    }

    fn is_hidden(&self, path: &Path) -> bool {
        path.strip_prefix(&self.root).is_ok_and(|relative| {
            relative.components().any(|component| match component {
                Component::Normal(name) => name.to_string_lossy().starts_with('.'),
                _ => false,
            })
        })
    }

    fn is_git_ignored(&self, path: &Path) -> bool {
        self.gitignore.as_ref().is_some_and(|gitignore| {
            path.strip_prefix(&self.root).is_ok_and(|relative| {
                gitignore
                    .matched_path_or_any_parents(relative, false)
                    .is_ignore()
            })
        })
    }

    fn candidate(&self, path: &Path, len: u64) -> Option<CandidateFile> {
        if len > self.max_file_size_bytes {
            log::debug!(
                "Skipping large file {} ({} bytes > {})",
                path.display(),
                len,
                self.max_file_size_bytes
            );
            return None;
        }
        if is_noise_file(path) {
            log::debug!("Skipping noisy artifact {}", path.display());
            return None;
        }
        let is_binary = match sniff_binary(path) {
            Ok(is_binary) => is_binary,
            Err(err) => {
                log::warn!("Failed to read {}: {err}", path.display());
                return None;
            }
        };
        Some(CandidateFile {
            path: path.to_path_buf(),
            len,
            is_binary,
        })
    }
}

/// NUL bytes mark a file as binary, the same heuristic git uses.
#[must_use]
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

fn sniff_binary(path: &Path) -> std::io::Result<bool> {
    let file = std::fs::File::open(path)?;
    let mut head = Vec::with_capacity(BINARY_SNIFF_BYTES);
    file.take(BINARY_SNIFF_BYTES as u64).read_to_end(&mut head)?;
    Ok(looks_binary(&head))
}

fn is_ignored_scope(relative: &Path) -> bool {
    relative.components().any(|component| match component {
        Component::Normal(name) => {
            let lowered = name.to_string_lossy().to_lowercase();
            IGNORED_SCOPES.iter().any(|ignored| ignored == &lowered)
        }
        _ => false,
    })
}

fn is_noise_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| {
            NOISE_FILE_NAMES
                .iter()
                .any(|candidate| name.eq_ignore_ascii_case(candidate))
        })
}

const IGNORED_SCOPES: &[&str] = &[
    // VCS / tooling
    ".git",
    ".hg",
    ".svn",
    ".idea",
    ".vscode",
    ".context",
    // caches / builds
    ".cache",
    "node_modules",
    ".next",
    ".turbo",
    ".parcel-cache",
    ".output",
    "build",
    "dist",
    "coverage",
    ".nuxt",
    ".vite",
    ".svelte-kit",
    "target",
    ".terraform",
    ".venv",
    "__pycache__",
    // vendored code
    "vendor",
    "third_party",
    "third-party",
];

const NOISE_FILE_NAMES: &[&str] = &[
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "Cargo.lock",
    "poetry.lock",
    ".DS_Store",
];
