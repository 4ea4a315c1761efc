use std::path::{Path, PathBuf};

pub const CONTEXT_DIR_NAME: &str = ".context";
pub const SHADOW_DIR_NAME: &str = "shadow";
pub const VECTORS_DIR_NAME: &str = "vectors";
pub const STORE_FILE_NAME: &str = "store.json";
pub const REPO_HASH_FILE_NAME: &str = "context.repo.hash";

const WITH_CONTEXT_NAMESPACE: &str = "with-context";
const WITHOUT_CONTEXT_NAMESPACE: &str = "without-context";

#[must_use]
pub fn context_dir_for_project_root(root: &Path) -> PathBuf {
    root.join(CONTEXT_DIR_NAME)
}

/// Root of the augmented mirror of the source tree.
#[must_use]
pub fn shadow_dir_for_project_root(root: &Path) -> PathBuf {
    context_dir_for_project_root(root).join(SHADOW_DIR_NAME)
}

#[must_use]
pub fn repo_hash_path_for_project_root(root: &Path) -> PathBuf {
    context_dir_for_project_root(root).join(REPO_HASH_FILE_NAME)
}

#[must_use]
pub fn vectors_dir_for_project_root(root: &Path) -> PathBuf {
    context_dir_for_project_root(root).join(VECTORS_DIR_NAME)
}

/// Store file of the namespace for the given mode. The two namespaces are never mixed:
/// chunk sizes and fingerprints differ between augmented and raw content.
#[must_use]
pub fn vector_store_path(root: &Path, context_enabled: bool) -> PathBuf {
    let namespace = if context_enabled {
        WITH_CONTEXT_NAMESPACE
    } else {
        WITHOUT_CONTEXT_NAMESPACE
    };
    vectors_dir_for_project_root(root)
        .join(namespace)
        .join(STORE_FILE_NAME)
}
