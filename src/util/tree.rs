// ============================================================================
// src/util/tree.rs – Filtered walk of the installation tree (size + manifest)
// ============================================================================

use regex::Regex;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Selects which entries of the source tree belong on the recovery partition.
///
/// The pattern is matched against each entry's path relative to the tree root,
/// with a leading `/`. Sizing and copying must share one filter or the plan
/// under- or over-provisions the partition.
#[derive(Debug, Clone)]
pub struct TreeFilter {
    pattern: Regex,
}

impl TreeFilter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn everything() -> Self {
        Self {
            pattern: Regex::new("/").expect("literal pattern"),
        }
    }

    pub fn matches(&self, relative: &Path) -> bool {
        let rel = format!("/{}", relative.to_string_lossy());
        self.pattern.is_match(&rel)
    }
}

/// Accepted directories and regular files of a tree, relative to its root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeManifest {
    pub entries: Vec<PathBuf>,
    /// Total size of the regular files.
    pub bytes: u64,
}

impl TreeManifest {
    /// NUL-separated list for `rsync --from0 --files-from=-`.
    pub fn files_from(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.extend_from_slice(entry.as_os_str().as_bytes());
            out.push(0);
        }
        out
    }
}

/// Walk `root` once and keep what `filter` accepts. Symlinks and special
/// files are skipped; the target filesystem is FAT.
pub fn tree_manifest(root: &Path, filter: &TreeFilter) -> io::Result<TreeManifest> {
    let mut manifest = TreeManifest::default();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if !filter.matches(rel) {
            continue;
        }
        let kind = entry.file_type();
        if kind.is_file() {
            manifest.bytes += entry.metadata()?.len();
        } else if !kind.is_dir() {
            debug!(path = %entry.path().display(), "skipping non-regular entry");
            continue;
        }
        manifest.entries.push(rel.to_path_buf());
    }
    Ok(manifest)
}

/// Total bytes of regular files under `root` accepted by `filter`.
pub fn tree_size(root: &Path, filter: &TreeFilter) -> io::Result<u64> {
    Ok(tree_manifest(root, filter)?.bytes)
}
