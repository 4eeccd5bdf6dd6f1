//! Shared lazy traversal over a directory tree.
//!
//! Size computation, archive building, recursive copy and search all consume
//! [`TreeWalk`]; none of them recurse on their own.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One entry produced by a tree walk.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// `/`-separated path relative to the walk root.
    pub relative: String,
    pub is_dir: bool,
    /// Byte length for files, 0 for directories.
    pub size: u64,
}

/// Depth-first, pre-order iterator over everything below `root`.
///
/// Symlinks are not followed and are skipped entirely. The root itself is
/// not yielded. Directories are yielded before their contents, so consumers
/// can create them before writing children.
pub struct TreeWalk {
    root: PathBuf,
    inner: walkdir::IntoIter,
}

impl TreeWalk {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            inner: WalkDir::new(root)
                .follow_links(false)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter(),
        }
    }

    /// Stops descending into the directory that was just yielded.
    pub fn skip_current_dir(&mut self) {
        self.inner.skip_current_dir();
    }
}

impl Iterator for TreeWalk {
    type Item = io::Result<WalkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(io::Error::other(err.to_string()))),
            };
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                continue;
            }
            let size = if file_type.is_file() {
                match entry.metadata() {
                    Ok(metadata) => metadata.len(),
                    Err(err) => return Some(Err(io::Error::other(err.to_string()))),
                }
            } else {
                0
            };
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map(|p| p.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
                .unwrap_or_default();
            return Some(Ok(WalkEntry {
                path: entry.path().to_path_buf(),
                relative,
                is_dir: file_type.is_dir(),
                size,
            }));
        }
    }
}

/// Recursive byte size of a file or directory. Missing paths count as 0.
pub fn tree_size(path: &Path) -> io::Result<u64> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    if !metadata.is_dir() {
        return Ok(0);
    }
    let mut total = 0u64;
    for entry in TreeWalk::new(path) {
        total = total.saturating_add(entry?.size);
    }
    Ok(total)
}

/// Async wrapper around [`tree_size`] for use from request handlers.
pub async fn tree_size_async(path: PathBuf) -> io::Result<u64> {
    tokio::task::spawn_blocking(move || tree_size(&path))
        .await
        .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture() -> tempfile::TempDir {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        std::fs::create_dir_all(root.join("docs/old")).expect("dirs");
        std::fs::write(root.join("docs/a.txt"), b"12345").expect("a");
        std::fs::write(root.join("docs/old/b.txt"), b"123").expect("b");
        std::fs::write(root.join("top.bin"), b"1").expect("top");
        temp
    }

    #[test]
    fn walk_yields_dirs_before_children() {
        let temp = fixture();
        let entries: Vec<_> = TreeWalk::new(temp.path())
            .map(|e| e.expect("entry"))
            .collect();
        let relatives: Vec<_> = entries.iter().map(|e| e.relative.as_str()).collect();
        assert_eq!(
            relatives,
            ["docs", "docs/a.txt", "docs/old", "docs/old/b.txt", "top.bin"]
        );
        let docs = entries.iter().position(|e| e.relative == "docs").unwrap();
        assert!(entries[docs].is_dir);
    }

    #[test]
    fn tree_size_sums_files_recursively() {
        let temp = fixture();
        assert_eq!(tree_size(temp.path()).unwrap(), 9);
        assert_eq!(tree_size(&temp.path().join("docs")).unwrap(), 8);
        assert_eq!(tree_size(&temp.path().join("top.bin")).unwrap(), 1);
        assert_eq!(tree_size(&temp.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn skip_current_dir_prunes_subtree() {
        let temp = fixture();
        let mut walk = TreeWalk::new(temp.path());
        let mut seen = Vec::new();
        while let Some(entry) = walk.next() {
            let entry = entry.expect("entry");
            if entry.relative == "docs" {
                walk.skip_current_dir();
            }
            seen.push(entry.relative);
        }
        assert_eq!(seen, ["docs", "top.bin"]);
    }
}
