//! Atomic filesystem primitives.
//!
//! Collisions are detected by the filesystem itself (`create_new`, hard links)
//! rather than by a prior existence check wherever the platform allows it.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use uuid::Uuid;

use crate::error::StoreError;
use crate::walk::TreeWalk;

const TEMP_MARKER: &str = ".tmp.";

/// Temporary sibling file that atomically replaces its target on finalize.
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// Creates the temporary file next to `target`.
    pub async fn new(target: &Path) -> Result<Self, StoreError> {
        let parent = target.parent().ok_or(StoreError::InvalidPath)?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}{TEMP_MARKER}{}", Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Discards the temporary file.
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// Flushes and renames over the target, replacing any previous content.
    pub async fn finalize(self) -> Result<(), StoreError> {
        if let Err(err) = self.file.sync_all().await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err.into());
        }
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok()
                    && fs::rename(&self.temp_path, &self.target).await.is_ok()
                {
                    return Ok(());
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err.into());
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

/// Whether a directory entry name belongs to an in-flight [`AtomicFile`].
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

/// Moves `source` to `dest`, failing with `AlreadyExists` instead of replacing.
///
/// Files go through a hard link, which the kernel refuses when `dest` exists.
/// Directories (and filesystems without hard links) fall back to a checked
/// rename, which leaves a narrow window a concurrent writer can race into.
pub async fn rename_no_replace(source: &Path, dest: &Path) -> Result<(), StoreError> {
    let metadata = fs::symlink_metadata(source)
        .await
        .map_err(StoreError::classify)?;
    if metadata.is_file() {
        match fs::hard_link(source, dest).await {
            Ok(()) => {
                if let Err(err) = fs::remove_file(source).await {
                    let _ = fs::remove_file(dest).await;
                    return Err(StoreError::classify(err));
                }
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists);
            }
            Err(_) => {}
        }
    }
    if fs::symlink_metadata(dest).await.is_ok() {
        return Err(StoreError::AlreadyExists);
    }
    fs::rename(source, dest)
        .await
        .map_err(StoreError::classify)
}

/// Copies a single file into a freshly created `dest`. A partially written
/// destination is removed on failure.
pub async fn copy_file_no_replace(source: &Path, dest: &Path) -> Result<u64, StoreError> {
    let mut input = File::open(source).await.map_err(StoreError::classify)?;
    let mut output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .await
        .map_err(StoreError::classify)?;
    let copied = match tokio::io::copy(&mut input, &mut output).await {
        Ok(copied) => copied,
        Err(err) => {
            drop(output);
            let _ = fs::remove_file(dest).await;
            return Err(err.into());
        }
    };
    if let Err(err) = output.sync_all().await {
        drop(output);
        let _ = fs::remove_file(dest).await;
        return Err(err.into());
    }
    Ok(copied)
}

/// Recursively copies directory `source` to a new directory `dest`.
///
/// `dest` itself must not exist. On failure the partial copy is removed.
pub async fn copy_tree_no_replace(source: &Path, dest: &Path) -> Result<u64, StoreError> {
    let source = source.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir(&dest).map_err(StoreError::classify)?;
        let result = copy_tree_blocking(&source, &dest);
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&dest);
        }
        result
    })
    .await
    .map_err(|err| StoreError::Io(io::Error::other(err.to_string())))?
}

fn copy_tree_blocking(source: &Path, dest: &Path) -> Result<u64, StoreError> {
    let mut copied = 0u64;
    for entry in TreeWalk::new(source) {
        let entry = entry?;
        let target = dest.join(&entry.relative);
        if entry.is_dir {
            std::fs::create_dir(&target)?;
        } else {
            copied += std::fs::copy(&entry.path, &target)?;
        }
    }
    Ok(copied)
}

/// Removes a file or a whole directory tree.
pub async fn remove_entry(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path).await?;
    if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn atomic_file_replaces_target() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("report.txt");
        std::fs::write(&target, b"old").expect("seed");

        let mut atomic = AtomicFile::new(&target).await.expect("atomic");
        atomic.file_mut().write_all(b"new content").await.unwrap();
        atomic.finalize().await.expect("finalize");

        assert_eq!(std::fs::read(&target).unwrap(), b"new content");
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_temp_name(&e.file_name().to_string_lossy()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn atomic_cleanup_leaves_target_alone() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("keep.txt");
        std::fs::write(&target, b"keep").expect("seed");
        let mut atomic = AtomicFile::new(&target).await.expect("atomic");
        atomic.file_mut().write_all(b"discard").await.unwrap();
        atomic.cleanup().await;
        assert_eq!(std::fs::read(&target).unwrap(), b"keep");
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn rename_no_replace_refuses_occupied_destination() {
        let temp = tempdir().expect("tempdir");
        let a = temp.path().join("a.txt");
        let b = temp.path().join("b.txt");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let result = rename_no_replace(&a, &b).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists)));
        assert_eq!(std::fs::read(&b).unwrap(), b"b");
        assert!(a.exists());

        let dir = temp.path().join("dir");
        std::fs::create_dir(&dir).unwrap();
        let result = rename_no_replace(&dir, &b).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists)));
    }

    #[tokio::test]
    async fn rename_no_replace_moves_files_and_dirs() {
        let temp = tempdir().expect("tempdir");
        let a = temp.path().join("a.txt");
        std::fs::write(&a, b"a").unwrap();
        rename_no_replace(&a, &temp.path().join("c.txt"))
            .await
            .expect("file rename");
        assert!(!a.exists());

        std::fs::create_dir_all(temp.path().join("d/inner")).unwrap();
        rename_no_replace(&temp.path().join("d"), &temp.path().join("e"))
            .await
            .expect("dir rename");
        assert!(temp.path().join("e/inner").is_dir());

        let missing = rename_no_replace(&temp.path().join("nope"), &temp.path().join("x")).await;
        assert!(matches!(missing, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn copy_tree_replicates_structure() {
        let temp = tempdir().expect("tempdir");
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join("nested/empty")).unwrap();
        std::fs::write(src.join("nested/x.bin"), vec![1u8; 10]).unwrap();
        std::fs::write(src.join("y.bin"), vec![2u8; 5]).unwrap();

        let copied = copy_tree_no_replace(&src, &temp.path().join("dst"))
            .await
            .expect("copy tree");
        assert_eq!(copied, 15);
        assert!(temp.path().join("dst/nested/empty").is_dir());
        assert_eq!(std::fs::read(temp.path().join("dst/y.bin")).unwrap(), vec![2u8; 5]);

        let again = copy_tree_no_replace(&src, &temp.path().join("dst")).await;
        assert!(matches!(again, Err(StoreError::AlreadyExists)));
    }

    #[tokio::test]
    async fn copy_file_no_replace_refuses_existing() {
        let temp = tempdir().expect("tempdir");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::write(&a, b"aaa").unwrap();
        assert_eq!(copy_file_no_replace(&a, &b).await.unwrap(), 3);
        assert!(matches!(
            copy_file_no_replace(&a, &b).await,
            Err(StoreError::AlreadyExists)
        ));
    }
}
