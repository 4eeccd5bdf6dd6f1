//! On-disk layout: three parallel per-user namespaces plus a transient area.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Identifier of the acting user, as supplied by the identity layer.
pub type UserId = i64;

/// Filesystem roots for live, trash and version trees.
///
/// `<storage>/live/user_<id>`, `<storage>/trash/user_<id>` and
/// `<storage>/versions/user_<id>` never overlap between users.
#[derive(Clone, Debug)]
pub struct Layout {
    storage_root: PathBuf,
    archive_root: PathBuf,
}

impl Layout {
    pub fn new(storage_root: PathBuf, archive_root: PathBuf) -> Self {
        Self {
            storage_root,
            archive_root,
        }
    }

    pub async fn ensure_roots(&self) -> io::Result<()> {
        for namespace in ["live", "trash", "versions"] {
            fs::create_dir_all(self.storage_root.join(namespace)).await?;
        }
        fs::create_dir_all(&self.archive_root).await
    }

    pub fn live_dir(&self, user: UserId) -> PathBuf {
        self.user_dir("live", user)
    }

    pub fn trash_dir(&self, user: UserId) -> PathBuf {
        self.user_dir("trash", user)
    }

    pub fn versions_dir(&self, user: UserId) -> PathBuf {
        self.user_dir("versions", user)
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_root
    }

    /// Returns the live root for `user`, creating it on first use.
    pub async fn live_root(&self, user: UserId) -> io::Result<PathBuf> {
        let dir = self.live_dir(user);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn trash_root(&self, user: UserId) -> io::Result<PathBuf> {
        let dir = self.trash_dir(user);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn versions_root(&self, user: UserId) -> io::Result<PathBuf> {
        let dir = self.versions_dir(user);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    fn user_dir(&self, namespace: &str, user: UserId) -> PathBuf {
        self.storage_root
            .join(namespace)
            .join(format!("user_{user}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn user_namespaces_are_disjoint() {
        let temp = tempdir().expect("tempdir");
        let layout = Layout::new(temp.path().join("storage"), temp.path().join("archives"));
        layout.ensure_roots().await.expect("roots");

        let live_a = layout.live_root(1).await.expect("live a");
        let live_b = layout.live_root(2).await.expect("live b");
        let trash_a = layout.trash_root(1).await.expect("trash a");
        let versions_a = layout.versions_root(1).await.expect("versions a");

        assert_ne!(live_a, live_b);
        assert!(!trash_a.starts_with(&live_a));
        assert!(!versions_a.starts_with(&live_a));
        assert!(!layout.archive_dir().starts_with(&live_a));
        assert!(live_a.is_dir() && trash_a.is_dir() && versions_a.is_dir());
    }
}
