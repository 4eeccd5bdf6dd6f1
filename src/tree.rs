//! Operations on a user's live file tree.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fs::Metadata;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};

use crate::atomic::{
    AtomicFile, copy_file_no_replace, copy_tree_no_replace, is_temp_name, rename_no_replace,
};
use crate::audit::{AuditEvent, AuditSink};
use crate::config::{DEFAULT_LOCK_WAIT_TIMEOUT_SECS, SnapshotPolicy};
use crate::context::RequestContext;
use crate::error::StoreError;
use crate::layout::Layout;
use crate::locking::LockManager;
use crate::path::{self, is_same_or_descendant, resolve_checked, sanitize, sanitize_name};
use crate::quota::QuotaLedger;
use crate::versions::VersionStore;
use crate::walk::{TreeWalk, tree_size_async};

const MAX_COPY_NAME_ATTEMPTS: u32 = 10_000;

/// Coarse class used by clients to pick an in-browser viewer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewClass {
    Image,
    Video,
    Audio,
    Text,
    Pdf,
}

impl PreviewClass {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "svg" => Some(Self::Image),
            "mp4" | "webm" | "ogg" => Some(Self::Video),
            "mp3" | "wav" => Some(Self::Audio),
            "txt" | "md" | "css" | "js" | "html" | "php" | "py" | "json" | "xml" | "csv" => {
                Some(Self::Text)
            }
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    /// Folders have no size of their own.
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    pub mime: Option<String>,
    pub preview: Option<PreviewClass>,
}

impl TreeEntry {
    fn from_metadata(name: String, path: String, metadata: &Metadata) -> Self {
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        if metadata.is_dir() {
            return TreeEntry {
                name,
                path,
                is_dir: true,
                size: None,
                modified,
                mime: None,
                preview: None,
            };
        }
        let ext = path::split_extension(&name).1;
        TreeEntry {
            mime: Some(
                mime_guess::from_path(&name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
            ),
            preview: ext.and_then(PreviewClass::from_extension),
            size: Some(metadata.len()),
            is_dir: false,
            name,
            path,
            modified,
        }
    }
}

fn sort_entries(entries: &mut [TreeEntry]) {
    entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub path: String,
    pub size: u64,
    /// Version number of the snapshot taken of the replaced content.
    pub replaced_version: Option<i64>,
}

#[derive(Clone)]
pub struct StorageTree {
    layout: Layout,
    ledger: QuotaLedger,
    versions: VersionStore,
    locks: Arc<LockManager>,
    audit: Arc<dyn AuditSink>,
    snapshot_policy: SnapshotPolicy,
}

impl StorageTree {
    pub fn new(
        layout: Layout,
        ledger: QuotaLedger,
        versions: VersionStore,
        locks: Arc<LockManager>,
        audit: Arc<dyn AuditSink>,
        snapshot_policy: SnapshotPolicy,
    ) -> Self {
        Self {
            layout,
            ledger,
            versions,
            locks,
            audit,
            snapshot_policy,
        }
    }

    /// Sanitizes `raw` and resolves it to an existing entry in the live tree.
    pub async fn locate(
        &self,
        ctx: &RequestContext,
        raw: &str,
    ) -> Result<(String, PathBuf), StoreError> {
        let relative = sanitize(raw)?;
        let root = self.layout.live_root(ctx.user_id).await?;
        let absolute = resolve_checked(&root, &relative, false).await?;
        Ok((relative, absolute))
    }

    /// Resolves an existing directory, the root when `raw` is empty.
    pub(crate) async fn locate_dir(
        &self,
        ctx: &RequestContext,
        raw: &str,
    ) -> Result<(String, PathBuf), StoreError> {
        let (relative, absolute) = self.locate(ctx, raw).await?;
        if !fs::metadata(&absolute).await?.is_dir() {
            return Err(StoreError::NotFound);
        }
        Ok((relative, absolute))
    }

    /// Resolves a non-root entry.
    async fn locate_item(
        &self,
        ctx: &RequestContext,
        raw: &str,
    ) -> Result<(String, PathBuf), StoreError> {
        let (relative, absolute) = self.locate(ctx, raw).await?;
        if relative.is_empty() {
            return Err(StoreError::InvalidPath);
        }
        Ok((relative, absolute))
    }

    pub async fn stat(&self, ctx: &RequestContext, raw: &str) -> Result<TreeEntry, StoreError> {
        let (relative, absolute) = self.locate_item(ctx, raw).await?;
        let metadata = fs::metadata(&absolute).await?;
        let name = path::file_name(&relative).to_string();
        Ok(TreeEntry::from_metadata(name, relative, &metadata))
    }

    /// Lists one directory. Read-only.
    pub async fn list(&self, ctx: &RequestContext, dir: &str) -> Result<Vec<TreeEntry>, StoreError> {
        let (relative, absolute) = self.locate_dir(ctx, dir).await?;
        let mut reader = fs::read_dir(&absolute).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_temp_name(&name) {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let entry_path = path::join(&relative, &name);
            entries.push(TreeEntry::from_metadata(name, entry_path, &metadata));
        }
        sort_entries(&mut entries);
        Ok(entries)
    }

    /// Case-insensitive substring search over entry names, best effort.
    pub async fn search(
        &self,
        ctx: &RequestContext,
        term: &str,
        limit: usize,
    ) -> Result<Vec<TreeEntry>, StoreError> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let root = self.layout.live_root(ctx.user_id).await?;
        let results = tokio::task::spawn_blocking(move || {
            let mut results = Vec::new();
            let mut walk = TreeWalk::new(&root);
            while let Some(entry) = walk.next() {
                let Ok(entry) = entry else { continue };
                let name = path::file_name(&entry.relative).to_string();
                if entry.is_dir && name.starts_with('.') {
                    walk.skip_current_dir();
                    continue;
                }
                if is_temp_name(&name) || !name.to_lowercase().contains(&needle) {
                    continue;
                }
                if let Ok(metadata) = std::fs::metadata(&entry.path) {
                    results.push(TreeEntry::from_metadata(name, entry.relative, &metadata));
                }
                if results.len() >= limit {
                    break;
                }
            }
            results
        })
        .await
        .map_err(|err| StoreError::Io(io::Error::other(err.to_string())))?;
        Ok(results)
    }

    /// Creates `name` under `parent`, creating missing ancestors of `parent`.
    pub async fn create_folder(
        &self,
        ctx: &RequestContext,
        parent: &str,
        name: &str,
    ) -> Result<String, StoreError> {
        let parent = sanitize(parent)?;
        let name = sanitize_name(name, false)?;
        let root = self.layout.live_root(ctx.user_id).await?;
        let parent_path = resolve_checked(&root, &parent, true).await?;
        fs::create_dir_all(&parent_path).await?;
        fs::create_dir(parent_path.join(&name))
            .await
            .map_err(StoreError::classify)?;

        let relative = path::join(&parent, &name);
        info!(user_id = ctx.user_id, path = relative, "folder created");
        self.audit
            .record(AuditEvent::new(ctx.user_id, "create_folder").item(&name, &parent));
        Ok(relative)
    }

    pub async fn rename(
        &self,
        ctx: &RequestContext,
        raw: &str,
        new_name: &str,
    ) -> Result<String, StoreError> {
        let new_name = sanitize_name(new_name, true)?;
        let (relative, source) = self.locate_item(ctx, raw).await?;
        let parent = path::parent(&relative);
        let dest_relative = path::join(parent, &new_name);
        let root = self.layout.live_root(ctx.user_id).await?;
        let dest = resolve_checked(&root, &dest_relative, true).await?;
        rename_no_replace(&source, &dest).await?;

        let old_name = path::file_name(&relative);
        info!(user_id = ctx.user_id, from = relative, to = dest_relative, "renamed");
        self.audit.record(
            AuditEvent::new(ctx.user_id, "rename")
                .item(old_name, parent)
                .details(format!("Renamed to: {new_name}")),
        );
        Ok(dest_relative)
    }

    /// Moves an entry into `dest_dir`, keeping its name.
    pub async fn move_entry(
        &self,
        ctx: &RequestContext,
        raw_source: &str,
        raw_dest_dir: &str,
    ) -> Result<String, StoreError> {
        let (relative, source) = self.locate_item(ctx, raw_source).await?;
        let dest_dir = sanitize(raw_dest_dir)?;
        if is_same_or_descendant(&relative, &dest_dir) {
            return Err(StoreError::InvalidDestination);
        }
        let (dest_dir, dest_dir_path) = self.locate_dir(ctx, &dest_dir).await?;
        let name = path::file_name(&relative);
        let dest_relative = path::join(&dest_dir, name);
        rename_no_replace(&source, &dest_dir_path.join(name)).await?;

        info!(user_id = ctx.user_id, from = relative, to = dest_relative, "moved");
        self.audit.record(
            AuditEvent::new(ctx.user_id, "move")
                .item(name, path::parent(&relative))
                .details(format!("Moved to: {dest_dir}")),
        );
        Ok(dest_relative)
    }

    /// Copies a file into `dest_dir`. On collision the copy is named
    /// `<stem>_copy`, then `<stem>_copy1`, `<stem>_copy2`, ...
    pub async fn copy(
        &self,
        ctx: &RequestContext,
        raw_source: &str,
        raw_dest_dir: &str,
    ) -> Result<String, StoreError> {
        let (relative, source) = self.locate_item(ctx, raw_source).await?;
        let metadata = fs::metadata(&source).await?;
        if !metadata.is_file() {
            return Err(StoreError::InvalidPath);
        }
        let (dest_dir, dest_dir_path) = self.locate_dir(ctx, raw_dest_dir).await?;
        self.ledger.authorize(ctx.user_id, metadata.len()).await?;

        let name = path::file_name(&relative);
        let (stem, ext) = path::split_extension(name);
        let mut attempt = 0u32;
        let copy_name = loop {
            let candidate = copy_candidate(name, stem, ext, attempt);
            match copy_file_no_replace(&source, &dest_dir_path.join(&candidate)).await {
                Ok(_) => break candidate,
                Err(StoreError::AlreadyExists) if attempt < MAX_COPY_NAME_ATTEMPTS => attempt += 1,
                Err(err) => return Err(err),
            }
        };

        self.ledger.refresh(ctx.user_id).await;
        let dest_relative = path::join(&dest_dir, &copy_name);
        info!(user_id = ctx.user_id, from = relative, to = dest_relative, "copied");
        self.audit.record(
            AuditEvent::new(ctx.user_id, "copy")
                .item(name, path::parent(&relative))
                .details(format!("Copied as: {dest_relative}")),
        );
        Ok(dest_relative)
    }

    /// Copies a file or folder into `dest_dir` under its own name, failing on
    /// collision. Folder contents are copied recursively.
    pub async fn copy_into(
        &self,
        ctx: &RequestContext,
        raw_source: &str,
        raw_dest_dir: &str,
    ) -> Result<String, StoreError> {
        let (relative, source) = self.locate_item(ctx, raw_source).await?;
        let (dest_dir, dest_dir_path) = self.locate_dir(ctx, raw_dest_dir).await?;
        if is_same_or_descendant(&relative, &dest_dir) {
            return Err(StoreError::InvalidDestination);
        }
        let size = tree_size_async(source.clone()).await?;
        self.ledger.authorize(ctx.user_id, size).await?;

        let name = path::file_name(&relative);
        let dest = dest_dir_path.join(name);
        if fs::metadata(&source).await?.is_dir() {
            copy_tree_no_replace(&source, &dest).await?;
        } else {
            copy_file_no_replace(&source, &dest).await?;
        }
        self.ledger.refresh(ctx.user_id).await;
        Ok(path::join(&dest_dir, name))
    }

    /// Streams `declared_size` bytes from `reader` into `dir/name`.
    ///
    /// Quota is checked against the full size before anything is written. An
    /// existing file at the same path is snapshotted as a new version right
    /// before it is replaced; whether a failed snapshot aborts the upload
    /// depends on the configured [`SnapshotPolicy`].
    pub async fn upload<R>(
        &self,
        ctx: &RequestContext,
        dir: &str,
        name: &str,
        declared_size: u64,
        reader: R,
    ) -> Result<UploadOutcome, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let dir = sanitize(dir)?;
        let name = sanitize_name(name, true)?;
        self.ledger.authorize(ctx.user_id, declared_size).await?;

        let relative = path::join(&dir, &name);
        let _guard = self
            .locks
            .lock_path(
                ctx.user_id,
                &relative,
                Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
            )
            .await?;
        let root = self.layout.live_root(ctx.user_id).await?;
        let target = resolve_checked(&root, &relative, true).await?;
        let existing = match fs::metadata(&target).await {
            Ok(metadata) if metadata.is_dir() => return Err(StoreError::AlreadyExists),
            Ok(_) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut atomic = AtomicFile::new(&target).await?;
        let mut limited = reader.take(declared_size.saturating_add(1));
        let written = match tokio::io::copy(&mut limited, atomic.file_mut()).await {
            Ok(written) => written,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err.into());
            }
        };
        if written != declared_size {
            atomic.cleanup().await;
            warn!(
                user_id = ctx.user_id,
                path = relative,
                expected = declared_size,
                actual = written,
                "upload size mismatch"
            );
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "upload size mismatch",
            )));
        }

        let mut replaced_version = None;
        if existing {
            match self
                .versions
                .snapshot_before_overwrite(ctx, &relative, &name, &target)
                .await
            {
                Ok(version) => replaced_version = Some(version.version_number),
                Err(err) if self.snapshot_policy == SnapshotPolicy::BestEffort => {
                    warn!(user_id = ctx.user_id, path = relative, error = %err, "version snapshot failed, overwriting anyway");
                }
                Err(err) => {
                    atomic.cleanup().await;
                    return Err(err);
                }
            }
        }
        atomic.finalize().await?;

        self.ledger.refresh(ctx.user_id).await;
        info!(
            user_id = ctx.user_id,
            path = relative,
            size = written,
            replaced = existing,
            "upload stored"
        );
        self.audit.record(
            AuditEvent::new(ctx.user_id, "upload")
                .item(&name, &dir)
                .details(format!("{written} bytes")),
        );
        Ok(UploadOutcome {
            path: relative,
            size: written,
            replaced_version,
        })
    }
}

fn copy_candidate(name: &str, stem: &str, ext: Option<&str>, attempt: u32) -> String {
    let suffix = match attempt {
        0 => return name.to_string(),
        1 => "_copy".to_string(),
        n => format!("_copy{}", n - 1),
    };
    match ext {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    }
}
