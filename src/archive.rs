//! Transient zip archives handed out as one-shot download handles.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::fs::{self, File};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::atomic::is_temp_name;
use crate::context::RequestContext;
use crate::error::StoreError;
use crate::layout::{Layout, UserId};
use crate::path::{self, resolve_checked, sanitize};
use crate::walk::TreeWalk;

/// A built archive waiting to be downloaded once.
#[derive(Clone, Debug)]
pub struct DownloadHandle {
    pub user_id: UserId,
    pub path: PathBuf,
    pub filename: String,
    pub created_at: Instant,
}

impl DownloadHandle {
    /// Opens the archive and unlinks it; the open handle keeps the bytes
    /// readable until it is dropped.
    pub async fn open(self) -> Result<(File, u64), StoreError> {
        let file = File::open(&self.path).await.map_err(StoreError::classify)?;
        let size = file.metadata().await?.len();
        if let Err(err) = fs::remove_file(&self.path).await {
            warn!(path = %self.path.display(), error = %err, "served archive not removed, left for cleanup");
        }
        Ok((file, size))
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveTicket {
    pub token: String,
    pub filename: String,
    pub size: u64,
    pub expires_in_secs: u64,
}

#[derive(Clone)]
pub struct ArchiveBuilder {
    layout: Layout,
    ttl: Duration,
    handles: Arc<Mutex<HashMap<String, DownloadHandle>>>,
}

impl ArchiveBuilder {
    pub fn new(layout: Layout, ttl: Duration) -> Self {
        Self {
            layout,
            ttl,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Zips `entries` (live-relative paths) into a transient file. Each entry
    /// becomes one top-level name in the archive, folders keep their structure.
    pub async fn build_archive(
        &self,
        ctx: &RequestContext,
        entries: &[String],
        filename: &str,
    ) -> Result<ArchiveTicket, StoreError> {
        if entries.is_empty() {
            return Err(StoreError::InvalidPath);
        }
        let live = self.layout.live_root(ctx.user_id).await?;
        let mut sources = Vec::with_capacity(entries.len());
        let mut used_names = HashSet::new();
        for raw in entries {
            let relative = sanitize(raw)?;
            if relative.is_empty() {
                return Err(StoreError::InvalidPath);
            }
            let absolute = resolve_checked(&live, &relative, false).await?;
            let top = unique_top_name(path::file_name(&relative), &mut used_names);
            sources.push((top, absolute));
        }

        fs::create_dir_all(self.layout.archive_dir()).await?;
        let target = self
            .layout
            .archive_dir()
            .join(format!("{}.zip", Uuid::new_v4().simple()));
        let blocking_target = target.clone();
        let size = tokio::task::spawn_blocking(move || {
            let result = write_zip_blocking(&blocking_target, &sources);
            if result.is_err() {
                let _ = std::fs::remove_file(&blocking_target);
            }
            result
        })
        .await
        .map_err(|err| StoreError::Io(io::Error::other(err.to_string())))??;

        let token = Uuid::new_v4().simple().to_string();
        let filename = archive_filename(filename);
        self.handles.lock().await.insert(
            token.clone(),
            DownloadHandle {
                user_id: ctx.user_id,
                path: target,
                filename: filename.clone(),
                created_at: Instant::now(),
            },
        );
        info!(user_id = ctx.user_id, entries = entries.len(), size, "archive built");
        Ok(ArchiveTicket {
            token,
            filename,
            size,
            expires_in_secs: self.ttl.as_secs(),
        })
    }

    /// Consumes a handle. Unknown, foreign and expired tokens are `NotFound`.
    pub async fn take(&self, ctx: &RequestContext, token: &str) -> Result<DownloadHandle, StoreError> {
        let handle = {
            let mut handles = self.handles.lock().await;
            match handles.get(token) {
                Some(handle) if handle.user_id == ctx.user_id => handles.remove(token),
                _ => None,
            }
        };
        let handle = handle.ok_or(StoreError::NotFound)?;
        if handle.created_at.elapsed() > self.ttl {
            let _ = fs::remove_file(&handle.path).await;
            debug!(user_id = ctx.user_id, "archive handle expired");
            return Err(StoreError::NotFound);
        }
        Ok(handle)
    }

    /// Drops expired handles and deletes their files, along with archive files
    /// no handle refers to that are older than the TTL.
    pub async fn cleanup_expired(&self) -> Result<usize, StoreError> {
        let (expired, live_paths) = {
            let mut handles = self.handles.lock().await;
            let mut expired = Vec::new();
            handles.retain(|_, handle| {
                if handle.created_at.elapsed() > self.ttl {
                    expired.push(handle.path.clone());
                    false
                } else {
                    true
                }
            });
            let live_paths: HashSet<PathBuf> =
                handles.values().map(|handle| handle.path.clone()).collect();
            (expired, live_paths)
        };

        let mut removed = 0;
        for path in expired {
            if fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed += self.sweep_orphans(&live_paths).await?;
        if removed > 0 {
            info!(removed, "expired archives removed");
        }
        Ok(removed)
    }

    async fn sweep_orphans(&self, referenced: &HashSet<PathBuf>) -> Result<usize, StoreError> {
        let mut reader = match fs::read_dir(self.layout.archive_dir()).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut removed = 0;
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if referenced.contains(&path) || !entry.file_type().await?.is_file() {
                continue;
            }
            let age = entry
                .metadata()
                .await?
                .modified()
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or_default();
            if age > self.ttl && fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn archive_filename(requested: &str) -> String {
    let stem = path::sanitize_name(requested.trim_end_matches(".zip"), true)
        .unwrap_or_else(|_| "download".to_string());
    format!("{stem}.zip")
}

fn unique_top_name(name: &str, used: &mut HashSet<String>) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = path::split_extension(name);
    let mut counter = 1;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{stem} ({counter}).{ext}"),
            None => format!("{stem} ({counter})"),
        };
        if used.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

fn write_zip_blocking(target: &Path, sources: &[(String, PathBuf)]) -> Result<u64, StoreError> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for (top, source) in sources {
        if std::fs::metadata(source)?.is_file() {
            zip.start_file(top.as_str(), options).map_err(zip_error)?;
            let mut input = std::fs::File::open(source)?;
            io::copy(&mut input, &mut zip)?;
            continue;
        }
        zip.add_directory(format!("{top}/"), options)
            .map_err(zip_error)?;
        for entry in TreeWalk::new(source) {
            let entry = entry?;
            if is_temp_name(path::file_name(&entry.relative)) {
                continue;
            }
            let name = format!("{top}/{}", entry.relative);
            if entry.is_dir {
                zip.add_directory(format!("{name}/"), options)
                    .map_err(zip_error)?;
            } else {
                zip.start_file(name, options).map_err(zip_error)?;
                let mut input = std::fs::File::open(&entry.path)?;
                io::copy(&mut input, &mut zip)?;
            }
        }
    }

    let mut file = zip.finish().map_err(zip_error)?;
    file.flush()?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

fn zip_error(err: zip::result::ZipError) -> StoreError {
    StoreError::Io(io::Error::other(err.to_string()))
}
