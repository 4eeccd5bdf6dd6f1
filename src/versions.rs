//! Historical snapshots of overwritten files.
//!
//! Version numbers come from a per-(user, path) counter that only ever grows,
//! so numbers are never reused even after the newest version is deleted.
//! Snapshot bytes are written before their record is inserted and removed
//! before their record is deleted. Snapshots live flat in the user's versions
//! root under a unique prefix.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tracing::{info, warn};
use uuid::Uuid;

use crate::atomic::{AtomicFile, copy_file_no_replace};
use crate::audit::{AuditEvent, AuditSink};
use crate::config::DEFAULT_LOCK_WAIT_TIMEOUT_SECS;
use crate::context::RequestContext;
use crate::db::{now_ts, to_datetime};
use crate::error::StoreError;
use crate::layout::Layout;
use crate::locking::LockManager;
use crate::path::{self, resolve_checked, sanitize};
use crate::quota::{QuotaLedger, to_db};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    pub id: i64,
    pub file_path: String,
    pub file_name: String,
    pub version_number: i64,
    /// Flat snapshot file name inside the user's versions root.
    #[serde(skip)]
    pub version_path: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: i64,
    file_path: String,
    file_name: String,
    version_number: i64,
    version_path: String,
    file_size: i64,
    created_at: i64,
}

impl From<VersionRow> for FileVersion {
    fn from(row: VersionRow) -> Self {
        FileVersion {
            id: row.id,
            file_path: row.file_path,
            file_name: row.file_name,
            version_number: row.version_number,
            version_path: row.version_path,
            size: row.file_size.max(0) as u64,
            created_at: to_datetime(row.created_at),
        }
    }
}

const VERSION_COLUMNS: &str =
    "id, file_path, file_name, version_number, version_path, file_size, created_at";

#[derive(Clone)]
pub struct VersionStore {
    pool: SqlitePool,
    layout: Layout,
    ledger: QuotaLedger,
    locks: Arc<LockManager>,
    audit: Arc<dyn AuditSink>,
}

impl VersionStore {
    pub fn new(
        pool: SqlitePool,
        layout: Layout,
        ledger: QuotaLedger,
        locks: Arc<LockManager>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            pool,
            layout,
            ledger,
            locks,
            audit,
        }
    }

    /// Copies the current bytes at `current` into a new version of `logical_path`.
    ///
    /// The caller must hold the path lock for `logical_path`.
    pub async fn snapshot_before_overwrite(
        &self,
        ctx: &RequestContext,
        logical_path: &str,
        display_name: &str,
        current: &Path,
    ) -> Result<FileVersion, StoreError> {
        let logical_path = sanitize(logical_path)?;
        if logical_path.is_empty() {
            return Err(StoreError::InvalidPath);
        }
        let number = self.next_number(ctx, &logical_path).await?;
        let created_at = now_ts();
        let relative = format!(
            "{created_at}_{}_{}",
            &Uuid::new_v4().simple().to_string()[..8],
            snapshot_name(display_name, number)
        );

        let root = self.layout.versions_root(ctx.user_id).await?;
        let target = root.join(&relative);
        let size = copy_file_no_replace(current, &target).await?;

        let inserted = sqlx::query(
            "INSERT INTO file_versions (user_id, file_path, file_name, version_number, version_path, file_size, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(ctx.user_id)
        .bind(&logical_path)
        .bind(display_name)
        .bind(number)
        .bind(&relative)
        .bind(to_db(size))
        .bind(created_at)
        .execute(&self.pool)
        .await;
        let id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(err) => {
                let _ = fs::remove_file(&target).await;
                return Err(err.into());
            }
        };

        info!(
            user_id = ctx.user_id,
            path = logical_path,
            version = number,
            size,
            "version snapshot created"
        );
        Ok(FileVersion {
            id,
            file_path: logical_path,
            file_name: display_name.to_string(),
            version_number: number,
            version_path: relative,
            size,
            created_at: to_datetime(created_at),
        })
    }

    async fn next_number(&self, ctx: &RequestContext, logical_path: &str) -> Result<i64, StoreError> {
        let number: i64 = sqlx::query_scalar(
            "INSERT INTO version_counters (user_id, file_path, last_number) \
             VALUES (?1, ?2, COALESCE((SELECT MAX(version_number) FROM file_versions WHERE user_id = ?1 AND file_path = ?2), 0) + 1) \
             ON CONFLICT (user_id, file_path) DO UPDATE SET last_number = last_number + 1 \
             RETURNING last_number",
        )
        .bind(ctx.user_id)
        .bind(logical_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(number)
    }

    /// Versions of one logical file, newest first.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        logical_path: &str,
    ) -> Result<Vec<FileVersion>, StoreError> {
        let logical_path = sanitize(logical_path)?;
        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {VERSION_COLUMNS} FROM file_versions WHERE user_id = ? AND file_path = ? ORDER BY version_number DESC"
        ))
        .bind(ctx.user_id)
        .bind(&logical_path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FileVersion::from).collect())
    }

    pub async fn get(&self, ctx: &RequestContext, id: i64) -> Result<FileVersion, StoreError> {
        sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {VERSION_COLUMNS} FROM file_versions WHERE id = ? AND user_id = ?"
        ))
        .bind(id)
        .bind(ctx.user_id)
        .fetch_optional(&self.pool)
        .await?
        .map(FileVersion::from)
        .ok_or(StoreError::NotFound)
    }

    /// Opens a version's bytes for delivery, with a suggested download name.
    pub async fn open(
        &self,
        ctx: &RequestContext,
        id: i64,
    ) -> Result<(File, u64, String), StoreError> {
        let version = self.get(ctx, id).await?;
        let path = self.snapshot_path(ctx, &version).await?;
        let file = File::open(&path).await.map_err(StoreError::classify)?;
        let size = file.metadata().await?.len();
        Ok((file, size, snapshot_name(&version.file_name, version.version_number)))
    }

    /// Puts a version's content back on the live path.
    ///
    /// Current live content, if any, is snapshotted first so the restore never
    /// loses data; that snapshot is returned.
    pub async fn restore(
        &self,
        ctx: &RequestContext,
        id: i64,
    ) -> Result<Option<FileVersion>, StoreError> {
        let version = self.get(ctx, id).await?;
        let _guard = self
            .locks
            .lock_path(
                ctx.user_id,
                &version.file_path,
                Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
            )
            .await?;
        let source = self.snapshot_path(ctx, &version).await?;
        let live_root = self.layout.live_root(ctx.user_id).await?;
        let target = resolve_checked(&live_root, &version.file_path, true).await?;

        let current_size = match fs::metadata(&target).await {
            Ok(metadata) if metadata.is_dir() => return Err(StoreError::AlreadyExists),
            Ok(metadata) => Some(metadata.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        self.ledger
            .authorize(
                ctx.user_id,
                version.size.saturating_sub(current_size.unwrap_or(0)),
            )
            .await?;

        let backup = match current_size {
            Some(_) => Some(
                self.snapshot_before_overwrite(ctx, &version.file_path, &version.file_name, &target)
                    .await?,
            ),
            None => None,
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut atomic = AtomicFile::new(&target).await?;
        let copied = match File::open(&source).await {
            Ok(mut input) => tokio::io::copy(&mut input, atomic.file_mut()).await,
            Err(err) => Err(err),
        };
        if let Err(err) = copied {
            atomic.cleanup().await;
            return Err(StoreError::classify(err));
        }
        atomic.finalize().await?;

        self.ledger.refresh(ctx.user_id).await;
        info!(
            user_id = ctx.user_id,
            path = version.file_path,
            version = version.version_number,
            "version restored"
        );
        self.audit.record(
            AuditEvent::new(ctx.user_id, "version_restore")
                .item(&version.file_name, &version.file_path)
                .details(format!("Restored version {}", version.version_number)),
        );
        Ok(backup)
    }

    /// Removes one version's bytes, then its record. Other numbers are untouched.
    pub async fn delete(&self, ctx: &RequestContext, id: i64) -> Result<(), StoreError> {
        let version = self.get(ctx, id).await?;
        let path = self.snapshot_path(ctx, &version).await?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(user_id = ctx.user_id, id, "version bytes already missing");
            }
            Err(err) => return Err(err.into()),
        }
        sqlx::query("DELETE FROM file_versions WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(ctx.user_id)
            .execute(&self.pool)
            .await?;
        info!(
            user_id = ctx.user_id,
            path = version.file_path,
            version = version.version_number,
            "version deleted"
        );
        self.audit.record(
            AuditEvent::new(ctx.user_id, "version_delete")
                .item(&version.file_name, &version.file_path)
                .details(format!("Deleted version {}", version.version_number)),
        );
        Ok(())
    }

    async fn snapshot_path(
        &self,
        ctx: &RequestContext,
        version: &FileVersion,
    ) -> Result<PathBuf, StoreError> {
        if version.version_path.contains('/') {
            return Err(StoreError::InvalidPath);
        }
        let root = self.layout.versions_root(ctx.user_id).await?;
        resolve_checked(&root, &version.version_path, false).await
    }
}

/// `report.txt` version 3 becomes `report_v3.txt`.
fn snapshot_name(display_name: &str, number: i64) -> String {
    match path::split_extension(display_name) {
        (stem, Some(ext)) => format!("{stem}_v{number}.{ext}"),
        (stem, None) => format!("{stem}_v{number}"),
    }
}
