//! Soft-deleted items: `Live -> Trashed -> {Restored -> Live, Purged}`.
//!
//! Bytes always move before metadata is written, and bytes are removed before
//! their record is deleted, so a crash can orphan a file in the trash area but
//! never leave a record pointing at nothing it once owned.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::atomic::{remove_entry, rename_no_replace};
use crate::audit::{AuditEvent, AuditSink};
use crate::config::SECONDS_PER_DAY;
use crate::context::RequestContext;
use crate::db::{now_ts, to_datetime};
use crate::error::StoreError;
use crate::layout::{Layout, UserId};
use crate::path::{self, resolve_checked, sanitize};
use crate::quota::{QuotaLedger, to_db};
use crate::walk::tree_size_async;

const MAX_RESTORE_NAME_ATTEMPTS: u32 = 100;

/// Whole days left before an item trashed at `deleted_at` expires.
pub fn days_left(deleted_at: i64, now: i64, retention_days: i64) -> i64 {
    let elapsed_days = (now - deleted_at).div_euclid(SECONDS_PER_DAY);
    (retention_days - elapsed_days).max(0)
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrashRecord {
    pub id: i64,
    pub original_name: String,
    /// Live-relative path the item was trashed from.
    pub original_path: String,
    #[serde(skip)]
    pub trash_name: String,
    pub size: u64,
    pub is_folder: bool,
    pub deleted_at: DateTime<Utc>,
    pub days_left: i64,
}

#[derive(sqlx::FromRow)]
struct TrashRow {
    id: i64,
    user_id: i64,
    original_name: String,
    original_path: String,
    trash_name: String,
    file_size: i64,
    is_folder: bool,
    deleted_at: i64,
}

impl TrashRow {
    fn into_record(self, now: i64, retention_days: i64) -> TrashRecord {
        TrashRecord {
            id: self.id,
            original_name: self.original_name,
            original_path: self.original_path,
            trash_name: self.trash_name,
            size: self.file_size.max(0) as u64,
            is_folder: self.is_folder,
            deleted_at: to_datetime(self.deleted_at),
            days_left: days_left(self.deleted_at, now, retention_days),
        }
    }
}

const TRASH_COLUMNS: &str =
    "id, user_id, original_name, original_path, trash_name, file_size, is_folder, deleted_at";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeSummary {
    pub purged: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub restored: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct TrashStore {
    pool: SqlitePool,
    layout: Layout,
    ledger: QuotaLedger,
    audit: Arc<dyn AuditSink>,
    retention_days: i64,
}

impl TrashStore {
    pub fn new(
        pool: SqlitePool,
        layout: Layout,
        ledger: QuotaLedger,
        audit: Arc<dyn AuditSink>,
        retention_days: u32,
    ) -> Self {
        Self {
            pool,
            layout,
            ledger,
            audit,
            retention_days: i64::from(retention_days),
        }
    }

    /// Moves a live entry into the trash area and records it.
    pub async fn trash(&self, ctx: &RequestContext, raw: &str) -> Result<TrashRecord, StoreError> {
        let relative = sanitize(raw)?;
        if relative.is_empty() {
            return Err(StoreError::InvalidPath);
        }
        let live = self.layout.live_root(ctx.user_id).await?;
        let source = resolve_checked(&live, &relative, false).await?;
        let is_folder = fs::symlink_metadata(&source).await?.is_dir();
        let size = tree_size_async(source.clone()).await?;

        let name = path::file_name(&relative).to_string();
        let deleted_at = now_ts();
        let trash_name = format!(
            "{deleted_at}_{}_{name}",
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let trash_path = self.layout.trash_root(ctx.user_id).await?.join(&trash_name);
        rename_no_replace(&source, &trash_path).await?;

        let inserted = sqlx::query(
            "INSERT INTO trash (user_id, original_name, original_path, trash_name, file_size, is_folder, deleted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(ctx.user_id)
        .bind(&name)
        .bind(&relative)
        .bind(&trash_name)
        .bind(to_db(size))
        .bind(is_folder)
        .bind(deleted_at)
        .execute(&self.pool)
        .await;
        let id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(err) => {
                if let Err(undo) = rename_no_replace(&trash_path, &source).await {
                    warn!(user_id = ctx.user_id, path = relative, error = %undo, "could not return item after failed trash insert");
                }
                return Err(err.into());
            }
        };

        self.ledger.refresh(ctx.user_id).await;
        info!(user_id = ctx.user_id, path = relative, size, "moved to trash");
        self.audit.record(
            AuditEvent::new(ctx.user_id, "delete")
                .item(&name, path::parent(&relative))
                .details("Moved to trash"),
        );
        Ok(TrashRecord {
            id,
            original_name: name,
            original_path: relative,
            trash_name,
            size,
            is_folder,
            deleted_at: to_datetime(deleted_at),
            days_left: self.retention_days,
        })
    }

    /// Trashed items, most recently deleted first.
    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<TrashRecord>, StoreError> {
        let rows = sqlx::query_as::<_, TrashRow>(&format!(
            "SELECT {TRASH_COLUMNS} FROM trash WHERE user_id = ? ORDER BY deleted_at DESC, id DESC"
        ))
        .bind(ctx.user_id)
        .fetch_all(&self.pool)
        .await?;
        let now = now_ts();
        Ok(rows
            .into_iter()
            .map(|row| row.into_record(now, self.retention_days))
            .collect())
    }

    async fn row(&self, ctx: &RequestContext, id: i64) -> Result<TrashRow, StoreError> {
        sqlx::query_as::<_, TrashRow>(&format!(
            "SELECT {TRASH_COLUMNS} FROM trash WHERE id = ? AND user_id = ?"
        ))
        .bind(id)
        .bind(ctx.user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn stored_path(&self, user: UserId, trash_name: &str) -> Result<PathBuf, StoreError> {
        if sanitize(trash_name)? != trash_name || trash_name.contains('/') {
            return Err(StoreError::InvalidPath);
        }
        Ok(self.layout.trash_root(user).await?.join(trash_name))
    }

    /// Moves a trashed item back to its original location, recreating missing
    /// ancestors. An occupied original path gets a `_restored_<ts>` name.
    pub async fn restore(&self, ctx: &RequestContext, id: i64) -> Result<String, StoreError> {
        let row = self.row(ctx, id).await?;
        let restored = self.restore_row(ctx, &row).await?;
        self.ledger.refresh(ctx.user_id).await;
        Ok(restored)
    }

    /// Restores every record of the user, oldest first. Failures are counted
    /// and leave their records in place.
    pub async fn restore_all(&self, ctx: &RequestContext) -> Result<RestoreSummary, StoreError> {
        let rows = sqlx::query_as::<_, TrashRow>(&format!(
            "SELECT {TRASH_COLUMNS} FROM trash WHERE user_id = ? ORDER BY deleted_at, id"
        ))
        .bind(ctx.user_id)
        .fetch_all(&self.pool)
        .await?;
        let mut summary = RestoreSummary::default();
        for row in &rows {
            match self.restore_row(ctx, row).await {
                Ok(_) => summary.restored += 1,
                Err(err) => {
                    warn!(user_id = ctx.user_id, id = row.id, error = %err, "trash restore failed");
                    summary.failed += 1;
                }
            }
        }
        self.ledger.refresh(ctx.user_id).await;
        info!(user_id = ctx.user_id, restored = summary.restored, failed = summary.failed, "trash restored");
        self.audit.record(
            AuditEvent::new(ctx.user_id, "restore_all")
                .details(format!("{} restored, {} failed", summary.restored, summary.failed)),
        );
        Ok(summary)
    }

    async fn restore_row(&self, ctx: &RequestContext, row: &TrashRow) -> Result<String, StoreError> {
        let stored = self.stored_path(ctx.user_id, &row.trash_name).await?;
        fs::symlink_metadata(&stored)
            .await
            .map_err(StoreError::classify)?;

        let original = sanitize(&row.original_path)?;
        if original.is_empty() {
            return Err(StoreError::InvalidPath);
        }
        let parent = path::parent(&original);
        let live = self.layout.live_root(ctx.user_id).await?;
        let parent_path = resolve_checked(&live, parent, true).await?;
        fs::create_dir_all(&parent_path).await?;

        let name = path::file_name(&original);
        let restored_name = self
            .move_back(&stored, &parent_path, name, row.is_folder)
            .await?;
        let restored = path::join(parent, &restored_name);

        sqlx::query("DELETE FROM trash WHERE id = ? AND user_id = ?")
            .bind(row.id)
            .bind(ctx.user_id)
            .execute(&self.pool)
            .await?;

        info!(user_id = ctx.user_id, path = restored, "restored from trash");
        self.audit.record(
            AuditEvent::new(ctx.user_id, "restore")
                .item(&row.original_name, parent)
                .details(format!("Restored to: {restored}")),
        );
        Ok(restored)
    }

    async fn move_back(
        &self,
        stored: &Path,
        parent_path: &Path,
        name: &str,
        is_folder: bool,
    ) -> Result<String, StoreError> {
        match rename_no_replace(stored, &parent_path.join(name)).await {
            Ok(()) => return Ok(name.to_string()),
            Err(StoreError::AlreadyExists) => {}
            Err(err) => return Err(err),
        }
        let (stem, ext) = if is_folder {
            (name, None)
        } else {
            path::split_extension(name)
        };
        let stamp = now_ts();
        for attempt in 0..MAX_RESTORE_NAME_ATTEMPTS {
            let suffix = match attempt {
                0 => format!("_restored_{stamp}"),
                n => format!("_restored_{stamp}_{n}"),
            };
            let candidate = match ext {
                Some(ext) => format!("{stem}{suffix}.{ext}"),
                None => format!("{stem}{suffix}"),
            };
            match rename_no_replace(stored, &parent_path.join(&candidate)).await {
                Ok(()) => return Ok(candidate),
                Err(StoreError::AlreadyExists) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::AlreadyExists)
    }

    /// Deletes the trashed bytes and then the record. Bytes that are already
    /// gone count as deleted.
    async fn purge_row(&self, row: &TrashRow) -> Result<(), StoreError> {
        let stored = self.stored_path(row.user_id, &row.trash_name).await?;
        match remove_entry(&stored).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(user_id = row.user_id, trash_name = row.trash_name, "trashed bytes already missing");
            }
            Err(err) => return Err(err.into()),
        }
        sqlx::query("DELETE FROM trash WHERE id = ?")
            .bind(row.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn purge(&self, ctx: &RequestContext, id: i64) -> Result<(), StoreError> {
        let row = self.row(ctx, id).await?;
        self.purge_row(&row).await?;
        self.ledger.refresh(ctx.user_id).await;
        info!(user_id = ctx.user_id, id, "trash item purged");
        self.audit.record(
            AuditEvent::new(ctx.user_id, "permanent_delete")
                .item(&row.original_name, path::parent(&row.original_path)),
        );
        Ok(())
    }

    /// Purges every record of the user. Records whose bytes could not be
    /// removed are kept.
    pub async fn purge_all(&self, ctx: &RequestContext) -> Result<PurgeSummary, StoreError> {
        let rows = sqlx::query_as::<_, TrashRow>(&format!(
            "SELECT {TRASH_COLUMNS} FROM trash WHERE user_id = ? ORDER BY id"
        ))
        .bind(ctx.user_id)
        .fetch_all(&self.pool)
        .await?;
        let mut summary = PurgeSummary::default();
        for row in &rows {
            match self.purge_row(row).await {
                Ok(()) => summary.purged += 1,
                Err(err) => {
                    warn!(user_id = ctx.user_id, id = row.id, error = %err, "trash purge failed");
                    summary.failed += 1;
                }
            }
        }
        self.ledger.refresh(ctx.user_id).await;
        info!(user_id = ctx.user_id, purged = summary.purged, failed = summary.failed, "trash emptied");
        self.audit.record(
            AuditEvent::new(ctx.user_id, "empty_trash")
                .details(format!("{} purged, {} failed", summary.purged, summary.failed)),
        );
        Ok(summary)
    }

    /// Purges every record, across all users, whose retention has run out.
    pub async fn purge_expired(&self) -> Result<PurgeSummary, StoreError> {
        let cutoff = now_ts() - self.retention_days * SECONDS_PER_DAY;
        let rows = sqlx::query_as::<_, TrashRow>(&format!(
            "SELECT {TRASH_COLUMNS} FROM trash WHERE deleted_at <= ? ORDER BY id"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        let mut summary = PurgeSummary::default();
        for row in &rows {
            match self.purge_row(row).await {
                Ok(()) => {
                    summary.purged += 1;
                    self.audit.record(
                        AuditEvent::new(row.user_id, "auto_purge")
                            .item(&row.original_name, path::parent(&row.original_path)),
                    );
                }
                Err(err) => {
                    warn!(user_id = row.user_id, id = row.id, error = %err, "expired trash purge failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}
