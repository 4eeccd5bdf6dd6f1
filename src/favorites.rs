//! Starred entries of the live tree.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use crate::audit::{AuditEvent, AuditSink};
use crate::context::RequestContext;
use crate::db::{now_ts, to_datetime};
use crate::error::StoreError;
use crate::path::{self, sanitize};
use crate::tree::TreeEntry;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Favorite {
    pub id: i64,
    pub item_path: String,
    pub item_name: String,
    pub is_folder: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct FavoriteRow {
    id: i64,
    item_path: String,
    item_name: String,
    is_folder: bool,
    created_at: i64,
}

impl From<FavoriteRow> for Favorite {
    fn from(row: FavoriteRow) -> Self {
        Favorite {
            id: row.id,
            item_path: row.item_path,
            item_name: row.item_name,
            is_folder: row.is_folder,
            created_at: to_datetime(row.created_at),
        }
    }
}

#[derive(Clone)]
pub struct FavoriteStore {
    pool: SqlitePool,
    audit: Arc<dyn AuditSink>,
}

impl FavoriteStore {
    pub fn new(pool: SqlitePool, audit: Arc<dyn AuditSink>) -> Self {
        Self { pool, audit }
    }

    /// Stars an existing entry; starring it twice is `AlreadyExists`.
    pub async fn add(&self, ctx: &RequestContext, entry: &TreeEntry) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO favorites (user_id, item_path, item_name, is_folder, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(ctx.user_id)
        .bind(&entry.path)
        .bind(&entry.name)
        .bind(entry.is_dir)
        .bind(now_ts())
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(StoreError::AlreadyExists);
            }
            Err(err) => return Err(err.into()),
        }
        info!(user_id = ctx.user_id, path = entry.path, "favorite added");
        self.audit.record(
            AuditEvent::new(ctx.user_id, "favorite").item(&entry.name, path::parent(&entry.path)),
        );
        Ok(())
    }

    pub async fn remove(&self, ctx: &RequestContext, raw: &str) -> Result<(), StoreError> {
        let item_path = sanitize(raw)?;
        let removed = sqlx::query("DELETE FROM favorites WHERE user_id = ? AND item_path = ?")
            .bind(ctx.user_id)
            .bind(&item_path)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(StoreError::NotFound);
        }
        self.audit.record(
            AuditEvent::new(ctx.user_id, "unfavorite")
                .item(path::file_name(&item_path), path::parent(&item_path)),
        );
        Ok(())
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<Favorite>, StoreError> {
        let rows = sqlx::query_as::<_, FavoriteRow>(
            "SELECT id, item_path, item_name, is_folder, created_at FROM favorites \
             WHERE user_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(ctx.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Favorite::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::{CTX, fixture, write};

    #[tokio::test]
    async fn favorites_are_unique_per_user() {
        let f = fixture().await;
        let favorites = FavoriteStore::new(f.pool.clone(), Arc::new(f.audit.clone()));
        write(&f, "docs/plan.txt", b"p");
        let entry = f.tree.stat(&CTX, "docs/plan.txt").await.unwrap();

        favorites.add(&CTX, &entry).await.unwrap();
        assert!(matches!(
            favorites.add(&CTX, &entry).await,
            Err(StoreError::AlreadyExists)
        ));
        favorites.add(&RequestContext::new(2), &entry).await.unwrap();

        let listed = favorites.list(&CTX).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].item_path, "docs/plan.txt");
        assert!(!listed[0].is_folder);

        favorites.remove(&CTX, "/docs/plan.txt").await.unwrap();
        assert!(matches!(
            favorites.remove(&CTX, "docs/plan.txt").await,
            Err(StoreError::NotFound)
        ));
        assert_eq!(favorites.list(&RequestContext::new(2)).await.unwrap().len(), 1);
    }
}
