//! Best-effort batch operations over a selection of entries.
//!
//! Every item is attempted independently; a failure is counted, never
//! propagated, and never undoes another item's success.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::archive::{ArchiveBuilder, ArchiveTicket};
use crate::audit::{AuditEvent, AuditSink};
use crate::context::RequestContext;
use crate::error::StoreError;
use crate::favorites::FavoriteStore;
use crate::trash::TrashStore;
use crate::tree::StorageTree;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Delete,
    Move,
    Copy,
    Download,
    Favorite,
    Unfavorite,
}

impl BulkAction {
    fn as_str(self) -> &'static str {
        match self {
            BulkAction::Delete => "delete",
            BulkAction::Move => "move",
            BulkAction::Copy => "copy",
            BulkAction::Download => "download",
            BulkAction::Favorite => "favorite",
            BulkAction::Unfavorite => "unfavorite",
        }
    }

    fn audit_action(self) -> &'static str {
        match self {
            BulkAction::Delete => "bulk_delete",
            BulkAction::Move => "bulk_move",
            BulkAction::Copy => "bulk_copy",
            BulkAction::Download => "bulk_download",
            BulkAction::Favorite => "bulk_favorite",
            BulkAction::Unfavorite => "bulk_unfavorite",
        }
    }
}

impl fmt::Display for BulkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    pub success_count: usize,
    pub failure_count: usize,
    pub summary: String,
    /// Present for downloads that produced an archive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<ArchiveTicket>,
}

impl BulkOutcome {
    fn new(action: BulkAction, success_count: usize, failure_count: usize) -> Self {
        Self {
            success_count,
            failure_count,
            summary: format!("{action}: {success_count} succeeded, {failure_count} failed"),
            download: None,
        }
    }
}

#[derive(Clone)]
pub struct BulkCoordinator {
    tree: StorageTree,
    trash: TrashStore,
    favorites: FavoriteStore,
    archives: ArchiveBuilder,
    audit: Arc<dyn AuditSink>,
}

impl BulkCoordinator {
    pub fn new(
        tree: StorageTree,
        trash: TrashStore,
        favorites: FavoriteStore,
        archives: ArchiveBuilder,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            tree,
            trash,
            favorites,
            archives,
            audit,
        }
    }

    /// Applies `action` to every item. Only malformed requests fail as a whole.
    pub async fn apply(
        &self,
        ctx: &RequestContext,
        action: BulkAction,
        items: &[String],
        destination: Option<&str>,
    ) -> Result<BulkOutcome, StoreError> {
        if items.is_empty() {
            return Err(StoreError::InvalidPath);
        }
        let outcome = match action {
            BulkAction::Move | BulkAction::Copy => {
                let destination = destination.ok_or(StoreError::InvalidPath)?;
                self.transfer(ctx, action, items, destination).await
            }
            BulkAction::Download => self.download(ctx, items).await,
            _ => {
                let mut succeeded = 0;
                for item in items {
                    match self.apply_one(ctx, action, item).await {
                        Ok(()) => succeeded += 1,
                        Err(err) => log_failure(ctx, action, item, &err),
                    }
                }
                BulkOutcome::new(action, succeeded, items.len() - succeeded)
            }
        };

        info!(
            user_id = ctx.user_id,
            action = action.as_str(),
            succeeded = outcome.success_count,
            failed = outcome.failure_count,
            "bulk operation finished"
        );
        self.audit.record(
            AuditEvent::new(ctx.user_id, action.audit_action()).details(outcome.summary.clone()),
        );
        Ok(outcome)
    }

    async fn apply_one(
        &self,
        ctx: &RequestContext,
        action: BulkAction,
        item: &str,
    ) -> Result<(), StoreError> {
        match action {
            BulkAction::Delete => self.trash.trash(ctx, item).await.map(|_| ()),
            BulkAction::Favorite => {
                let entry = self.tree.stat(ctx, item).await?;
                self.favorites.add(ctx, &entry).await
            }
            BulkAction::Unfavorite => self.favorites.remove(ctx, item).await,
            BulkAction::Move | BulkAction::Copy | BulkAction::Download => {
                Err(StoreError::InvalidPath)
            }
        }
    }

    async fn transfer(
        &self,
        ctx: &RequestContext,
        action: BulkAction,
        items: &[String],
        destination: &str,
    ) -> BulkOutcome {
        if let Err(err) = self.tree.locate_dir(ctx, destination).await {
            debug!(user_id = ctx.user_id, destination, error = %err, "bulk destination unavailable");
            return BulkOutcome::new(action, 0, items.len());
        }
        let mut succeeded = 0;
        for item in items {
            let result = match action {
                BulkAction::Move => self.tree.move_entry(ctx, item, destination).await,
                _ => self.tree.copy_into(ctx, item, destination).await,
            };
            match result {
                Ok(_) => succeeded += 1,
                Err(err) => log_failure(ctx, action, item, &err),
            }
        }
        BulkOutcome::new(action, succeeded, items.len() - succeeded)
    }

    async fn download(&self, ctx: &RequestContext, items: &[String]) -> BulkOutcome {
        let mut found = Vec::new();
        for item in items {
            match self.tree.stat(ctx, item).await {
                Ok(entry) => found.push(entry.path),
                Err(err) => log_failure(ctx, BulkAction::Download, item, &err),
            }
        }
        if found.is_empty() {
            return BulkOutcome::new(BulkAction::Download, 0, items.len());
        }
        let filename = format!("download_{}", Utc::now().format("%Y-%m-%d_%H-%M-%S"));
        match self.archives.build_archive(ctx, &found, &filename).await {
            Ok(ticket) => {
                let mut outcome =
                    BulkOutcome::new(BulkAction::Download, found.len(), items.len() - found.len());
                outcome.download = Some(ticket);
                outcome
            }
            Err(err) => {
                log_failure(ctx, BulkAction::Download, "archive", &err);
                BulkOutcome::new(BulkAction::Download, 0, items.len())
            }
        }
    }
}

fn log_failure(ctx: &RequestContext, action: BulkAction, item: &str, err: &StoreError) {
    debug!(user_id = ctx.user_id, action = action.as_str(), item, error = %err, "bulk item failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::{CTX, Fixture, fixture, fixture_with, write};
    use crate::config::SnapshotPolicy;
    use std::time::Duration;

    struct Harness {
        f: Fixture,
        bulk: BulkCoordinator,
        trash: TrashStore,
        favorites: FavoriteStore,
        archives: ArchiveBuilder,
    }

    fn harness(f: Fixture) -> Harness {
        let sink: Arc<dyn AuditSink> = Arc::new(f.audit.clone());
        let trash = TrashStore::new(
            f.pool.clone(),
            f.layout.clone(),
            f.ledger.clone(),
            sink.clone(),
            30,
        );
        let favorites = FavoriteStore::new(f.pool.clone(), sink.clone());
        let archives = ArchiveBuilder::new(f.layout.clone(), Duration::from_secs(600));
        let bulk = BulkCoordinator::new(
            f.tree.clone(),
            trash.clone(),
            favorites.clone(),
            archives.clone(),
            sink,
        );
        Harness {
            f,
            bulk,
            trash,
            favorites,
            archives,
        }
    }

    fn items(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn bulk_delete_counts_partial_failures() {
        let h = harness(fixture().await);
        write(&h.f, "a.txt", b"a");
        write(&h.f, "dir/b.txt", b"b");
        write(&h.f, "keep.txt", b"k");

        let selection = items(&["a.txt", "missing.txt", "dir", "../../ghost", ""]);
        let outcome = h
            .bulk
            .apply(&CTX, BulkAction::Delete, &selection, None)
            .await
            .unwrap();
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.failure_count, 3);
        assert_eq!(outcome.summary, "delete: 2 succeeded, 3 failed");

        let trashed: Vec<_> = h
            .trash
            .list(&CTX)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.original_path)
            .collect();
        assert_eq!(trashed.len(), 2);
        assert!(trashed.contains(&"a.txt".to_string()));
        assert!(trashed.contains(&"dir".to_string()));
        assert!(!h.f.live.join("a.txt").exists());
        assert_eq!(std::fs::read(h.f.live.join("keep.txt")).unwrap(), b"k");
        assert!(h.f.audit.actions().contains(&"bulk_delete"));
    }

    #[tokio::test]
    async fn missing_destination_fails_every_item() {
        let h = harness(fixture().await);
        write(&h.f, "a.txt", b"a");
        write(&h.f, "b.txt", b"b");
        let selection = items(&["a.txt", "b.txt"]);

        for action in [BulkAction::Move, BulkAction::Copy] {
            let outcome = h
                .bulk
                .apply(&CTX, action, &selection, Some("nowhere"))
                .await
                .unwrap();
            assert_eq!((outcome.success_count, outcome.failure_count), (0, 2));
        }
        assert!(h.f.live.join("a.txt").is_file());
        assert!(!h.f.live.join("nowhere").exists());
        assert!(matches!(
            h.bulk.apply(&CTX, BulkAction::Move, &selection, None).await,
            Err(StoreError::InvalidPath)
        ));
    }

    #[tokio::test]
    async fn bulk_move_skips_collisions_and_self_containment() {
        let h = harness(fixture().await);
        write(&h.f, "a.txt", b"a");
        write(&h.f, "b.txt", b"top");
        write(&h.f, "target/b.txt", b"nested");
        let selection = items(&["a.txt", "b.txt", "target"]);

        let outcome = h
            .bulk
            .apply(&CTX, BulkAction::Move, &selection, Some("target"))
            .await
            .unwrap();
        assert_eq!((outcome.success_count, outcome.failure_count), (1, 2));
        assert!(h.f.live.join("target/a.txt").is_file());
        assert_eq!(std::fs::read(h.f.live.join("b.txt")).unwrap(), b"top");
        assert_eq!(std::fs::read(h.f.live.join("target/b.txt")).unwrap(), b"nested");
    }

    #[tokio::test]
    async fn bulk_copy_is_recursive_and_quota_checked() {
        let h = harness(fixture_with(30, SnapshotPolicy::Blocking).await);
        write(&h.f, "dir/x.bin", &[1u8; 4]);
        write(&h.f, "dir/sub/y.bin", &[2u8; 4]);
        write(&h.f, "big.bin", &[3u8; 9]);
        std::fs::create_dir(h.f.live.join("dest")).unwrap();
        h.f.ledger.recompute(1).await.unwrap();

        let outcome = h
            .bulk
            .apply(&CTX, BulkAction::Copy, &items(&["dir", "big.bin"]), Some("dest"))
            .await
            .unwrap();
        assert_eq!((outcome.success_count, outcome.failure_count), (1, 1));
        assert_eq!(std::fs::read(h.f.live.join("dest/dir/sub/y.bin")).unwrap(), [2u8; 4]);
        assert!(!h.f.live.join("dest/big.bin").exists());
        assert_eq!(h.f.ledger.account(1).await.unwrap().used, 25);

        let again = h
            .bulk
            .apply(&CTX, BulkAction::Copy, &items(&["dir/x.bin"]), Some("dest/dir"))
            .await
            .unwrap();
        assert_eq!((again.success_count, again.failure_count), (0, 1));
    }

    #[tokio::test]
    async fn bulk_favorites_count_duplicates_as_failures() {
        let h = harness(fixture().await);
        write(&h.f, "a.txt", b"a");
        write(&h.f, "docs/b.txt", b"b");

        let outcome = h
            .bulk
            .apply(&CTX, BulkAction::Favorite, &items(&["a.txt", "docs", "a.txt", "nope"]), None)
            .await
            .unwrap();
        assert_eq!((outcome.success_count, outcome.failure_count), (2, 2));
        assert_eq!(h.favorites.list(&CTX).await.unwrap().len(), 2);

        let outcome = h
            .bulk
            .apply(&CTX, BulkAction::Unfavorite, &items(&["docs", "docs"]), None)
            .await
            .unwrap();
        assert_eq!((outcome.success_count, outcome.failure_count), (1, 1));
    }

    #[tokio::test]
    async fn bulk_download_archives_found_items() {
        let h = harness(fixture().await);
        write(&h.f, "a.txt", b"a");
        write(&h.f, "docs/b.txt", b"b");

        let outcome = h
            .bulk
            .apply(&CTX, BulkAction::Download, &items(&["a.txt", "docs", "gone"]), None)
            .await
            .unwrap();
        assert_eq!((outcome.success_count, outcome.failure_count), (2, 1));
        let ticket = outcome.download.expect("archive ticket");
        assert!(ticket.filename.starts_with("download_"));
        let handle = h.archives.take(&CTX, &ticket.token).await.unwrap();
        assert!(handle.path.is_file());

        let none = h
            .bulk
            .apply(&CTX, BulkAction::Download, &items(&["gone"]), None)
            .await
            .unwrap();
        assert!(none.download.is_none());
        assert_eq!(none.failure_count, 1);
    }

    #[test]
    fn outcome_serializes_in_camel_case() {
        let outcome = BulkOutcome::new(BulkAction::Favorite, 3, 1);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["successCount"], 3);
        assert_eq!(json["failureCount"], 1);
        assert_eq!(json["summary"], "favorite: 3 succeeded, 1 failed");
        assert!(json.get("download").is_none());

        let action: BulkAction = serde_json::from_str("\"unfavorite\"").unwrap();
        assert_eq!(action, BulkAction::Unfavorite);
    }
}
