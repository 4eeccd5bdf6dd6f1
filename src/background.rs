//! Periodic maintenance: archive expiry, quota reconciliation and the optional
//! trash reaper.

use std::time::Duration;
use tracing::{info, warn};

use crate::archive::ArchiveBuilder;
use crate::config::{ARCHIVE_CLEAN_INTERVAL_SECS, TRASH_REAP_INTERVAL_SECS};
use crate::quota::QuotaLedger;
use crate::trash::TrashStore;

pub struct BackgroundConfig {
    /// 0 disables reconciliation.
    pub quota_reconcile_secs: u64,
    pub trash_auto_purge: bool,
}

pub fn spawn_background_tasks(
    archives: ArchiveBuilder,
    ledger: QuotaLedger,
    trash: TrashStore,
    config: BackgroundConfig,
) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(ARCHIVE_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = archives.cleanup_expired().await {
                warn!(error = %err, "archive cleanup failed");
            }
        }
    });

    if config.quota_reconcile_secs > 0 {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(config.quota_reconcile_secs));
            loop {
                interval.tick().await;
                match ledger.reconcile_all().await {
                    Ok(count) => info!(accounts = count, "quota reconciled"),
                    Err(err) => warn!(error = %err, "quota reconcile failed"),
                }
            }
        });
    }

    if config.trash_auto_purge {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(TRASH_REAP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                match trash.purge_expired().await {
                    Ok(summary) if summary.purged > 0 || summary.failed > 0 => info!(
                        purged = summary.purged,
                        failed = summary.failed,
                        "expired trash purged"
                    ),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "trash reaper failed"),
                }
            }
        });
    }
}
