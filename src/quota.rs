//! Per-user byte accounting.
//!
//! The cached `used_bytes` counter is only ever overwritten by [`QuotaLedger::recompute`],
//! which walks the live tree. Size-increasing operations ask [`QuotaLedger::authorize`]
//! before committing bytes; every size-changing operation recomputes afterwards.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::db::now_ts;
use crate::error::StoreError;
use crate::layout::{Layout, UserId};
use crate::walk::tree_size_async;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub user_id: UserId,
    pub quota: u64,
    pub used: u64,
}

impl Account {
    pub fn available(&self) -> u64 {
        self.quota.saturating_sub(self.used)
    }

    /// `used + additional <= quota`; a quota of 0 admits nothing but empty writes.
    pub fn can_write(&self, additional: u64) -> bool {
        self.used
            .checked_add(additional)
            .is_some_and(|total| total <= self.quota)
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    user_id: i64,
    quota_bytes: i64,
    used_bytes: i64,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            user_id: row.user_id,
            quota: row.quota_bytes.max(0) as u64,
            used: row.used_bytes.max(0) as u64,
        }
    }
}

#[derive(Clone)]
pub struct QuotaLedger {
    pool: SqlitePool,
    layout: Layout,
    default_quota: u64,
}

impl QuotaLedger {
    pub fn new(pool: SqlitePool, layout: Layout, default_quota: u64) -> Self {
        Self {
            pool,
            layout,
            default_quota,
        }
    }

    /// Loads the account, provisioning it with the default quota on first use.
    pub async fn account(&self, user: UserId) -> Result<Account, StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO accounts (user_id, quota_bytes, used_bytes, updated_at) VALUES (?, ?, 0, ?)",
        )
        .bind(user)
        .bind(to_db(self.default_quota))
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT user_id, quota_bytes, used_bytes FROM accounts WHERE user_id = ?",
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Precondition for size-increasing operations.
    pub async fn authorize(&self, user: UserId, additional: u64) -> Result<(), StoreError> {
        let account = self.account(user).await?;
        if account.can_write(additional) {
            return Ok(());
        }
        debug!(
            user_id = user,
            additional,
            used = account.used,
            quota = account.quota,
            "write rejected by quota"
        );
        Err(StoreError::QuotaExceeded {
            required: additional,
            available: account.available(),
        })
    }

    /// Walks the live tree and overwrites the cached counter with its size.
    pub async fn recompute(&self, user: UserId) -> Result<u64, StoreError> {
        self.account(user).await?;
        let live = self.layout.live_root(user).await?;
        let used = tree_size_async(live).await?;
        sqlx::query("UPDATE accounts SET used_bytes = ?, updated_at = ? WHERE user_id = ?")
            .bind(to_db(used))
            .bind(now_ts())
            .bind(user)
            .execute(&self.pool)
            .await?;
        debug!(user_id = user, used, "storage usage recomputed");
        Ok(used)
    }

    /// Recompute after a mutation that already succeeded; a failure here only
    /// leaves drift for the next reconciliation.
    pub async fn refresh(&self, user: UserId) {
        if let Err(err) = self.recompute(user).await {
            warn!(user_id = user, error = %err, "storage usage refresh failed");
        }
    }

    /// Privileged override of a user's quota.
    pub async fn set_quota(&self, user: UserId, quota: u64) -> Result<Account, StoreError> {
        self.account(user).await?;
        sqlx::query("UPDATE accounts SET quota_bytes = ?, updated_at = ? WHERE user_id = ?")
            .bind(to_db(quota))
            .bind(now_ts())
            .bind(user)
            .execute(&self.pool)
            .await?;
        info!(user_id = user, quota, "quota updated");
        self.account(user).await
    }

    /// Recomputes every known account, returning how many were refreshed.
    pub async fn reconcile_all(&self) -> Result<usize, StoreError> {
        let users: Vec<i64> = sqlx::query_scalar("SELECT user_id FROM accounts ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        let mut refreshed = 0;
        for user in users {
            match self.recompute(user).await {
                Ok(_) => refreshed += 1,
                Err(err) => warn!(user_id = user, error = %err, "quota reconcile failed"),
            }
        }
        Ok(refreshed)
    }

    #[cfg(test)]
    pub(crate) async fn force_used(&self, user: UserId, used: u64) {
        self.account(user).await.expect("account");
        sqlx::query("UPDATE accounts SET used_bytes = ? WHERE user_id = ?")
            .bind(to_db(used))
            .bind(user)
            .execute(&self.pool)
            .await
            .expect("force used");
    }
}

pub(crate) fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use tempfile::tempdir;

    async fn make_ledger(quota: u64) -> (tempfile::TempDir, QuotaLedger) {
        let temp = tempdir().expect("tempdir");
        let layout = Layout::new(temp.path().join("storage"), temp.path().join("archives"));
        layout.ensure_roots().await.expect("roots");
        let ledger = QuotaLedger::new(memory_pool().await, layout, quota);
        (temp, ledger)
    }

    #[tokio::test]
    async fn accounts_are_provisioned_with_default_quota() {
        let (_temp, ledger) = make_ledger(1_000).await;
        let account = ledger.account(5).await.expect("account");
        assert_eq!(account.quota, 1_000);
        assert_eq!(account.used, 0);
    }

    #[tokio::test]
    async fn can_write_is_inclusive_of_quota() {
        let (_temp, ledger) = make_ledger(1_000_000).await;
        ledger.force_used(1, 999_000).await;
        assert!(ledger.account(1).await.unwrap().can_write(1_000));
        assert!(!ledger.account(1).await.unwrap().can_write(2_000));
        let err = ledger.authorize(1, 2_000).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::QuotaExceeded {
                required: 2_000,
                available: 1_000
            }
        ));
    }

    #[tokio::test]
    async fn zero_quota_means_no_space() {
        let (_temp, ledger) = make_ledger(0).await;
        assert!(!ledger.account(1).await.unwrap().can_write(1));
        assert!(ledger.account(1).await.unwrap().can_write(0));
    }

    #[tokio::test]
    async fn recompute_overwrites_drifted_counter() {
        let (temp, ledger) = make_ledger(10_000).await;
        ledger.force_used(3, 9_999).await;
        let live = temp.path().join("storage/live/user_3");
        std::fs::create_dir_all(live.join("sub")).expect("live dirs");
        std::fs::write(live.join("a.bin"), vec![0u8; 100]).expect("a");
        std::fs::write(live.join("sub/b.bin"), vec![0u8; 23]).expect("b");

        assert_eq!(ledger.recompute(3).await.unwrap(), 123);
        assert_eq!(ledger.account(3).await.unwrap().used, 123);
    }

    #[tokio::test]
    async fn set_quota_and_reconcile_all() {
        let (_temp, ledger) = make_ledger(10).await;
        ledger.force_used(1, 5).await;
        ledger.force_used(2, 7).await;
        let account = ledger.set_quota(1, 4_096).await.unwrap();
        assert_eq!(account.quota, 4_096);
        assert_eq!(ledger.reconcile_all().await.unwrap(), 2);
        assert_eq!(ledger.account(2).await.unwrap().used, 0);
    }
}
