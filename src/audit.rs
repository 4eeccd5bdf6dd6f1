//! Fire-and-forget activity recording.

use sqlx::SqlitePool;
#[cfg(test)]
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::db::now_ts;
use crate::layout::UserId;

/// One audited action. Optional fields mirror the activity log columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEvent {
    pub user_id: UserId,
    pub action: &'static str,
    pub item_name: Option<String>,
    pub item_path: Option<String>,
    pub details: Option<String>,
}

impl AuditEvent {
    pub fn new(user_id: UserId, action: &'static str) -> Self {
        Self {
            user_id,
            action,
            item_name: None,
            item_path: None,
            details: None,
        }
    }

    pub fn item(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.item_name = Some(name.into());
        self.item_path = Some(path.into());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Receives audit events after a mutation has succeeded.
///
/// Implementations must not block the caller or report failure back: losing
/// an audit record never fails the underlying operation.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes events into the `activity_logs` table on a detached task.
#[derive(Clone)]
pub struct SqlAudit {
    pool: SqlitePool,
}

impl SqlAudit {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl AuditSink for SqlAudit {
    fn record(&self, event: AuditEvent) {
        debug!(
            user_id = event.user_id,
            action = event.action,
            item_path = event.item_path.as_deref().unwrap_or(""),
            "audit"
        );
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let result = sqlx::query(
                "INSERT INTO activity_logs (user_id, action, item_name, item_path, details, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(event.user_id)
            .bind(event.action)
            .bind(&event.item_name)
            .bind(&event.item_path)
            .bind(&event.details)
            .bind(now_ts())
            .execute(&pool)
            .await;
            if let Err(err) = result {
                warn!(user_id = event.user_id, action = event.action, error = %err, "audit write failed");
            }
        });
    }
}

/// Keeps events in memory so tests can assert on them.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemoryAudit {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

#[cfg(test)]
impl MemoryAudit {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.events().into_iter().map(|e| e.action).collect()
    }
}

#[cfg(test)]
impl AuditSink for MemoryAudit {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use std::time::Duration;

    #[tokio::test]
    async fn sql_audit_persists_events() {
        let pool = memory_pool().await;
        let audit = SqlAudit::new(pool.clone());
        audit.record(
            AuditEvent::new(7, "rename")
                .item("a.txt", "docs/a.txt")
                .details("Renamed to: b.txt"),
        );

        let mut count = 0i64;
        for _ in 0..50 {
            count = sqlx::query_scalar("SELECT COUNT(*) FROM activity_logs WHERE user_id = 7")
                .fetch_one(&pool)
                .await
                .expect("count");
            if count > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn memory_audit_collects_actions() {
        let audit = MemoryAudit::default();
        audit.record(AuditEvent::new(1, "move"));
        audit.record(AuditEvent::new(1, "copy"));
        assert_eq!(audit.actions(), ["move", "copy"]);
    }
}
