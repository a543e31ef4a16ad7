//! Audit trail for committed ledger mutations.
//!
//! Entries are written after the ledger transaction commits. A failed write is
//! logged and counted but never undoes the mutation it describes.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Mutex;
use uuid::Uuid;

use crate::services::metrics::record_error;

/// One audit record.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub actor_id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: Value,
}

impl AuditEntry {
    pub fn new(
        actor_id: impl Into<String>,
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            details,
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Best effort: implementations swallow their own failures.
    async fn record(&self, entry: AuditEntry);
}

/// Writes entries to the `audit_logs` table.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, entry: AuditEntry) {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_logs (audit_id, actor_id, action, entity_type, entity_id, details)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.actor_id)
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.details)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => tracing::debug!(
                action = %entry.action,
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                "Audit entry written"
            ),
            Err(e) => {
                record_error("audit_write");
                tracing::error!(
                    error = %e,
                    action = %entry.action,
                    entity_type = %entry.entity_type,
                    entity_id = %entry.entity_id,
                    "Failed to write audit entry"
                );
            }
        }
    }
}

/// Keeps entries in memory. Used by tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_sink_keeps_entries_in_order() {
        let sink = MemoryAuditSink::default();
        sink.record(AuditEntry::new("ops-1", "debt.create", "driver_debt", "7", json!({"amount": "300.00"})))
            .await;
        sink.record(AuditEntry::new("ops-1", "debt.void", "driver_debt", "7", json!({})))
            .await;

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "debt.create");
        assert_eq!(entries[1].action, "debt.void");
    }
}
