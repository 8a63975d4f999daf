use std::sync::Arc;

use chrono::Utc;
use diesel::insert_into;
use diesel_async::RunQueryDsl;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use crate::db::models::NewAuditEvent;
use crate::db::schema::ops_audit_events;
use crate::db::{map_diesel_error, map_pool_error, DbPool, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub owner_user_id: Option<String>,
    pub kind: &'static str,
    pub action: String,
    pub ok: bool,
    pub details: Value,
}

/// Append-only operational audit trail. Writes are best-effort.
pub trait AuditSink: Send + Sync {
    fn record<'a>(&'a self, record: &'a AuditRecord) -> BoxFuture<'a, Result<(), StoreError>>;
}

impl<T> AuditSink for Arc<T>
where
    T: AuditSink + ?Sized,
{
    fn record<'a>(&'a self, record: &'a AuditRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).record(record)
    }
}

pub struct PgAuditSink {
    pool: DbPool,
}

impl PgAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl AuditSink for PgAuditSink {
    fn record<'a>(&'a self, record: &'a AuditRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            insert_into(ops_audit_events::table)
                .values(&NewAuditEvent {
                    owner_user_id: record.owner_user_id.clone(),
                    kind: record.kind.to_string(),
                    action: record.action.clone(),
                    ok: record.ok,
                    details: record.details.clone(),
                    created_at: Utc::now(),
                })
                .execute(&mut conn)
                .await
                .map_err(map_diesel_error)?;
            Ok(())
        })
    }
}

/// Writes `record`, logging instead of failing when the sink is unavailable.
pub async fn record_best_effort(sink: &dyn AuditSink, record: AuditRecord) {
    if let Err(err) = sink.record(&record).await {
        warn!(
            event = "audit_write_failed",
            kind = record.kind,
            action = %record.action,
            error = %err,
            "failed to append audit record"
        );
    }
}
