//! Audit sink: write-once, never read on the hot path.
//!
//! The write completes before the pipeline returns so every invocation
//! leaves exactly one record, but a failed write only logs — it never
//! changes the caller-visible outcome.

use std::sync::Arc;

use crate::models::audit::InferenceRecord;
use crate::store::AuditStore;

#[derive(Clone)]
pub struct AuditSink {
    store: Arc<dyn AuditStore>,
}

impl AuditSink {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Persist one record, best-effort.
    pub async fn emit(&self, record: &InferenceRecord) {
        if let Err(e) = self.store.insert_record(record).await {
            tracing::error!(
                request_id = %record.request_id,
                org_id = %record.org_id,
                status = record.status.as_str(),
                error = %e,
                "audit write failed"
            );
        }
    }
}
