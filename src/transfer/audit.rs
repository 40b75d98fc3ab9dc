//! Audit trail
//!
//! Every transition attempt the executor runs produces one [`AuditRecord`]:
//! who drove it, which order, which edge, and whether it committed.
//! Terminal orders stay immutable apart from these records.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::state::TransferStatus;
use super::types::{TraceContext, TxnId};

/// `tracing` target the default sink writes to; route it with
/// `RUST_LOG=transfer_saga::audit=info`.
pub const AUDIT_TARGET: &str = "transfer_saga::audit";

/// Actor recorded when no user is on the trace (sweeper, continuation).
pub const SYSTEM_ACTOR: &str = "SYSTEM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResult {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub trace_id: String,
    pub actor: String,
    pub txn_id: TxnId,
    pub from: TransferStatus,
    pub to: TransferStatus,
    pub result: AuditResult,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        trace: &TraceContext,
        txn_id: TxnId,
        from: TransferStatus,
        to: TransferStatus,
    ) -> Self {
        Self {
            trace_id: trace.trace_id.to_string(),
            actor: trace
                .user_id
                .clone()
                .unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
            txn_id,
            from,
            to,
            result: AuditResult::Success,
            error: None,
            duration_ms: 0,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(mut self, error: impl ToString) -> Self {
        self.result = AuditResult::Failure;
        self.error = Some(error.to_string());
        self
    }

    pub fn took(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Where audit records go. Must not fail the transition it describes.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Structured log line per record on [`AUDIT_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        match serde_json::to_string(&record) {
            Ok(json) => info!(
                target: AUDIT_TARGET,
                txn_id = %record.txn_id,
                actor = %record.actor,
                from = %record.from,
                to = %record.to,
                result = ?record.result,
                audit = %json,
                "Audit"
            ),
            Err(e) => warn!(target: AUDIT_TARGET, txn_id = %record.txn_id, error = %e, "Audit record not serializable"),
        }
    }
}

/// Keeps records in memory; handy for tests and local inspection.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn for_txn(&self, txn_id: &TxnId) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| &r.txn_id == txn_id)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
