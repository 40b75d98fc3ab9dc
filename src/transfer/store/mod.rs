//! Transfer persistence
//!
//! A [`UnitOfWork`] groups ledger writes, the order status update and the
//! staged outbound events of one transition. Nothing is visible to other
//! readers until `commit`; `rollback` (or dropping the unit) discards all
//! of it.

pub mod memory;
pub mod postgres;

pub use memory::MemoryTransferStore;
pub use postgres::PgTransferStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::events::OutboundEvent;
use super::state::TransferStatus;
use super::types::{TransferOrder, TxnId};
use crate::ledger::{AccountBalance, AccountFreezeLog, LedgerTx};
use crate::money::CurrencyCode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic check failed at write or commit time.
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored data cannot be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub index: u32,
    pub total: u32,
}

impl Shard {
    pub fn owns(&self, order_id: i64) -> bool {
        self.total > 0 && order_id.rem_euclid(i64::from(self.total)) == i64::from(self.index)
    }
}

/// Order listing filter.
#[derive(Debug, Clone, Default)]
pub struct OrderQuery {
    /// Empty = any status
    pub statuses: Vec<TransferStatus>,
    pub shard: Option<Shard>,
    /// Only orders not touched since this instant
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl OrderQuery {
    pub fn matches(&self, order: &TransferOrder) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&order.status))
            && self.shard.is_none_or(|s| s.owns(order.id))
            && self.updated_before.is_none_or(|t| order.updated_at < t)
    }
}

#[async_trait]
pub trait UnitOfWork: LedgerTx {
    /// Insert (`expected_version == 0`) or compare-and-swap update.
    /// Returns the order's system id.
    async fn save_order(
        &mut self,
        order: &TransferOrder,
        expected_version: i64,
    ) -> Result<i64, StoreError>;

    /// Outbox: handed back by `commit` for publishing.
    fn stage_event(&mut self, event: OutboundEvent);

    async fn commit(self: Box<Self>) -> Result<Vec<OutboundEvent>, StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Insert a balance row unless one exists. `true` = inserted.
    async fn open_account(&self, row: &AccountBalance) -> Result<bool, StoreError>;

    async fn find_order(&self, id: i64) -> Result<Option<TransferOrder>, StoreError>;

    async fn find_order_by_txn(&self, txn_id: &TxnId) -> Result<Option<TransferOrder>, StoreError>;

    /// Raw committed row; callers verify integrity.
    async fn balance(
        &self,
        account_no: &str,
        currency: &CurrencyCode,
    ) -> Result<Option<AccountBalance>, StoreError>;

    /// Open freeze logs created before `cutoff`, oldest first, leaving
    /// out the ids in `skip`.
    async fn stale_freezes(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        skip: &[Uuid],
    ) -> Result<Vec<AccountFreezeLog>, StoreError>;

    /// Ordered by id.
    async fn list_orders(&self, query: &OrderQuery) -> Result<Vec<TransferOrder>, StoreError>;
}
