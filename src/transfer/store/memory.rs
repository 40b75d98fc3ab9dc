//! In-memory transfer store
//!
//! Writes are staged in the unit of work together with the version each
//! row had when first touched, then validated against the committed state
//! at commit. A unit that lost a race fails with `Conflict` and applies
//! nothing. The state mutex is never held across an await point.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{OrderQuery, StoreError, TransferStore, UnitOfWork};
use crate::ledger::{AccountBalance, AccountFreezeLog, FreezeLogStatus, LedgerError, LedgerTx};
use crate::money::CurrencyCode;
use crate::transfer::events::OutboundEvent;
use crate::transfer::types::{TransferOrder, TxnId};

type BalanceKey = (String, CurrencyCode);

fn key(account_no: &str, currency: &CurrencyCode) -> BalanceKey {
    (account_no.to_string(), currency.clone())
}

#[derive(Debug, Default)]
struct State {
    balances: HashMap<BalanceKey, AccountBalance>,
    orders: BTreeMap<i64, TransferOrder>,
    by_txn: HashMap<TxnId, i64>,
    next_order_id: i64,
    freeze_logs: HashMap<Uuid, AccountFreezeLog>,
    claims: HashSet<String>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTransferStore {
    state: Arc<Mutex<State>>,
}

impl MemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a balance row as-is (no version check).
    pub fn put_balance(&self, row: AccountBalance) {
        let mut state = lock(&self.state);
        state
            .balances
            .insert(key(row.account_no(), row.currency()), row);
    }

    /// All freeze logs, oldest first.
    pub fn freeze_logs(&self) -> Vec<AccountFreezeLog> {
        let state = lock(&self.state);
        let mut logs: Vec<_> = state.freeze_logs.values().cloned().collect();
        logs.sort_by_key(|l| l.created_at);
        logs
    }

    /// Sum of every balance row in a currency.
    pub fn total_balance(&self, currency: &CurrencyCode) -> Decimal {
        let state = lock(&self.state);
        state
            .balances
            .values()
            .filter(|r| r.currency() == currency)
            .map(|r| r.balance())
            .sum()
    }

    pub fn order_count(&self) -> usize {
        lock(&self.state).orders.len()
    }
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn open_account(&self, row: &AccountBalance) -> Result<bool, StoreError> {
        let mut state = lock(&self.state);
        let k = key(row.account_no(), row.currency());
        if state.balances.contains_key(&k) {
            return Ok(false);
        }
        state.balances.insert(k, row.clone());
        Ok(true)
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(MemoryUnitOfWork::new(self.state.clone())))
    }

    async fn find_order(&self, id: i64) -> Result<Option<TransferOrder>, StoreError> {
        Ok(lock(&self.state).orders.get(&id).cloned())
    }

    async fn find_order_by_txn(&self, txn_id: &TxnId) -> Result<Option<TransferOrder>, StoreError> {
        let state = lock(&self.state);
        Ok(state
            .by_txn
            .get(txn_id)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn balance(
        &self,
        account_no: &str,
        currency: &CurrencyCode,
    ) -> Result<Option<AccountBalance>, StoreError> {
        Ok(lock(&self.state)
            .balances
            .get(&key(account_no, currency))
            .cloned())
    }

    async fn stale_freezes(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        skip: &[Uuid],
    ) -> Result<Vec<AccountFreezeLog>, StoreError> {
        let state = lock(&self.state);
        let mut stale: Vec<_> = state
            .freeze_logs
            .values()
            .filter(|l| l.is_open() && l.created_at < cutoff && !skip.contains(&l.id))
            .cloned()
            .collect();
        stale.sort_by_key(|l| l.created_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn list_orders(&self, query: &OrderQuery) -> Result<Vec<TransferOrder>, StoreError> {
        let state = lock(&self.state);
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        Ok(state
            .orders
            .values()
            .filter(|o| query.matches(o))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Debug)]
struct StagedBalance {
    /// Committed version when this unit first wrote the row
    base_version: i64,
    row: AccountBalance,
}

#[derive(Debug)]
struct StagedOrder {
    /// 0 = insert
    base_version: i64,
    order: TransferOrder,
}

pub struct MemoryUnitOfWork {
    state: Arc<Mutex<State>>,
    balances: HashMap<BalanceKey, StagedBalance>,
    orders: HashMap<i64, StagedOrder>,
    claims: HashSet<String>,
    new_logs: Vec<AccountFreezeLog>,
    closed_logs: HashMap<Uuid, FreezeLogStatus>,
    events: Vec<OutboundEvent>,
}

impl MemoryUnitOfWork {
    fn new(state: Arc<Mutex<State>>) -> Self {
        Self {
            state,
            balances: HashMap::new(),
            orders: HashMap::new(),
            claims: HashSet::new(),
            new_logs: Vec::new(),
            closed_logs: HashMap::new(),
            events: Vec::new(),
        }
    }

    /// Check every staged write against the committed state.
    fn validate(&self, state: &State) -> Result<(), StoreError> {
        for (k, staged) in &self.balances {
            let committed = state.balances.get(k).map(|r| r.version());
            if committed != Some(staged.base_version) {
                return Err(StoreError::Conflict(format!(
                    "balance {}/{} moved from version {} to {:?}",
                    k.0, k.1, staged.base_version, committed
                )));
            }
        }
        for (id, staged) in &self.orders {
            if staged.base_version == 0 {
                if state.by_txn.contains_key(&staged.order.txn_id) {
                    return Err(StoreError::Conflict(format!(
                        "order {} already exists",
                        staged.order.txn_id
                    )));
                }
            } else {
                let committed = state.orders.get(id).map(|o| o.version);
                if committed != Some(staged.base_version) {
                    return Err(StoreError::Conflict(format!(
                        "order {} moved from version {} to {:?}",
                        staged.order.txn_id, staged.base_version, committed
                    )));
                }
            }
        }
        if let Some(claimed) = self.claims.iter().find(|c| state.claims.contains(*c)) {
            return Err(StoreError::Conflict(format!(
                "ledger request {} already applied",
                claimed
            )));
        }
        for id in self.closed_logs.keys() {
            match state.freeze_logs.get(id) {
                Some(log) if log.is_open() => {}
                _ => {
                    return Err(StoreError::Conflict(format!(
                        "freeze log {} already closed",
                        id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for MemoryUnitOfWork {
    async fn load_balance(
        &mut self,
        account_no: &str,
        currency: &CurrencyCode,
    ) -> Result<Option<AccountBalance>, LedgerError> {
        let k = key(account_no, currency);
        if let Some(staged) = self.balances.get(&k) {
            return Ok(Some(staged.row.clone()));
        }
        Ok(lock(&self.state).balances.get(&k).cloned())
    }

    async fn store_balance(
        &mut self,
        expected_version: i64,
        next: &AccountBalance,
    ) -> Result<(), LedgerError> {
        let k = key(next.account_no(), next.currency());
        let (current, base) = match self.balances.get(&k) {
            Some(staged) => (Some(staged.row.version()), staged.base_version),
            None => {
                let committed = lock(&self.state).balances.get(&k).map(|r| r.version());
                (committed, committed.unwrap_or(0))
            }
        };
        if current != Some(expected_version) {
            return Err(LedgerError::ConcurrencyConflict {
                account_no: k.0,
                currency: k.1,
                expected: expected_version,
                actual: current.unwrap_or(0),
            });
        }
        self.balances.insert(
            k,
            StagedBalance {
                base_version: base,
                row: next.clone(),
            },
        );
        Ok(())
    }

    async fn claim_request(&mut self, request_id: &str) -> Result<bool, LedgerError> {
        if self.claims.contains(request_id) || lock(&self.state).claims.contains(request_id) {
            return Ok(false);
        }
        self.claims.insert(request_id.to_string());
        Ok(true)
    }

    async fn insert_freeze_log(&mut self, log: &AccountFreezeLog) -> Result<(), LedgerError> {
        self.new_logs.push(log.clone());
        Ok(())
    }

    async fn open_freeze_log(
        &mut self,
        correlation_id: &str,
        account_no: &str,
        currency: &CurrencyCode,
    ) -> Result<Option<AccountFreezeLog>, LedgerError> {
        if let Some(log) = self
            .new_logs
            .iter()
            .find(|l| l.is_open() && l.matches(correlation_id, account_no, currency))
        {
            return Ok(Some(log.clone()));
        }
        let state = lock(&self.state);
        let mut open: Vec<_> = state
            .freeze_logs
            .values()
            .filter(|l| {
                l.is_open()
                    && !self.closed_logs.contains_key(&l.id)
                    && l.matches(correlation_id, account_no, currency)
            })
            .collect();
        open.sort_by_key(|l| l.created_at);
        Ok(open.first().map(|l| (*l).clone()))
    }

    async fn close_freeze_log(
        &mut self,
        log_id: Uuid,
        status: FreezeLogStatus,
    ) -> Result<(), LedgerError> {
        if let Some(log) = self.new_logs.iter_mut().find(|l| l.id == log_id) {
            log.status = status;
            log.closed_at = Some(Utc::now());
            return Ok(());
        }
        self.closed_logs.insert(log_id, status);
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn save_order(
        &mut self,
        order: &TransferOrder,
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        let mut staged = order.clone();
        staged.version = expected_version + 1;

        if expected_version == 0 {
            let id = {
                let mut state = lock(&self.state);
                if state.by_txn.contains_key(&order.txn_id) {
                    return Err(StoreError::Conflict(format!(
                        "order {} already exists",
                        order.txn_id
                    )));
                }
                state.next_order_id += 1;
                state.next_order_id
            };
            staged.id = id;
            self.orders.insert(
                id,
                StagedOrder {
                    base_version: 0,
                    order: staged,
                },
            );
            return Ok(id);
        }

        let id = order.id;
        let (current, base) = match self.orders.get(&id) {
            Some(s) => (Some(s.order.version), s.base_version),
            None => {
                let committed = lock(&self.state).orders.get(&id).map(|o| o.version);
                (committed, expected_version)
            }
        };
        if current != Some(expected_version) {
            return Err(StoreError::Conflict(format!(
                "order {} expected version {}, found {:?}",
                order.txn_id, expected_version, current
            )));
        }
        self.orders.insert(
            id,
            StagedOrder {
                base_version: base,
                order: staged,
            },
        );
        Ok(id)
    }

    fn stage_event(&mut self, event: OutboundEvent) {
        self.events.push(event);
    }

    async fn commit(self: Box<Self>) -> Result<Vec<OutboundEvent>, StoreError> {
        let this = *self;
        let state_handle = this.state.clone();
        let mut state = lock(&state_handle);
        this.validate(&state)?;

        for (k, staged) in this.balances {
            state.balances.insert(k, staged.row);
        }
        for (id, staged) in this.orders {
            state.by_txn.insert(staged.order.txn_id, id);
            state.orders.insert(id, staged.order);
        }
        state.claims.extend(this.claims);
        let now = Utc::now();
        for (id, status) in this.closed_logs {
            if let Some(log) = state.freeze_logs.get_mut(&id) {
                log.status = status;
                log.closed_at = Some(now);
            }
        }
        for log in this.new_logs {
            state.freeze_logs.insert(log.id, log);
        }
        Ok(this.events)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
