//! PostgreSQL transfer store
//!
//! One database transaction per unit of work. Balance and order updates
//! are `UPDATE ... WHERE version = $expected`; zero affected rows is a
//! conflict. Ledger request ids are claimed with `ON CONFLICT DO NOTHING`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use super::{OrderQuery, StoreError, TransferStore, UnitOfWork};
use crate::ledger::{AccountBalance, AccountFreezeLog, FreezeLogStatus, LedgerError, LedgerTx};
use crate::money::{CurrencyCode, Money};
use crate::transfer::events::OutboundEvent;
use crate::transfer::state::TransferStatus;
use crate::transfer::types::{
    PayeeInfo, PayerInfo, RiskOutcome, TransferChannel, TransferOrder, TransferType, TxnId,
};

const SCHEMA: &str = include_str!("../../../migrations/0001_transfer_saga.sql");

const ORDER_COLUMNS: &str = "id, txn_id, request_id, payer, payee, amount, currency, fee, \
     transfer_type, channel, status, risk_outcome, failure_reason, settlement_account, \
     network_reference, version, created_at, updated_at";

const BALANCE_COLUMNS: &str =
    "account_no, currency, balance, frozen, version, integrity, updated_at";

const FREEZE_LOG_COLUMNS: &str =
    "id, correlation_id, account_no, currency, amount, status, created_at, closed_at";

#[derive(Debug, Clone)]
pub struct PgTransferStore {
    pool: PgPool,
}

impl PgTransferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create tables if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Transfer schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransferStore for PgTransferStore {
    async fn open_account(&self, row: &AccountBalance) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            INSERT INTO account_balances
                (account_no, currency, balance, frozen, version, integrity, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (account_no, currency) DO NOTHING
            "#,
        )
        .bind(row.account_no())
        .bind(row.currency().as_str())
        .bind(row.balance())
        .bind(row.frozen())
        .bind(row.version())
        .bind(row.integrity())
        .bind(row.updated_at())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork {
            tx,
            events: Vec::new(),
        }))
    }

    async fn find_order(&self, id: i64) -> Result<Option<TransferOrder>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transfer_orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn find_order_by_txn(&self, txn_id: &TxnId) -> Result<Option<TransferOrder>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transfer_orders WHERE txn_id = $1",
            ORDER_COLUMNS
        ))
        .bind(txn_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn balance(
        &self,
        account_no: &str,
        currency: &CurrencyCode,
    ) -> Result<Option<AccountBalance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM account_balances WHERE account_no = $1 AND currency = $2",
            BALANCE_COLUMNS
        ))
        .bind(account_no)
        .bind(currency.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_balance).transpose()
    }

    async fn stale_freezes(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        skip: &[Uuid],
    ) -> Result<Vec<AccountFreezeLog>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM account_freeze_logs
            WHERE status = $1 AND created_at < $2 AND NOT (id = ANY($4))
            ORDER BY created_at ASC
            LIMIT $3
            "#,
            FREEZE_LOG_COLUMNS
        ))
        .bind(FreezeLogStatus::Frozen.id())
        .bind(cutoff)
        .bind(limit as i64)
        .bind(skip.to_vec())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_freeze_log).collect()
    }

    async fn list_orders(&self, query: &OrderQuery) -> Result<Vec<TransferOrder>, StoreError> {
        let statuses: Vec<i16> = query.statuses.iter().map(|s| s.id()).collect();
        let (shard_total, shard_index) = query
            .shard
            .map(|s| (i64::from(s.total), i64::from(s.index)))
            .unwrap_or((0, 0));
        let limit = if query.limit == 0 { i64::MAX } else { query.limit as i64 };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM transfer_orders
            WHERE (cardinality($1::SMALLINT[]) = 0 OR status = ANY($1))
              AND ($2::BIGINT = 0 OR id % $2 = $3)
              AND ($4::TIMESTAMPTZ IS NULL OR updated_at < $4)
            ORDER BY id ASC
            LIMIT $5
            "#,
            ORDER_COLUMNS
        ))
        .bind(&statuses)
        .bind(shard_total)
        .bind(shard_index)
        .bind(query.updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_order).collect()
    }
}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
    events: Vec<OutboundEvent>,
}

fn storage(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

fn corrupt_ledger(e: StoreError) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

#[async_trait]
impl LedgerTx for PgUnitOfWork {
    async fn load_balance(
        &mut self,
        account_no: &str,
        currency: &CurrencyCode,
    ) -> Result<Option<AccountBalance>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM account_balances WHERE account_no = $1 AND currency = $2",
            BALANCE_COLUMNS
        ))
        .bind(account_no)
        .bind(currency.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage)?;
        row.as_ref()
            .map(row_to_balance)
            .transpose()
            .map_err(corrupt_ledger)
    }

    async fn store_balance(
        &mut self,
        expected_version: i64,
        next: &AccountBalance,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE account_balances
            SET balance = $1, frozen = $2, version = $3, integrity = $4, updated_at = $5
            WHERE account_no = $6 AND currency = $7 AND version = $8
            "#,
        )
        .bind(next.balance())
        .bind(next.frozen())
        .bind(next.version())
        .bind(next.integrity())
        .bind(next.updated_at())
        .bind(next.account_no())
        .bind(next.currency().as_str())
        .bind(expected_version)
        .execute(&mut *self.tx)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            let actual = sqlx::query_scalar::<_, i64>(
                "SELECT version FROM account_balances WHERE account_no = $1 AND currency = $2",
            )
            .bind(next.account_no())
            .bind(next.currency().as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage)?;
            return Err(LedgerError::ConcurrencyConflict {
                account_no: next.account_no().to_string(),
                currency: next.currency().clone(),
                expected: expected_version,
                actual: actual.unwrap_or(0),
            });
        }
        Ok(())
    }

    async fn claim_request(&mut self, request_id: &str) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "INSERT INTO ledger_requests (request_id) VALUES ($1) ON CONFLICT (request_id) DO NOTHING",
        )
        .bind(request_id)
        .execute(&mut *self.tx)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_freeze_log(&mut self, log: &AccountFreezeLog) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO account_freeze_logs
                (id, correlation_id, account_no, currency, amount, status, created_at, closed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(log.id)
        .bind(&log.correlation_id)
        .bind(&log.account_no)
        .bind(log.currency.as_str())
        .bind(log.amount)
        .bind(log.status.id())
        .bind(log.created_at)
        .bind(log.closed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn open_freeze_log(
        &mut self,
        correlation_id: &str,
        account_no: &str,
        currency: &CurrencyCode,
    ) -> Result<Option<AccountFreezeLog>, LedgerError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM account_freeze_logs
            WHERE correlation_id = $1 AND account_no = $2 AND currency = $3 AND status = $4
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE
            "#,
            FREEZE_LOG_COLUMNS
        ))
        .bind(correlation_id)
        .bind(account_no)
        .bind(currency.as_str())
        .bind(FreezeLogStatus::Frozen.id())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage)?;
        row.as_ref()
            .map(row_to_freeze_log)
            .transpose()
            .map_err(corrupt_ledger)
    }

    async fn close_freeze_log(
        &mut self,
        log_id: Uuid,
        status: FreezeLogStatus,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE account_freeze_logs
            SET status = $1, closed_at = NOW()
            WHERE id = $2 AND status = $3
            "#,
        )
        .bind(status.id())
        .bind(log_id)
        .bind(FreezeLogStatus::Frozen.id())
        .execute(&mut *self.tx)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::Storage(format!(
                "freeze log {} already closed",
                log_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn save_order(
        &mut self,
        order: &TransferOrder,
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        let payer = serde_json::to_string(&order.payer)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let payee = serde_json::to_string(&order.payee)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        if expected_version == 0 {
            let id = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO transfer_orders
                    (txn_id, request_id, payer, payee, amount, currency, fee, transfer_type,
                     channel, status, risk_outcome, failure_reason, settlement_account,
                     network_reference, version, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 1, $15, $16)
                ON CONFLICT (txn_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(order.txn_id.to_string())
            .bind(&order.request_id)
            .bind(payer)
            .bind(payee)
            .bind(order.amount.amount())
            .bind(order.currency().as_str())
            .bind(order.fee)
            .bind(order.transfer_type.id())
            .bind(order.channel.id())
            .bind(order.status.id())
            .bind(order.risk_outcome.id())
            .bind(&order.failure_reason)
            .bind(&order.settlement_account)
            .bind(&order.network_reference)
            .bind(order.created_at)
            .bind(order.updated_at)
            .fetch_optional(&mut *self.tx)
            .await?;
            return id.ok_or_else(|| {
                StoreError::Conflict(format!("order {} already exists", order.txn_id))
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE transfer_orders
            SET status = $1, risk_outcome = $2, failure_reason = $3, network_reference = $4,
                fee = $5, payee = $6, version = version + 1, updated_at = $7
            WHERE id = $8 AND version = $9
            "#,
        )
        .bind(order.status.id())
        .bind(order.risk_outcome.id())
        .bind(&order.failure_reason)
        .bind(&order.network_reference)
        .bind(order.fee)
        .bind(payee)
        .bind(order.updated_at)
        .bind(order.id)
        .bind(expected_version)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "order {} no longer at version {}",
                order.txn_id, expected_version
            )));
        }
        Ok(order.id)
    }

    fn stage_event(&mut self, event: OutboundEvent) {
        self.events.push(event);
    }

    async fn commit(self: Box<Self>) -> Result<Vec<OutboundEvent>, StoreError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(this.events)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ============================================================
// ROW MAPPING
// ============================================================

fn corrupt(what: &str, value: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("invalid {}: {}", what, value))
}

fn currency_col(row: &PgRow, col: &str) -> Result<CurrencyCode, StoreError> {
    let raw: String = row.try_get(col)?;
    CurrencyCode::parse(&raw).map_err(|_| corrupt(col, raw))
}

fn row_to_balance(row: &PgRow) -> Result<AccountBalance, StoreError> {
    Ok(AccountBalance::restore(
        row.try_get("account_no")?,
        currency_col(row, "currency")?,
        row.try_get("balance")?,
        row.try_get("frozen")?,
        row.try_get("version")?,
        row.try_get("integrity")?,
        row.try_get("updated_at")?,
    ))
}

fn row_to_freeze_log(row: &PgRow) -> Result<AccountFreezeLog, StoreError> {
    let status_id: i16 = row.try_get("status")?;
    Ok(AccountFreezeLog {
        id: row.try_get("id")?,
        correlation_id: row.try_get("correlation_id")?,
        account_no: row.try_get("account_no")?,
        currency: currency_col(row, "currency")?,
        amount: row.try_get("amount")?,
        status: FreezeLogStatus::from_id(status_id)
            .ok_or_else(|| corrupt("freeze log status", status_id))?,
        created_at: row.try_get("created_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

fn row_to_order(row: &PgRow) -> Result<TransferOrder, StoreError> {
    let txn_raw: String = row.try_get("txn_id")?;
    let txn_id: TxnId = txn_raw.trim().parse().map_err(|_| corrupt("txn_id", &txn_raw))?;

    let payer_raw: String = row.try_get("payer")?;
    let payer: PayerInfo =
        serde_json::from_str(&payer_raw).map_err(|e| corrupt("payer", e))?;
    let payee_raw: String = row.try_get("payee")?;
    let payee: PayeeInfo =
        serde_json::from_str(&payee_raw).map_err(|e| corrupt("payee", e))?;

    let amount: Decimal = row.try_get("amount")?;
    let amount =
        Money::new(amount, currency_col(row, "currency")?).map_err(|e| corrupt("amount", e))?;

    let type_id: i16 = row.try_get("transfer_type")?;
    let channel_id: i16 = row.try_get("channel")?;
    let status_id: i16 = row.try_get("status")?;
    let risk_id: i16 = row.try_get("risk_outcome")?;

    Ok(TransferOrder {
        id: row.try_get("id")?,
        txn_id,
        request_id: row.try_get("request_id")?,
        payer,
        payee,
        amount,
        fee: row.try_get("fee")?,
        transfer_type: TransferType::from_id(type_id)
            .ok_or_else(|| corrupt("transfer_type", type_id))?,
        channel: TransferChannel::from_id(channel_id)
            .ok_or_else(|| corrupt("channel", channel_id))?,
        status: TransferStatus::from_id(status_id).ok_or_else(|| corrupt("status", status_id))?,
        risk_outcome: RiskOutcome::from_id(risk_id)
            .ok_or_else(|| corrupt("risk_outcome", risk_id))?,
        failure_reason: row.try_get("failure_reason")?,
        settlement_account: row.try_get("settlement_account")?,
        network_reference: row.try_get("network_reference")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
