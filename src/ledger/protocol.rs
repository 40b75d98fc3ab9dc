//! Ledger protocol: freeze / unfreeze / debit / credit
//!
//! Every call runs inside the caller's unit of work (`LedgerTx`) and is a
//! conditional update on the row version it read. Each call carries a
//! request id which is claimed in a journal in the same unit of work; a
//! second call with a claimed id is a replay and mutates nothing.
//!
//! Unfreeze and debit additionally require an open freeze log for the
//! correlation id. A closed (or missing) log means the hold was already
//! released or consumed, so the call degrades to a replay instead of
//! touching frozen funds that belong to another hold.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;

use super::balance::AccountBalance;
use super::error::LedgerError;
use super::freeze_log::{AccountFreezeLog, FreezeLogStatus};
use super::integrity::IntegritySigner;
use crate::money::CurrencyCode;

/// Storage primitives the protocol needs from a unit of work.
#[async_trait]
pub trait LedgerTx: Send {
    async fn load_balance(
        &mut self,
        account_no: &str,
        currency: &CurrencyCode,
    ) -> Result<Option<AccountBalance>, LedgerError>;

    /// Compare-and-swap: persist `next` only if the row is still at
    /// `expected_version`.
    async fn store_balance(
        &mut self,
        expected_version: i64,
        next: &AccountBalance,
    ) -> Result<(), LedgerError>;

    /// Returns `false` if the request id was already claimed.
    async fn claim_request(&mut self, request_id: &str) -> Result<bool, LedgerError>;

    async fn insert_freeze_log(&mut self, log: &AccountFreezeLog) -> Result<(), LedgerError>;

    async fn open_freeze_log(
        &mut self,
        correlation_id: &str,
        account_no: &str,
        currency: &CurrencyCode,
    ) -> Result<Option<AccountFreezeLog>, LedgerError>;

    async fn close_freeze_log(
        &mut self,
        log_id: Uuid,
        status: FreezeLogStatus,
    ) -> Result<(), LedgerError>;
}

/// One ledger call.
#[derive(Debug, Clone)]
pub struct LedgerRequest {
    pub request_id: String,
    pub correlation_id: String,
    pub account_no: String,
    pub currency: CurrencyCode,
    pub amount: Decimal,
    /// Caller's view of the row version. `None` = use whatever is current.
    pub expected_version: Option<i64>,
}

impl LedgerRequest {
    pub fn new(
        request_id: impl Into<String>,
        correlation_id: impl Into<String>,
        account_no: impl Into<String>,
        currency: CurrencyCode,
        amount: Decimal,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            correlation_id: correlation_id.into(),
            account_no: account_no.into(),
            currency,
            amount,
            expected_version: None,
        }
    }

    pub fn at_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    /// Row after the call (unchanged on replay).
    pub balance: AccountBalance,
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    signer: IntegritySigner,
}

impl Ledger {
    pub fn new(signer: IntegritySigner) -> Self {
        Self { signer }
    }

    pub fn signer(&self) -> &IntegritySigner {
        &self.signer
    }

    /// Load and verify a row.
    pub async fn read<T: LedgerTx + ?Sized>(
        &self,
        tx: &mut T,
        account_no: &str,
        currency: &CurrencyCode,
    ) -> Result<AccountBalance, LedgerError> {
        let row = tx
            .load_balance(account_no, currency)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound {
                account_no: account_no.to_string(),
                currency: currency.clone(),
            })?;
        row.verify(&self.signer)?;
        Ok(row)
    }

    pub async fn freeze<T: LedgerTx + ?Sized>(
        &self,
        tx: &mut T,
        req: &LedgerRequest,
    ) -> Result<LedgerReceipt, LedgerError> {
        if !tx.claim_request(&req.request_id).await? {
            return self.replay(tx, req).await;
        }
        let row = self.read_expected(tx, req).await?;
        let next = row.freeze(req.amount, &self.signer)?;
        tx.store_balance(row.version(), &next).await?;
        tx.insert_freeze_log(&AccountFreezeLog::open(
            req.correlation_id.clone(),
            req.account_no.clone(),
            req.currency.clone(),
            req.amount,
        ))
        .await?;
        debug!(request_id = %req.request_id, account = %req.account_no, amount = %req.amount, "Freeze applied");
        Ok(LedgerReceipt {
            balance: next,
            replayed: false,
        })
    }

    pub async fn unfreeze<T: LedgerTx + ?Sized>(
        &self,
        tx: &mut T,
        req: &LedgerRequest,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.release(tx, req, FreezeLogStatus::Unfrozen).await
    }

    pub async fn debit<T: LedgerTx + ?Sized>(
        &self,
        tx: &mut T,
        req: &LedgerRequest,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.release(tx, req, FreezeLogStatus::Debited).await
    }

    pub async fn credit<T: LedgerTx + ?Sized>(
        &self,
        tx: &mut T,
        req: &LedgerRequest,
    ) -> Result<LedgerReceipt, LedgerError> {
        if !tx.claim_request(&req.request_id).await? {
            return self.replay(tx, req).await;
        }
        let row = self.read_expected(tx, req).await?;
        let next = row.credit(req.amount, &self.signer)?;
        tx.store_balance(row.version(), &next).await?;
        debug!(request_id = %req.request_id, account = %req.account_no, amount = %req.amount, "Credit applied");
        Ok(LedgerReceipt {
            balance: next,
            replayed: false,
        })
    }

    /// Shared body of unfreeze and debit: both consume an open hold.
    async fn release<T: LedgerTx + ?Sized>(
        &self,
        tx: &mut T,
        req: &LedgerRequest,
        outcome: FreezeLogStatus,
    ) -> Result<LedgerReceipt, LedgerError> {
        if !tx.claim_request(&req.request_id).await? {
            return self.replay(tx, req).await;
        }
        let Some(hold) = tx
            .open_freeze_log(&req.correlation_id, &req.account_no, &req.currency)
            .await?
        else {
            warn!(
                request_id = %req.request_id,
                correlation_id = %req.correlation_id,
                "No open freeze for release, treating as replay"
            );
            return self.replay(tx, req).await;
        };
        if req.amount > hold.amount {
            return Err(LedgerError::InsufficientFrozen {
                account_no: req.account_no.clone(),
                currency: req.currency.clone(),
                frozen: hold.amount,
                requested: req.amount,
            });
        }
        // A hold is consumed whole; a partial release would close the log
        // while leaving the remainder frozen with nothing tracking it
        if req.amount < hold.amount {
            return Err(LedgerError::PartialRelease {
                correlation_id: req.correlation_id.clone(),
                held: hold.amount,
                requested: req.amount,
            });
        }

        let row = self.read_expected(tx, req).await?;
        let next = match outcome {
            FreezeLogStatus::Debited => row.debit(req.amount, &self.signer)?,
            _ => row.unfreeze(req.amount, &self.signer)?,
        };
        tx.store_balance(row.version(), &next).await?;
        tx.close_freeze_log(hold.id, outcome).await?;
        debug!(
            request_id = %req.request_id,
            account = %req.account_no,
            amount = %req.amount,
            outcome = ?outcome,
            "Hold released"
        );
        Ok(LedgerReceipt {
            balance: next,
            replayed: false,
        })
    }

    async fn read_expected<T: LedgerTx + ?Sized>(
        &self,
        tx: &mut T,
        req: &LedgerRequest,
    ) -> Result<AccountBalance, LedgerError> {
        let row = self.read(tx, &req.account_no, &req.currency).await?;
        match req.expected_version {
            Some(expected) if expected != row.version() => {
                Err(LedgerError::ConcurrencyConflict {
                    account_no: req.account_no.clone(),
                    currency: req.currency.clone(),
                    expected,
                    actual: row.version(),
                })
            }
            _ => Ok(row),
        }
    }

    async fn replay<T: LedgerTx + ?Sized>(
        &self,
        tx: &mut T,
        req: &LedgerRequest,
    ) -> Result<LedgerReceipt, LedgerError> {
        let balance = self.read(tx, &req.account_no, &req.currency).await?;
        Ok(LedgerReceipt {
            balance,
            replayed: true,
        })
    }
}
