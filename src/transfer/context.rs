//! Transfer context
//!
//! Built fresh for every transition (submit path and continuation path)
//! and dropped afterwards; never cached across transitions.

use std::sync::Arc;

use rust_decimal::Decimal;

use super::adapters::{AccountDirectory, AccountSnapshot};
use super::error::TransferError;
use super::store::TransferStore;
use super::types::{TraceContext, TransferOrder};
use crate::ledger::{AccountBalance, Ledger};
use crate::money::CurrencyCode;

/// Typed hand-off between handlers of ONE transition. Reset by the
/// executor before each transition runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseScratch {
    /// Payer hold consumed
    pub payer_debited: Option<Decimal>,
    /// Net amount pulled back from the settlement account (reversal)
    pub recovered_from_payee: Option<Decimal>,
}

#[derive(Debug)]
pub struct TransferContext {
    pub order: TransferOrder,
    /// Verified ledger row at build time; handlers refresh it as they go.
    pub payer_balance: Option<AccountBalance>,
    pub scratch: PhaseScratch,
    pub trace: TraceContext,
}

impl TransferContext {
    pub fn new(order: TransferOrder, trace: TraceContext) -> Self {
        Self {
            order,
            payer_balance: None,
            scratch: PhaseScratch::default(),
            trace,
        }
    }

    pub fn with_payer_balance(mut self, balance: Option<AccountBalance>) -> Self {
        self.payer_balance = balance;
        self
    }

    pub fn txn_ref(&self) -> String {
        self.order.txn_id.to_string()
    }
}

/// Rebuilds contexts from the directory and the store.
#[derive(Clone)]
pub struct ContextBuilder {
    directory: Arc<dyn AccountDirectory>,
    store: Arc<dyn TransferStore>,
    ledger: Arc<Ledger>,
}

impl ContextBuilder {
    pub fn new(
        directory: Arc<dyn AccountDirectory>,
        store: Arc<dyn TransferStore>,
        ledger: Arc<Ledger>,
    ) -> Self {
        Self {
            directory,
            store,
            ledger,
        }
    }

    pub async fn account(&self, account_no: &str) -> Result<Option<AccountSnapshot>, TransferError> {
        self.directory.account(account_no).await
    }

    /// Current verified balance row, if the account holds the currency.
    pub async fn balance(
        &self,
        account_no: &str,
        currency: &CurrencyCode,
    ) -> Result<Option<AccountBalance>, TransferError> {
        let Some(row) = self.store.balance(account_no, currency).await? else {
            return Ok(None);
        };
        row.verify(self.ledger.signer())?;
        Ok(Some(row))
    }

    /// Fresh context for a persisted order (continuation, sweeper, reversal).
    pub async fn rehydrate(
        &self,
        order: TransferOrder,
        trace: TraceContext,
    ) -> Result<TransferContext, TransferError> {
        let balance = self
            .balance(&order.payer.account_no, order.currency())
            .await?;
        Ok(TransferContext::new(order, trace).with_payer_balance(balance))
    }

    /// Re-read the order (if persisted) and the payer row after a lost race.
    pub async fn refresh(&self, ctx: &mut TransferContext) -> Result<(), TransferError> {
        if ctx.order.is_persisted() {
            ctx.order = self
                .store
                .find_order_by_txn(&ctx.order.txn_id)
                .await?
                .ok_or_else(|| TransferError::OrderNotFound(ctx.order.txn_id.to_string()))?;
        }
        ctx.payer_balance = self
            .balance(&ctx.order.payer.account_no, ctx.order.currency())
            .await?;
        Ok(())
    }
}
