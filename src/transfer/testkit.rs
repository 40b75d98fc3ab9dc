//! Fixtures shared by the transfer unit tests.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use super::state::TransferStatus;
use super::types::{
    PayeeInfo, PayerInfo, RiskOutcome, TransferChannel, TransferOrder, TransferType, TxnId,
};
use crate::ledger::{AccountBalance, IntegritySigner, Ledger};
use crate::money::{CurrencyCode, Money};

pub const SECRET: &[u8] = b"unit-test-integrity-secret";

pub fn mop() -> CurrencyCode {
    CurrencyCode::parse("MOP").unwrap()
}

pub fn signer() -> IntegritySigner {
    IntegritySigner::new(SECRET).unwrap()
}

pub fn ledger() -> Arc<Ledger> {
    Arc::new(Ledger::new(signer()))
}

pub fn opened(account_no: &str, amount: i64) -> AccountBalance {
    AccountBalance::open(account_no, mop(), Decimal::from(amount), &signer()).unwrap()
}

/// Unsaved internal order: 888001 -> 888002, 200 MOP, no fee.
pub fn order(amount: i64) -> TransferOrder {
    let now = Utc::now();
    TransferOrder {
        id: 0,
        txn_id: TxnId::new(),
        request_id: format!("req-{}", TxnId::new()),
        payer: PayerInfo {
            user_id: "u-alice".into(),
            account_no: "888001".into(),
            account_name: "Alice".into(),
        },
        payee: PayeeInfo {
            account_no: "888002".into(),
            account_name: Some("Bob".into()),
            ..Default::default()
        },
        amount: Money::new(Decimal::from(amount), mop()).unwrap(),
        fee: Decimal::ZERO,
        transfer_type: TransferType::Internal,
        channel: TransferChannel::Internal,
        status: TransferStatus::Init,
        risk_outcome: RiskOutcome::Unknown,
        failure_reason: None,
        settlement_account: "888002".into(),
        network_reference: None,
        version: 0,
        created_at: now,
        updated_at: now,
    }
}
