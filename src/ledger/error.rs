//! Ledger Error Types

use rust_decimal::Decimal;
use thiserror::Error;

use crate::money::CurrencyCode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ledger amount must be greater than zero")]
    InvalidAmount,

    #[error(
        "Insufficient available balance on {account_no}/{currency}: available {available}, requested {requested}"
    )]
    InsufficientAvailable {
        account_no: String,
        currency: CurrencyCode,
        available: Decimal,
        requested: Decimal,
    },

    #[error(
        "Insufficient frozen balance on {account_no}/{currency}: frozen {frozen}, requested {requested}"
    )]
    InsufficientFrozen {
        account_no: String,
        currency: CurrencyCode,
        frozen: Decimal,
        requested: Decimal,
    },

    #[error("Hold {correlation_id} is {held}, cannot release {requested} of it")]
    PartialRelease {
        correlation_id: String,
        held: Decimal,
        requested: Decimal,
    },

    #[error("Version conflict on {account_no}/{currency}: expected {expected}, found {actual}")]
    ConcurrencyConflict {
        account_no: String,
        currency: CurrencyCode,
        expected: i64,
        actual: i64,
    },

    #[error("Integrity code mismatch on {account_no}/{currency} at version {version}")]
    IntegrityViolation {
        account_no: String,
        currency: CurrencyCode,
        version: i64,
    },

    #[error("Balance record not found: {account_no}/{currency}")]
    AccountNotFound {
        account_no: String,
        currency: CurrencyCode,
    },

    #[error("Balance arithmetic overflow")]
    Overflow,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Lost the compare-and-swap race; the caller should re-read and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyConflict { .. })
    }
}
