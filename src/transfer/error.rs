//! Transfer Error Types
//!
//! Only the validation family, `InsufficientFunds` and `DuplicateRequest`
//! are clean user-facing rejections. `ConcurrencyConflict`,
//! `DownstreamUnavailable` and `SubjectBusy` are retried internally before
//! surfacing as "try again". Everything else is an internal fault.

use rust_decimal::Decimal;
use thiserror::Error;

use super::store::StoreError;
use crate::idempotency::GuardError;
use crate::ledger::LedgerError;
use crate::money::MoneyError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("Payer and payee account cannot be the same")]
    SelfTransfer,

    #[error("Amount exceeds single-transaction limit {limit}")]
    LimitExceeded { limit: Decimal },

    #[error("Fee {fee} is not below the transfer amount")]
    FeeExceedsAmount { fee: Decimal },

    #[error("Payer account not found")]
    PayerAccountNotFound,

    #[error("Payer account is not active")]
    PayerAccountInactive,

    #[error("Payer account holds no {0} balance")]
    PayerCurrencyNotHeld(String),

    #[error("Payee account not found")]
    PayeeAccountNotFound,

    #[error("Payee account is not held at this bank")]
    PayeeNotInHouse,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Transaction credential rejected")]
    InvalidCredential,

    #[error("Account does not belong to the requesting user")]
    Forbidden,

    // === Funds ===
    #[error("Insufficient available balance for transfer {txn_id}")]
    InsufficientFunds { txn_id: String },

    // === Idempotency ===
    #[error("Duplicate request")]
    DuplicateRequest { prior: Option<String> },

    // === Transient ===
    #[error("Concurrent modification: {0}")]
    ConcurrencyConflict(String),

    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    #[error("Another request for {0} is in progress")]
    SubjectBusy(String),

    // === Internal ===
    #[error("Ledger integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Ledger rejected operation: {0}")]
    LedgerRejected(String),

    #[error("Transfer not found: {0}")]
    OrderNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Pipeline contract broken: {0}")]
    PipelineContract(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TransferError {
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount(_) => "INVALID_AMOUNT",
            TransferError::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
            TransferError::SelfTransfer => "SELF_TRANSFER",
            TransferError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            TransferError::FeeExceedsAmount { .. } => "FEE_EXCEEDS_AMOUNT",
            TransferError::PayerAccountNotFound => "PAYER_ACCOUNT_NOT_FOUND",
            TransferError::PayerAccountInactive => "PAYER_ACCOUNT_INACTIVE",
            TransferError::PayerCurrencyNotHeld(_) => "PAYER_CURRENCY_NOT_HELD",
            TransferError::PayeeAccountNotFound => "PAYEE_ACCOUNT_NOT_FOUND",
            TransferError::PayeeNotInHouse => "PAYEE_NOT_IN_HOUSE",
            TransferError::MissingField(_) => "MISSING_FIELD",
            TransferError::InvalidCredential => "INVALID_CREDENTIAL",
            TransferError::Forbidden => "FORBIDDEN",
            TransferError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            TransferError::DuplicateRequest { .. } => "DUPLICATE_REQUEST",
            TransferError::ConcurrencyConflict(_) => "CONCURRENCY_CONFLICT",
            TransferError::DownstreamUnavailable(_) => "DOWNSTREAM_UNAVAILABLE",
            TransferError::SubjectBusy(_) => "SUBJECT_BUSY",
            TransferError::IntegrityViolation(_) => "INTEGRITY_VIOLATION",
            TransferError::LedgerRejected(_) => "LEDGER_REJECTED",
            TransferError::OrderNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            TransferError::PipelineContract(_) => "PIPELINE_CONTRACT",
            TransferError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// HTTP status suggestion for an outer API
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::InvalidCredential => 401,
            TransferError::Forbidden => 403,
            TransferError::OrderNotFound(_) => 404,
            TransferError::DuplicateRequest { .. } => 409,
            TransferError::InsufficientFunds { .. } => 422,
            TransferError::ConcurrencyConflict(_) | TransferError::SubjectBusy(_) => 429,
            TransferError::DownstreamUnavailable(_) => 503,
            e if e.is_validation() => 400,
            _ => 500,
        }
    }

    /// Bad request: rejected before any order exists.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidAmount(_)
                | TransferError::UnsupportedCurrency(_)
                | TransferError::SelfTransfer
                | TransferError::LimitExceeded { .. }
                | TransferError::FeeExceedsAmount { .. }
                | TransferError::PayerAccountNotFound
                | TransferError::PayerAccountInactive
                | TransferError::PayerCurrencyNotHeld(_)
                | TransferError::PayeeAccountNotFound
                | TransferError::PayeeNotInHouse
                | TransferError::MissingField(_)
                | TransferError::InvalidCredential
                | TransferError::Forbidden
        )
    }

    /// Worth another attempt after re-reading state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::ConcurrencyConflict(_)
                | TransferError::DownstreamUnavailable(_)
                | TransferError::SubjectBusy(_)
        )
    }

    pub fn is_user_visible(&self) -> bool {
        self.is_validation()
            || matches!(
                self,
                TransferError::InsufficientFunds { .. } | TransferError::DuplicateRequest { .. }
            )
    }
}

impl From<MoneyError> for TransferError {
    fn from(e: MoneyError) -> Self {
        match e {
            MoneyError::InvalidCurrency(code) => TransferError::UnsupportedCurrency(code),
            other => TransferError::InvalidAmount(other.to_string()),
        }
    }
}

impl From<LedgerError> for TransferError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::ConcurrencyConflict { .. } => {
                TransferError::ConcurrencyConflict(e.to_string())
            }
            LedgerError::IntegrityViolation { .. } => {
                TransferError::IntegrityViolation(e.to_string())
            }
            LedgerError::Storage(msg) => TransferError::DownstreamUnavailable(msg),
            other => TransferError::LedgerRejected(other.to_string()),
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(_) => TransferError::ConcurrencyConflict(e.to_string()),
            StoreError::NotFound(what) => TransferError::OrderNotFound(what),
            StoreError::Corrupt(_) => TransferError::IntegrityViolation(e.to_string()),
            StoreError::Backend(msg) => TransferError::DownstreamUnavailable(msg),
        }
    }
}

impl From<GuardError> for TransferError {
    fn from(e: GuardError) -> Self {
        TransferError::DownstreamUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::CurrencyCode;

    #[test]
    fn test_error_codes() {
        assert_eq!(TransferError::SelfTransfer.code(), "SELF_TRANSFER");
        assert_eq!(
            TransferError::InsufficientFunds {
                txn_id: "T".into()
            }
            .code(),
            "INSUFFICIENT_FUNDS"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(TransferError::InvalidCredential.http_status(), 401);
        assert_eq!(TransferError::SelfTransfer.http_status(), 400);
        assert_eq!(TransferError::MissingField("swift_code").http_status(), 400);
        assert_eq!(
            TransferError::DownstreamUnavailable("x".into()).http_status(),
            503
        );
        assert_eq!(TransferError::Configuration("x".into()).http_status(), 500);
    }

    #[test]
    fn test_classification() {
        assert!(TransferError::ConcurrencyConflict("x".into()).is_transient());
        assert!(TransferError::SubjectBusy("888001".into()).is_transient());
        assert!(!TransferError::SelfTransfer.is_transient());

        assert!(TransferError::SelfTransfer.is_user_visible());
        assert!(TransferError::DuplicateRequest { prior: None }.is_user_visible());
        assert!(!TransferError::IntegrityViolation("x".into()).is_user_visible());
        assert!(!TransferError::DownstreamUnavailable("x".into()).is_user_visible());
    }

    #[test]
    fn test_ledger_error_mapping() {
        let mop = CurrencyCode::parse("MOP").unwrap();
        let conflict = LedgerError::ConcurrencyConflict {
            account_no: "1".into(),
            currency: mop.clone(),
            expected: 1,
            actual: 2,
        };
        assert!(TransferError::from(conflict).is_transient());

        let tampered = LedgerError::IntegrityViolation {
            account_no: "1".into(),
            currency: mop,
            version: 3,
        };
        assert_eq!(
            TransferError::from(tampered).code(),
            "INTEGRITY_VIOLATION"
        );
    }
}
