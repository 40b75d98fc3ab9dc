//! Account balance record
//!
//! One row per (account, currency). The row is never mutated in place:
//! every protocol operation returns the NEXT row (version + 1, integrity
//! code recomputed) which the caller persists with a compare-and-swap on
//! the version it read.
//!
//! # Invariants (ENFORCED by private fields):
//! - `0 <= frozen <= balance`
//! - `available = balance - frozen`
//! - `integrity == sign(balance, version)` for every row produced here

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::LedgerError;
use super::integrity::IntegritySigner;
use crate::money::CurrencyCode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    account_no: String,
    currency: CurrencyCode,
    balance: Decimal,
    frozen: Decimal,
    version: i64,
    integrity: String,
    updated_at: DateTime<Utc>,
}

impl AccountBalance {
    /// Open a new balance row (version 1) with an opening balance.
    pub fn open(
        account_no: impl Into<String>,
        currency: CurrencyCode,
        opening: Decimal,
        signer: &IntegritySigner,
    ) -> Result<Self, LedgerError> {
        if opening < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        Ok(Self {
            account_no: account_no.into(),
            currency,
            balance: opening,
            frozen: Decimal::ZERO,
            version: 1,
            integrity: signer.sign(opening, 1),
            updated_at: Utc::now(),
        })
    }

    /// Rebuild a row exactly as stored. No validation: call
    /// [`AccountBalance::verify`] before trusting it.
    pub fn restore(
        account_no: String,
        currency: CurrencyCode,
        balance: Decimal,
        frozen: Decimal,
        version: i64,
        integrity: String,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_no,
            currency,
            balance,
            frozen,
            version,
            integrity,
            updated_at,
        }
    }

    // ============================================================
    // READ-ONLY GETTERS
    // ============================================================

    pub fn account_no(&self) -> &str {
        &self.account_no
    }

    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    #[inline]
    pub fn balance(&self) -> Decimal {
        self.balance
    }

    #[inline]
    pub fn frozen(&self) -> Decimal {
        self.frozen
    }

    #[inline]
    pub fn available(&self) -> Decimal {
        self.balance - self.frozen
    }

    #[inline]
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn integrity(&self) -> &str {
        &self.integrity
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Check the integrity code and the frozen/balance bounds.
    pub fn verify(&self, signer: &IntegritySigner) -> Result<(), LedgerError> {
        let bounds_ok = self.frozen >= Decimal::ZERO && self.frozen <= self.balance;
        if !bounds_ok || !signer.verify(self.balance, self.version, &self.integrity) {
            return Err(LedgerError::IntegrityViolation {
                account_no: self.account_no.clone(),
                currency: self.currency.clone(),
                version: self.version,
            });
        }
        Ok(())
    }

    // ============================================================
    // PROTOCOL TRANSITIONS (pure: return the next row)
    // ============================================================

    /// available -> frozen
    pub fn freeze(&self, amount: Decimal, signer: &IntegritySigner) -> Result<Self, LedgerError> {
        Self::check_amount(amount)?;
        if self.available() < amount {
            return Err(LedgerError::InsufficientAvailable {
                account_no: self.account_no.clone(),
                currency: self.currency.clone(),
                available: self.available(),
                requested: amount,
            });
        }
        let frozen = self
            .frozen
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(self.next(self.balance, frozen, signer))
    }

    /// frozen -> available
    pub fn unfreeze(&self, amount: Decimal, signer: &IntegritySigner) -> Result<Self, LedgerError> {
        Self::check_amount(amount)?;
        self.check_frozen(amount)?;
        Ok(self.next(self.balance, self.frozen - amount, signer))
    }

    /// Confirm a prior freeze: balance and frozen both drop by `amount`.
    /// Availability is not re-checked, the freeze already reserved it.
    pub fn debit(&self, amount: Decimal, signer: &IntegritySigner) -> Result<Self, LedgerError> {
        Self::check_amount(amount)?;
        self.check_frozen(amount)?;
        Ok(self.next(self.balance - amount, self.frozen - amount, signer))
    }

    /// balance (and therefore available) += amount
    pub fn credit(&self, amount: Decimal, signer: &IntegritySigner) -> Result<Self, LedgerError> {
        Self::check_amount(amount)?;
        let balance = self
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(self.next(balance, self.frozen, signer))
    }

    fn check_amount(amount: Decimal) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        Ok(())
    }

    fn check_frozen(&self, amount: Decimal) -> Result<(), LedgerError> {
        if self.frozen < amount {
            return Err(LedgerError::InsufficientFrozen {
                account_no: self.account_no.clone(),
                currency: self.currency.clone(),
                frozen: self.frozen,
                requested: amount,
            });
        }
        Ok(())
    }

    fn next(&self, balance: Decimal, frozen: Decimal, signer: &IntegritySigner) -> Self {
        let version = self.version + 1;
        Self {
            account_no: self.account_no.clone(),
            currency: self.currency.clone(),
            balance,
            frozen,
            version,
            integrity: signer.sign(balance, version),
            updated_at: Utc::now(),
        }
    }
}
