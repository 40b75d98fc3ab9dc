//! Freeze log: one row per freeze, closed by the matching unfreeze/debit.
//!
//! Open rows older than the compensation window are what the sweeper hunts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::CurrencyCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FreezeLogStatus {
    Frozen,
    Unfrozen,
    Debited,
}

impl FreezeLogStatus {
    pub fn id(&self) -> i16 {
        match self {
            FreezeLogStatus::Frozen => 0,
            FreezeLogStatus::Unfrozen => 1,
            FreezeLogStatus::Debited => 2,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(FreezeLogStatus::Frozen),
            1 => Some(FreezeLogStatus::Unfrozen),
            2 => Some(FreezeLogStatus::Debited),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FreezeLogStatus::Frozen)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFreezeLog {
    pub id: Uuid,
    /// The order's txn id (or a derived id for reversal holds).
    pub correlation_id: String,
    pub account_no: String,
    pub currency: CurrencyCode,
    pub amount: Decimal,
    pub status: FreezeLogStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl AccountFreezeLog {
    pub fn open(
        correlation_id: impl Into<String>,
        account_no: impl Into<String>,
        currency: CurrencyCode,
        amount: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            account_no: account_no.into(),
            currency,
            amount,
            status: FreezeLogStatus::Frozen,
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn matches(&self, correlation_id: &str, account_no: &str, currency: &CurrencyCode) -> bool {
        self.correlation_id == correlation_id
            && self.account_no == account_no
            && &self.currency == currency
    }
}
