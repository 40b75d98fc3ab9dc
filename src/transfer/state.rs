//! Transfer lifecycle states
//!
//! State IDs are stored as SMALLINT. Forward path is positive, the
//! cancel path negative, reversal above SUCCESS.
//!
//! ```text
//! INIT -> FROZEN -> RISK_PENDING -> SETTLING -> SUCCESS -> REVERSING -> REVERSED
//!            \            \
//!             +------------+-> UNFREEZING -> FAILED
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal states: SUCCESS (40), FAILED (-20), REVERSED (60).
/// SUCCESS still accepts the operator-triggered reversal edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransferStatus {
    /// Validated and built, nothing persisted or frozen yet
    Init = 0,

    /// Payer funds frozen, risk request not yet emitted
    Frozen = 10,

    /// Waiting for the external risk verdict
    RiskPending = 20,

    /// Funds moving: payer debited, payee credited
    Settling = 30,

    /// Terminal: settled
    Success = 40,

    /// Releasing the freeze after rejection or timeout
    Unfreezing = -10,

    /// Terminal: nothing moved, freeze released (or never taken)
    Failed = -20,

    /// Operator reversal in progress
    Reversing = 50,

    /// Terminal: settlement undone
    Reversed = 60,
}

impl TransferStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Success | TransferStatus::Failed | TransferStatus::Reversed
        )
    }

    /// Payer funds are frozen and owned by this order.
    #[inline]
    pub fn holds_freeze(&self) -> bool {
        matches!(self, TransferStatus::Frozen | TransferStatus::RiskPending)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferStatus::Init),
            10 => Some(TransferStatus::Frozen),
            20 => Some(TransferStatus::RiskPending),
            30 => Some(TransferStatus::Settling),
            40 => Some(TransferStatus::Success),
            -10 => Some(TransferStatus::Unfreezing),
            -20 => Some(TransferStatus::Failed),
            50 => Some(TransferStatus::Reversing),
            60 => Some(TransferStatus::Reversed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Init => "INIT",
            TransferStatus::Frozen => "FROZEN",
            TransferStatus::RiskPending => "RISK_PENDING",
            TransferStatus::Settling => "SETTLING",
            TransferStatus::Success => "SUCCESS",
            TransferStatus::Unfreezing => "UNFREEZING",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Reversing => "REVERSING",
            TransferStatus::Reversed => "REVERSED",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransferStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferStatus::from_id(value).ok_or(())
    }
}
