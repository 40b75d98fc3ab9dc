//! Transfer domain types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use super::adapters::TransactionCredential;
use super::state::TransferStatus;
use crate::money::{CurrencyCode, Money};

/// Business transaction id. Correlates the async continuation and every
/// ledger call made on behalf of the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(Ulid);

impl TxnId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxnId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferType {
    /// Same bank, both accounts in-house
    Internal,
    /// Domestic clearing to another bank
    Interbank,
    /// SWIFT / CIPS
    CrossBorder,
    /// FPS-style instant payment
    InstantRail,
}

impl TransferType {
    pub const ALL: [TransferType; 4] = [
        TransferType::Internal,
        TransferType::Interbank,
        TransferType::CrossBorder,
        TransferType::InstantRail,
    ];

    pub fn id(&self) -> i16 {
        match self {
            TransferType::Internal => 1,
            TransferType::Interbank => 2,
            TransferType::CrossBorder => 3,
            TransferType::InstantRail => 4,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Internal => "INTERNAL",
            TransferType::Interbank => "INTERBANK",
            TransferType::CrossBorder => "CROSS_BORDER",
            TransferType::InstantRail => "INSTANT_RAIL",
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferChannel {
    Internal,
    LocalClearing,
    Fps,
    Swift,
    Cips,
}

impl TransferChannel {
    pub const ALL: [TransferChannel; 5] = [
        TransferChannel::Internal,
        TransferChannel::LocalClearing,
        TransferChannel::Fps,
        TransferChannel::Swift,
        TransferChannel::Cips,
    ];

    pub fn id(&self) -> i16 {
        match self {
            TransferChannel::Internal => 1,
            TransferChannel::LocalClearing => 2,
            TransferChannel::Fps => 3,
            TransferChannel::Swift => 4,
            TransferChannel::Cips => 5,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.id() == id)
    }

    /// Leaves the bank: settlement goes through a clearing account and
    /// the network must be notified.
    pub fn is_external(&self) -> bool {
        !matches!(self, TransferChannel::Internal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferChannel::Internal => "INTERNAL",
            TransferChannel::LocalClearing => "LOCAL_CLEARING",
            TransferChannel::Fps => "FPS",
            TransferChannel::Swift => "SWIFT",
            TransferChannel::Cips => "CIPS",
        }
    }
}

impl fmt::Display for TransferChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskOutcome {
    #[default]
    Unknown,
    Passed,
    Rejected,
}

impl RiskOutcome {
    pub fn id(&self) -> i16 {
        match self {
            RiskOutcome::Unknown => 0,
            RiskOutcome::Passed => 1,
            RiskOutcome::Rejected => 2,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(RiskOutcome::Unknown),
            1 => Some(RiskOutcome::Passed),
            2 => Some(RiskOutcome::Rejected),
            _ => None,
        }
    }
}

/// Customer tier, drives limits and fee rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserTier {
    #[default]
    Normal,
    Key,
    Vip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayerInfo {
    pub user_id: String,
    pub account_no: String,
    pub account_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayeeInfo {
    pub account_no: String,
    #[serde(default)]
    pub account_name: Option<String>,
    /// Domestic bank / clearing code
    #[serde(default)]
    pub bank_code: Option<String>,
    #[serde(default)]
    pub swift_code: Option<String>,
    #[serde(default)]
    pub fps_id: Option<String>,
    /// ISO country of the receiving bank (cross-border)
    #[serde(default)]
    pub country: Option<String>,
}

/// The durable transfer aggregate.
///
/// `version == 0` means not yet persisted; `id` is assigned on first save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOrder {
    pub id: i64,
    pub txn_id: TxnId,
    pub request_id: String,
    pub payer: PayerInfo,
    pub payee: PayeeInfo,
    pub amount: Money,
    pub fee: Decimal,
    pub transfer_type: TransferType,
    pub channel: TransferChannel,
    pub status: TransferStatus,
    pub risk_outcome: RiskOutcome,
    pub failure_reason: Option<String>,
    /// Account credited with `amount - fee` on settlement
    pub settlement_account: String,
    pub network_reference: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferOrder {
    pub fn currency(&self) -> &CurrencyCode {
        self.amount.currency()
    }

    /// What the settlement account receives.
    pub fn net_amount(&self) -> Decimal {
        self.amount.amount() - self.fee
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }
}

/// Submit transfer (inbound)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTransferRequest {
    pub request_id: String,
    pub user_id: String,
    pub payer_account_no: String,
    pub payee: PayeeInfo,
    pub amount: Decimal,
    pub currency: String,
    pub transfer_type: TransferType,
    /// Ignored when the type pins the channel.
    #[serde(default)]
    pub channel_hint: Option<TransferChannel>,
    /// Transaction password; wiped on drop, never persisted or logged.
    #[serde(skip_serializing)]
    pub credential: TransactionCredential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitTransferResponse {
    pub txn_id: TxnId,
    pub status: TransferStatus,
    pub message: String,
}

/// Operator-triggered reversal (inbound)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversalRequest {
    pub order_id: i64,
    pub reason: String,
}

/// Carried explicitly through every call and across async hops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub user_id: Option<String>,
}

impl TraceContext {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            user_id,
        }
    }

    /// Trace for work with no inbound request (sweeper, startup).
    pub fn system() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id_parse() {
        let id = TxnId::new();
        assert_eq!(id.to_string().parse::<TxnId>().unwrap(), id);
        assert!("not-a-ulid".parse::<TxnId>().is_err());
    }

    #[test]
    fn test_enum_ids() {
        for t in TransferType::ALL {
            assert_eq!(TransferType::from_id(t.id()), Some(t));
        }
        for c in TransferChannel::ALL {
            assert_eq!(TransferChannel::from_id(c.id()), Some(c));
        }
        assert_eq!(RiskOutcome::from_id(2), Some(RiskOutcome::Rejected));
        assert!(!TransferChannel::Internal.is_external());
        assert!(TransferChannel::Swift.is_external());
    }

    #[test]
    fn test_credential_never_serialized() {
        let req = SubmitTransferRequest {
            request_id: "r".into(),
            user_id: "u".into(),
            payer_account_no: "888001".into(),
            payee: PayeeInfo::default(),
            amount: Decimal::ONE,
            currency: "MOP".into(),
            transfer_type: TransferType::Internal,
            channel_hint: None,
            credential: "123456".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("123456"));
        assert!(!format!("{:?}", req).contains("123456"));
    }
}
