//! Transfer policy: currencies, limits, fee rules and house accounts.
//!
//! Loaded from the `policy` section of the config file.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::money::{CurrencyCode, round_money};
use crate::transfer::error::TransferError;
use crate::transfer::types::{TransferChannel, TransferType, UserTier};

/// Single-transaction limit for (tier, type, currency).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    pub tier: UserTier,
    pub transfer_type: TransferType,
    pub currency: CurrencyCode,
    pub max_amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeMode {
    Fixed,
    Percentage,
    /// fixed + amount * rate
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRule {
    pub channel: TransferChannel,
    pub currency: CurrencyCode,
    /// `None` applies to every tier without a dedicated rule
    #[serde(default)]
    pub tier: Option<UserTier>,
    pub mode: FeeMode,
    #[serde(default)]
    pub fixed: Decimal,
    #[serde(default)]
    pub rate: Decimal,
    #[serde(default)]
    pub min_fee: Option<Decimal>,
    #[serde(default)]
    pub max_fee: Option<Decimal>,
}

impl FeeRule {
    /// Raw fee, clamped to [min, max], half-up to cents.
    pub fn apply(&self, amount: Decimal) -> Decimal {
        let mut fee = match self.mode {
            FeeMode::Fixed => self.fixed,
            FeeMode::Percentage => amount * self.rate,
            FeeMode::Both => self.fixed + amount * self.rate,
        };
        if let Some(min) = self.min_fee {
            fee = fee.max(min);
        }
        if let Some(max) = self.max_fee {
            fee = fee.min(max);
        }
        round_money(fee)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstantRailPolicy {
    #[serde(default = "default_instant_currencies")]
    pub currencies: Vec<CurrencyCode>,
    #[serde(default = "default_instant_cap")]
    pub max_amount: Decimal,
}

impl Default for InstantRailPolicy {
    fn default() -> Self {
        Self {
            currencies: default_instant_currencies(),
            max_amount: default_instant_cap(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPolicy {
    #[serde(default = "default_currencies")]
    pub currencies: Vec<CurrencyCode>,
    #[serde(default)]
    pub limits: Vec<LimitRule>,
    #[serde(default)]
    pub fees: Vec<FeeRule>,
    /// Settlement account per external channel
    #[serde(default = "default_clearing_accounts")]
    pub clearing_accounts: BTreeMap<TransferChannel, String>,
    #[serde(default = "default_fee_account")]
    pub fee_account: String,
    #[serde(default = "default_in_house_prefixes")]
    pub in_house_prefixes: Vec<String>,
    #[serde(default)]
    pub instant_rail: InstantRailPolicy,
    /// Risk request destination when the payee has no country
    #[serde(default = "default_destination_country")]
    pub default_destination_country: String,
}

fn codes(raw: &[&str]) -> Vec<CurrencyCode> {
    raw.iter()
        .filter_map(|c| CurrencyCode::parse(c).ok())
        .collect()
}

fn default_currencies() -> Vec<CurrencyCode> {
    codes(&["MOP", "HKD", "CNY", "USD"])
}

fn default_instant_currencies() -> Vec<CurrencyCode> {
    codes(&["MOP", "HKD"])
}

fn default_instant_cap() -> Decimal {
    Decimal::from(1_000_000)
}

fn default_clearing_accounts() -> BTreeMap<TransferChannel, String> {
    BTreeMap::from([
        (TransferChannel::LocalClearing, "CLEARING-LOCAL".to_string()),
        (TransferChannel::Fps, "CLEARING-FPS".to_string()),
        (TransferChannel::Swift, "CLEARING-SWIFT".to_string()),
        (TransferChannel::Cips, "CLEARING-CIPS".to_string()),
    ])
}

fn default_fee_account() -> String {
    "FEE-INCOME".to_string()
}

fn default_in_house_prefixes() -> Vec<String> {
    vec!["888".to_string(), "628888".to_string()]
}

fn default_destination_country() -> String {
    crate::transfer::events::DEFAULT_DESTINATION_COUNTRY.to_string()
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            currencies: default_currencies(),
            limits: Vec::new(),
            fees: Vec::new(),
            clearing_accounts: default_clearing_accounts(),
            fee_account: default_fee_account(),
            in_house_prefixes: default_in_house_prefixes(),
            instant_rail: InstantRailPolicy::default(),
            default_destination_country: default_destination_country(),
        }
    }
}

impl TransferPolicy {
    pub fn supports(&self, currency: &CurrencyCode) -> bool {
        self.currencies.contains(currency)
    }

    /// `None` = no limit configured.
    pub fn limit_for(
        &self,
        tier: UserTier,
        transfer_type: TransferType,
        currency: &CurrencyCode,
    ) -> Option<Decimal> {
        self.limits
            .iter()
            .find(|l| l.tier == tier && l.transfer_type == transfer_type && &l.currency == currency)
            .map(|l| l.max_amount)
    }

    /// Tier-specific rule wins over the catch-all; no rule = free.
    pub fn fee_for(
        &self,
        channel: TransferChannel,
        currency: &CurrencyCode,
        tier: UserTier,
        amount: Decimal,
    ) -> Decimal {
        let candidates = || {
            self.fees
                .iter()
                .filter(move |r| r.channel == channel && &r.currency == currency)
        };
        candidates()
            .find(|r| r.tier == Some(tier))
            .or_else(|| candidates().find(|r| r.tier.is_none()))
            .map(|r| r.apply(amount))
            .unwrap_or(Decimal::ZERO)
    }

    pub fn is_in_house(&self, account_no: &str) -> bool {
        self.in_house_prefixes
            .iter()
            .any(|p| account_no.starts_with(p.as_str()))
    }

    pub fn clearing_account(&self, channel: TransferChannel) -> Result<&str, TransferError> {
        self.clearing_accounts
            .get(&channel)
            .map(String::as_str)
            .ok_or_else(|| {
                TransferError::Configuration(format!("no clearing account for {}", channel))
            })
    }

    /// Every account the bank itself books into.
    pub fn house_accounts(&self) -> Vec<&str> {
        let mut accounts: Vec<&str> = self.clearing_accounts.values().map(String::as_str).collect();
        accounts.push(self.fee_account.as_str());
        accounts
    }
}
