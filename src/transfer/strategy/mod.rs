//! Transfer strategies
//!
//! One strategy per [`TransferType`]. A strategy validates requests,
//! prices them, picks the channel and settlement account, and owns the
//! transition table: `(status, risk outcome) -> (phases, next status)`.
//!
//! The standard table shared by every type:
//!
//! | from                 | trigger        | phases                                 | to          |
//! |----------------------|----------------|----------------------------------------|-------------|
//! | INIT                 | submit         | FREEZE_FUND                            | FROZEN      |
//! | FROZEN               | submit         | SEND_RISK_REQUEST                      | RISK_PENDING|
//! | FROZEN, RISK_PENDING | risk passed    | DEDUCT_FEE, DEDUCT_PAYER, CREDIT_PAYEE | SETTLING    |
//! | FROZEN, RISK_PENDING | risk rejected  | UNFREEZE                               | UNFREEZING  |
//! | SETTLING             | -              | NOTIFY_NETWORK (external only)         | SUCCESS     |
//! | UNFREEZING           | -              | -                                      | FAILED      |

pub mod cross_border;
pub mod instant_rail;
pub mod interbank;
pub mod internal;
pub mod policy;

pub use cross_border::CrossBorderStrategy;
pub use instant_rail::InstantRailStrategy;
pub use interbank::InterbankStrategy;
pub use internal::InternalStrategy;
pub use policy::{FeeMode, FeeRule, LimitRule, TransferPolicy};

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;

use super::adapters::AccountSnapshot;
use super::error::TransferError;
use super::pipeline::Phase;
use super::state::TransferStatus;
use super::types::{PayeeInfo, RiskOutcome, TransferChannel, TransferType};
use crate::money::Money;

/// Phases to run and the status they lead to. Consumed once by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub phases: Vec<Phase>,
    pub next_status: TransferStatus,
}

impl StateTransition {
    pub fn new(phases: impl Into<Vec<Phase>>, next_status: TransferStatus) -> Self {
        Self {
            phases: phases.into(),
            next_status,
        }
    }

    /// Status-only edge.
    pub fn to(next_status: TransferStatus) -> Self {
        Self::new(Vec::new(), next_status)
    }
}

/// Everything a strategy looks at before an order exists.
#[derive(Debug, Clone, Copy)]
pub struct TransferDraft<'a> {
    pub user_id: &'a str,
    pub payer: &'a AccountSnapshot,
    pub payee: &'a PayeeInfo,
    /// Directory entry for the payee, when the bank knows the account
    pub payee_account: Option<&'a AccountSnapshot>,
    pub amount: &'a Money,
    pub channel_hint: Option<TransferChannel>,
}

pub trait TransferStrategy: Send + Sync {
    fn transfer_type(&self) -> TransferType;

    fn policy(&self) -> &TransferPolicy;

    fn select_channel(&self, draft: &TransferDraft<'_>) -> TransferChannel;

    /// Type-specific checks on top of [`validate_common`].
    fn validate_specific(&self, draft: &TransferDraft<'_>) -> Result<(), TransferError>;

    fn settlement_account(
        &self,
        draft: &TransferDraft<'_>,
        channel: TransferChannel,
    ) -> Result<String, TransferError>;

    fn validate(&self, draft: &TransferDraft<'_>) -> Result<(), TransferError> {
        validate_common(self.policy(), self.transfer_type(), draft)?;
        self.validate_specific(draft)
    }

    fn calculate_fee(
        &self,
        draft: &TransferDraft<'_>,
        channel: TransferChannel,
    ) -> Result<Decimal, TransferError> {
        let amount = draft.amount.amount();
        let fee = self
            .policy()
            .fee_for(channel, draft.amount.currency(), draft.payer.tier, amount);
        if fee >= amount {
            return Err(TransferError::FeeExceedsAmount { fee });
        }
        Ok(fee)
    }

    /// `None` = no edge for this state/event (late or duplicate trigger).
    fn next_transition(
        &self,
        status: TransferStatus,
        risk: RiskOutcome,
    ) -> Option<StateTransition> {
        standard_next(status, risk, self.notifies_network())
    }

    /// Compensation edge for a hold that outlived the freeze window.
    fn timeout_transition(&self, status: TransferStatus) -> Option<StateTransition> {
        standard_timeout(status)
    }

    fn reversal_transition(&self, status: TransferStatus) -> Option<StateTransition> {
        standard_reversal(status, self.recalls_on_reversal())
    }

    /// SETTLING -> SUCCESS runs NOTIFY_NETWORK.
    fn notifies_network(&self) -> bool {
        true
    }

    /// Reversal also sends a recall to the network.
    fn recalls_on_reversal(&self) -> bool {
        false
    }
}

/// Checks every transfer type shares.
pub fn validate_common(
    policy: &TransferPolicy,
    transfer_type: TransferType,
    draft: &TransferDraft<'_>,
) -> Result<(), TransferError> {
    if draft.payer.user_id != draft.user_id {
        return Err(TransferError::Forbidden);
    }
    if !draft.payer.is_active() {
        return Err(TransferError::PayerAccountInactive);
    }
    let currency = draft.amount.currency();
    if !policy.supports(currency) {
        return Err(TransferError::UnsupportedCurrency(currency.to_string()));
    }
    if draft.payee.account_no.trim().is_empty() {
        return Err(TransferError::MissingField("payee.account_no"));
    }
    if draft.payer.account_no == draft.payee.account_no {
        return Err(TransferError::SelfTransfer);
    }
    if let Some(limit) = policy.limit_for(draft.payer.tier, transfer_type, currency) {
        if draft.amount.amount() > limit {
            return Err(TransferError::LimitExceeded { limit });
        }
    }
    Ok(())
}

pub fn standard_next(
    status: TransferStatus,
    risk: RiskOutcome,
    notify_network: bool,
) -> Option<StateTransition> {
    use TransferStatus::*;
    match (status, risk) {
        (Init, _) => Some(StateTransition::new([Phase::FreezeFund], Frozen)),
        (Frozen, RiskOutcome::Unknown) => {
            Some(StateTransition::new([Phase::SendRiskRequest], RiskPending))
        }
        (Frozen | RiskPending, RiskOutcome::Passed) => Some(StateTransition::new(
            [Phase::DeductFee, Phase::DeductPayer, Phase::CreditPayee],
            Settling,
        )),
        (Frozen | RiskPending, RiskOutcome::Rejected) => {
            Some(StateTransition::new([Phase::Unfreeze], Unfreezing))
        }
        (Settling, _) if notify_network => {
            Some(StateTransition::new([Phase::NotifyNetwork], Success))
        }
        (Settling, _) => Some(StateTransition::to(Success)),
        (Unfreezing, _) => Some(StateTransition::to(Failed)),
        _ => None,
    }
}

pub fn standard_timeout(status: TransferStatus) -> Option<StateTransition> {
    match status {
        TransferStatus::Frozen | TransferStatus::RiskPending => Some(StateTransition::new(
            [Phase::Unfreeze],
            TransferStatus::Unfreezing,
        )),
        _ => None,
    }
}

/// SUCCESS -> REVERSING (mark), REVERSING -> REVERSED (undo).
pub fn standard_reversal(status: TransferStatus, recall: bool) -> Option<StateTransition> {
    match status {
        TransferStatus::Success => Some(StateTransition::to(TransferStatus::Reversing)),
        TransferStatus::Reversing => {
            let mut phases = vec![Phase::ReverseCredit, Phase::ReverseDeduct, Phase::ReverseFee];
            if recall {
                phases.push(Phase::NotifyNetwork);
            }
            Some(StateTransition::new(phases, TransferStatus::Reversed))
        }
        _ => None,
    }
}

/// Transfer type -> strategy, injective by construction.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<TransferType, Arc<dyn TransferStrategy>>,
}

impl StrategyRegistry {
    pub fn builder() -> StrategyRegistryBuilder {
        StrategyRegistryBuilder::default()
    }

    pub fn get(&self, transfer_type: TransferType) -> Result<Arc<dyn TransferStrategy>, TransferError> {
        self.strategies.get(&transfer_type).cloned().ok_or_else(|| {
            TransferError::Configuration(format!("no strategy for {}", transfer_type))
        })
    }

    pub fn types(&self) -> Vec<TransferType> {
        let mut types: Vec<_> = self.strategies.keys().copied().collect();
        types.sort();
        types
    }
}

#[derive(Default)]
pub struct StrategyRegistryBuilder {
    strategies: HashMap<TransferType, Arc<dyn TransferStrategy>>,
    duplicates: Vec<TransferType>,
}

impl StrategyRegistryBuilder {
    pub fn register(mut self, strategy: Arc<dyn TransferStrategy>) -> Self {
        let transfer_type = strategy.transfer_type();
        if self.strategies.insert(transfer_type, strategy).is_some() {
            self.duplicates.push(transfer_type);
        }
        self
    }

    pub fn build(self) -> Result<StrategyRegistry, TransferError> {
        if let Some(t) = self.duplicates.first() {
            return Err(TransferError::Configuration(format!(
                "duplicate strategy for {}",
                t
            )));
        }
        if self.strategies.is_empty() {
            return Err(TransferError::Configuration("no strategies registered".into()));
        }
        Ok(StrategyRegistry {
            strategies: self.strategies,
        })
    }
}
