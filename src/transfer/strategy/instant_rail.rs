//! Instant payment rail (FPS), addressed by proxy id.

use std::sync::Arc;

use super::{TransferDraft, TransferPolicy, TransferStrategy};
use crate::transfer::error::TransferError;
use crate::transfer::types::{TransferChannel, TransferType};

pub struct InstantRailStrategy {
    policy: Arc<TransferPolicy>,
}

impl InstantRailStrategy {
    pub fn new(policy: Arc<TransferPolicy>) -> Self {
        Self { policy }
    }
}

impl TransferStrategy for InstantRailStrategy {
    fn transfer_type(&self) -> TransferType {
        TransferType::InstantRail
    }

    fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    fn select_channel(&self, _draft: &TransferDraft<'_>) -> TransferChannel {
        TransferChannel::Fps
    }

    fn validate_specific(&self, draft: &TransferDraft<'_>) -> Result<(), TransferError> {
        if !draft
            .payee
            .fps_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty())
        {
            return Err(TransferError::MissingField("payee.fps_id"));
        }
        let rail = &self.policy.instant_rail;
        let currency = draft.amount.currency();
        if !rail.currencies.contains(currency) {
            return Err(TransferError::UnsupportedCurrency(currency.to_string()));
        }
        if draft.amount.amount() > rail.max_amount {
            return Err(TransferError::LimitExceeded {
                limit: rail.max_amount,
            });
        }
        Ok(())
    }

    fn settlement_account(
        &self,
        _draft: &TransferDraft<'_>,
        channel: TransferChannel,
    ) -> Result<String, TransferError> {
        self.policy.clearing_account(channel).map(str::to_string)
    }
}
