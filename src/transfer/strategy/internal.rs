//! Book transfer between two accounts held at this bank.

use std::sync::Arc;

use super::{TransferDraft, TransferPolicy, TransferStrategy};
use crate::transfer::error::TransferError;
use crate::transfer::types::{TransferChannel, TransferType};

pub struct InternalStrategy {
    policy: Arc<TransferPolicy>,
}

impl InternalStrategy {
    pub fn new(policy: Arc<TransferPolicy>) -> Self {
        Self { policy }
    }
}

impl TransferStrategy for InternalStrategy {
    fn transfer_type(&self) -> TransferType {
        TransferType::Internal
    }

    fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    fn select_channel(&self, _draft: &TransferDraft<'_>) -> TransferChannel {
        TransferChannel::Internal
    }

    fn validate_specific(&self, draft: &TransferDraft<'_>) -> Result<(), TransferError> {
        if !self.policy.is_in_house(&draft.payee.account_no) {
            return Err(TransferError::PayeeNotInHouse);
        }
        match draft.payee_account {
            Some(payee) if payee.is_active() => Ok(()),
            _ => Err(TransferError::PayeeAccountNotFound),
        }
    }

    /// Money lands directly on the payee's own account.
    fn settlement_account(
        &self,
        draft: &TransferDraft<'_>,
        _channel: TransferChannel,
    ) -> Result<String, TransferError> {
        Ok(draft.payee.account_no.clone())
    }

    fn notifies_network(&self) -> bool {
        false
    }
}
