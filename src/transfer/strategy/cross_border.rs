//! Cross-border transfer over SWIFT, or CIPS for renminbi.

use std::sync::Arc;

use super::{TransferDraft, TransferPolicy, TransferStrategy};
use crate::transfer::error::TransferError;
use crate::transfer::types::{TransferChannel, TransferType};

const CIPS_CURRENCY: &str = "CNY";

pub struct CrossBorderStrategy {
    policy: Arc<TransferPolicy>,
}

impl CrossBorderStrategy {
    pub fn new(policy: Arc<TransferPolicy>) -> Self {
        Self { policy }
    }
}

fn present(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl TransferStrategy for CrossBorderStrategy {
    fn transfer_type(&self) -> TransferType {
        TransferType::CrossBorder
    }

    fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    fn select_channel(&self, draft: &TransferDraft<'_>) -> TransferChannel {
        if draft.amount.currency().as_str() == CIPS_CURRENCY {
            TransferChannel::Cips
        } else {
            TransferChannel::Swift
        }
    }

    fn validate_specific(&self, draft: &TransferDraft<'_>) -> Result<(), TransferError> {
        if !present(&draft.payee.swift_code) {
            return Err(TransferError::MissingField("payee.swift_code"));
        }
        if !present(&draft.payee.country) {
            return Err(TransferError::MissingField("payee.country"));
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

    fn recalls_on_reversal(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::transfer::pipeline::Phase;
    use crate::transfer::state::TransferStatus;
    use crate::transfer::types::PayeeInfo;

    fn payee() -> PayeeInfo {
        PayeeInfo {
            account_no: "GB29NWBK60161331926819".into(),
            swift_code: Some("NWBKGB2L".into()),
            country: Some("GB".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_required_fields() {
        let s = CrossBorderStrategy::new(Arc::new(TransferPolicy::default()));
        let payer = payer();
        let amount = money(100, "USD");

        let mut no_country = payee();
        no_country.country = None;
        assert_eq!(
            s.validate(&draft(&payer, &no_country, None, &amount)),
            Err(TransferError::MissingField("payee.country"))
        );
        let mut no_swift = payee();
        no_swift.swift_code = Some("  ".into());
        assert_eq!(
            s.validate(&draft(&payer, &no_swift, None, &amount)),
            Err(TransferError::MissingField("payee.swift_code"))
        );
        assert!(s.validate(&draft(&payer, &payee(), None, &amount)).is_ok());
    }

    #[test]
    fn test_channel_by_currency() {
        let s = CrossBorderStrategy::new(Arc::new(TransferPolicy::default()));
        let payer = payer();
        let to = payee();
        let usd = money(100, "USD");
        let cny = money(100, "CNY");
        assert_eq!(s.select_channel(&draft(&payer, &to, None, &usd)), TransferChannel::Swift);
        let d = draft(&payer, &to, None, &cny);
        assert_eq!(s.select_channel(&d), TransferChannel::Cips);
        assert_eq!(
            s.settlement_account(&d, TransferChannel::Cips).unwrap(),
            "CLEARING-CIPS"
        );
    }

    #[test]
    fn test_reversal_recalls() {
        let s = CrossBorderStrategy::new(Arc::new(TransferPolicy::default()));
        let t = s.reversal_transition(TransferStatus::Reversing).unwrap();
        assert_eq!(t.phases.last(), Some(&Phase::NotifyNetwork));
        assert_eq!(t.next_status, TransferStatus::Reversed);
    }
}
