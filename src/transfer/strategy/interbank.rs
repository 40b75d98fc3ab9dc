//! Domestic transfer to another bank through local clearing.

use std::sync::Arc;

use super::{TransferDraft, TransferPolicy, TransferStrategy};
use crate::transfer::error::TransferError;
use crate::transfer::types::{TransferChannel, TransferType};

pub struct InterbankStrategy {
    policy: Arc<TransferPolicy>,
}

impl InterbankStrategy {
    pub fn new(policy: Arc<TransferPolicy>) -> Self {
        Self { policy }
    }
}

impl TransferStrategy for InterbankStrategy {
    fn transfer_type(&self) -> TransferType {
        TransferType::Interbank
    }

    fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    fn select_channel(&self, _draft: &TransferDraft<'_>) -> TransferChannel {
        TransferChannel::LocalClearing
    }

    fn validate_specific(&self, draft: &TransferDraft<'_>) -> Result<(), TransferError> {
        match draft.payee.bank_code.as_deref() {
            Some(code) if !code.trim().is_empty() => Ok(()),
            _ => Err(TransferError::MissingField("payee.bank_code")),
        }
    }

    fn settlement_account(
        &self,
        _draft: &TransferDraft<'_>,
        channel: TransferChannel,
    ) -> Result<String, TransferError> {
        self.policy.clearing_account(channel).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{FeeMode, FeeRule};
    use super::*;
    use crate::money::CurrencyCode;
    use crate::transfer::types::PayeeInfo;
    use rust_decimal::Decimal;

    fn payee(bank_code: Option<&str>) -> PayeeInfo {
        PayeeInfo {
            account_no: "700123".into(),
            bank_code: bank_code.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_bank_code_required() {
        let s = InterbankStrategy::new(Arc::new(TransferPolicy::default()));
        let payer = payer();
        let amount = money(100, "MOP");
        assert_eq!(
            s.validate(&draft(&payer, &payee(None), None, &amount)),
            Err(TransferError::MissingField("payee.bank_code"))
        );
        assert!(s.validate(&draft(&payer, &payee(Some("BNU")), None, &amount)).is_ok());
    }

    #[test]
    fn test_fee_and_clearing_account() {
        let policy = TransferPolicy {
            fees: vec![FeeRule {
                channel: TransferChannel::LocalClearing,
                currency: CurrencyCode::parse("MOP").unwrap(),
                tier: None,
                mode: FeeMode::Fixed,
                fixed: Decimal::from(5),
                rate: Decimal::ZERO,
                min_fee: None,
                max_fee: None,
            }],
            ..TransferPolicy::default()
        };
        let s = InterbankStrategy::new(Arc::new(policy));
        let payer = payer();
        let to = payee(Some("BNU"));

        let amount = money(100, "MOP");
        let d = draft(&payer, &to, None, &amount);
        let channel = s.select_channel(&d);
        assert_eq!(s.calculate_fee(&d, channel).unwrap(), Decimal::from(5));
        assert_eq!(s.settlement_account(&d, channel).unwrap(), "CLEARING-LOCAL");

        // fee must stay below the amount
        let tiny = money(5, "MOP");
        let d = draft(&payer, &to, None, &tiny);
        assert!(matches!(
            s.calculate_fee(&d, channel),
            Err(TransferError::FeeExceedsAmount { .. })
        ));
    }
}
