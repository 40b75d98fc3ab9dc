//! Phase handlers
//!
//! Ledger request ids are `<txn_id>:<PHASE>`; reversal holds on the
//! counterparty accounts use their own correlation ids so they never touch
//! the payer's original freeze.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::{Phase, PhaseHandler};
use crate::ledger::{Ledger, LedgerError, LedgerRequest};
use crate::transfer::adapters::NetworkGateway;
use crate::transfer::context::TransferContext;
use crate::transfer::error::TransferError;
use crate::transfer::events::{Envelope, OutboundEvent, RiskRequestEvent};
use crate::transfer::state::TransferStatus;
use crate::transfer::store::UnitOfWork;

fn request(
    ctx: &TransferContext,
    request_id: String,
    correlation_id: String,
    account_no: &str,
    amount: Decimal,
) -> LedgerRequest {
    LedgerRequest::new(
        request_id,
        correlation_id,
        account_no,
        ctx.order.currency().clone(),
        amount,
    )
}

/// Hold on a counterparty account, consumed in the same unit of work.
async fn claw_back(
    ledger: &Ledger,
    ctx: &TransferContext,
    uow: &mut dyn UnitOfWork,
    phase: Phase,
    account_no: &str,
    amount: Decimal,
) -> Result<(), TransferError> {
    let txn = ctx.txn_ref();
    let correlation = phase.request_id(&txn);
    let hold = request(
        ctx,
        format!("{}:HOLD", correlation),
        correlation.clone(),
        account_no,
        amount,
    );
    ledger.freeze(uow, &hold).await?;
    let take = request(ctx, correlation.clone(), correlation, account_no, amount);
    ledger.debit(uow, &take).await?;
    Ok(())
}

// ============================================================
// FORWARD PATH
// ============================================================

pub struct FreezeFundHandler {
    ledger: Arc<Ledger>,
}

impl FreezeFundHandler {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl PhaseHandler for FreezeFundHandler {
    fn phase(&self) -> Phase {
        Phase::FreezeFund
    }

    async fn handle(
        &self,
        ctx: &mut TransferContext,
        uow: &mut dyn UnitOfWork,
    ) -> Result<(), TransferError> {
        let txn = ctx.txn_ref();
        let mut req = request(
            ctx,
            Phase::FreezeFund.request_id(&txn),
            txn.clone(),
            &ctx.order.payer.account_no,
            ctx.order.amount.amount(),
        );
        if let Some(seen) = &ctx.payer_balance {
            req = req.at_version(seen.version());
        }

        match self.ledger.freeze(uow, &req).await {
            Ok(receipt) => {
                debug!(txn_id = %txn, available = %receipt.balance.available(), "Payer funds frozen");
                ctx.payer_balance = Some(receipt.balance);
                Ok(())
            }
            Err(LedgerError::InsufficientAvailable { .. }) => {
                Err(TransferError::InsufficientFunds { txn_id: txn })
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub struct SendRiskRequestHandler {
    default_country: String,
}

impl SendRiskRequestHandler {
    pub fn new(default_country: impl Into<String>) -> Self {
        Self {
            default_country: default_country.into(),
        }
    }
}

#[async_trait]
impl PhaseHandler for SendRiskRequestHandler {
    fn phase(&self) -> Phase {
        Phase::SendRiskRequest
    }

    async fn handle(
        &self,
        ctx: &mut TransferContext,
        uow: &mut dyn UnitOfWork,
    ) -> Result<(), TransferError> {
        let order = &ctx.order;
        let envelope = Envelope::new(
            &ctx.trace,
            RiskRequestEvent {
                txn_id: order.txn_id,
                account_no: order.payer.account_no.clone(),
                amount: order.amount.amount(),
                currency: order.currency().clone(),
                destination_country: order
                    .payee
                    .country
                    .clone()
                    .unwrap_or_else(|| self.default_country.clone()),
            },
        );
        uow.stage_event(OutboundEvent::RiskRequest(envelope));
        Ok(())
    }
}

pub struct DeductFeeHandler {
    ledger: Arc<Ledger>,
    fee_account: String,
}

impl DeductFeeHandler {
    pub fn new(ledger: Arc<Ledger>, fee_account: impl Into<String>) -> Self {
        Self {
            ledger,
            fee_account: fee_account.into(),
        }
    }
}

#[async_trait]
impl PhaseHandler for DeductFeeHandler {
    fn phase(&self) -> Phase {
        Phase::DeductFee
    }

    async fn handle(
        &self,
        ctx: &mut TransferContext,
        uow: &mut dyn UnitOfWork,
    ) -> Result<(), TransferError> {
        let fee = ctx.order.fee;
        if fee > Decimal::ZERO {
            let txn = ctx.txn_ref();
            let req = request(
                ctx,
                Phase::DeductFee.request_id(&txn),
                txn,
                &self.fee_account,
                fee,
            );
            self.ledger.credit(uow, &req).await?;
        }
        Ok(())
    }
}

pub struct DeductPayerHandler {
    ledger: Arc<Ledger>,
}

impl DeductPayerHandler {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl PhaseHandler for DeductPayerHandler {
    fn phase(&self) -> Phase {
        Phase::DeductPayer
    }

    async fn handle(
        &self,
        ctx: &mut TransferContext,
        uow: &mut dyn UnitOfWork,
    ) -> Result<(), TransferError> {
        let txn = ctx.txn_ref();
        let amount = ctx.order.amount.amount();
        let req = request(
            ctx,
            Phase::DeductPayer.request_id(&txn),
            txn.clone(),
            &ctx.order.payer.account_no,
            amount,
        );
        let receipt = self.ledger.debit(uow, &req).await?;
        // Settling against a released hold would credit money nobody paid
        if receipt.replayed {
            return Err(TransferError::PipelineContract(format!(
                "payer hold for {} is no longer open",
                txn
            )));
        }
        ctx.payer_balance = Some(receipt.balance);
        ctx.scratch.payer_debited = Some(amount);
        Ok(())
    }
}

pub struct CreditPayeeHandler {
    ledger: Arc<Ledger>,
}

impl CreditPayeeHandler {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl PhaseHandler for CreditPayeeHandler {
    fn phase(&self) -> Phase {
        Phase::CreditPayee
    }

    async fn handle(
        &self,
        ctx: &mut TransferContext,
        uow: &mut dyn UnitOfWork,
    ) -> Result<(), TransferError> {
        if ctx.scratch.payer_debited.is_none() {
            return Err(TransferError::PipelineContract(
                "CREDIT_PAYEE ran before DEDUCT_PAYER".into(),
            ));
        }
        let txn = ctx.txn_ref();
        let net = ctx.order.net_amount();
        let req = request(
            ctx,
            Phase::CreditPayee.request_id(&txn),
            txn,
            &ctx.order.settlement_account,
            net,
        );
        self.ledger.credit(uow, &req).await?;
        Ok(())
    }
}

pub struct NotifyNetworkHandler {
    gateway: Arc<dyn NetworkGateway>,
}

impl NotifyNetworkHandler {
    pub fn new(gateway: Arc<dyn NetworkGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl PhaseHandler for NotifyNetworkHandler {
    fn phase(&self) -> Phase {
        Phase::NotifyNetwork
    }

    async fn handle(
        &self,
        ctx: &mut TransferContext,
        _uow: &mut dyn UnitOfWork,
    ) -> Result<(), TransferError> {
        if !ctx.order.channel.is_external() {
            return Ok(());
        }
        if ctx.order.status == TransferStatus::Reversing {
            let reason = ctx
                .order
                .failure_reason
                .clone()
                .unwrap_or_else(|| "reversal".to_string());
            let reference = self.gateway.recall(&ctx.order, &reason, &ctx.trace).await?;
            info!(txn_id = %ctx.order.txn_id, gateway = self.gateway.name(), %reference, "Recall sent");
            return Ok(());
        }
        if ctx.order.network_reference.is_some() {
            return Ok(());
        }
        let reference = self.gateway.dispatch(&ctx.order, &ctx.trace).await?;
        info!(txn_id = %ctx.order.txn_id, gateway = self.gateway.name(), %reference, "Dispatched to network");
        ctx.order.network_reference = Some(reference);
        Ok(())
    }
}

// ============================================================
// CANCEL PATH
// ============================================================

pub struct UnfreezeHandler {
    ledger: Arc<Ledger>,
}

impl UnfreezeHandler {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl PhaseHandler for UnfreezeHandler {
    fn phase(&self) -> Phase {
        Phase::Unfreeze
    }

    async fn handle(
        &self,
        ctx: &mut TransferContext,
        uow: &mut dyn UnitOfWork,
    ) -> Result<(), TransferError> {
        let txn = ctx.txn_ref();
        let req = request(
            ctx,
            Phase::Unfreeze.request_id(&txn),
            txn.clone(),
            &ctx.order.payer.account_no,
            ctx.order.amount.amount(),
        );
        let receipt = self.ledger.unfreeze(uow, &req).await?;
        if receipt.replayed {
            warn!(txn_id = %txn, "Payer hold already released");
        }
        ctx.payer_balance = Some(receipt.balance);
        Ok(())
    }
}

// ============================================================
// REVERSAL PATH
// ============================================================

pub struct ReverseCreditHandler {
    ledger: Arc<Ledger>,
}

impl ReverseCreditHandler {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl PhaseHandler for ReverseCreditHandler {
    fn phase(&self) -> Phase {
        Phase::ReverseCredit
    }

    async fn handle(
        &self,
        ctx: &mut TransferContext,
        uow: &mut dyn UnitOfWork,
    ) -> Result<(), TransferError> {
        let net = ctx.order.net_amount();
        let account = ctx.order.settlement_account.clone();
        claw_back(&self.ledger, ctx, uow, Phase::ReverseCredit, &account, net).await?;
        ctx.scratch.recovered_from_payee = Some(net);
        Ok(())
    }
}

pub struct ReverseDeductHandler {
    ledger: Arc<Ledger>,
}

impl ReverseDeductHandler {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl PhaseHandler for ReverseDeductHandler {
    fn phase(&self) -> Phase {
        Phase::ReverseDeduct
    }

    async fn handle(
        &self,
        ctx: &mut TransferContext,
        uow: &mut dyn UnitOfWork,
    ) -> Result<(), TransferError> {
        let Some(recovered) = ctx.scratch.recovered_from_payee else {
            return Err(TransferError::PipelineContract(
                "REVERSE_DEDUCT ran before REVERSE_CREDIT".into(),
            ));
        };
        let txn = ctx.txn_ref();
        let req = request(
            ctx,
            Phase::ReverseDeduct.request_id(&txn),
            txn,
            &ctx.order.payer.account_no,
            recovered,
        );
        let receipt = self.ledger.credit(uow, &req).await?;
        ctx.payer_balance = Some(receipt.balance);
        Ok(())
    }
}

pub struct ReverseFeeHandler {
    ledger: Arc<Ledger>,
    fee_account: String,
}

impl ReverseFeeHandler {
    pub fn new(ledger: Arc<Ledger>, fee_account: impl Into<String>) -> Self {
        Self {
            ledger,
            fee_account: fee_account.into(),
        }
    }
}

#[async_trait]
impl PhaseHandler for ReverseFeeHandler {
    fn phase(&self) -> Phase {
        Phase::ReverseFee
    }

    async fn handle(
        &self,
        ctx: &mut TransferContext,
        uow: &mut dyn UnitOfWork,
    ) -> Result<(), TransferError> {
        let fee = ctx.order.fee;
        if fee <= Decimal::ZERO {
            return Ok(());
        }
        claw_back(&self.ledger, ctx, uow, Phase::ReverseFee, &self.fee_account, fee).await?;

        let txn = ctx.txn_ref();
        let refund = request(
            ctx,
            format!("{}:REFUND", Phase::ReverseFee.request_id(&txn)),
            txn,
            &ctx.order.payer.account_no,
            fee,
        );
        let receipt = self.ledger.credit(uow, &refund).await?;
        ctx.payer_balance = Some(receipt.balance);
        Ok(())
    }
}
