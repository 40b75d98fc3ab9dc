//! Handler Pipeline
//!
//! One handler per [`Phase`]. Handlers are stateless, perform a single
//! side effect inside the transition's unit of work and must be safe to
//! re-run for the same txn id (every ledger call carries a request id
//! derived from txn id + phase).

pub mod handlers;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::context::TransferContext;
use super::error::TransferError;
use super::store::UnitOfWork;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    FreezeFund,
    SendRiskRequest,
    DeductFee,
    DeductPayer,
    CreditPayee,
    NotifyNetwork,
    Unfreeze,
    ReverseCredit,
    ReverseDeduct,
    ReverseFee,
}

impl Phase {
    pub const ALL: [Phase; 10] = [
        Phase::FreezeFund,
        Phase::SendRiskRequest,
        Phase::DeductFee,
        Phase::DeductPayer,
        Phase::CreditPayee,
        Phase::NotifyNetwork,
        Phase::Unfreeze,
        Phase::ReverseCredit,
        Phase::ReverseDeduct,
        Phase::ReverseFee,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::FreezeFund => "FREEZE_FUND",
            Phase::SendRiskRequest => "SEND_RISK_REQUEST",
            Phase::DeductFee => "DEDUCT_FEE",
            Phase::DeductPayer => "DEDUCT_PAYER",
            Phase::CreditPayee => "CREDIT_PAYEE",
            Phase::NotifyNetwork => "NOTIFY_NETWORK",
            Phase::Unfreeze => "UNFREEZE",
            Phase::ReverseCredit => "REVERSE_CREDIT",
            Phase::ReverseDeduct => "REVERSE_DEDUCT",
            Phase::ReverseFee => "REVERSE_FEE",
        }
    }

    /// Ledger request id for this phase of a transfer.
    pub fn request_id(&self, txn_ref: &str) -> String {
        format!("{}:{}", txn_ref, self.as_str())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait PhaseHandler: Send + Sync {
    fn phase(&self) -> Phase;

    async fn handle(
        &self,
        ctx: &mut TransferContext,
        uow: &mut dyn UnitOfWork,
    ) -> Result<(), TransferError>;
}

/// Fixed phase -> handler table, complete by construction.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<Phase, Arc<dyn PhaseHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, phase: Phase) -> Result<Arc<dyn PhaseHandler>, TransferError> {
        self.handlers
            .get(&phase)
            .cloned()
            .ok_or_else(|| TransferError::Configuration(format!("no handler for {}", phase)))
    }

    /// Resolve every phase up front so a transition never starts half-wired.
    pub fn resolve(&self, phases: &[Phase]) -> Result<Vec<Arc<dyn PhaseHandler>>, TransferError> {
        phases.iter().map(|p| self.get(*p)).collect()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<Phase, Arc<dyn PhaseHandler>>,
    duplicates: Vec<Phase>,
}

impl HandlerRegistryBuilder {
    pub fn register(mut self, handler: Arc<dyn PhaseHandler>) -> Self {
        let phase = handler.phase();
        if self.handlers.insert(phase, handler).is_some() {
            self.duplicates.push(phase);
        }
        self
    }

    /// Fails on duplicate bindings or any phase left without a handler.
    pub fn build(self) -> Result<HandlerRegistry, TransferError> {
        if let Some(phase) = self.duplicates.first() {
            return Err(TransferError::Configuration(format!(
                "duplicate handler for {}",
                phase
            )));
        }
        let missing: Vec<&str> = Phase::ALL
            .iter()
            .filter(|p| !self.handlers.contains_key(p))
            .map(|p| p.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(TransferError::Configuration(format!(
                "missing handlers: {}",
                missing.join(", ")
            )));
        }
        Ok(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}
