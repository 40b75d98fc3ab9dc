//! Composition root
//!
//! Every strategy and phase handler is registered here, explicitly, once.
//! The registries refuse duplicates and gaps, so a wiring mistake fails at
//! startup rather than mid-transfer.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;

use crate::config::SagaConfig;
use crate::idempotency::IdempotencyGuard;
use crate::ledger::{AccountBalance, IntegritySigner, Ledger};
use crate::money::CurrencyCode;
use crate::subject_lock::SubjectLocks;
use crate::transfer::adapters::{AccountDirectory, CredentialVerifier, NetworkGateway};
use crate::transfer::audit::AuditSink;
use crate::transfer::context::ContextBuilder;
use crate::transfer::events::EventPublisher;
use crate::transfer::pipeline::HandlerRegistry;
use crate::transfer::pipeline::handlers::{
    CreditPayeeHandler, DeductFeeHandler, DeductPayerHandler, FreezeFundHandler,
    NotifyNetworkHandler, ReverseCreditHandler, ReverseDeductHandler, ReverseFeeHandler,
    SendRiskRequestHandler, UnfreezeHandler,
};
use crate::transfer::store::TransferStore;
use crate::transfer::strategy::{
    CrossBorderStrategy, InstantRailStrategy, InterbankStrategy, InternalStrategy,
    StrategyRegistry, TransferPolicy,
};
use crate::transfer::{
    CompensationSweeper, RiskContinuation, StateMachineExecutor, TransferError, TransferService,
};

/// Collaborators the saga does not own.
pub struct SagaDeps {
    pub store: Arc<dyn TransferStore>,
    pub directory: Arc<dyn AccountDirectory>,
    pub credentials: Arc<dyn CredentialVerifier>,
    pub guard: Arc<dyn IdempotencyGuard>,
    pub gateway: Arc<dyn NetworkGateway>,
    pub publisher: Arc<dyn EventPublisher>,
    pub audit: Arc<dyn AuditSink>,
}

pub struct SagaRuntime {
    pub service: Arc<TransferService>,
    pub continuation: Arc<RiskContinuation>,
    pub sweeper: Arc<CompensationSweeper>,
    pub executor: Arc<StateMachineExecutor>,
    pub ledger: Arc<Ledger>,
    pub policy: Arc<TransferPolicy>,
    store: Arc<dyn TransferStore>,
}

pub fn build_strategies(policy: &Arc<TransferPolicy>) -> Result<StrategyRegistry, TransferError> {
    StrategyRegistry::builder()
        .register(Arc::new(InternalStrategy::new(policy.clone())))
        .register(Arc::new(InterbankStrategy::new(policy.clone())))
        .register(Arc::new(CrossBorderStrategy::new(policy.clone())))
        .register(Arc::new(InstantRailStrategy::new(policy.clone())))
        .build()
}

pub fn build_handlers(
    ledger: &Arc<Ledger>,
    policy: &TransferPolicy,
    gateway: Arc<dyn NetworkGateway>,
) -> Result<HandlerRegistry, TransferError> {
    HandlerRegistry::builder()
        .register(Arc::new(FreezeFundHandler::new(ledger.clone())))
        .register(Arc::new(SendRiskRequestHandler::new(
            policy.default_destination_country.clone(),
        )))
        .register(Arc::new(DeductFeeHandler::new(
            ledger.clone(),
            policy.fee_account.clone(),
        )))
        .register(Arc::new(DeductPayerHandler::new(ledger.clone())))
        .register(Arc::new(CreditPayeeHandler::new(ledger.clone())))
        .register(Arc::new(NotifyNetworkHandler::new(gateway)))
        .register(Arc::new(UnfreezeHandler::new(ledger.clone())))
        .register(Arc::new(ReverseCreditHandler::new(ledger.clone())))
        .register(Arc::new(ReverseDeductHandler::new(ledger.clone())))
        .register(Arc::new(ReverseFeeHandler::new(
            ledger.clone(),
            policy.fee_account.clone(),
        )))
        .build()
}

impl SagaRuntime {
    pub fn assemble(
        saga: &SagaConfig,
        policy: TransferPolicy,
        deps: SagaDeps,
    ) -> Result<Self, TransferError> {
        let signer = IntegritySigner::new(saga.integrity_secret.as_bytes())
            .map_err(|e| TransferError::Configuration(format!("integrity secret: {}", e)))?;
        let ledger = Arc::new(Ledger::new(signer));
        let policy = Arc::new(policy);
        let locks = Arc::new(SubjectLocks::new(saga.subject_lock));

        let strategies = build_strategies(&policy)?;
        let handlers = build_handlers(&ledger, &policy, deps.gateway)?;
        let contexts = ContextBuilder::new(deps.directory, deps.store.clone(), ledger.clone());
        let executor = Arc::new(StateMachineExecutor::new(
            deps.store.clone(),
            handlers,
            deps.publisher,
            contexts,
            saga.retry,
            deps.audit,
        ));

        let service = Arc::new(TransferService::new(
            deps.guard.clone(),
            locks,
            deps.credentials,
            strategies.clone(),
            executor.clone(),
        ));
        let continuation = Arc::new(RiskContinuation::new(executor.clone(), strategies.clone()));
        let sweeper = Arc::new(CompensationSweeper::new(
            executor.clone(),
            strategies,
            ledger.clone(),
            deps.guard,
            saga.sweeper,
        ));

        info!(
            currencies = policy.currencies.len(),
            fee_rules = policy.fees.len(),
            limit_rules = policy.limits.len(),
            "Transfer saga assembled"
        );
        Ok(Self {
            service,
            continuation,
            sweeper,
            executor,
            ledger,
            policy,
            store: deps.store,
        })
    }

    /// Zero-balance rows for every house account (clearing + fee income)
    /// in every supported currency. Existing rows are left alone.
    pub async fn open_house_accounts(&self) -> Result<usize, TransferError> {
        let mut opened = 0;
        for currency in &self.policy.currencies {
            for account_no in self.policy.house_accounts() {
                if self.open_account(account_no, currency, Decimal::ZERO).await? {
                    opened += 1;
                }
            }
        }
        info!(opened, "House accounts ready");
        Ok(opened)
    }

    /// Open a balance row unless one exists. `true` = opened now.
    pub async fn open_account(
        &self,
        account_no: &str,
        currency: &CurrencyCode,
        opening: Decimal,
    ) -> Result<bool, TransferError> {
        let row = AccountBalance::open(account_no, currency.clone(), opening, self.ledger.signer())?;
        Ok(self.store.open_account(&row).await?)
    }
}
