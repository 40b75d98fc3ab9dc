//! End-to-end saga tests on the in-memory store.
//!
//! The harness assembles the real runtime (registries, executor, service,
//! continuation, sweeper) and plays the risk engine by hand from the
//! outbound channel.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::app::{SagaDeps, SagaRuntime};
use crate::config::SagaConfig;
use crate::idempotency::MemoryIdempotencyGuard;
use crate::ledger::{AccountBalance, LedgerRequest};
use crate::transfer::adapters::mock::MockNetworkGateway;
use crate::transfer::adapters::{
    AccountSnapshot, Argon2Credentials, CredentialParams, MemoryAccountDirectory,
};
use crate::transfer::audit::{AuditResult, MemoryAuditSink};
use crate::transfer::events::{ChannelPublisher, Envelope, OutboundEvent, RiskResultEvent};
use crate::transfer::store::{MemoryTransferStore, TransferStore};
use crate::transfer::strategy::{FeeMode, FeeRule, LimitRule, TransferPolicy};
use crate::transfer::sweeper::FREEZE_TIMEOUT_REASON;
use crate::transfer::testkit::{mop, opened};
use crate::transfer::types::{
    PayeeInfo, ReversalRequest, RiskOutcome, SubmitTransferRequest, TraceContext,
    TransferChannel, TransferType, UserTier,
};
use crate::transfer::{ContinuationOutcome, TransferError, TransferStatus};

const ALICE_PIN: &str = "246810";
const SAGA_YAML: &str = "integrity_secret: integration-test-secret-0001\n";

struct TestHarness {
    runtime: SagaRuntime,
    store: Arc<MemoryTransferStore>,
    gateway: Arc<MockNetworkGateway>,
    audit: Arc<MemoryAuditSink>,
    outbound: mpsc::Receiver<OutboundEvent>,
}

fn dec(v: i64) -> Decimal {
    Decimal::from(v)
}

fn test_policy() -> TransferPolicy {
    TransferPolicy {
        limits: vec![LimitRule {
            tier: UserTier::Normal,
            transfer_type: TransferType::Internal,
            currency: mop(),
            max_amount: dec(50_000),
        }],
        fees: vec![
            FeeRule {
                channel: TransferChannel::LocalClearing,
                currency: mop(),
                tier: None,
                mode: FeeMode::Fixed,
                fixed: dec(5),
                rate: Decimal::ZERO,
                min_fee: None,
                max_fee: None,
            },
            FeeRule {
                channel: TransferChannel::Swift,
                currency: mop(),
                tier: None,
                mode: FeeMode::Fixed,
                fixed: dec(20),
                rate: Decimal::ZERO,
                min_fee: None,
                max_fee: None,
            },
        ],
        ..TransferPolicy::default()
    }
}

impl TestHarness {
    async fn new() -> Self {
        Self::with_policy(test_policy()).await
    }

    async fn with_policy(policy: TransferPolicy) -> Self {
        Self::with_saga(SAGA_YAML, policy).await
    }

    async fn with_saga(yaml: &str, policy: TransferPolicy) -> Self {
        let saga: SagaConfig = serde_yaml::from_str(yaml).unwrap();
        let store = Arc::new(MemoryTransferStore::new());
        let gateway = Arc::new(MockNetworkGateway::new());

        let directory = Arc::new(MemoryAccountDirectory::new());
        directory.upsert(AccountSnapshot::active(
            "888001",
            "Alice",
            "u-alice",
            UserTier::Normal,
        ));
        directory.upsert(AccountSnapshot::active("888002", "Bob", "u-bob", UserTier::Normal));

        let credentials = Arc::new(
            Argon2Credentials::new(CredentialParams {
                memory_kib: 8,
                iterations: 1,
                parallelism: 1,
            })
            .unwrap(),
        );
        credentials.enroll("u-alice", ALICE_PIN).unwrap();

        let audit = Arc::new(MemoryAuditSink::new());
        let (publisher, outbound) = ChannelPublisher::channel(256);
        let runtime = SagaRuntime::assemble(
            &saga,
            policy,
            SagaDeps {
                store: store.clone(),
                directory,
                credentials,
                guard: Arc::new(MemoryIdempotencyGuard::default()),
                gateway: gateway.clone(),
                publisher: Arc::new(publisher),
                audit: audit.clone(),
            },
        )
        .unwrap();
        runtime.open_house_accounts().await.unwrap();
        runtime.open_account("888001", &mop(), dec(1000)).await.unwrap();
        runtime.open_account("888002", &mop(), Decimal::ZERO).await.unwrap();

        Self {
            runtime,
            store,
            gateway,
            audit,
            outbound,
        }
    }

    async fn balance(&self, account_no: &str) -> AccountBalance {
        self.store.balance(account_no, &mop()).await.unwrap().unwrap()
    }

    async fn submit(
        &self,
        req: SubmitTransferRequest,
    ) -> Result<crate::transfer::SubmitTransferResponse, TransferError> {
        self.runtime
            .service
            .submit(req, TraceContext::new(Some("u-alice".into())))
            .await
    }

    /// Next risk request the saga emitted.
    fn next_risk_request(&mut self) -> Envelope<crate::transfer::events::RiskRequestEvent> {
        match self.outbound.try_recv().unwrap() {
            OutboundEvent::RiskRequest(envelope) => envelope,
        }
    }

    /// Answer the next pending risk request.
    async fn answer(&mut self, passed: bool) -> ContinuationOutcome {
        let request = self.next_risk_request();
        let verdict = verdict_for(&request, passed);
        self.runtime
            .continuation
            .on_risk_result(&verdict)
            .await
            .unwrap()
    }

    /// 1000 MOP total across every MOP row.
    fn assert_conserved(&self) {
        assert_eq!(self.store.total_balance(&mop()), dec(1000));
    }
}

fn verdict_for(
    request: &Envelope<crate::transfer::events::RiskRequestEvent>,
    passed: bool,
) -> Envelope<RiskResultEvent> {
    Envelope::new(
        &request.trace(),
        RiskResultEvent {
            txn_id: request.payload.txn_id,
            passed,
            reason: (!passed).then(|| "sanctions screening hit".to_string()),
        },
    )
}

fn internal(request_id: &str, amount: i64) -> SubmitTransferRequest {
    SubmitTransferRequest {
        request_id: request_id.into(),
        user_id: "u-alice".into(),
        payer_account_no: "888001".into(),
        payee: PayeeInfo {
            account_no: "888002".into(),
            ..Default::default()
        },
        amount: dec(amount),
        currency: "MOP".into(),
        transfer_type: TransferType::Internal,
        channel_hint: None,
        credential: ALICE_PIN.into(),
    }
}

fn interbank(request_id: &str, amount: i64) -> SubmitTransferRequest {
    SubmitTransferRequest {
        payee: PayeeInfo {
            account_no: "700123456".into(),
            account_name: Some("Carol".into()),
            bank_code: Some("BNU".into()),
            ..Default::default()
        },
        transfer_type: TransferType::Interbank,
        ..internal(request_id, amount)
    }
}

fn cross_border(request_id: &str, amount: i64) -> SubmitTransferRequest {
    SubmitTransferRequest {
        payee: PayeeInfo {
            account_no: "HK001122334455".into(),
            account_name: Some("Dora".into()),
            swift_code: Some("HSBCHKHH".into()),
            country: Some("HK".into()),
            ..Default::default()
        },
        transfer_type: TransferType::CrossBorder,
        ..internal(request_id, amount)
    }
}

// ========================================================================
// Happy path
// ========================================================================

#[tokio::test]
async fn test_internal_transfer_settles_after_risk_pass() {
    let mut h = TestHarness::new().await;

    let resp = h.submit(internal("req-1", 200)).await.unwrap();
    assert_eq!(resp.status, TransferStatus::RiskPending);

    let payer = h.balance("888001").await;
    assert_eq!(payer.balance(), dec(1000));
    assert_eq!(payer.available(), dec(800));
    assert_eq!(payer.frozen(), dec(200));

    let outcome = h.answer(true).await;
    assert_eq!(outcome, ContinuationOutcome::Applied(TransferStatus::Success));

    let payer = h.balance("888001").await;
    assert_eq!(payer.balance(), dec(800));
    assert_eq!(payer.frozen(), Decimal::ZERO);
    assert_eq!(h.balance("888002").await.balance(), dec(200));

    let order = h.runtime.service.order_by_txn(&resp.txn_id).await.unwrap();
    assert_eq!(order.status, TransferStatus::Success);
    assert_eq!(order.risk_outcome, RiskOutcome::Passed);
    assert_eq!(order.payee.account_name.as_deref(), Some("Bob"));
    assert_eq!(h.gateway.dispatch_count(), 0);
    h.assert_conserved();
}

#[tokio::test]
async fn test_risk_request_carries_trace_and_destination() {
    let mut h = TestHarness::new().await;
    let trace = TraceContext::new(Some("u-alice".into()));

    let resp = h
        .runtime
        .service
        .submit(internal("req-trace", 150), trace.clone())
        .await
        .unwrap();
    let request = h.next_risk_request();
    assert_eq!(request.trace_id, trace.trace_id);
    assert_eq!(request.payload.txn_id, resp.txn_id);
    assert_eq!(request.payload.amount, dec(150));
    assert_eq!(request.payload.destination_country, "MO");
}

#[tokio::test]
async fn test_interbank_fee_booked_and_network_notified() {
    let mut h = TestHarness::new().await;

    let resp = h.submit(interbank("req-ib", 200)).await.unwrap();
    assert_eq!(h.answer(true).await, ContinuationOutcome::Applied(TransferStatus::Success));

    let order = h.runtime.service.order_by_txn(&resp.txn_id).await.unwrap();
    assert_eq!(order.channel, TransferChannel::LocalClearing);
    assert_eq!(order.fee, dec(5));
    assert_eq!(order.settlement_account, "CLEARING-LOCAL");
    assert!(order.network_reference.is_some());

    assert_eq!(h.balance("888001").await.balance(), dec(800));
    assert_eq!(h.balance("CLEARING-LOCAL").await.balance(), dec(195));
    assert_eq!(h.balance("FEE-INCOME").await.balance(), dec(5));
    assert_eq!(h.gateway.dispatch_count(), 1);
    h.assert_conserved();
}

#[tokio::test]
async fn test_instant_rail_cap_and_channel() {
    let mut policy = test_policy();
    policy.instant_rail.max_amount = dec(500);
    let h = TestHarness::with_policy(policy).await;
    let rail = |request_id: &str, amount| SubmitTransferRequest {
        payee: PayeeInfo {
            account_no: "700555".into(),
            fps_id: Some("+85361234567".into()),
            ..Default::default()
        },
        transfer_type: TransferType::InstantRail,
        ..internal(request_id, amount)
    };

    let err = h.submit(rail("req-fps-big", 600)).await.unwrap_err();
    assert_eq!(err, TransferError::LimitExceeded { limit: dec(500) });

    let resp = h.submit(rail("req-fps", 300)).await.unwrap();
    assert_eq!(resp.status, TransferStatus::RiskPending);
    let order = h.runtime.service.order_by_txn(&resp.txn_id).await.unwrap();
    assert_eq!(order.channel, TransferChannel::Fps);
    assert_eq!(order.settlement_account, "CLEARING-FPS");
}

// ========================================================================
// Failure paths
// ========================================================================

#[tokio::test]
async fn test_risk_rejection_restores_funds() {
    let mut h = TestHarness::new().await;

    let resp = h.submit(internal("req-rej", 200)).await.unwrap();
    assert_eq!(h.answer(false).await, ContinuationOutcome::Applied(TransferStatus::Failed));

    let payer = h.balance("888001").await;
    assert_eq!(payer.available(), dec(1000));
    assert_eq!(payer.frozen(), Decimal::ZERO);
    assert_eq!(h.balance("888002").await.balance(), Decimal::ZERO);

    let order = h.runtime.service.order_by_txn(&resp.txn_id).await.unwrap();
    assert_eq!(order.risk_outcome, RiskOutcome::Rejected);
    assert_eq!(order.failure_reason.as_deref(), Some("sanctions screening hit"));
    h.assert_conserved();
}

#[tokio::test]
async fn test_insufficient_funds_recorded_as_failed() {
    let mut h = TestHarness::new().await;

    let err = h.submit(internal("req-poor", 5000)).await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_FUNDS");

    let order = h
        .runtime
        .service
        .outcome_of("req-poor")
        .await
        .unwrap()
        .expect("failed order recorded");
    assert_eq!(order.status, TransferStatus::Failed);
    assert!(order.failure_reason.is_some());
    assert_eq!(h.store.order_count(), 1);
    assert_eq!(h.balance("888001").await.available(), dec(1000));
    assert!(h.outbound.try_recv().is_err());

    let again = h.submit(internal("req-poor", 5000)).await.unwrap_err();
    assert_eq!(
        again,
        TransferError::DuplicateRequest {
            prior: Some(order.txn_id.to_string())
        }
    );
}

#[tokio::test]
async fn test_validation_rejections_persist_nothing() {
    let h = TestHarness::new().await;

    let mut to_self = internal("req-self", 10);
    to_self.payee.account_no = "888001".into();
    assert_eq!(h.submit(to_self).await.unwrap_err(), TransferError::SelfTransfer);

    let mut not_mine = internal("req-forbidden", 10);
    not_mine.user_id = "u-bob".into();
    assert_eq!(h.submit(not_mine).await.unwrap_err(), TransferError::Forbidden);

    let mut unknown_payee = internal("req-ghost", 10);
    unknown_payee.payee.account_no = "888999".into();
    assert_eq!(
        h.submit(unknown_payee).await.unwrap_err(),
        TransferError::PayeeAccountNotFound
    );

    let over_limit = internal("req-limit", 60_000);
    assert_eq!(
        h.submit(over_limit).await.unwrap_err(),
        TransferError::LimitExceeded { limit: dec(50_000) }
    );

    let mut bad_ccy = internal("req-ccy", 10);
    bad_ccy.currency = "JPY".into();
    assert_eq!(h.submit(bad_ccy).await.unwrap_err().code(), "UNSUPPORTED_CURRENCY");

    // HKD is supported but Alice only holds MOP
    let mut no_row = internal("req-hkd", 10);
    no_row.currency = "HKD".into();
    let err = h.submit(no_row).await.unwrap_err();
    assert_eq!(err, TransferError::PayerCurrencyNotHeld("HKD".into()));
    assert!(err.is_validation());

    assert_eq!(h.store.order_count(), 0);
    assert_eq!(h.balance("888001").await.available(), dec(1000));
}

#[tokio::test]
async fn test_invalid_credential_releases_request_id() {
    let h = TestHarness::new().await;

    let mut wrong = internal("req-pin", 100);
    wrong.credential = "000000".into();
    assert_eq!(h.submit(wrong).await.unwrap_err(), TransferError::InvalidCredential);
    assert_eq!(h.store.order_count(), 0);
    assert_eq!(h.balance("888001").await.frozen(), Decimal::ZERO);

    // same request id may be retried once the rejection is definitive
    let resp = h.submit(internal("req-pin", 100)).await.unwrap();
    assert_eq!(resp.status, TransferStatus::RiskPending);
}

// ========================================================================
// Idempotency and duplicate delivery
// ========================================================================

#[tokio::test]
async fn test_duplicate_request_id_creates_one_order() {
    let h = TestHarness::new().await;

    let first = h.submit(internal("req-dup", 200)).await.unwrap();
    let second = h.submit(internal("req-dup", 200)).await.unwrap_err();
    assert_eq!(
        second,
        TransferError::DuplicateRequest {
            prior: Some(first.txn_id.to_string())
        }
    );

    assert_eq!(h.store.order_count(), 1);
    assert_eq!(h.balance("888001").await.frozen(), dec(200));
    let order = h.runtime.service.outcome_of("req-dup").await.unwrap().unwrap();
    assert_eq!(order.txn_id, first.txn_id);
}

#[tokio::test]
async fn test_duplicate_and_late_risk_results_are_noops() {
    let mut h = TestHarness::new().await;

    h.submit(internal("req-late", 200)).await.unwrap();
    let request = h.next_risk_request();
    let pass = verdict_for(&request, true);
    let continuation = h.runtime.continuation.clone();

    assert_eq!(
        continuation.on_risk_result(&pass).await.unwrap(),
        ContinuationOutcome::Applied(TransferStatus::Success)
    );
    // redelivery of the same verdict, then a contradicting late one
    assert_eq!(
        continuation.on_risk_result(&pass.clone().redelivered()).await.unwrap(),
        ContinuationOutcome::Discarded
    );
    assert_eq!(
        continuation
            .on_risk_result(&verdict_for(&request, false))
            .await
            .unwrap(),
        ContinuationOutcome::Discarded
    );

    assert_eq!(h.balance("888001").await.balance(), dec(800));
    assert_eq!(h.balance("888002").await.balance(), dec(200));
    h.assert_conserved();
}

#[tokio::test]
async fn test_every_committed_transition_is_audited() {
    let mut h = TestHarness::new().await;

    let resp = h.submit(internal("req-audit", 200)).await.unwrap();
    h.answer(true).await;

    let trail: Vec<_> = h
        .audit
        .for_txn(&resp.txn_id)
        .into_iter()
        .map(|r| (r.from, r.to, r.result))
        .collect();
    assert_eq!(
        trail,
        vec![
            (TransferStatus::Init, TransferStatus::Frozen, AuditResult::Success),
            (TransferStatus::Frozen, TransferStatus::RiskPending, AuditResult::Success),
            (TransferStatus::RiskPending, TransferStatus::Settling, AuditResult::Success),
            (TransferStatus::Settling, TransferStatus::Success, AuditResult::Success),
        ]
    );
    let records = h.audit.for_txn(&resp.txn_id);
    assert!(records.iter().all(|r| r.actor == "u-alice"));
    // the verdict hop keeps the submitter's trace
    assert_eq!(records[0].trace_id, records[3].trace_id);
}

// ========================================================================
// Subject lease scope
// ========================================================================

#[tokio::test]
async fn test_slow_network_dispatch_does_not_block_payer_submissions() {
    let mut h = TestHarness::new().await;

    h.submit(interbank("req-slow", 200)).await.unwrap();
    let verdict = verdict_for(&h.next_risk_request(), true);

    h.gateway.gate_dispatch();
    let continuation = h.runtime.continuation.clone();
    let settling = tokio::spawn(async move { continuation.on_risk_result(&verdict).await });
    h.gateway.dispatch_in_flight().await;

    let next = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        h.submit(internal("req-while-dispatching", 100)),
    )
    .await
    .expect("submission waited on the network call")
    .unwrap();
    assert_eq!(next.status, TransferStatus::RiskPending);

    h.gateway.open_dispatch();
    assert_eq!(
        settling.await.unwrap().unwrap(),
        ContinuationOutcome::Applied(TransferStatus::Success)
    );

    let payer = h.balance("888001").await;
    assert_eq!(payer.balance(), dec(800));
    assert_eq!(payer.frozen(), dec(100));
    h.assert_conserved();
}

#[tokio::test]
async fn test_slow_recall_does_not_block_payer_submissions() {
    let mut h = TestHarness::new().await;

    let resp = h.submit(cross_border("req-recall", 300)).await.unwrap();
    h.answer(true).await;
    let order = h.runtime.service.order_by_txn(&resp.txn_id).await.unwrap();

    h.gateway.gate_dispatch();
    let service = h.runtime.service.clone();
    let reversing = tokio::spawn(async move {
        service
            .reverse(
                ReversalRequest {
                    order_id: order.id,
                    reason: "customer dispute".into(),
                },
                TraceContext::system(),
            )
            .await
    });
    h.gateway.dispatch_in_flight().await;

    let next = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        h.submit(internal("req-while-recalling", 100)),
    )
    .await
    .expect("submission waited on the recall")
    .unwrap();
    assert_eq!(next.status, TransferStatus::RiskPending);

    h.gateway.open_dispatch();
    let reversed = reversing.await.unwrap().unwrap();
    assert_eq!(reversed.status, TransferStatus::Reversed);
    // the freeze above bumped the payer row, so the reversal may have lost
    // one CAS round and re-sent the recall; the network keys it by txn id
    assert!(h.gateway.recall_count() >= 1);
    let payer = h.balance("888001").await;
    assert_eq!(payer.balance(), dec(1000));
    assert_eq!(payer.frozen(), dec(100));
    h.assert_conserved();
}

#[tokio::test]
async fn test_risk_result_for_unknown_transfer_discarded() {
    let h = TestHarness::new().await;
    let stray = Envelope::new(
        &TraceContext::system(),
        RiskResultEvent {
            txn_id: crate::transfer::TxnId::new(),
            passed: true,
            reason: None,
        },
    );
    assert_eq!(
        h.runtime.continuation.on_risk_result(&stray).await.unwrap(),
        ContinuationOutcome::Discarded
    );
}

// ========================================================================
// Compensation sweeper
// ========================================================================

#[tokio::test]
async fn test_sweeper_times_out_stale_freeze() {
    let mut h = TestHarness::new().await;

    let resp = h.submit(internal("req-stale", 200)).await.unwrap();
    let request = h.next_risk_request();

    let early = h.runtime.sweeper.sweep_once().await.unwrap();
    assert_eq!(early.scanned, 0);

    let report = h
        .runtime
        .sweeper
        .sweep_at(Utc::now() + Duration::minutes(31))
        .await
        .unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.compensated, 1);
    assert_eq!(report.failed, 0);

    let order = h.runtime.service.order_by_txn(&resp.txn_id).await.unwrap();
    assert_eq!(order.status, TransferStatus::Failed);
    assert_eq!(order.failure_reason.as_deref(), Some(FREEZE_TIMEOUT_REASON));
    let payer = h.balance("888001").await;
    assert_eq!(payer.available(), dec(1000));
    assert_eq!(payer.frozen(), Decimal::ZERO);

    // the verdict arrives after compensation
    let late = h
        .runtime
        .continuation
        .on_risk_result(&verdict_for(&request, true))
        .await
        .unwrap();
    assert_eq!(late, ContinuationOutcome::Discarded);
    assert_eq!(h.balance("888001").await.available(), dec(1000));
    assert_eq!(h.balance("888002").await.balance(), Decimal::ZERO);
    h.assert_conserved();
}

#[tokio::test]
async fn test_sweeper_releases_orphan_freeze() {
    let h = TestHarness::new().await;

    let mut uow = h.store.begin().await.unwrap();
    h.runtime
        .ledger
        .freeze(
            uow.as_mut(),
            &LedgerRequest::new("orphan-7:HOLD", "orphan-7", "888001", mop(), dec(50)),
        )
        .await
        .unwrap();
    uow.commit().await.unwrap();
    assert_eq!(h.balance("888001").await.available(), dec(950));

    let later = Utc::now() + Duration::minutes(31);
    let report = h.runtime.sweeper.sweep_at(later).await.unwrap();
    assert_eq!(report.compensated, 1);
    let payer = h.balance("888001").await;
    assert_eq!(payer.available(), dec(1000));
    assert_eq!(payer.frozen(), Decimal::ZERO);

    let again = h.runtime.sweeper.sweep_at(later).await.unwrap();
    assert_eq!(again.scanned, 0);
    h.assert_conserved();
}

#[tokio::test]
async fn test_failing_freeze_does_not_starve_newer_ones() {
    let yaml = format!("{SAGA_YAML}sweeper:\n  batch_size: 1\n");
    let h = TestHarness::with_saga(&yaml, test_policy()).await;
    h.runtime.open_account("888003", &mop(), dec(50)).await.unwrap();

    let hold = |id: &str, account_no: &str| {
        LedgerRequest::new(format!("{id}:HOLD"), id, account_no, mop(), dec(50))
    };
    let mut uow = h.store.begin().await.unwrap();
    h.runtime
        .ledger
        .freeze(uow.as_mut(), &hold("orphan-bad", "888003"))
        .await
        .unwrap();
    uow.commit().await.unwrap();
    // row re-signed under another key, so every unfreeze on it fails
    h.store.put_balance(opened("888003", 50));

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let mut uow = h.store.begin().await.unwrap();
    h.runtime
        .ledger
        .freeze(uow.as_mut(), &hold("orphan-good", "888001"))
        .await
        .unwrap();
    uow.commit().await.unwrap();

    let later = Utc::now() + Duration::minutes(31);
    let first = h.runtime.sweeper.sweep_at(later).await.unwrap();
    assert_eq!(first.scanned, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(h.balance("888001").await.available(), dec(950));

    let second = h.runtime.sweeper.sweep_at(later).await.unwrap();
    assert_eq!(second.parked, 1);
    assert_eq!(second.compensated, 1);
    assert_eq!(second.failed, 0);
    let payer = h.balance("888001").await;
    assert_eq!(payer.available(), dec(1000));
    assert_eq!(payer.frozen(), Decimal::ZERO);

    // once the backoff lapses the bad hold is retried
    let retry = h
        .runtime
        .sweeper
        .sweep_at(later + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(retry.parked, 0);
    assert_eq!(retry.scanned, 1);
    assert_eq!(retry.failed, 1);
}

// ========================================================================
// Reversal
// ========================================================================

#[tokio::test]
async fn test_internal_reversal_claws_back_payee() {
    let mut h = TestHarness::new().await;

    let resp = h.submit(internal("req-rev", 200)).await.unwrap();
    h.answer(true).await;
    let order = h.runtime.service.order_by_txn(&resp.txn_id).await.unwrap();

    let reversed = h
        .runtime
        .service
        .reverse(
            ReversalRequest {
                order_id: order.id,
                reason: "duplicate payment".into(),
            },
            TraceContext::system(),
        )
        .await
        .unwrap();
    assert_eq!(reversed.status, TransferStatus::Reversed);
    assert_eq!(
        reversed.failure_reason.as_deref(),
        Some("reversal: duplicate payment")
    );
    assert_eq!(h.balance("888001").await.balance(), dec(1000));
    assert_eq!(h.balance("888002").await.balance(), Decimal::ZERO);
    h.assert_conserved();

    let err = h
        .runtime
        .service
        .reverse(
            ReversalRequest {
                order_id: order.id,
                reason: "again".into(),
            },
            TraceContext::system(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE_TRANSITION");
}

#[tokio::test]
async fn test_cross_border_reversal_recalls_and_refunds_fee() {
    let mut h = TestHarness::new().await;

    let resp = h.submit(cross_border("req-xb", 300)).await.unwrap();
    let request = h.next_risk_request();
    assert_eq!(request.payload.destination_country, "HK");
    let applied = h
        .runtime
        .continuation
        .on_risk_result(&verdict_for(&request, true))
        .await
        .unwrap();
    assert_eq!(applied, ContinuationOutcome::Applied(TransferStatus::Success));
    assert_eq!(h.balance("CLEARING-SWIFT").await.balance(), dec(280));
    assert_eq!(h.balance("FEE-INCOME").await.balance(), dec(20));

    let order = h.runtime.service.order_by_txn(&resp.txn_id).await.unwrap();
    assert_eq!(order.channel, TransferChannel::Swift);
    let reversed = h
        .runtime
        .service
        .reverse(
            ReversalRequest {
                order_id: order.id,
                reason: "beneficiary bank returned funds".into(),
            },
            TraceContext::system(),
        )
        .await
        .unwrap();

    assert_eq!(reversed.status, TransferStatus::Reversed);
    assert_eq!(h.gateway.dispatch_count(), 1);
    assert_eq!(h.gateway.recall_count(), 1);
    assert_eq!(h.balance("888001").await.balance(), dec(1000));
    assert_eq!(h.balance("CLEARING-SWIFT").await.balance(), Decimal::ZERO);
    assert_eq!(h.balance("FEE-INCOME").await.balance(), Decimal::ZERO);
    h.assert_conserved();
}

#[tokio::test]
async fn test_reversal_requires_settled_transfer() {
    let h = TestHarness::new().await;
    let resp = h.submit(internal("req-pending", 100)).await.unwrap();
    let order = h.runtime.service.order_by_txn(&resp.txn_id).await.unwrap();

    let err = h
        .runtime
        .service
        .reverse(
            ReversalRequest {
                order_id: order.id,
                reason: "too early".into(),
            },
            TraceContext::system(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE_TRANSITION");
    assert_eq!(h.balance("888001").await.frozen(), dec(100));
}

// ========================================================================
// Queries
// ========================================================================

#[tokio::test]
async fn test_shard_queries_partition_orders() {
    let h = TestHarness::new().await;
    for i in 0..3 {
        h.submit(internal(&format!("req-shard-{}", i), 100))
            .await
            .unwrap();
    }

    let pending = vec![TransferStatus::RiskPending];
    let even = h
        .runtime
        .service
        .orders_for_shard(0, 2, pending.clone(), 10)
        .await
        .unwrap();
    let odd = h
        .runtime
        .service
        .orders_for_shard(1, 2, pending.clone(), 10)
        .await
        .unwrap();
    assert_eq!(even.len() + odd.len(), 3);
    assert!(even.iter().all(|o| o.id % 2 == 0));
    assert!(odd.iter().all(|o| o.id % 2 == 1));

    let err = h
        .runtime
        .service
        .orders_for_shard(2, 2, pending, 10)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFIGURATION_ERROR");
}

#[tokio::test]
async fn test_lookups_for_unknown_ids() {
    let h = TestHarness::new().await;
    assert!(h.runtime.service.outcome_of("never-sent").await.unwrap().is_none());
    assert_eq!(
        h.runtime.service.get_order(42).await.unwrap_err().code(),
        "TRANSFER_NOT_FOUND"
    );
}
