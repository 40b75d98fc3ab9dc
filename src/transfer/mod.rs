//! Transfer Saga
//!
//! Moves money between accounts through a persisted state machine:
//! freeze the payer's funds, wait for an asynchronous risk verdict, then
//! settle or release. Every step is idempotent and commits atomically with
//! the order status, so funds are never lost, duplicated or left frozen.
//!
//! # State Machine
//!
//! ```text
//! INIT → FROZEN → RISK_PENDING → SETTLING → SUCCESS → REVERSING → REVERSED
//!          │            │
//!          └────────────┴──→ UNFREEZING → FAILED
//! ```
//!
//! # Components
//!
//! - [`service::TransferService`]: submit path (guard, lease, validation, first transitions)
//! - [`executor::StateMachineExecutor`]: one transition = one unit of work
//! - [`strategy`]: per-type validation, pricing and transition table
//! - [`pipeline`]: one handler per phase
//! - [`continuation::RiskContinuation`]: resumes orders on risk verdicts
//! - [`sweeper::CompensationSweeper`]: releases holds that outlived the timeout
//! - [`audit`]: one record per transition attempt

pub mod adapters;
pub mod audit;
pub mod context;
pub mod continuation;
pub mod error;
pub mod events;
pub mod executor;
pub mod pipeline;
pub mod retry;
pub mod service;
pub mod state;
pub mod store;
pub mod strategy;
pub mod sweeper;
pub mod types;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
pub(crate) mod testkit;

pub use continuation::{ContinuationOutcome, RedeliveryPolicy, RiskContinuation};
pub use error::TransferError;
pub use executor::{DriveOutcome, StateMachineExecutor};
pub use retry::RetryPolicy;
pub use service::TransferService;
pub use state::TransferStatus;
pub use sweeper::{CompensationSweeper, SweepReport, SweeperConfig};
pub use types::{
    ReversalRequest, SubmitTransferRequest, SubmitTransferResponse, TraceContext, TransferOrder,
    TxnId,
};
