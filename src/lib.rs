//! Transfer Saga - money-movement orchestration
//!
//! Takes a transfer request through freeze, asynchronous risk review and
//! settlement or rollback, guaranteeing funds are never lost, duplicated
//! or permanently stuck across restarts and message redelivery.
//!
//! # Modules
//!
//! - [`money`] - Decimal money and currency codes
//! - [`ledger`] - Balance rows, freeze log, CAS ledger protocol
//! - [`idempotency`] - Request-id guard with PROCESSING / SUCCESS TTLs
//! - [`subject_lock`] - Per-account advisory lease
//! - [`transfer`] - Orders, strategies, handler pipeline, executor, sweeper
//! - [`app`] - Composition root
//! - [`config`] / [`logging`] - Process plumbing

pub mod app;
pub mod config;
pub mod idempotency;
pub mod ledger;
pub mod logging;
#[cfg(feature = "mock-risk-engine")]
pub mod mock_risk;
pub mod money;
pub mod subject_lock;
pub mod transfer;

// Convenient re-exports at crate root
pub use app::{SagaDeps, SagaRuntime};
pub use ledger::{AccountBalance, Ledger, LedgerError};
pub use money::{CurrencyCode, Money, MoneyError};
pub use transfer::{TransferError, TransferService, TransferStatus};

/// Build identifier baked in by `build.rs`.
pub const GIT_HASH: &str = env!("GIT_HASH");
