//! Collaborator Adapters
//!
//! Boundaries to systems the saga does not own: the account directory,
//! transaction credential store and the external payment network.

pub mod credential;
pub mod directory;
pub mod network;

pub use credential::{Argon2Credentials, CredentialParams, TransactionCredential};
pub use directory::{AccountSnapshot, AccountStatus, MemoryAccountDirectory};
pub use network::{HttpNetworkGateway, LoggingNetworkGateway};

use async_trait::async_trait;
use thiserror::Error;

use super::error::TransferError;
use super::types::{TraceContext, TransferOrder};

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn account(&self, account_no: &str) -> Result<Option<AccountSnapshot>, TransferError>;
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// `Err(InvalidCredential)` on mismatch or unknown user.
    async fn verify(
        &self,
        user_id: &str,
        credential: &TransactionCredential,
    ) -> Result<(), TransferError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Network unreachable: {0}")]
    Unavailable(String),

    #[error("Network rejected instruction: {0}")]
    Rejected(String),
}

impl From<GatewayError> for TransferError {
    fn from(e: GatewayError) -> Self {
        TransferError::DownstreamUnavailable(e.to_string())
    }
}

/// External payment network (clearing house, FPS, SWIFT/CIPS).
///
/// # Idempotency
/// Both calls are keyed by the order's txn id; resending the same
/// instruction must return the original reference.
#[async_trait]
pub trait NetworkGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Send a settled transfer; returns the network reference.
    async fn dispatch(
        &self,
        order: &TransferOrder,
        trace: &TraceContext,
    ) -> Result<String, GatewayError>;

    /// Ask the network to pull back a previously dispatched transfer.
    async fn recall(
        &self,
        order: &TransferOrder,
        reason: &str,
        trace: &TraceContext,
    ) -> Result<String, GatewayError>;
}

/// Mock gateway for testing
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio::sync::Notify;

    #[derive(Default)]
    pub struct MockNetworkGateway {
        dispatch_count: AtomicUsize,
        recall_count: AtomicUsize,
        fail_dispatch: AtomicBool,
        /// While set, `dispatch` and `recall` park until `open_dispatch`
        gated: AtomicBool,
        entered: Notify,
        gate: Notify,
    }

    impl MockNetworkGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail_dispatch(&self, fail: bool) {
            self.fail_dispatch.store(fail, Ordering::SeqCst);
        }

        /// Make the next dispatches hang like a slow network.
        pub fn gate_dispatch(&self) {
            self.gated.store(true, Ordering::SeqCst);
        }

        /// Resolves once a gated dispatch is in flight.
        pub async fn dispatch_in_flight(&self) {
            self.entered.notified().await;
        }

        pub fn open_dispatch(&self) {
            self.gated.store(false, Ordering::SeqCst);
            self.gate.notify_one();
        }

        pub fn dispatch_count(&self) -> usize {
            self.dispatch_count.load(Ordering::SeqCst)
        }

        pub fn recall_count(&self) -> usize {
            self.recall_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NetworkGateway for MockNetworkGateway {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn dispatch(
            &self,
            order: &TransferOrder,
            _trace: &TraceContext,
        ) -> Result<String, GatewayError> {
            self.dispatch_count.fetch_add(1, Ordering::SeqCst);
            if self.gated.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.gate.notified().await;
            }
            if self.fail_dispatch.load(Ordering::SeqCst) {
                return Err(GatewayError::Unavailable("mock dispatch failure".into()));
            }
            Ok(format!("NET-{}", order.txn_id))
        }

        async fn recall(
            &self,
            order: &TransferOrder,
            _reason: &str,
            _trace: &TraceContext,
        ) -> Result<String, GatewayError> {
            self.recall_count.fetch_add(1, Ordering::SeqCst);
            if self.gated.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.gate.notified().await;
            }
            Ok(format!("RCL-{}", order.txn_id))
        }
    }
}
