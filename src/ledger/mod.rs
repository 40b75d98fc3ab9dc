//! Balance Ledger
//!
//! Per (account, currency) balance rows with an available/frozen split,
//! optimistic versioning and an HMAC integrity code. Mutated only through
//! [`Ledger`] (freeze, unfreeze, debit, credit).

pub mod balance;
pub mod error;
pub mod freeze_log;
pub mod integrity;
pub mod protocol;

pub use balance::AccountBalance;
pub use error::LedgerError;
pub use freeze_log::{AccountFreezeLog, FreezeLogStatus};
pub use integrity::IntegritySigner;
pub use protocol::{Ledger, LedgerReceipt, LedgerRequest, LedgerTx};
