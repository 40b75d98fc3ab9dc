//! Account directory: who owns an account, whether it may move money,
//! and the owner's tier.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::AccountDirectory;
use crate::transfer::error::TransferError;
use crate::transfer::types::UserTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Frozen,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_no: String,
    pub account_name: String,
    pub user_id: String,
    pub status: AccountStatus,
    pub tier: UserTier,
}

impl AccountSnapshot {
    pub fn active(
        account_no: impl Into<String>,
        account_name: impl Into<String>,
        user_id: impl Into<String>,
        tier: UserTier,
    ) -> Self {
        Self {
            account_no: account_no.into(),
            account_name: account_name.into(),
            user_id: user_id.into(),
            status: AccountStatus::Active,
            tier,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

#[derive(Debug, Default)]
pub struct MemoryAccountDirectory {
    accounts: DashMap<String, AccountSnapshot>,
}

impl MemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, snapshot: AccountSnapshot) {
        self.accounts.insert(snapshot.account_no.clone(), snapshot);
    }

    pub fn set_status(&self, account_no: &str, status: AccountStatus) {
        if let Some(mut account) = self.accounts.get_mut(account_no) {
            account.status = status;
        }
    }
}

#[async_trait]
impl AccountDirectory for MemoryAccountDirectory {
    async fn account(&self, account_no: &str) -> Result<Option<AccountSnapshot>, TransferError> {
        Ok(self.accounts.get(account_no).map(|a| a.clone()))
    }
}
