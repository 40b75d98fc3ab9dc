//! Transaction credential (payment password)
//!
//! The plaintext lives only inside [`TransactionCredential`], backed by
//! `Zeroizing` so every copy is wiped on drop. Hashes are Argon2id PHC
//! strings; verification runs on the blocking pool.

use std::fmt;

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, warn};
use zeroize::Zeroizing;

use super::CredentialVerifier;
use crate::transfer::error::TransferError;

#[derive(Clone)]
pub struct TransactionCredential {
    secret: Zeroizing<String>,
}

impl TransactionCredential {
    pub fn new(plaintext: String) -> Self {
        Self {
            secret: Zeroizing::new(plaintext),
        }
    }

    pub fn expose(&self) -> &[u8] {
        self.secret.as_bytes()
    }
}

impl From<&str> for TransactionCredential {
    fn from(plaintext: &str) -> Self {
        Self::new(plaintext.to_string())
    }
}

impl From<String> for TransactionCredential {
    fn from(plaintext: String) -> Self {
        Self::new(plaintext)
    }
}

impl<'de> Deserialize<'de> for TransactionCredential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl fmt::Debug for TransactionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransactionCredential(***)")
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialParams {
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

fn default_memory_kib() -> u32 {
    Params::DEFAULT_M_COST
}

fn default_iterations() -> u32 {
    Params::DEFAULT_T_COST
}

fn default_parallelism() -> u32 {
    Params::DEFAULT_P_COST
}

impl Default for CredentialParams {
    fn default() -> Self {
        Self {
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

pub struct Argon2Credentials {
    /// user id -> PHC hash string
    hashes: DashMap<String, String>,
    argon2: Argon2<'static>,
}

impl Argon2Credentials {
    pub fn new(params: CredentialParams) -> Result<Self, TransferError> {
        let params = Params::new(params.memory_kib, params.iterations, params.parallelism, None)
            .map_err(|e| TransferError::Configuration(format!("argon2 params: {}", e)))?;
        Ok(Self {
            hashes: DashMap::new(),
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hash and store a user's transaction password.
    pub fn enroll(&self, user_id: &str, plaintext: &str) -> Result<(), TransferError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| TransferError::Configuration(format!("Hashing failed: {}", e)))?
            .to_string();
        self.hashes.insert(user_id.to_string(), hash);
        Ok(())
    }

    /// Register an existing PHC hash (loaded from the credential store).
    pub fn insert_hash(&self, user_id: &str, phc: String) {
        self.hashes.insert(user_id.to_string(), phc);
    }
}

#[async_trait]
impl CredentialVerifier for Argon2Credentials {
    async fn verify(
        &self,
        user_id: &str,
        credential: &TransactionCredential,
    ) -> Result<(), TransferError> {
        let Some(stored) = self.hashes.get(user_id).map(|h| h.clone()) else {
            warn!(user_id, "No transaction credential enrolled");
            return Err(TransferError::InvalidCredential);
        };
        let argon2 = self.argon2.clone();
        let candidate = credential.clone();
        let owner = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&stored).map_err(|e| {
                warn!(user_id = %owner, error = %e, "Stored credential hash is malformed");
                TransferError::InvalidCredential
            })?;
            argon2
                .verify_password(candidate.expose(), &parsed)
                .map_err(|_| TransferError::InvalidCredential)
        })
        .await
        .map_err(|e| {
            error!(user_id, error = %e, "Credential check task failed");
            TransferError::DownstreamUnavailable("credential check aborted".into())
        })?
    }
}
