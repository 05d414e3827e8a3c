//! Account records and chunk storage on top of a [`KeyValueStore`]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};
use upkeep_api::{AccountSalts, ChunkMap, is_valid_chunk_name};

use crate::{KeyValueStore, StoreError, StoreResult, WriteBatch};

/// Server-side account state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub username: String,
    pub email_address: Option<String>,
    pub auth_salt: String,
    /// Hex SHA-256 of the client's auth hash
    pub auth_digest: String,
    pub key_salt: String,
    pub key_version: u64,
    pub chunks_version: u64,
    /// Names of every chunk currently stored for this account
    #[serde(default)]
    pub chunk_names: BTreeSet<String>,
}

impl AccountRecord {
    /// Constant-shape comparison of a presented auth hash against the digest
    pub fn matches_auth_hash(&self, auth_hash: &str) -> bool {
        let presented = digest_auth_hash(auth_hash);
        presented.len() == self.auth_digest.len()
            && presented
                .bytes()
                .zip(self.auth_digest.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    pub fn salts(&self) -> AccountSalts {
        AccountSalts {
            auth_salt: self.auth_salt.clone(),
            key_salt: self.key_salt.clone(),
            key_version: self.key_version,
            chunks_version: self.chunks_version,
        }
    }
}

/// Input for provisioning an account
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub email_address: Option<String>,
    pub auth_salt: String,
    pub auth_hash: String,
    pub key_salt: String,
}

impl NewAccount {
    fn validate(&self) -> StoreResult<()> {
        if self.username.is_empty() {
            return Err(StoreError::InvalidAccount("Please enter a username.".into()));
        }
        if self.auth_hash.is_empty() {
            return Err(StoreError::InvalidAccount("Please enter a password.".into()));
        }
        let bad_email = self
            .email_address
            .as_deref()
            .is_some_and(|email| !email.contains('@') || !email.contains('.'));
        if bad_email {
            return Err(StoreError::InvalidAccount(
                "Please enter a valid email address.".into(),
            ));
        }
        Ok(())
    }
}

/// New credentials installed by a password change
#[derive(Debug, Clone)]
pub struct CredentialChange {
    pub auth_salt: String,
    pub auth_hash: String,
    pub key_salt: String,
}

/// Hex SHA-256 of an auth hash, as kept in [`AccountRecord::auth_digest`]
pub fn digest_auth_hash(auth_hash: &str) -> String {
    format!("{:x}", Sha256::digest(auth_hash.as_bytes()))
}

/// `:` never appears in a chunk name, so no chunk key can shadow this
fn account_key(username: &str) -> String {
    format!("account:{}", username)
}

fn chunk_key(name: &str, username: &str) -> String {
    format!("{}_{}", name, username)
}

/// Account and chunk access for upkeepd
///
/// Callers serialize mutations per account; each mutation is a single
/// atomic batch against the underlying store.
#[derive(Clone)]
pub struct AccountRepository {
    store: Arc<dyn KeyValueStore>,
}

impl AccountRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn is_healthy(&self) -> bool {
        self.store.is_healthy()
    }

    /// Provision an account. Not reachable through the protocol.
    pub fn create_account(&self, account: NewAccount) -> StoreResult<AccountRecord> {
        account.validate()?;
        if self.get_account(&account.username)?.is_some() {
            return Err(StoreError::AlreadyExists(account.username));
        }

        let record = AccountRecord {
            username: account.username,
            email_address: account.email_address,
            auth_salt: account.auth_salt,
            auth_digest: digest_auth_hash(&account.auth_hash),
            key_salt: account.key_salt,
            key_version: 0,
            chunks_version: 0,
            chunk_names: BTreeSet::new(),
        };

        let mut batch = WriteBatch::new();
        batch.put(account_key(&record.username), serde_json::to_string(&record)?);
        self.store.apply(batch)?;

        info!(username = %record.username, "Account created");
        Ok(record)
    }

    pub fn get_account(&self, username: &str) -> StoreResult<Option<AccountRecord>> {
        match self.store.get(&account_key(username))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn require_account(&self, username: &str) -> StoreResult<AccountRecord> {
        self.get_account(username)?
            .ok_or_else(|| StoreError::NotFound(format!("account {}", username)))
    }

    pub fn get_chunk(&self, username: &str, name: &str) -> StoreResult<Option<String>> {
        self.store.get(&chunk_key(name, username))
    }

    /// Read several chunks; missing ones come back as `None`
    pub fn get_chunks(&self, username: &str, names: &[String]) -> StoreResult<ChunkMap> {
        names
            .iter()
            .map(|name| Ok((name.clone(), self.get_chunk(username, name)?)))
            .collect()
    }

    /// Write or tombstone chunks as one version step. Returns the new
    /// `chunks_version`.
    pub fn write_chunks(&self, username: &str, chunks: &ChunkMap) -> StoreResult<u64> {
        let mut record = self.require_account(username)?;
        let mut batch = WriteBatch::new();

        stage_chunks(&mut record, chunks, &mut batch)?;
        record.chunks_version += 1;
        batch.put(account_key(username), serde_json::to_string(&record)?);
        self.store.apply(batch)?;

        debug!(
            username = %username,
            chunks = chunks.len(),
            chunks_version = record.chunks_version,
            "Chunks written"
        );
        Ok(record.chunks_version)
    }

    /// Install new credentials and replace every chunk in one step.
    ///
    /// Chunks not present in `chunks` are removed. Bumps `key_version` and
    /// `chunks_version` by one each.
    pub fn replace_credentials(
        &self,
        username: &str,
        change: CredentialChange,
        chunks: &ChunkMap,
    ) -> StoreResult<AccountRecord> {
        let mut record = self.require_account(username)?;
        let mut batch = WriteBatch::new();

        let stale: Vec<String> = record
            .chunk_names
            .iter()
            .filter(|name| !chunks.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            batch.delete(chunk_key(&name, username));
            record.chunk_names.remove(&name);
        }
        stage_chunks(&mut record, chunks, &mut batch)?;

        record.auth_salt = change.auth_salt;
        record.auth_digest = digest_auth_hash(&change.auth_hash);
        record.key_salt = change.key_salt;
        record.key_version += 1;
        record.chunks_version += 1;
        batch.put(account_key(username), serde_json::to_string(&record)?);
        self.store.apply(batch)?;

        info!(
            username = %username,
            key_version = record.key_version,
            "Credentials replaced"
        );
        Ok(record)
    }
}

fn stage_chunks(
    record: &mut AccountRecord,
    chunks: &ChunkMap,
    batch: &mut WriteBatch,
) -> StoreResult<()> {
    for (name, value) in chunks {
        if !is_valid_chunk_name(name) {
            return Err(StoreError::InvalidAccount(format!(
                "invalid chunk name '{}'",
                name
            )));
        }
        let key = chunk_key(name, &record.username);
        match value {
            Some(value) => {
                batch.put(key, value.clone());
                record.chunk_names.insert(name.clone());
            }
            None => {
                batch.delete(key);
                record.chunk_names.remove(name);
            }
        }
    }
    Ok(())
}
