//! Password hashing and the locally saved credential bundle

use aes_gcm::aead::{OsRng, rand_core::RngCore};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use upkeep_api::{Command, ResponsePayload, Transport, TransportError};

use crate::{CoreError, CoreResult};

/// PBKDF2-HMAC-SHA256 rounds for password hashes
pub const PBKDF2_ROUNDS: u32 = 100_000;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Fresh random salt, base64
pub fn generate_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    STANDARD.encode(salt)
}

/// Hash a password with a salt. Used both for the auth hash sent to the
/// server and for the key hash that never leaves the client.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), PBKDF2_ROUNDS, &mut out);
    STANDARD.encode(out)
}

/// What a logged-in client keeps between runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub username: String,
    /// Re-binds a new connection to the account
    pub auth_hash: String,
    /// Source of the chunk key
    pub key_hash: String,
    pub key_version: u64,
}

pub trait CredentialStore: Send + Sync {
    fn save(&self, bundle: &CredentialBundle) -> CoreResult<()>;
    fn load(&self) -> CoreResult<Option<CredentialBundle>>;
    fn clear(&self) -> CoreResult<()>;
}

/// JSON file in the client data directory
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn save(&self, bundle: &CredentialBundle) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Credentials(e.to_string()))?;
        }
        let payload = serde_json::to_string_pretty(bundle)
            .map_err(|e| CoreError::Credentials(e.to_string()))?;
        std::fs::write(&self.path, payload).map_err(|e| CoreError::Credentials(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CoreError::Credentials(e.to_string()))?;
        }

        debug!(path = %self.path.display(), "Credentials saved");
        Ok(())
    }

    fn load(&self) -> CoreResult<Option<CredentialBundle>> {
        let payload = match std::fs::read_to_string(&self.path) {
            Ok(payload) => payload,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::Credentials(e.to_string())),
        };
        let bundle = serde_json::from_str(&payload)
            .map_err(|e| CoreError::Credentials(e.to_string()))?;
        Ok(Some(bundle))
    }

    fn clear(&self) -> CoreResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Credentials(e.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    bundle: Mutex<Option<CredentialBundle>>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn save(&self, bundle: &CredentialBundle) -> CoreResult<()> {
        let mut guard = self
            .bundle
            .lock()
            .map_err(|e| CoreError::Credentials(format!("in-memory lock poisoned: {e}")))?;
        *guard = Some(bundle.clone());
        Ok(())
    }

    fn load(&self) -> CoreResult<Option<CredentialBundle>> {
        let guard = self
            .bundle
            .lock()
            .map_err(|e| CoreError::Credentials(format!("in-memory lock poisoned: {e}")))?;
        Ok(guard.clone())
    }

    fn clear(&self) -> CoreResult<()> {
        let mut guard = self
            .bundle
            .lock()
            .map_err(|e| CoreError::Credentials(format!("in-memory lock poisoned: {e}")))?;
        *guard = None;
        Ok(())
    }
}

/// Log in over `transport` and save the resulting bundle.
///
/// The connection behind `transport` is bound to the account afterwards.
pub async fn log_in(
    transport: &dyn Transport,
    store: &dyn CredentialStore,
    username: &str,
    password: &str,
) -> CoreResult<CredentialBundle> {
    if username.is_empty() {
        return Err(CoreError::validation("Please enter a username."));
    }
    if password.is_empty() {
        return Err(CoreError::validation("Please enter a password."));
    }

    let auth_salt = match transport
        .call(Command::GetAuthSalt {
            username: username.to_string(),
        })
        .await
        .map_err(crate::SyncError::from)?
    {
        ResponsePayload::AuthSalt { auth_salt } => auth_salt,
        _ => return Err(unexpected("get_auth_salt")),
    };

    let auth_hash = hash_password(password, &auth_salt);
    let (key_salt, key_version) = match transport
        .call(Command::LogIn {
            username: username.to_string(),
            auth_hash: auth_hash.clone(),
        })
        .await
        .map_err(crate::SyncError::from)?
    {
        ResponsePayload::LoggedIn {
            key_salt,
            key_version,
        } => (key_salt, key_version),
        _ => return Err(unexpected("log_in")),
    };

    let bundle = CredentialBundle {
        username: username.to_string(),
        auth_hash,
        key_hash: hash_password(password, &key_salt),
        key_version,
    };
    store.save(&bundle)?;
    debug!(username = %username, key_version, "Logged in");
    Ok(bundle)
}

/// Re-bind a fresh connection using a saved bundle
pub async fn resume(transport: &dyn Transport, bundle: &CredentialBundle) -> CoreResult<()> {
    match transport
        .call(Command::LogIn {
            username: bundle.username.clone(),
            auth_hash: bundle.auth_hash.clone(),
        })
        .await
        .map_err(crate::SyncError::from)?
    {
        ResponsePayload::LoggedIn { key_version, .. } if key_version != bundle.key_version => {
            Err(CoreError::KeyVersionMismatch {
                saved: bundle.key_version,
                current: key_version,
            })
        }
        ResponsePayload::LoggedIn { .. } => Ok(()),
        _ => Err(unexpected("log_in")),
    }
}

fn unexpected(command: &'static str) -> CoreError {
    CoreError::Sync(TransportError::UnexpectedResponse { command }.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use upkeep_api::{ErrorCode, MockAccount, MockServer};

    fn bundle() -> CredentialBundle {
        CredentialBundle {
            username: "alice".into(),
            auth_hash: "auth".into(),
            key_hash: "key".into(),
            key_version: 2,
        }
    }

    #[test]
    fn hashing_is_salted_and_deterministic() {
        let a = hash_password("hunter2", "salt-a");
        assert_eq!(a, hash_password("hunter2", "salt-a"));
        assert_ne!(a, hash_password("hunter2", "salt-b"));
        assert_ne!(generate_salt(), generate_salt());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("client").join("credentials.json"));

        assert!(store.load().unwrap().is_none());
        store.save(&bundle()).unwrap();
        assert_eq!(store.load().unwrap(), Some(bundle()));
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn memory_store_round_trip() {
        let store = InMemoryCredentialStore::default();
        store.save(&bundle()).unwrap();
        assert_eq!(store.load().unwrap(), Some(bundle()));
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn log_in_saves_bundle() {
        let auth_hash = hash_password("hunter2", "mock-auth-salt");
        let server = MockServer::with_account(MockAccount::new("alice", auth_hash.clone()));
        let store = InMemoryCredentialStore::default();

        let bundle = log_in(&server, &store, "alice", "hunter2").await.unwrap();
        assert_eq!(bundle.auth_hash, auth_hash);
        assert_eq!(bundle.key_hash, hash_password("hunter2", "mock-key-salt"));
        assert_eq!(store.load().unwrap(), Some(bundle.clone()));

        resume(&server, &bundle).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_password_saves_nothing() {
        let server = MockServer::with_account(MockAccount::new("alice", "other"));
        let store = InMemoryCredentialStore::default();

        let err = log_in(&server, &store, "alice", "hunter2").await.unwrap_err();
        match err {
            CoreError::Sync(crate::SyncError::Transport(e)) => {
                assert_eq!(e.code(), Some(ErrorCode::IncorrectPassword));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn resume_detects_password_change_elsewhere() {
        let server = MockServer::with_account(MockAccount::new("alice", "auth"));
        let err = resume(&server, &bundle()).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::KeyVersionMismatch { saved: 2, current: 0 }
        ));
    }
}
