//! In-memory account server for testing the client engine

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    AccountSalts, ChunkMap, Command, ErrorCode, ErrorInfo, ResponsePayload, Transport,
    TransportError, TransportResult,
};

/// Account state held by the mock
#[derive(Debug, Clone)]
pub struct MockAccount {
    pub username: String,
    pub auth_salt: String,
    pub auth_hash: String,
    pub key_salt: String,
    pub key_version: u64,
    pub chunks_version: u64,
    pub chunks: BTreeMap<String, String>,
}

impl MockAccount {
    pub fn new(username: impl Into<String>, auth_hash: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth_salt: "mock-auth-salt".into(),
            auth_hash: auth_hash.into(),
            key_salt: "mock-key-salt".into(),
            key_version: 0,
            chunks_version: 0,
            chunks: BTreeMap::new(),
        }
    }

    fn check_versions(
        &self,
        key_version: Option<u64>,
        chunks_version: Option<u64>,
    ) -> TransportResult<()> {
        let key_stale = key_version.is_some_and(|v| v != self.key_version);
        let chunks_stale = chunks_version.is_some_and(|v| v != self.chunks_version);
        if key_stale || chunks_stale {
            return Err(TransportError::Server(ErrorInfo::stale()));
        }
        Ok(())
    }

    fn apply_chunks(&mut self, chunks: ChunkMap) {
        for (name, value) in chunks {
            match value {
                Some(value) => {
                    self.chunks.insert(name, value);
                }
                None => {
                    self.chunks.remove(&name);
                }
            }
        }
        self.chunks_version += 1;
    }
}

/// Mock account server for unit/integration testing
///
/// Applies the same version checks as upkeepd and records every command it
/// receives, in arrival order.
pub struct MockServer {
    account: Mutex<MockAccount>,
    requests: Mutex<Vec<Command>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,

    /// Configure every call to fail as if the network were down
    pub fail_communication: Arc<Mutex<bool>>,

    /// Simulated round-trip time
    pub latency: Arc<Mutex<Duration>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::with_account(MockAccount::new("mock-user", "mock-auth-hash"))
    }

    pub fn with_account(account: MockAccount) -> Self {
        Self {
            account: Mutex::new(account),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_communication: Arc::new(Mutex::new(false)),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn set_fail_communication(&self, fail: bool) {
        *self.fail_communication.lock().unwrap() = fail;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Snapshot of the account
    pub fn account(&self) -> MockAccount {
        self.account.lock().unwrap().clone()
    }

    pub fn chunk(&self, name: &str) -> Option<String> {
        self.account.lock().unwrap().chunks.get(name).cloned()
    }

    pub fn chunks_version(&self) -> u64 {
        self.account.lock().unwrap().chunks_version
    }

    /// Pretend another device wrote to the account
    pub fn simulate_foreign_write(&self) {
        self.account.lock().unwrap().chunks_version += 1;
    }

    /// Every command received so far, in arrival order
    pub fn requests(&self) -> Vec<Command> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Highest number of calls ever observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn handle(&self, command: Command) -> TransportResult<ResponsePayload> {
        let mut account = self.account.lock().unwrap();

        match command {
            Command::GetAuthSalt { username } => {
                if username != account.username {
                    return Err(TransportError::server(ErrorCode::UnknownUser, "Unknown user"));
                }
                Ok(ResponsePayload::AuthSalt {
                    auth_salt: account.auth_salt.clone(),
                })
            }
            Command::LogIn {
                username,
                auth_hash,
            } => {
                if username != account.username {
                    return Err(TransportError::server(ErrorCode::UnknownUser, "Unknown user"));
                }
                if auth_hash != account.auth_hash {
                    return Err(TransportError::server(
                        ErrorCode::IncorrectPassword,
                        "Incorrect password",
                    ));
                }
                Ok(ResponsePayload::LoggedIn {
                    key_salt: account.key_salt.clone(),
                    key_version: account.key_version,
                })
            }
            Command::GetSalts => Ok(ResponsePayload::Salts(AccountSalts {
                auth_salt: account.auth_salt.clone(),
                key_salt: account.key_salt.clone(),
                key_version: account.key_version,
                chunks_version: account.chunks_version,
            })),
            Command::ValidateAuthHash {
                auth_hash,
                key_version,
                chunks_version,
            } => {
                if auth_hash != account.auth_hash {
                    return Err(TransportError::server(
                        ErrorCode::IncorrectPassword,
                        "Incorrect password",
                    ));
                }
                account.check_versions(key_version, chunks_version)?;
                Ok(ResponsePayload::Validated)
            }
            Command::ChangePassword {
                old_auth_hash,
                new_auth_salt,
                new_auth_hash,
                new_key_salt,
                key_version,
                chunks_version,
                chunks,
            } => {
                if old_auth_hash != account.auth_hash {
                    return Err(TransportError::server(
                        ErrorCode::IncorrectPassword,
                        "Incorrect password",
                    ));
                }
                account.check_versions(Some(key_version), Some(chunks_version))?;
                account.auth_salt = new_auth_salt;
                account.auth_hash = new_auth_hash;
                account.key_salt = new_key_salt;
                account.key_version += 1;
                account.chunks.clear();
                account.apply_chunks(chunks);
                Ok(ResponsePayload::PasswordChanged {
                    key_version: account.key_version,
                    chunks_version: account.chunks_version,
                })
            }
            Command::GetChunks {
                key_version,
                chunks_version,
                names,
            } => {
                account.check_versions(Some(key_version), chunks_version)?;
                let chunks = names
                    .into_iter()
                    .map(|name| {
                        let value = account.chunks.get(&name).cloned();
                        (name, value)
                    })
                    .collect();
                Ok(ResponsePayload::Chunks {
                    chunks,
                    chunks_version: account.chunks_version,
                })
            }
            Command::SetChunks {
                key_version,
                chunks_version,
                chunks,
            } => {
                account.check_versions(Some(key_version), Some(chunks_version))?;
                account.apply_chunks(chunks);
                Ok(ResponsePayload::ChunksSet {
                    chunks_version: account.chunks_version,
                })
            }
            Command::Ping => Ok(ResponsePayload::Pong),
        }
    }
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockServer {
    async fn call(&self, command: Command) -> TransportResult<ResponsePayload> {
        self.requests.lock().unwrap().push(command.clone());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fail = *self.fail_communication.lock().unwrap();
        let result = if fail {
            Err(TransportError::communication("mock network failure"))
        } else {
            self.handle(command)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_chunks(version: u64, name: &str, value: Option<&str>) -> Command {
        let mut chunks = ChunkMap::new();
        chunks.insert(name.to_string(), value.map(str::to_string));
        Command::SetChunks {
            key_version: 0,
            chunks_version: version,
            chunks,
        }
    }

    #[tokio::test]
    async fn set_chunks_bumps_version_once() {
        let server = MockServer::new();
        let payload = server.call(set_chunks(0, "plannerItems", Some("x"))).await.unwrap();
        assert!(matches!(payload, ResponsePayload::ChunksSet { chunks_version: 1 }));
        assert_eq!(server.chunk("plannerItems").as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn stale_write_is_rejected_without_mutation() {
        let server = MockServer::new();
        server.call(set_chunks(0, "plannerItems", Some("x"))).await.unwrap();

        let err = server
            .call(set_chunks(0, "plannerItems", Some("y")))
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(server.chunk("plannerItems").as_deref(), Some("x"));
        assert_eq!(server.chunks_version(), 1);
    }

    #[tokio::test]
    async fn tombstone_removes_chunk() {
        let server = MockServer::new();
        server.call(set_chunks(0, "oldCompletions.1", Some("x"))).await.unwrap();
        server.call(set_chunks(1, "oldCompletions.1", None)).await.unwrap();
        assert!(server.chunk("oldCompletions.1").is_none());
    }

    #[tokio::test]
    async fn communication_failure_is_reported() {
        let server = MockServer::new();
        server.set_fail_communication(true);
        let err = server.call(Command::Ping).await.unwrap_err();
        assert!(matches!(err, TransportError::Communication(_)));
        assert_eq!(server.request_count(), 1);
    }
}
