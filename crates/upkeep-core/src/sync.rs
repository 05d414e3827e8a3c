//! Single-flight, strictly ordered request queue for one session
//!
//! Every request goes through one worker task draining an unbounded FIFO
//! channel, so requests reach the server in the order they were enqueued
//! and at most one is outstanding at a time. Versions are stamped when a
//! request is sent, not when it is enqueued, so queued writes see the
//! version produced by the write before them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use upkeep_api::{AccountSalts, ChunkMap, Command, ResponsePayload, Transport, TransportError};
use upkeep_util::MonotonicInstant;

use crate::{ChunkKey, CodecError, decrypt_chunk, encrypt_chunk};

/// Chunk name → plaintext JSON. `None` is a tombstone.
pub type PlainChunks = BTreeMap<String, Option<serde_json::Value>>;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// A save failed earlier; nothing more is sent until reload
    #[error("Your changes could not be saved. Please reload to continue.")]
    Faulted,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    #[error("The sync engine has stopped")]
    Closed,
}

impl SyncError {
    /// Whether the server rejected the request for carrying old versions
    pub fn is_stale(&self) -> bool {
        matches!(self, SyncError::Transport(e) if e.is_stale())
    }
}

/// Save indicator shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    Saving,
    Saved,
    Error,
}

impl SaveState {
    pub fn label(&self) -> &'static str {
        match self {
            SaveState::Idle => "",
            SaveState::Saving => "Saving...",
            SaveState::Saved => "Saved",
            SaveState::Error => "Error",
        }
    }
}

/// Request body before versions are stamped on
#[derive(Debug, Clone)]
pub enum SyncRequest {
    GetSalts,
    ValidateAuthHash {
        auth_hash: String,
    },
    GetChunks {
        names: Vec<String>,
    },
    SetChunks {
        chunks: ChunkMap,
    },
    ChangePassword {
        old_auth_hash: String,
        new_auth_salt: String,
        new_auth_hash: String,
        new_key_salt: String,
        chunks: ChunkMap,
    },
}

type Reply = oneshot::Sender<Result<ResponsePayload, SyncError>>;

struct Job {
    is_save: bool,
    request: SyncRequest,
    reply: Reply,
}

enum Message {
    Job(Job),
    /// Resolves once every earlier message has been handled
    Barrier(oneshot::Sender<()>),
}

/// Handle on the result of one dispatched request
#[must_use = "dropping a ticket does not cancel the request"]
pub struct SaveTicket {
    rx: oneshot::Receiver<Result<ResponsePayload, SyncError>>,
}

impl SaveTicket {
    fn resolved(result: Result<ResponsePayload, SyncError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Wait for the server's answer
    pub async fn wait(self) -> Result<ResponsePayload, SyncError> {
        self.rx.await.map_err(|_| SyncError::Closed)?
    }
}

#[derive(Debug)]
struct SyncState {
    key_version: u64,
    chunks_version: u64,
    faulted: bool,
    pending_saves: usize,
    last_save: Option<MonotonicInstant>,
}

struct Shared {
    state: Mutex<SyncState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stamp(&self, request: SyncRequest) -> Command {
        let state = self.state();
        match request {
            SyncRequest::GetSalts => Command::GetSalts,
            SyncRequest::ValidateAuthHash { auth_hash } => Command::ValidateAuthHash {
                auth_hash,
                key_version: Some(state.key_version),
                chunks_version: Some(state.chunks_version),
            },
            SyncRequest::GetChunks { names } => Command::GetChunks {
                key_version: state.key_version,
                chunks_version: Some(state.chunks_version),
                names,
            },
            SyncRequest::SetChunks { chunks } => Command::SetChunks {
                key_version: state.key_version,
                chunks_version: state.chunks_version,
                chunks,
            },
            SyncRequest::ChangePassword {
                old_auth_hash,
                new_auth_salt,
                new_auth_hash,
                new_key_salt,
                chunks,
            } => Command::ChangePassword {
                old_auth_hash,
                new_auth_salt,
                new_auth_hash,
                new_key_salt,
                key_version: state.key_version,
                chunks_version: state.chunks_version,
                chunks,
            },
        }
    }

    fn finish(&self, is_save: bool, result: &Result<ResponsePayload, SyncError>) {
        let mut state = self.state();
        if is_save {
            state.pending_saves = state.pending_saves.saturating_sub(1);
        }
        match result {
            Ok(payload) => {
                match payload {
                    ResponsePayload::Chunks { chunks_version, .. }
                    | ResponsePayload::ChunksSet { chunks_version } => {
                        state.chunks_version = *chunks_version;
                    }
                    ResponsePayload::PasswordChanged {
                        key_version,
                        chunks_version,
                    } => {
                        state.key_version = *key_version;
                        state.chunks_version = *chunks_version;
                    }
                    _ => {}
                }
                if is_save {
                    state.last_save = Some(MonotonicInstant::now());
                }
            }
            Err(SyncError::Faulted) => {}
            Err(e) => {
                if is_save && !state.faulted {
                    state.faulted = true;
                    warn!(error = %e, "Save failed, further writes are disabled");
                }
            }
        }
    }
}

async fn run_worker(
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let job = match message {
            Message::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
            Message::Job(job) => job,
        };

        let result = if shared.state().faulted {
            Err(SyncError::Faulted)
        } else {
            let command = shared.stamp(job.request);
            let name = command.name();
            debug!(command = name, is_save = job.is_save, "Sending request");
            transport.call(command).await.map_err(|e| {
                debug!(command = name, error = %e, "Request failed");
                SyncError::Transport(e)
            })
        };

        shared.finish(job.is_save, &result);
        let _ = job.reply.send(result);
    }
    debug!("Sync worker stopped");
}

/// Serializes all server traffic of one logged-in session
pub struct SyncEngine {
    jobs: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    key: ChunkKey,
    saved_indicator: Duration,
}

impl SyncEngine {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        key: ChunkKey,
        key_version: u64,
        chunks_version: u64,
        saved_indicator: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SyncState {
                key_version,
                chunks_version,
                faulted: false,
                pending_saves: 0,
                last_save: None,
            }),
        });
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(transport, shared.clone(), rx));

        info!(key_version, chunks_version, "Sync engine started");
        Self {
            jobs,
            shared,
            key,
            saved_indicator,
        }
    }

    /// Enqueue a request. Rejects at once when the fault latch is set.
    pub fn dispatch(&self, is_save: bool, request: SyncRequest) -> SaveTicket {
        {
            let mut state = self.shared.state();
            if state.faulted {
                return SaveTicket::resolved(Err(SyncError::Faulted));
            }
            if is_save {
                state.pending_saves += 1;
            }
        }

        let (reply, rx) = oneshot::channel();
        let job = Job {
            is_save,
            request,
            reply,
        };
        if let Err(mpsc::error::SendError(Message::Job(job))) = self.jobs.send(Message::Job(job)) {
            self.shared.finish(is_save, &Err(SyncError::Closed));
            let _ = job.reply.send(Err(SyncError::Closed));
        }
        SaveTicket { rx }
    }

    /// Encrypt `chunks` and enqueue them as one write
    pub fn set_chunks(&self, chunks: &PlainChunks) -> Result<SaveTicket, SyncError> {
        let chunks = encrypt_all(chunks, &self.key)?;
        Ok(self.dispatch(true, SyncRequest::SetChunks { chunks }))
    }

    /// Fetch and decrypt chunks. Missing chunks come back as `None`.
    pub async fn get_chunks(&self, names: Vec<String>) -> Result<PlainChunks, SyncError> {
        let payload = self
            .dispatch(false, SyncRequest::GetChunks { names })
            .wait()
            .await?;
        let ResponsePayload::Chunks { chunks, .. } = payload else {
            return Err(SyncError::UnexpectedResponse("get_chunks"));
        };

        chunks
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    Some(text) => Some(decrypt_chunk(&text, &self.key)?),
                    None => None,
                };
                Ok((name, value))
            })
            .collect()
    }

    pub async fn get_salts(&self) -> Result<AccountSalts, SyncError> {
        match self.dispatch(false, SyncRequest::GetSalts).wait().await? {
            ResponsePayload::Salts(salts) => Ok(salts),
            _ => Err(SyncError::UnexpectedResponse("get_salts")),
        }
    }

    pub async fn validate_auth_hash(&self, auth_hash: String) -> Result<(), SyncError> {
        match self
            .dispatch(false, SyncRequest::ValidateAuthHash { auth_hash })
            .wait()
            .await?
        {
            ResponsePayload::Validated => Ok(()),
            _ => Err(SyncError::UnexpectedResponse("validate_auth_hash")),
        }
    }

    /// Re-encrypt `chunks` under `new_key` and replace the account's
    /// credentials and chunks. Switches to `new_key` on success and returns
    /// the new key version.
    pub async fn change_password(
        &mut self,
        old_auth_hash: String,
        new_auth_salt: String,
        new_auth_hash: String,
        new_key_salt: String,
        new_key: ChunkKey,
        chunks: &PlainChunks,
    ) -> Result<u64, SyncError> {
        let chunks = encrypt_all(chunks, &new_key)?;
        let request = SyncRequest::ChangePassword {
            old_auth_hash,
            new_auth_salt,
            new_auth_hash,
            new_key_salt,
            chunks,
        };
        match self.dispatch(true, request).wait().await? {
            ResponsePayload::PasswordChanged { key_version, .. } => {
                self.key = new_key;
                info!(key_version, "Password changed");
                Ok(key_version)
            }
            _ => Err(SyncError::UnexpectedResponse("change_password")),
        }
    }

    /// Wait until everything enqueued so far has been handled
    pub async fn settled(&self) -> Result<(), SyncError> {
        let (done, rx) = oneshot::channel();
        self.jobs
            .send(Message::Barrier(done))
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?;
        if self.is_faulted() {
            return Err(SyncError::Faulted);
        }
        Ok(())
    }

    pub fn save_state(&self, now: MonotonicInstant) -> SaveState {
        let state = self.shared.state();
        if state.faulted {
            SaveState::Error
        } else if state.pending_saves > 0 {
            SaveState::Saving
        } else if state
            .last_save
            .is_some_and(|at| now.duration_since(at) < self.saved_indicator)
        {
            SaveState::Saved
        } else {
            SaveState::Idle
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.shared.state().faulted
    }

    pub fn chunks_version(&self) -> u64 {
        self.shared.state().chunks_version
    }

    pub fn key_version(&self) -> u64 {
        self.shared.state().key_version
    }

    pub fn key(&self) -> &ChunkKey {
        &self.key
    }
}

fn encrypt_all(chunks: &PlainChunks, key: &ChunkKey) -> Result<ChunkMap, SyncError> {
    chunks
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Some(value) => Some(encrypt_chunk(value, key)?),
                None => None,
            };
            Ok((name.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive_key;
    use serde_json::json;
    use upkeep_api::MockServer;

    fn engine(server: &Arc<MockServer>) -> SyncEngine {
        SyncEngine::new(
            server.clone(),
            derive_key("key-hash"),
            0,
            0,
            Duration::from_millis(1200),
        )
    }

    fn one(name: &str, value: serde_json::Value) -> PlainChunks {
        let mut chunks = PlainChunks::new();
        chunks.insert(name.to_string(), Some(value));
        chunks
    }

    #[tokio::test]
    async fn writes_are_applied_in_enqueue_order_one_at_a_time() {
        let server = Arc::new(MockServer::new());
        server.set_latency(Duration::from_millis(10));
        let engine = engine(&server);

        let tickets: Vec<_> = (0..5)
            .map(|i| engine.set_chunks(&one(&format!("chunk{}", i), json!(i))).unwrap())
            .collect();
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        assert_eq!(server.max_in_flight(), 1);
        assert_eq!(server.chunks_version(), 5);
        assert_eq!(engine.chunks_version(), 5);

        let order: Vec<u64> = server
            .requests()
            .into_iter()
            .map(|command| match command {
                Command::SetChunks { chunks_version, .. } => chunks_version,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);

        let names: Vec<String> = server
            .requests()
            .into_iter()
            .filter_map(|command| match command {
                Command::SetChunks { chunks, .. } => chunks.keys().next().cloned(),
                _ => None,
            })
            .collect();
        assert_eq!(names, ["chunk0", "chunk1", "chunk2", "chunk3", "chunk4"]);
    }

    #[tokio::test]
    async fn chunks_round_trip_through_server_encrypted() {
        let server = Arc::new(MockServer::new());
        let engine = engine(&server);

        let mut chunks = one("plannerItems", json!({"version": 1}));
        chunks.insert("oldCompletions.3".into(), None);
        engine.set_chunks(&chunks).unwrap().wait().await.unwrap();

        let stored = server.chunk("plannerItems").unwrap();
        assert!(!stored.contains("version"));

        let fetched = engine
            .get_chunks(vec!["plannerItems".into(), "oldCompletions.3".into()])
            .await
            .unwrap();
        assert_eq!(fetched["plannerItems"], Some(json!({"version": 1})));
        assert_eq!(fetched["oldCompletions.3"], None);
    }

    #[tokio::test]
    async fn failed_save_latches_fault() {
        let server = Arc::new(MockServer::new());
        let engine = engine(&server);

        server.set_fail_communication(true);
        let err = engine
            .set_chunks(&one("a", json!(1)))
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert!(engine.is_faulted());

        server.set_fail_communication(false);
        let before = server.request_count();
        let err = engine
            .set_chunks(&one("b", json!(2)))
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Faulted));
        assert!(engine.get_chunks(vec!["a".into()]).await.is_err());
        assert_eq!(server.request_count(), before);
        assert_eq!(engine.save_state(MonotonicInstant::now()), SaveState::Error);
    }

    #[tokio::test]
    async fn jobs_queued_behind_a_fault_never_reach_server() {
        let server = Arc::new(MockServer::new());
        server.set_latency(Duration::from_millis(20));
        server.set_fail_communication(true);
        let engine = engine(&server);

        let first = engine.set_chunks(&one("a", json!(1))).unwrap();
        let second = engine.set_chunks(&one("b", json!(2))).unwrap();

        assert!(matches!(first.wait().await, Err(SyncError::Transport(_))));
        assert!(matches!(second.wait().await, Err(SyncError::Faulted)));
        assert_eq!(server.request_count(), 1);
    }

    #[tokio::test]
    async fn failed_read_does_not_latch() {
        let server = Arc::new(MockServer::new());
        let engine = engine(&server);

        server.set_fail_communication(true);
        assert!(engine.get_chunks(vec!["a".into()]).await.is_err());
        assert!(!engine.is_faulted());

        server.set_fail_communication(false);
        engine.set_chunks(&one("a", json!(1))).unwrap().wait().await.unwrap();
    }

    #[tokio::test]
    async fn stale_write_is_rejected_and_latches() {
        let server = Arc::new(MockServer::new());
        let engine = engine(&server);

        server.simulate_foreign_write();
        let err = engine
            .set_chunks(&one("a", json!(1)))
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert!(server.chunk("a").is_none());
        assert!(matches!(engine.settled().await, Err(SyncError::Faulted)));
    }

    #[tokio::test]
    async fn save_indicator_progression() {
        let server = Arc::new(MockServer::new());
        server.set_latency(Duration::from_millis(30));
        let engine = engine(&server);
        assert_eq!(engine.save_state(MonotonicInstant::now()), SaveState::Idle);

        let ticket = engine.set_chunks(&one("a", json!(1))).unwrap();
        assert_eq!(engine.save_state(MonotonicInstant::now()), SaveState::Saving);

        ticket.wait().await.unwrap();
        engine.settled().await.unwrap();
        let now = MonotonicInstant::now();
        assert_eq!(engine.save_state(now), SaveState::Saved);
        assert_eq!(
            engine.save_state(now + Duration::from_secs(2)),
            SaveState::Idle
        );
    }

    #[tokio::test]
    async fn reads_do_not_show_saving() {
        let server = Arc::new(MockServer::new());
        server.set_latency(Duration::from_millis(30));
        let engine = engine(&server);

        let ticket = engine.dispatch(false, SyncRequest::GetSalts);
        assert_eq!(engine.save_state(MonotonicInstant::now()), SaveState::Idle);
        ticket.wait().await.unwrap();
    }
}
