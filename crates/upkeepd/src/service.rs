//! Request handling for upkeepd

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use upkeep_api::{ChunkMap, Command, ErrorCode, ErrorInfo, ResponsePayload, is_valid_chunk_name};
use upkeep_store::{AccountRecord, AccountRepository, CredentialChange, StoreError};

use crate::AccountQueue;

type ServiceResult<T> = Result<T, ErrorInfo>;

/// Per-connection state: which account `log_in` bound it to
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    username: Option<String>,
}

impl ConnectionState {
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn require_login(&self) -> ServiceResult<&str> {
        self.username().ok_or_else(|| {
            ErrorInfo::new(
                ErrorCode::NotLoggedIn,
                "You are not currently logged in. Please log in to view your tasks.",
            )
        })
    }
}

/// Account server logic, shared by every connection
pub struct AccountService {
    accounts: AccountRepository,
    queue: Arc<AccountQueue>,
    shutting_down: AtomicBool,
}

impl AccountService {
    pub fn new(accounts: AccountRepository, job_timeout: Duration) -> Self {
        Self {
            accounts,
            queue: Arc::new(AccountQueue::new(job_timeout)),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn accounts(&self) -> &AccountRepository {
        &self.accounts
    }

    pub fn queue(&self) -> &AccountQueue {
        &self.queue
    }

    /// Refuse new mutations from now on
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!(in_flight = self.queue.in_flight(), "Refusing new writes");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Begin shutdown and wait for every account queue to drain
    pub async fn shutdown(&self) {
        self.begin_shutdown();
        self.queue.drained().await;
        info!("Account queues drained");
    }

    /// Handle one command for a connection
    pub async fn handle(
        &self,
        conn: &mut ConnectionState,
        command: Command,
    ) -> ServiceResult<ResponsePayload> {
        let name = command.name();
        debug!(command = name, username = ?conn.username(), "Handling command");

        match command {
            Command::GetAuthSalt { username } => {
                let record = self.find_account(&username)?;
                Ok(ResponsePayload::AuthSalt {
                    auth_salt: record.auth_salt,
                })
            }

            Command::LogIn {
                username,
                auth_hash,
            } => {
                let record = self.find_account(&username)?;
                if !record.matches_auth_hash(&auth_hash) {
                    info!(username = %username, "Rejected login");
                    return Err(incorrect_password());
                }
                info!(username = %username, key_version = record.key_version, "Logged in");
                conn.username = Some(username);
                Ok(ResponsePayload::LoggedIn {
                    key_salt: record.key_salt,
                    key_version: record.key_version,
                })
            }

            Command::GetSalts => {
                let record = self.current_account(conn)?;
                Ok(ResponsePayload::Salts(record.salts()))
            }

            Command::ValidateAuthHash {
                auth_hash,
                key_version,
                chunks_version,
            } => {
                let record = self.current_account(conn)?;
                if !record.matches_auth_hash(&auth_hash) {
                    return Err(incorrect_password());
                }
                check_versions(&record, key_version, chunks_version)?;
                Ok(ResponsePayload::Validated)
            }

            Command::GetChunks {
                key_version,
                chunks_version,
                names,
            } => {
                let record = self.current_account(conn)?;
                check_versions(&record, Some(key_version), chunks_version)?;
                if let Some(bad) = names.iter().find(|name| !is_valid_chunk_name(name)) {
                    return Err(invalid_chunk_name(bad));
                }
                let chunks = self
                    .accounts
                    .get_chunks(&record.username, &names)
                    .map_err(internal_error)?;
                Ok(ResponsePayload::Chunks {
                    chunks,
                    chunks_version: record.chunks_version,
                })
            }

            Command::SetChunks {
                key_version,
                chunks_version,
                chunks,
            } => {
                let username = conn.require_login()?.to_string();
                let admission = self.queue.enter();
                self.refuse_if_shutting_down()?;
                validate_chunk_names(&chunks)?;

                let accounts = self.accounts.clone();
                let job_user = username.clone();
                let new_version = admission
                    .run(&username, name, move || {
                        let record = accounts.require_account(&job_user).map_err(internal_error)?;
                        check_versions(&record, Some(key_version), Some(chunks_version))?;
                        accounts
                            .write_chunks(&job_user, &chunks)
                            .map_err(internal_error)
                    })
                    .await
                    .map_err(job_failed)??;
                Ok(ResponsePayload::ChunksSet {
                    chunks_version: new_version,
                })
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
                let username = conn.require_login()?.to_string();
                let admission = self.queue.enter();
                self.refuse_if_shutting_down()?;
                validate_chunk_names(&chunks)?;

                let accounts = self.accounts.clone();
                let job_user = username.clone();
                let record = admission
                    .run(&username, name, move || {
                        let record = accounts.require_account(&job_user).map_err(internal_error)?;
                        if !record.matches_auth_hash(&old_auth_hash) {
                            return Err(incorrect_password());
                        }
                        check_versions(&record, Some(key_version), Some(chunks_version))?;
                        let change = CredentialChange {
                            auth_salt: new_auth_salt,
                            auth_hash: new_auth_hash,
                            key_salt: new_key_salt,
                        };
                        accounts
                            .replace_credentials(&job_user, change, &chunks)
                            .map_err(internal_error)
                    })
                    .await
                    .map_err(job_failed)??;
                Ok(ResponsePayload::PasswordChanged {
                    key_version: record.key_version,
                    chunks_version: record.chunks_version,
                })
            }

            Command::Ping => Ok(ResponsePayload::Pong),
        }
    }

    fn find_account(&self, username: &str) -> ServiceResult<AccountRecord> {
        self.accounts
            .get_account(username)
            .map_err(internal_error)?
            .ok_or_else(|| ErrorInfo::new(ErrorCode::UnknownUser, "Unknown user"))
    }

    fn current_account(&self, conn: &ConnectionState) -> ServiceResult<AccountRecord> {
        let username = conn.require_login()?;
        self.accounts
            .require_account(username)
            .map_err(internal_error)
    }

    fn refuse_if_shutting_down(&self) -> ServiceResult<()> {
        if self.is_shutting_down() {
            return Err(ErrorInfo::new(
                ErrorCode::ShuttingDown,
                "The server is shutting down. Please try again later.",
            ));
        }
        Ok(())
    }
}

/// `None` skips the check for that version
fn check_versions(
    record: &AccountRecord,
    key_version: Option<u64>,
    chunks_version: Option<u64>,
) -> ServiceResult<()> {
    let key_stale = key_version.is_some_and(|v| v != record.key_version);
    let chunks_stale = chunks_version.is_some_and(|v| v != record.chunks_version);
    if key_stale || chunks_stale {
        warn!(
            username = %record.username,
            key_version = ?key_version,
            current_key_version = record.key_version,
            chunks_version = ?chunks_version,
            current_chunks_version = record.chunks_version,
            "Rejected stale request"
        );
        return Err(ErrorInfo::stale());
    }
    Ok(())
}

fn validate_chunk_names(chunks: &ChunkMap) -> ServiceResult<()> {
    match chunks.keys().find(|name| !is_valid_chunk_name(name)) {
        Some(bad) => Err(invalid_chunk_name(bad)),
        None => Ok(()),
    }
}

fn invalid_chunk_name(name: &str) -> ErrorInfo {
    ErrorInfo::new(
        ErrorCode::InvalidRequest,
        format!("Invalid chunk name '{}'", name),
    )
}

fn incorrect_password() -> ErrorInfo {
    ErrorInfo::new(ErrorCode::IncorrectPassword, "Incorrect password")
}

fn internal_error(e: StoreError) -> ErrorInfo {
    match e {
        StoreError::InvalidAccount(msg) => ErrorInfo::new(ErrorCode::InvalidRequest, msg),
        StoreError::NotFound(_) => ErrorInfo::new(ErrorCode::UnknownUser, "Unknown user"),
        e => {
            error!(error = %e, "Store failure");
            ErrorInfo::new(ErrorCode::InternalError, "Internal server error")
        }
    }
}

fn job_failed(e: tokio::task::JoinError) -> ErrorInfo {
    error!(error = %e, "Account job failed");
    ErrorInfo::new(ErrorCode::InternalError, "Internal server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use upkeep_store::{NewAccount, SqliteStore};

    fn service() -> AccountService {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let accounts = AccountRepository::new(store);
        accounts
            .create_account(NewAccount {
                username: "alice".into(),
                email_address: None,
                auth_salt: "auth-salt".into(),
                auth_hash: "auth-hash".into(),
                key_salt: "key-salt".into(),
            })
            .unwrap();
        AccountService::new(accounts, Duration::from_secs(30))
    }

    async fn logged_in(service: &AccountService) -> ConnectionState {
        let mut conn = ConnectionState::default();
        service
            .handle(
                &mut conn,
                Command::LogIn {
                    username: "alice".into(),
                    auth_hash: "auth-hash".into(),
                },
            )
            .await
            .unwrap();
        conn
    }

    fn set(name: &str, value: Option<&str>, chunks_version: u64) -> Command {
        let mut chunks = ChunkMap::new();
        chunks.insert(name.to_string(), value.map(str::to_string));
        Command::SetChunks {
            key_version: 0,
            chunks_version,
            chunks,
        }
    }

    #[tokio::test]
    async fn login_flow() {
        let service = service();
        let mut conn = ConnectionState::default();

        let err = service.handle(&mut conn, Command::GetSalts).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotLoggedIn);

        let err = service
            .handle(
                &mut conn,
                Command::GetAuthSalt {
                    username: "bob".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownUser);

        let err = service
            .handle(
                &mut conn,
                Command::LogIn {
                    username: "alice".into(),
                    auth_hash: "wrong".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::IncorrectPassword);
        assert!(conn.username().is_none());

        let conn = logged_in(&service).await;
        assert_eq!(conn.username(), Some("alice"));
    }

    #[tokio::test]
    async fn writes_bump_version_and_reject_stale() {
        let service = service();
        let mut conn = logged_in(&service).await;

        let payload = service
            .handle(&mut conn, set("plannerItems", Some("cipher"), 0))
            .await
            .unwrap();
        assert!(matches!(
            payload,
            ResponsePayload::ChunksSet { chunks_version: 1 }
        ));

        let err = service
            .handle(&mut conn, set("plannerItems", Some("other"), 0))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::StaleData);
        assert_eq!(
            service.accounts().get_chunk("alice", "plannerItems").unwrap(),
            Some("cipher".to_string())
        );

        let payload = service
            .handle(
                &mut conn,
                Command::GetChunks {
                    key_version: 0,
                    chunks_version: None,
                    names: vec!["plannerItems".into(), "recentCompletions".into()],
                },
            )
            .await
            .unwrap();
        match payload {
            ResponsePayload::Chunks {
                chunks,
                chunks_version,
            } => {
                assert_eq!(chunks_version, 1);
                assert_eq!(chunks["plannerItems"], Some("cipher".to_string()));
                assert_eq!(chunks["recentCompletions"], None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_chunk_names_are_rejected() {
        let service = service();
        let mut conn = logged_in(&service).await;

        let err = service
            .handle(&mut conn, set("bad_name", Some("x"), 0))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert_eq!(service.accounts().require_account("alice").unwrap().chunks_version, 0);
    }

    #[tokio::test]
    async fn change_password_replaces_credentials() {
        let service = service();
        let mut conn = logged_in(&service).await;
        service
            .handle(&mut conn, set("oldCompletions.1", Some("old"), 0))
            .await
            .unwrap();

        let mut chunks = ChunkMap::new();
        chunks.insert("plannerItems".into(), Some("rekeyed".into()));
        let change = |old: &str| Command::ChangePassword {
            old_auth_hash: old.into(),
            new_auth_salt: "new-auth-salt".into(),
            new_auth_hash: "new-auth-hash".into(),
            new_key_salt: "new-key-salt".into(),
            key_version: 0,
            chunks_version: 1,
            chunks: chunks.clone(),
        };

        let err = service.handle(&mut conn, change("wrong")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::IncorrectPassword);

        let payload = service.handle(&mut conn, change("auth-hash")).await.unwrap();
        assert!(matches!(
            payload,
            ResponsePayload::PasswordChanged {
                key_version: 1,
                chunks_version: 2
            }
        ));
        assert_eq!(
            service.accounts().get_chunk("alice", "oldCompletions.1").unwrap(),
            None
        );

        let mut fresh = ConnectionState::default();
        let err = service
            .handle(
                &mut fresh,
                Command::LogIn {
                    username: "alice".into(),
                    auth_hash: "auth-hash".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::IncorrectPassword);
    }

    #[tokio::test]
    async fn shutdown_refuses_writes_but_serves_reads() {
        let service = service();
        let mut conn = logged_in(&service).await;

        service.shutdown().await;
        let err = service
            .handle(&mut conn, set("plannerItems", Some("x"), 0))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ShuttingDown);
        assert_eq!(service.queue().in_flight(), 0);

        assert!(service.handle(&mut conn, Command::GetSalts).await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_waits_for_an_admitted_write() {
        let service = Arc::new(service());
        let admission = service.queue().enter();

        let stopping = {
            let service = service.clone();
            tokio::spawn(async move { service.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(service.is_shutting_down());
        assert!(!stopping.is_finished());

        drop(admission);
        tokio::time::timeout(Duration::from_secs(1), stopping)
            .await
            .unwrap()
            .unwrap();
    }
}
