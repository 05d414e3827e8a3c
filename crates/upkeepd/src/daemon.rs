//! Connection handling loop of upkeepd

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use upkeep_api::{API_VERSION, ErrorCode, ErrorInfo, Response};
use upkeep_ipc::{IpcError, IpcResult, IpcServer, ServerMessage};
use upkeep_util::ClientId;

use crate::{AccountService, ConnectionState};

type Connections = Arc<Mutex<HashMap<ClientId, Arc<Mutex<ConnectionState>>>>>;

/// A started IPC server wired to an [`AccountService`]
pub struct Daemon {
    accounts: Arc<AccountService>,
    ipc: Arc<IpcServer>,
    connections: Connections,
}

impl Daemon {
    /// Takes a server that has already been started
    pub fn new(accounts: Arc<AccountService>, ipc: IpcServer) -> Self {
        Self {
            accounts,
            ipc: Arc::new(ipc),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn accounts(&self) -> &Arc<AccountService> {
        &self.accounts
    }

    /// Serve until `shutdown` resolves, then refuse new writes and keep
    /// answering until every account queue has drained.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> IpcResult<()> {
        let Some(mut ipc_messages) = self.ipc.take_message_receiver().await else {
            return Err(IpcError::ServerError("message receiver already taken".into()));
        };

        let ipc_accept = self.ipc.clone();
        let accept = tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        info!("Service running");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(msg) = ipc_messages.recv() => self.handle_ipc_message(msg).await,
            }
        }

        info!("Shutting down upkeepd");
        self.accounts.begin_shutdown();
        let drain = self.accounts.shutdown();
        tokio::pin!(drain);
        loop {
            tokio::select! {
                _ = &mut drain => break,
                Some(msg) = ipc_messages.recv() => self.handle_ipc_message(msg).await,
            }
        }

        accept.abort();
        self.ipc.shutdown();
        info!("Shutdown complete");
        Ok(())
    }

    async fn handle_ipc_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                let conn = self
                    .connections
                    .lock()
                    .await
                    .entry(client_id.clone())
                    .or_default()
                    .clone();
                let accounts = self.accounts.clone();
                let ipc = self.ipc.clone();

                // One request at a time per connection; a slow account does
                // not hold up other connections
                tokio::spawn(async move {
                    let mut conn = conn.lock().await;
                    let response = if request.api_version != API_VERSION {
                        Response::error(
                            request.request_id,
                            ErrorInfo::new(
                                ErrorCode::InvalidRequest,
                                format!("Unsupported API version {}", request.api_version),
                            ),
                        )
                    } else {
                        match accounts.handle(&mut conn, request.command).await {
                            Ok(payload) => Response::success(request.request_id, payload),
                            Err(e) => Response::error(request.request_id, e),
                        }
                    };
                    if let Err(e) = ipc.send_response(&client_id, response).await {
                        debug!(client_id = %client_id, error = %e, "Client gone before response");
                    }
                });
            }

            ServerMessage::ClientConnected { client_id } => {
                self.connections
                    .lock()
                    .await
                    .insert(client_id, Arc::default());
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");
                self.connections.lock().await.remove(&client_id);
            }
        }
    }
}
