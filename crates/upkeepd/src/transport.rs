//! In-process transport straight into an [`AccountService`]

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use upkeep_api::{Command, ResponsePayload, Transport, TransportError, TransportResult};

use crate::{AccountService, ConnectionState};

/// Behaves like one IPC connection, without the socket
pub struct LocalTransport {
    service: Arc<AccountService>,
    conn: Mutex<ConnectionState>,
}

impl LocalTransport {
    pub fn new(service: Arc<AccountService>) -> Self {
        Self {
            service,
            conn: Mutex::new(ConnectionState::default()),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, command: Command) -> TransportResult<ResponsePayload> {
        let mut conn = self.conn.lock().await;
        self.service
            .handle(&mut conn, command)
            .await
            .map_err(TransportError::Server)
    }
}
