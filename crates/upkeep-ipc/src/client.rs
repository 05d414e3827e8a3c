//! IPC client implementation

use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use upkeep_api::{
    Command, Request, Response, ResponsePayload, Transport, TransportError, TransportResult,
};

use crate::{IpcError, IpcResult};

/// Connection to upkeepd
///
/// Holds one request in flight at a time; concurrent callers queue on the
/// connection lock.
pub struct IpcClient {
    conn: Mutex<Connection>,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_request_id: u64,
}

impl IpcClient {
    /// Connect to upkeepd
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            conn: Mutex::new(Connection {
                reader: BufReader::new(read_half),
                writer: write_half,
                next_request_id: 1,
            }),
        })
    }

    /// Send a command and wait for response
    pub async fn send(&self, command: Command) -> IpcResult<Response> {
        let mut conn = self.conn.lock().await;
        let request_id = conn.next_request_id;
        conn.next_request_id += 1;

        let request = Request::new(request_id, command);
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        conn.writer.write_all(json.as_bytes()).await?;

        let mut line = String::new();
        let n = conn.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(IpcError::ConnectionClosed);
        }

        let response: Response = serde_json::from_str(line.trim())?;
        if response.request_id != request_id {
            return Err(IpcError::InvalidMessage(format!(
                "response to request {} while waiting for {}",
                response.request_id, request_id
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl Transport for IpcClient {
    async fn call(&self, command: Command) -> TransportResult<ResponsePayload> {
        let response = self
            .send(command)
            .await
            .map_err(|e| TransportError::communication(e.to_string()))?;
        response.into_result().map_err(TransportError::Server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IpcServer, ServerMessage};
    use tempfile::tempdir;
    use upkeep_api::{ErrorCode, ErrorInfo};

    /// Answers pings and rejects everything else
    async fn serve(server: std::sync::Arc<IpcServer>) {
        let mut messages = server.take_message_receiver().await.unwrap();
        let accept = server.clone();
        tokio::spawn(async move {
            let _ = accept.run().await;
        });
        while let Some(message) = messages.recv().await {
            if let ServerMessage::Request { client_id, request } = message {
                let response = match request.command {
                    Command::Ping => Response::success(request.request_id, ResponsePayload::Pong),
                    _ => Response::error(
                        request.request_id,
                        ErrorInfo::new(ErrorCode::NotLoggedIn, "not logged in"),
                    ),
                };
                let _ = server.send_response(&client_id, response).await;
            }
        }
    }

    #[tokio::test]
    async fn round_trip_over_socket() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("upkeepd.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();
        tokio::spawn(serve(std::sync::Arc::new(server)));

        let client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(matches!(
            client.call(Command::Ping).await,
            Ok(ResponsePayload::Pong)
        ));

        let err = client.call(Command::GetSalts).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotLoggedIn));
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails() {
        let dir = tempdir().unwrap();
        let result = IpcClient::connect(dir.path().join("absent.sock")).await;
        assert!(matches!(result, Err(IpcError::Io(_))));
    }
}
