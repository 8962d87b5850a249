//! RPC client for talking to a running server.
//!
//! Holds one persistent connection. The handshake is sent on connect; calls
//! are sequential with increasing ids.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::protocol::{Request, Response};

/// Error returned by RPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to RPC server: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to parse response: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Server closed the connection")]
    Closed,

    #[error("Response id {received} does not match request id {expected}")]
    IdMismatch { expected: i64, received: i64 },

    #[error("RPC error: {0}")]
    Rpc(String),
}

/// RPC client over one authenticated connection.
pub struct RpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: i64,
}

impl RpcClient {
    /// Connect and present `secret` as the handshake line.
    pub async fn connect(addr: SocketAddr, secret: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(ClientError::Connect)?;
        let (reader, mut writer) = stream.into_split();

        writer.write_all(secret.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 1,
        })
    }

    /// Call a method and return its raw result.
    pub async fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        let response = self.send(&Request::new(id, method, params)).await?;
        if response.id != id {
            return Err(ClientError::IdMismatch {
                expected: id,
                received: response.id,
            });
        }
        match response.error {
            Some(message) => Err(ClientError::Rpc(message)),
            None => Ok(response.result),
        }
    }

    /// Call a method and deserialize its result.
    pub async fn call_as<T: DeserializeOwned>(
        &mut self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, ClientError> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(ClientError::Parse)
    }

    /// Send one request envelope as-is and read the next response line.
    pub async fn send(&mut self, request: &Request) -> Result<Response, ClientError> {
        let mut json = serde_json::to_string(request).map_err(ClientError::Serialize)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Closed);
        }
        serde_json::from_str(&line).map_err(ClientError::Parse)
    }
}
