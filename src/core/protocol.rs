use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Core trait for connection handlers
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Serve one accepted connection until the peer hangs up
    async fn handle_connection(&self, client: TcpStream) -> Result<u64, ProtocolError>;

    /// Protocol name
    fn name(&self) -> &str;
}

/// Writes every received byte straight back to the peer
#[derive(Debug, Default)]
pub struct EchoProtocol;

#[async_trait]
impl Protocol for EchoProtocol {
    async fn handle_connection(&self, client: TcpStream) -> Result<u64, ProtocolError> {
        let (mut reader, mut writer) = client.into_split();
        let copied = tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|e| ProtocolError::Io(e.to_string()))?;
        writer
            .shutdown()
            .await
            .map_err(|e| ProtocolError::Io(e.to_string()))?;
        Ok(copied)
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Reads and drops everything the peer sends
#[derive(Debug, Default)]
pub struct DiscardProtocol;

#[async_trait]
impl Protocol for DiscardProtocol {
    async fn handle_connection(&self, mut client: TcpStream) -> Result<u64, ProtocolError> {
        let mut buf = [0u8; 4096];
        let mut total = 0u64;
        loop {
            let n = client
                .read(&mut buf)
                .await
                .map_err(|e| ProtocolError::Io(e.to_string()))?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
        }
    }

    fn name(&self) -> &str {
        "discard"
    }
}

/// Look up a built-in protocol by its configured name
pub fn protocol_by_name(name: &str) -> Result<Arc<dyn Protocol>, ProtocolError> {
    match name {
        "echo" => Ok(Arc::new(EchoProtocol)),
        "discard" => Ok(Arc::new(DiscardProtocol)),
        other => Err(ProtocolError::Unknown(other.to_string())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown protocol: {0}")]
    Unknown(String),
    #[error("Connection I/O failed: {0}")]
    Io(String),
}
