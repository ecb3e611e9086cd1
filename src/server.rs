use crate::config::Config;
use crate::core::tcp::{TcpConnection, TcpListener, TcpTransport};
use crate::core::{
    protocol_by_name, CancelSignal, HeartbeatListener, ListenerError, Protocol, ProtocolError,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct AcceptServer {
    config: Arc<Config>,
    protocol: Arc<dyn Protocol>,
}

impl AcceptServer {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let protocol = protocol_by_name(&config.server.protocol)?;
        info!("Serving protocol '{}'", protocol.name());

        Ok(Self {
            config: Arc::new(config),
            protocol,
        })
    }

    /// Open the configured listener
    pub async fn bind(&self) -> Result<HeartbeatListener<TcpListener>, ServerError> {
        let listener_config = &self.config.listener;
        let listener = HeartbeatListener::bind(
            &TcpTransport,
            listener_config.network,
            &listener_config.bind,
            self.config.transport.clone(),
            listener_config.heartbeat(),
        )
        .await?
        .with_close_grace(listener_config.close_grace());

        Ok(listener)
    }

    /// Bind and serve until `cancel` fires
    pub async fn start(&self, cancel: CancelSignal) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await
    }

    /// Serve connections from `listener` until `cancel` fires or accepting
    /// fails, then close the listener and drain in-flight connections.
    pub async fn serve(
        &self,
        listener: HeartbeatListener<TcpListener>,
        cancel: CancelSignal,
    ) -> Result<(), ServerError> {
        info!("Server listening on {}", listener.addr());

        let mut connections = JoinSet::new();
        let result = loop {
            match listener.accept_with_cancel(&cancel).await {
                Ok(Some(conn)) => {
                    debug!("New connection from: {}", conn.peer_addr());
                    let protocol = Arc::clone(&self.protocol);
                    connections.spawn(handle_connection(conn, protocol));
                }
                Ok(None) => {
                    info!("Accept loop stopped");
                    break Ok(());
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    break Err(ServerError::Listener(e));
                }
            }

            while let Some(done) = connections.try_join_next() {
                if let Err(e) = done {
                    warn!("Connection task failed: {}", e);
                }
            }
        };

        let closed = listener.close().await;
        self.drain(&mut connections).await;

        let metrics = listener.metrics();
        info!(
            "Listener stats: accepted={} delivered={} abandoned={} errors={} timeouts={}",
            metrics.accepted,
            metrics.delivered,
            metrics.abandoned,
            metrics.accept_errors,
            metrics.timeouts
        );

        result?;
        closed.map_err(ServerError::Listener)
    }

    async fn drain(&self, connections: &mut JoinSet<()>) {
        if connections.is_empty() {
            return;
        }

        let timeout = self.config.server.drain_timeout();
        info!(
            "Waiting up to {:?} for {} connection(s)",
            timeout,
            connections.len()
        );

        let drained = tokio::time::timeout(timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "Aborting {} connection(s) still open after drain timeout",
                connections.len()
            );
            connections.shutdown().await;
        }
    }
}

async fn handle_connection(conn: TcpConnection, protocol: Arc<dyn Protocol>) {
    let peer = conn.peer_addr();
    let stream = match conn.into_tokio() {
        Ok(stream) => stream,
        Err(e) => {
            error!("Cannot register connection from {}: {}", peer, e);
            return;
        }
    };

    match protocol.handle_connection(stream).await {
        Ok(bytes) => debug!("Connection from {} finished after {} bytes", peer, bytes),
        Err(e) => error!("Connection error from {}: {}", peer, e),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
