//! RTMP server listener
//!
//! Handles the TCP accept loop and spawns one task per connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};
use crate::registry::StreamRegistry;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::stats::ServerStats;

/// RTMP server bound to its listening socket
pub struct RtmpServer {
    config: ServerConfig,
    listener: TcpListener,
    registry: Arc<StreamRegistry>,
    stats: Arc<ServerStats>,
}

impl RtmpServer {
    /// Bind the listening socket; failure here is fatal to the process
    pub async fn bind(
        config: ServerConfig,
        registry: Arc<StreamRegistry>,
        stats: Arc<ServerStats>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: config.bind_addr,
                source,
            })?;

        Ok(Self {
            config,
            listener,
            registry,
            stats,
        })
    }

    /// Address actually bound (differs from the configured one for port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Accept connections forever
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(addr = %self.local_addr()?, "RTMP server listening");

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop() => result,
        }
    }

    async fn accept_loop(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let session_id = self.registry.next_session_id();

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::warn!(session_id, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        tracing::debug!(session_id, peer = %peer_addr, "New connection");
        self.stats.connection_opened();

        let config = self.config.clone();
        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let mut connection =
                Connection::new(session_id, socket, peer_addr, config, registry, stats.clone());

            if let Err(e) = connection.run().await {
                tracing::debug!(session_id, error = %e, "Connection error");
            }

            stats.connection_closed();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ServerConfig::default().bind("127.0.0.1:0".parse().unwrap());
        let server = RtmpServer::bind(
            config,
            Arc::new(StreamRegistry::new()),
            Arc::new(ServerStats::new()),
        )
        .await
        .unwrap();

        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().unwrap();

        let result = RtmpServer::bind(
            ServerConfig::default().bind(taken),
            Arc::new(StreamRegistry::new()),
            Arc::new(ServerStats::new()),
        )
        .await;

        match result {
            Err(Error::Bind { addr, .. }) => assert_eq!(addr, taken),
            other => panic!("expected bind error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let config = ServerConfig::default().bind("127.0.0.1:0".parse().unwrap());
        let server = RtmpServer::bind(
            config,
            Arc::new(StreamRegistry::new()),
            Arc::new(ServerStats::new()),
        )
        .await
        .unwrap();

        let result = server.run_until(async {}).await;
        assert!(result.is_ok());
    }
}
