//! RPC Server Adapter
//!
//! Accepts framed RPC connections and answers them from a region server:
//! reads, replicated batches and liveness pings.

use crate::application::RegionServer;
use crate::infrastructure::ShutdownController;
use crate::replication::codec::{read_frame, write_frame};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// RPC server - inbound adapter in front of one [`RegionServer`].
pub struct RpcServer {
    server: Arc<RegionServer>,
    listener: TcpListener,
    shutdown: ShutdownController,
}

impl RpcServer {
    /// Bind the listening socket. Use port 0 for an ephemeral port.
    pub async fn bind(
        server: Arc<RegionServer>,
        listen_addr: &str,
        shutdown: ShutdownController,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        Ok(Self {
            server,
            listener,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown, one task per connection.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            "region server {} listening on {}",
            self.server.name(),
            self.local_addr()?
        );
        let token = self.shutdown.token();

        loop {
            let (stream, addr) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = token.cancelled() => break,
            };
            let server = self.server.clone();
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(server, stream, shutdown).await {
                    tracing::debug!("rpc connection from {} closed: {}", addr, e);
                }
            });
        }

        tracing::info!("region server {} stopped accepting", self.server.name());
        Ok(())
    }

    /// Serve requests on one connection until EOF or shutdown.
    async fn handle_connection(
        server: Arc<RegionServer>,
        mut stream: TcpStream,
        shutdown: ShutdownController,
    ) -> anyhow::Result<()> {
        let _guard = shutdown.session_guard();
        let token = shutdown.token();
        stream.set_nodelay(true)?;

        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut stream) => frame?,
                _ = token.cancelled() => return Ok(()),
            };
            let Some(request) = frame else {
                return Ok(());
            };
            tracing::trace!("rpc {} on {}", request.type_name(), server.name());
            let reply = server.handle(request);
            write_frame(&mut stream, &reply).await?;
        }
    }
}
