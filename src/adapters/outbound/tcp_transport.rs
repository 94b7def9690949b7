//! TCP Replica Transport
//!
//! Length-prefixed bincode frames over pooled TCP connections. Each request
//! borrows an idle connection (or dials a new one), writes one frame, reads
//! one reply, and returns the connection to the pool on success.

use crate::domain::entities::{ReadRequest, ReadResponse, RegionReplica};
use crate::domain::errors::TransportError;
use crate::domain::ports::ReplicaTransport;
use crate::domain::value_objects::{SequenceId, ServerName};
use crate::replication::codec::{read_frame, write_frame};
use crate::replication::{EditBatch, Message};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Transport settings.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub connect_timeout: Duration,
    /// Deadline for one request/reply exchange
    pub request_timeout: Duration,
    /// Idle connections kept per server
    pub max_idle: usize,
    pub idle_timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            max_idle: 4,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

struct IdleConnection {
    stream: TcpStream,
    last_used: Instant,
}

/// RPC client for remote region servers.
pub struct TcpTransport {
    config: TcpTransportConfig,
    routes: DashMap<ServerName, SocketAddr>,
    idle: DashMap<ServerName, Arc<Mutex<VecDeque<IdleConnection>>>>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            routes: DashMap::new(),
            idle: DashMap::new(),
        }
    }

    /// Map a logical server name to the socket address it listens on.
    pub fn add_route(&self, server: ServerName, addr: SocketAddr) {
        tracing::debug!("route {} -> {}", server, addr);
        self.routes.insert(server, addr);
    }

    pub fn remove_route(&self, server: &ServerName) {
        self.routes.remove(server);
        self.idle.remove(server);
    }

    /// Idle pooled connections for a server.
    pub async fn idle_connections(&self, server: &ServerName) -> usize {
        match self.idle.get(server).map(|p| p.value().clone()) {
            Some(pool) => pool.lock().await.len(),
            None => 0,
        }
    }

    fn pool(&self, server: &ServerName) -> Arc<Mutex<VecDeque<IdleConnection>>> {
        self.idle
            .entry(server.clone())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    async fn acquire(&self, server: &ServerName) -> Result<TcpStream, TransportError> {
        {
            let pool = self.pool(server);
            let mut idle = pool.lock().await;
            while let Some(conn) = idle.pop_front() {
                if conn.last_used.elapsed() > self.config.idle_timeout {
                    tracing::debug!("discarding idle connection to {}", server);
                    continue;
                }
                return Ok(conn.stream);
            }
        }

        let addr = self
            .routes
            .get(server)
            .map(|a| *a.value())
            .ok_or_else(|| TransportError::connection(server, "no route"))?;

        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(TransportError::connection(server, e.to_string())),
            Err(_) => Err(TransportError::Timeout(server.clone())),
        }
    }

    async fn release(&self, server: &ServerName, stream: TcpStream) {
        let pool = self.pool(server);
        let mut idle = pool.lock().await;
        if idle.len() < self.config.max_idle {
            idle.push_back(IdleConnection {
                stream,
                last_used: Instant::now(),
            });
        }
    }

    /// One request/reply exchange. A failed exchange drops its connection.
    async fn call(&self, server: &ServerName, request: Message) -> Result<Message, TransportError> {
        let mut stream = self.acquire(server).await?;
        let exchange = async {
            write_frame(&mut stream, &request).await?;
            read_frame(&mut stream).await
        };

        let reply = match tokio::time::timeout(self.config.request_timeout, exchange).await {
            Err(_) => return Err(TransportError::Timeout(server.clone())),
            Ok(Err(e)) => return Err(TransportError::connection(server, e.to_string())),
            Ok(Ok(None)) => return Err(TransportError::connection(server, "connection closed")),
            Ok(Ok(Some(reply))) => reply,
        };

        self.release(server, stream).await;
        match reply {
            Message::Failure(e) => Err(e),
            other => Ok(other),
        }
    }

    fn unexpected(server: &ServerName, reply: &Message) -> TransportError {
        TransportError::Remote(format!(
            "unexpected {} reply from {}",
            reply.type_name(),
            server
        ))
    }

    /// Liveness check.
    pub async fn ping(&self, server: &ServerName) -> Result<(), TransportError> {
        match self.call(server, Message::Ping).await? {
            Message::Pong => Ok(()),
            other => Err(Self::unexpected(server, &other)),
        }
    }
}

#[async_trait]
impl ReplicaTransport for TcpTransport {
    async fn read(
        &self,
        server: &ServerName,
        replica: &RegionReplica,
        request: ReadRequest,
    ) -> Result<ReadResponse, TransportError> {
        let message = Message::Read {
            replica: replica.clone(),
            request,
        };
        match self.call(server, message).await? {
            Message::ReadResult(response) => Ok(response),
            other => Err(Self::unexpected(server, &other)),
        }
    }

    async fn replicate(
        &self,
        server: &ServerName,
        replica: &RegionReplica,
        batch: EditBatch,
    ) -> Result<SequenceId, TransportError> {
        let message = Message::Replicate {
            replica: replica.clone(),
            batch,
        };
        match self.call(server, message).await? {
            Message::Applied { last_applied } => Ok(last_applied),
            other => Err(Self::unexpected(server, &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::inbound::RpcServer;
    use crate::adapters::outbound::{DashMapMetricsStore, MemoryRegionStore};
    use crate::application::{HostedRegion, RegionServer};
    use crate::domain::entities::{Mutation, RegionInfo, WalEdit};
    use crate::domain::value_objects::ReplicaId;
    use crate::infrastructure::ShutdownController;

    async fn serve() -> (TcpTransport, ServerName, RegionReplica, ShutdownController) {
        let name = ServerName::new("rs1.local", 16021);
        let server = Arc::new(RegionServer::new(
            name.clone(),
            Arc::new(DashMapMetricsStore::new()),
            Duration::from_secs(30),
        ));
        let replica = RegionInfo::catalog().replica(ReplicaId(1));
        server.open_region(Arc::new(HostedRegion::secondary(
            replica.clone(),
            Arc::new(MemoryRegionStore::new()),
        )));

        let shutdown = ShutdownController::new();
        let rpc = RpcServer::bind(server, "127.0.0.1:0", shutdown.clone())
            .await
            .unwrap();
        let addr = rpc.local_addr().unwrap();
        tokio::spawn(rpc.run());

        let transport = TcpTransport::new(TcpTransportConfig::default());
        transport.add_route(name.clone(), addr);
        (transport, name, replica, shutdown)
    }

    #[tokio::test]
    async fn test_replicate_then_read_over_tcp() {
        let (transport, name, replica, shutdown) = serve().await;

        let batch = EditBatch::new(
            replica.region.encoded_name(),
            vec![WalEdit::new(1, vec![Mutation::put("k", "v")])],
        );
        assert_eq!(transport.replicate(&name, &replica, batch).await.unwrap(), 1);

        let response = transport
            .read(&name, &replica, ReadRequest::get("k"))
            .await
            .unwrap();
        assert_eq!(response.rows.len(), 1);
        assert_eq!(response.last_applied, 1);

        // sequential calls reuse one pooled connection
        assert_eq!(transport.idle_connections(&name).await, 1);
        shutdown.shutdown();
    }

    #[tokio::test]
    async fn test_remote_failure_is_returned() {
        let (transport, name, _, shutdown) = serve().await;
        let primary = RegionInfo::catalog().replica(ReplicaId::PRIMARY);
        let err = transport
            .read(&name, &primary, ReadRequest::get("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RegionNotServed { .. }));
        shutdown.shutdown();
    }

    #[tokio::test]
    async fn test_ping() {
        let (transport, name, _, shutdown) = serve().await;
        transport.ping(&name).await.unwrap();
        shutdown.shutdown();
    }

    #[tokio::test]
    async fn test_no_route() {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let err = transport.ping(&ServerName::new("nowhere", 1)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
