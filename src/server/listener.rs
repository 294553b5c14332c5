//! Server listener
//!
//! Handles the TCP accept loop and spawns a task per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::route::{LocalFabric, RouteFabric};
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::server::handler::NatsHandler;
use crate::session::SessionContext;
use crate::stats::ServerStats;

/// Pub/sub server
pub struct NatsServer<H: NatsHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    fabric: Arc<LocalFabric>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    stats: Arc<Mutex<ServerStats>>,
}

impl<H: NatsHandler> NatsServer<H> {
    /// Create a new server with the given configuration and handler
    pub fn new(mut config: ServerConfig, handler: H) -> Self {
        config.resolve_server_id();

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            handler: Arc::new(handler),
            fabric: Arc::new(LocalFabric::new()),
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
            stats: Arc::new(Mutex::new(ServerStats::new())),
        }
    }

    /// Routing fabric shared by all connections
    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Snapshot of server-wide counters
    pub fn stats(&self) -> ServerStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "Server listening");
        self.accept_loop(&listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` completes
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tracing::info!(
            addr = %listener.local_addr()?,
            server_id = %self.config.server_id,
            "Server listening"
        );

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.rejected_connections += 1;
                    }
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session_id = session_id, peer = %peer_addr, "New connection");

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.total_connections += 1;
            stats.active_connections += 1;
        }

        let config = self.config.clone();
        let handler = Arc::clone(&self.handler);
        let fabric = Arc::clone(&self.fabric);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let _permit = permit;
            let deliveries = fabric.register(session_id, config.fabric_queue_depth);
            let shared: Arc<dyn RouteFabric> = fabric.clone();
            let ctx = SessionContext::new(session_id, peer_addr);
            let mut connection = Connection::new(ctx, socket, config, handler, shared, deliveries);

            if let Err(e) = connection.run().await {
                tracing::debug!(session_id = session_id, error = %e, "Connection error");
            }
            fabric.unregister(session_id);

            if let Ok(mut stats) = stats.lock() {
                stats.record_session(&connection.service().stats());
            }
            tracing::info!(session_id = session_id, "Connection closed");
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}
