//! TCP listener and connection handling.
//!
//! Each accepted connection runs in its own task:
//! read the handshake token, route it to a backend (spawning one if
//! needed), then relay. Failures in that task close only that client
//! connection. A failing listener socket ends [`Listener::run`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn, Instrument};

use super::handshake::{read_token, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_TOKEN_LEN};
use super::relay::{proxy_connection, DEFAULT_DIAL_TIMEOUT};
use super::router::{RoutingDecision, SessionRouter};
use crate::error::ConnectionError;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Size of the handshake token read before routing.
    pub token_len: usize,
    /// Time a client gets to send its token.
    pub handshake_timeout: Duration,
    /// Connect timeout towards the backend.
    pub dial_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            token_len: DEFAULT_TOKEN_LEN,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Clients that failed to deliver a full token.
    pub handshake_failed: AtomicU64,
    /// Connections that caused a backend spawn.
    pub sessions_spawned: AtomicU64,
    /// Connections routed to an already running backend.
    pub sessions_reused: AtomicU64,
    /// Connections dropped because their backend did not start.
    pub spawn_failed: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

/// The router's client-facing TCP listener.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    router: Arc<SessionRouter>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(config: ListenerConfig, router: Arc<SessionRouter>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            token_len = config.token_len,
            dial_timeout_ms = config.dial_timeout.as_millis() as u64,
            "Listener bound"
        );

        Ok(Self {
            config,
            listener,
            router,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until the listening socket fails.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    return Err(e);
                }
            };

            info!(peer_addr = %peer_addr, "Accepted connection");
            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            self.stats
                .connections_active
                .fetch_add(1, Ordering::Relaxed);

            let listener = Arc::clone(&self);
            tokio::spawn(
                async move {
                    if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                        warn!(
                            peer_addr = %peer_addr,
                            reason = e.reason_code(),
                            error = %e,
                            "Connection aborted"
                        );
                    }

                    listener
                        .stats
                        .connections_active
                        .fetch_sub(1, Ordering::Relaxed);
                    listener
                        .stats
                        .connections_closed
                        .fetch_add(1, Ordering::Relaxed);
                }
                .instrument(tracing::info_span!("connection", peer = %peer_addr)),
            );
        }
    }

    /// Handle a single connection.
    async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ConnectionError> {
        let token = match read_token(
            &mut client,
            self.config.token_len,
            self.config.handshake_timeout,
        )
        .await
        {
            Ok(token) => token,
            Err(e) => {
                self.stats.handshake_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let decision = match self.router.route(&token, peer_addr).await {
            Ok(decision) => decision,
            Err(e) => {
                self.stats.spawn_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        match &decision {
            RoutingDecision::Existing { .. } => {
                self.stats.sessions_reused.fetch_add(1, Ordering::Relaxed)
            }
            RoutingDecision::Spawned { .. } => {
                self.stats.sessions_spawned.fetch_add(1, Ordering::Relaxed)
            }
        };

        let stats = match proxy_connection(
            client,
            peer_addr,
            decision.upstream(),
            &token,
            self.config.dial_timeout,
        )
        .await
        {
            Ok(stats) => {
                self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                stats
            }
            Err(e) => {
                if matches!(e, ConnectionError::Dial { .. }) {
                    self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }
        };

        self.stats
            .bytes_to_backend
            .fetch_add(stats.bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(stats.bytes_from_backend, Ordering::Relaxed);

        Ok(())
    }
}
