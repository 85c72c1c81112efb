//! Routing decisions: handshake token to backend.
//!
//! A token seen for the first time reserves a port and spawns a dedicated
//! backend; later connections carrying the same token (the iperf3 control
//! connection and every data stream of one test) are sent to that backend.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info};

use super::handshake::Token;
use super::relay::Upstream;
use crate::error::ConnectionError;
use crate::session::{BackendState, Reservation, Session, SessionTable};
use crate::supervisor::BackendSupervisor;

/// Default host backends are dialed on. Backends always run next to the
/// router.
pub const DEFAULT_BACKEND_HOST: &str = "localhost";

/// Result of a routing decision.
#[derive(Debug, Clone)]
pub enum RoutingDecision {
    /// Token already bound to a running backend.
    Existing { session: Session, upstream: Upstream },
    /// A new backend was spawned for this token.
    Spawned { session: Session, upstream: Upstream },
}

impl RoutingDecision {
    pub fn upstream(&self) -> &Upstream {
        match self {
            RoutingDecision::Existing { upstream, .. } => upstream,
            RoutingDecision::Spawned { upstream, .. } => upstream,
        }
    }

    pub fn session(&self) -> &Session {
        match self {
            RoutingDecision::Existing { session, .. } => session,
            RoutingDecision::Spawned { session, .. } => session,
        }
    }
}

/// Resolves handshake tokens to backends, spawning them on demand.
pub struct SessionRouter {
    table: Arc<SessionTable>,
    supervisor: Arc<BackendSupervisor>,
    backend_host: String,
}

impl SessionRouter {
    pub fn new(table: Arc<SessionTable>, supervisor: Arc<BackendSupervisor>) -> Self {
        Self::with_backend_host(table, supervisor, DEFAULT_BACKEND_HOST)
    }

    pub fn with_backend_host(
        table: Arc<SessionTable>,
        supervisor: Arc<BackendSupervisor>,
        backend_host: impl Into<String>,
    ) -> Self {
        Self {
            table,
            supervisor,
            backend_host: backend_host.into(),
        }
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Find or create the backend for `token`.
    ///
    /// Spawning waits for readiness. A concurrent connection with the same
    /// token waits on the first one's spawn instead of starting another
    /// backend. Spawn failures release the reservation and are returned, as
    /// does running out of backend ports.
    pub async fn route(
        &self,
        token: &Token,
        client_addr: SocketAddr,
    ) -> Result<RoutingDecision, ConnectionError> {
        match self.table.reserve(token, client_addr).await? {
            Reservation::Existing { session, mut state } => {
                let observed = match state.wait_for(|s| *s != BackendState::Starting).await {
                    Ok(observed) => *observed,
                    Err(_) => BackendState::Failed,
                };
                if observed == BackendState::Failed {
                    return Err(ConnectionError::BackendUnavailable { port: session.port });
                }

                // The entry may have been reserved by another connection
                // still starting; pick up the pid it published since.
                let session = match self.table.lookup(token).await {
                    Some(current) if current.id == session.id => current,
                    _ => session,
                };

                info!(port = session.port, token = %token, "Found existing session");
                let upstream = Upstream::new(self.backend_host.as_str(), session.port);
                Ok(RoutingDecision::Existing { session, upstream })
            }
            Reservation::Reserved(session) => {
                debug!(port = session.port, token = %token, "No session for token");

                let process = match self.supervisor.spawn(session.port).await {
                    Ok(process) => process,
                    Err(e) => {
                        self.table.abandon(&session).await;
                        return Err(e.into());
                    }
                };

                self.table.mark_ready(&session, process.pid()).await;
                let session = Session {
                    pid: process.pid(),
                    ..session
                };
                self.supervisor.launch_reaper(session.clone(), process);

                info!(port = session.port, token = %token, "Spawned session");
                let upstream = Upstream::new(self.backend_host.as_str(), session.port);
                Ok(RoutingDecision::Spawned { session, upstream })
            }
        }
    }
}
