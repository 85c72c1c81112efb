//! Session-affine TCP proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> handshake token -> SessionRouter -> SessionTable
//!                                              |               (hit)
//!                                              +-> BackendSupervisor::spawn (miss)
//!           Listener -> relay <-> localhost:<session port> (backend)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let table = Arc::new(SessionTable::new());
//! let supervisor = Arc::new(BackendSupervisor::new(BackendConfig::default(), table.clone(), metrics));
//! let router = Arc::new(SessionRouter::new(table, supervisor));
//!
//! let listener = Listener::bind(ListenerConfig::new("[::]:5201".parse()?), router).await?;
//! Arc::new(listener).run().await?;
//! ```

mod handshake;
mod listener;
mod relay;
mod router;

pub use handshake::{read_token, Token, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_TOKEN_LEN};
pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use relay::{
    connect_upstream, proxy_connection, relay, RelayStats, Side, Upstream, DEFAULT_DIAL_TIMEOUT,
};
pub use router::{RoutingDecision, SessionRouter, DEFAULT_BACKEND_HOST};
