pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod session;
pub mod supervisor;

pub use config::{Config, LogFormat};
pub use error::{ConnectionError, HandshakeError, SpawnError, TableError};
pub use metrics::Metrics;
pub use proxy::{
    Listener, ListenerConfig, ListenerStats, RelayStats, RoutingDecision, SessionRouter, Side,
    Token, Upstream,
};
pub use session::{BackendState, Reservation, Session, SessionStatus, SessionTable};
pub use supervisor::{BackendConfig, BackendProcess, BackendSupervisor};
