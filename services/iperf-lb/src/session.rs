//! Session table.
//!
//! Maps a handshake token to the backend serving it. Every operation runs
//! under one mutex, so a lookup and the registration that follows a miss
//! form a single critical section (see [`SessionTable::reserve`]).
//!
//! Port allocation follows `max(live ports) + 1` with a floor: ports freed
//! by exited sessions are handed out again only once the running maximum
//! has dropped below them. Once a live session holds port 65535 no further
//! session can be registered until it exits.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::error::TableError;
use crate::proxy::Token;

/// Lowest port handed to a backend (the listener itself defaults to 5201).
pub const DEFAULT_PORT_FLOOR: u16 = 5202;

/// Lifecycle of the backend behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    /// Port reserved, process spawning or waiting for its readiness marker.
    Starting,
    /// Backend printed its readiness marker and accepts connections.
    Ready,
    /// Spawn or readiness failed; the reservation is released.
    Failed,
    /// Backend process exited and the session was removed.
    Exited,
}

/// One client-to-backend binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Table-assigned identifier, stable for the life of the session.
    pub id: u64,
    pub token: Token,
    /// Address of the client that caused the spawn. Informational only.
    pub client_addr: SocketAddr,
    pub port: u16,
    /// Backend process id, known once the backend is ready.
    pub pid: Option<u32>,
}

/// A session together with its current backend state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    #[serde(flatten)]
    pub session: Session,
    pub state: BackendState,
}

/// Outcome of [`SessionTable::reserve`].
#[derive(Debug)]
pub enum Reservation {
    /// A session already exists for the token. Its backend may still be
    /// starting; wait on `state` before dialing.
    Existing {
        session: Session,
        state: watch::Receiver<BackendState>,
    },
    /// No session existed. The caller now owns a `Starting` entry and must
    /// either [`mark_ready`](SessionTable::mark_ready) or
    /// [`abandon`](SessionTable::abandon) it.
    Reserved(Session),
}

struct Entry {
    session: Session,
    state: watch::Sender<BackendState>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Token, Entry>,
    next_id: u64,
}

impl Inner {
    fn allocate_port(&self, floor: u16) -> Result<u16, TableError> {
        match self.entries.values().map(|e| e.session.port).max() {
            None => Ok(floor),
            Some(max) => max
                .checked_add(1)
                .map(|next| next.max(floor))
                .ok_or(TableError::PortsExhausted),
        }
    }

    fn insert(&mut self, session: Session, state: BackendState) -> Result<(), TableError> {
        if self.entries.contains_key(&session.token) {
            return Err(TableError::DuplicateToken);
        }
        if self.entries.values().any(|e| e.session.port == session.port) {
            return Err(TableError::DuplicatePort(session.port));
        }

        self.next_id = self.next_id.max(session.id + 1);
        let (state, _) = watch::channel(state);
        self.entries
            .insert(session.token.clone(), Entry { session, state });
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Registry of live sessions.
pub struct SessionTable {
    port_floor: u16,
    inner: Mutex<Inner>,
}

impl SessionTable {
    /// Create an empty table allocating ports from [`DEFAULT_PORT_FLOOR`].
    pub fn new() -> Self {
        Self::with_port_floor(DEFAULT_PORT_FLOOR)
    }

    pub fn with_port_floor(port_floor: u16) -> Self {
        Self {
            port_floor,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn port_floor(&self) -> u16 {
        self.port_floor
    }

    /// Find the session bound to `token`.
    pub async fn lookup(&self, token: &Token) -> Option<Session> {
        let inner = self.inner.lock().await;
        inner.entries.get(token).map(|e| e.session.clone())
    }

    /// Port the next session would receive. Nothing is reserved.
    pub async fn allocate_port(&self) -> Result<u16, TableError> {
        self.inner.lock().await.allocate_port(self.port_floor)
    }

    /// Register an already running backend.
    ///
    /// Callers are expected to have checked the token with [`lookup`]
    /// first; prefer [`reserve`] which does both atomically.
    ///
    /// [`lookup`]: SessionTable::lookup
    /// [`reserve`]: SessionTable::reserve
    pub async fn add(&self, session: Session) -> Result<(), TableError> {
        self.inner.lock().await.insert(session, BackendState::Ready)
    }

    /// Look up `token` and, on a miss, allocate a port and register a
    /// `Starting` entry for it, all under the table lock.
    ///
    /// Two connections racing with the same new token get exactly one
    /// `Reserved`; the other sees `Existing` and waits for its state.
    /// Fails with [`TableError::PortsExhausted`] when no port above the
    /// running maximum is left.
    pub async fn reserve(
        &self,
        token: &Token,
        client_addr: SocketAddr,
    ) -> Result<Reservation, TableError> {
        let mut inner = self.inner.lock().await;

        if let Some(entry) = inner.entries.get(token) {
            return Ok(Reservation::Existing {
                session: entry.session.clone(),
                state: entry.state.subscribe(),
            });
        }

        let port = inner.allocate_port(self.port_floor)?;
        let session = Session {
            id: inner.next_id(),
            token: token.clone(),
            client_addr,
            port,
            pid: None,
        };
        inner.insert(session.clone(), BackendState::Starting)?;

        debug!(port = port, token = %token, "Reserved session");
        Ok(Reservation::Reserved(session))
    }

    /// Publish that the backend for `session` is accepting connections.
    pub async fn mark_ready(&self, session: &Session, pid: Option<u32>) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&session.token) {
            if entry.session.id == session.id {
                entry.session.pid = pid;
                entry.state.send_replace(BackendState::Ready);
            }
        }
    }

    /// Release a reservation whose backend never became ready.
    pub async fn abandon(&self, session: &Session) {
        self.take(session, BackendState::Failed).await;
    }

    /// Remove `session`. A no-op when it is already gone or when the token
    /// has since been bound to a different session.
    pub async fn remove(&self, session: &Session) -> bool {
        self.take(session, BackendState::Exited).await
    }

    async fn take(&self, session: &Session, final_state: BackendState) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.entries.get(&session.token) {
            Some(entry) if entry.session.id == session.id => {}
            _ => return false,
        }

        if let Some(entry) = inner.entries.remove(&session.token) {
            entry.state.send_replace(final_state);
        }
        true
    }

    /// Number of sessions whose backend is ready.
    pub async fn count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .entries
            .values()
            .filter(|e| *e.state.borrow() == BackendState::Ready)
            .count()
    }

    /// All entries, including reservations still starting, ordered by port.
    pub async fn snapshot(&self) -> Vec<SessionStatus> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<_> = inner
            .entries
            .values()
            .map(|e| SessionStatus {
                session: e.session.clone(),
                state: *e.state.borrow(),
            })
            .collect();
        sessions.sort_by_key(|s| s.session.port);
        sessions
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn token(s: &str) -> Token {
        Token::new(s.as_bytes())
    }

    fn client() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    fn session(id: u64, name: &str, port: u16) -> Session {
        Session {
            id,
            token: token(name),
            client_addr: client(),
            port,
            pid: None,
        }
    }

    async fn reserve_new(table: &SessionTable, name: &str) -> Session {
        match table.reserve(&token(name), client()).await.unwrap() {
            Reservation::Reserved(session) => session,
            Reservation::Existing { .. } => panic!("token {} already reserved", name),
        }
    }

    #[tokio::test]
    async fn test_ports_start_at_floor_and_increase() {
        let table = SessionTable::new();
        assert_eq!(table.allocate_port().await, Ok(5202));

        let a = reserve_new(&table, "T1").await;
        let b = reserve_new(&table, "T2").await;
        let c = reserve_new(&table, "T3").await;

        assert_eq!((a.port, b.port, c.port), (5202, 5203, 5204));
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_freed_port_not_reused_below_running_max() {
        let table = SessionTable::new();
        let a = reserve_new(&table, "T1").await;
        let _b = reserve_new(&table, "T2").await;

        assert!(table.remove(&a).await);
        assert_eq!(reserve_new(&table, "T3").await.port, 5204);
    }

    #[tokio::test]
    async fn test_freed_port_reused_once_table_drains() {
        let table = SessionTable::new();
        let a = reserve_new(&table, "T1").await;
        table.remove(&a).await;

        assert_eq!(reserve_new(&table, "T2").await.port, 5202);
    }

    #[tokio::test]
    async fn test_reserve_same_token_returns_existing() {
        let table = SessionTable::new();
        let a = reserve_new(&table, "T1").await;

        match table
            .reserve(&token("T1"), "192.0.2.99:1".parse().unwrap())
            .await
            .unwrap()
        {
            Reservation::Existing { session, state } => {
                assert_eq!(session, a);
                assert_eq!(*state.borrow(), BackendState::Starting);
            }
            Reservation::Reserved(_) => panic!("second reservation for T1"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_reserve_single_owner() {
        let table = Arc::new(SessionTable::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                matches!(
                    table.reserve(&token("T1"), client()).await,
                    Ok(Reservation::Reserved(_))
                )
            }));
        }

        let mut owners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                owners += 1;
            }
        }
        assert_eq!(owners, 1);
        assert_eq!(table.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_waiter_observes_ready() {
        let table = SessionTable::new();
        let a = reserve_new(&table, "T1").await;

        let Ok(Reservation::Existing { mut state, .. }) = table.reserve(&token("T1"), client()).await
        else {
            panic!("expected existing session");
        };

        table.mark_ready(&a, Some(4242)).await;
        let seen = *state
            .wait_for(|s| *s != BackendState::Starting)
            .await
            .unwrap();
        assert_eq!(seen, BackendState::Ready);
        assert_eq!(table.lookup(&token("T1")).await.unwrap().pid, Some(4242));
        assert_eq!(table.count().await, 1);
    }

    #[tokio::test]
    async fn test_abandon_publishes_failed_and_frees_token() {
        let table = SessionTable::new();
        let a = reserve_new(&table, "T1").await;

        let Ok(Reservation::Existing { mut state, .. }) = table.reserve(&token("T1"), client()).await
        else {
            panic!("expected existing session");
        };

        table.abandon(&a).await;
        let seen = *state
            .wait_for(|s| *s != BackendState::Starting)
            .await
            .unwrap();
        assert_eq!(seen, BackendState::Failed);
        assert!(table.lookup(&token("T1")).await.is_none());
        assert_eq!(table.count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_id_checked() {
        let table = SessionTable::new();
        let old = reserve_new(&table, "T1").await;
        assert!(table.remove(&old).await);
        assert!(!table.remove(&old).await);

        // A stale handle must not evict the token's new session.
        let new = reserve_new(&table, "T1").await;
        assert!(!table.remove(&old).await);
        assert_eq!(table.lookup(&token("T1")).await, Some(new));
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates() {
        let table = SessionTable::new();
        table.add(session(1, "T1", 5202)).await.unwrap();

        assert_eq!(
            table.add(session(2, "T1", 5300)).await,
            Err(TableError::DuplicateToken)
        );
        assert_eq!(
            table.add(session(3, "T2", 5202)).await,
            Err(TableError::DuplicatePort(5202))
        );

        // Ids handed out after a manual add never collide with it.
        let next = reserve_new(&table, "T3").await;
        assert!(next.id > 1);
        assert_eq!(next.port, 5203);
    }

    #[tokio::test]
    async fn test_count_excludes_starting() {
        let table = SessionTable::new();
        let a = reserve_new(&table, "T1").await;
        let _b = reserve_new(&table, "T2").await;
        assert_eq!(table.count().await, 0);

        table.mark_ready(&a, None).await;
        assert_eq!(table.count().await, 1);

        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].state, BackendState::Ready);
        assert_eq!(snapshot[1].state, BackendState::Starting);
    }

    #[tokio::test]
    async fn test_top_of_port_range_is_not_shared() {
        let table = SessionTable::with_port_floor(65534);
        let a = reserve_new(&table, "T1").await;
        let b = reserve_new(&table, "T2").await;
        assert_eq!((a.port, b.port), (65534, 65535));

        assert_eq!(table.allocate_port().await, Err(TableError::PortsExhausted));
        assert!(matches!(
            table.reserve(&token("T3"), client()).await,
            Err(TableError::PortsExhausted)
        ));
        assert_eq!(table.snapshot().await.len(), 2);

        // A token already holding a port is still routed.
        assert!(matches!(
            table.reserve(&token("T2"), client()).await,
            Ok(Reservation::Existing { .. })
        ));

        // Once the top port is released the range opens up again.
        table.remove(&b).await;
        assert_eq!(reserve_new(&table, "T3").await.port, 65535);
    }

    #[tokio::test]
    async fn test_floor_at_top_of_range() {
        let table = SessionTable::with_port_floor(65535);
        assert_eq!(reserve_new(&table, "T1").await.port, 65535);
        assert!(matches!(
            table.reserve(&token("T2"), client()).await,
            Err(TableError::PortsExhausted)
        ));
    }

    #[tokio::test]
    async fn test_custom_floor() {
        let table = SessionTable::with_port_floor(40000);
        assert_eq!(reserve_new(&table, "T1").await.port, 40000);
        assert_eq!(table.port_floor(), 40000);
    }
}
