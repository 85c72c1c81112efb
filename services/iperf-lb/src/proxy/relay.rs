//! Bidirectional relay between a client and its backend.
//!
//! The two directions are copied concurrently. Whichever finishes first
//! (EOF or error) cancels the other, and both connections are shut down,
//! so a peer that disconnects never leaves the opposite copy blocked.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::handshake::Token;
use crate::error::ConnectionError;

/// Default connect timeout for backend connections.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(1500);

/// Upper bound on shutting down both legs once a direction finished.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

const RELAY_BUFFER: usize = 64 * 1024;

/// Where a session's backend accepts connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Which side of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

/// Outcome of a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
    /// Side whose outbound stream ended first and triggered teardown.
    pub finished_first: Side,
}

/// Dial the backend with an explicit timeout. No retry.
pub async fn connect_upstream(
    upstream: &Upstream,
    dial_timeout: Duration,
) -> Result<TcpStream, ConnectionError> {
    debug!(backend = %upstream, "Connecting to backend");

    let result = match timeout(
        dial_timeout,
        TcpStream::connect((upstream.host.as_str(), upstream.port)),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    };

    result.map_err(|source| ConnectionError::Dial {
        addr: upstream.to_string(),
        source,
    })
}

/// Dial `upstream`, replay the handshake bytes already read from the client,
/// and relay until either side finishes.
pub async fn proxy_connection(
    client: TcpStream,
    peer_addr: SocketAddr,
    upstream: &Upstream,
    handshake: &Token,
    dial_timeout: Duration,
) -> Result<RelayStats, ConnectionError> {
    let mut backend = connect_upstream(upstream, dial_timeout).await?;
    let backend_addr = backend.peer_addr().map_err(ConnectionError::Relay)?;

    // The backend expects the cookie as if it had read it from the client.
    backend
        .write_all(handshake.as_bytes())
        .await
        .map_err(ConnectionError::Relay)?;

    info!(client = %peer_addr, backend = %backend_addr, "Connected");

    let stats = relay(client, backend).await;

    info!(
        client = %peer_addr,
        backend = %backend_addr,
        bytes_to_backend = stats.bytes_to_backend,
        bytes_from_backend = stats.bytes_from_backend,
        finished_first = ?stats.finished_first,
        "Closed"
    );

    Ok(stats)
}

/// Relay bytes between `client` and `backend` until one direction ends.
///
/// Both streams are shut down and dropped before this returns.
pub async fn relay<C, B>(client: C, backend: B) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let mut bytes_to_backend = 0u64;
    let mut bytes_from_backend = 0u64;

    // Losing branch is dropped here, which cancels its copy.
    let (finished_first, result) = tokio::select! {
        r = pump(&mut client_read, &mut backend_write, &mut bytes_to_backend) => (Side::Client, r),
        r = pump(&mut backend_read, &mut client_write, &mut bytes_from_backend) => (Side::Backend, r),
    };

    if let Err(e) = result {
        debug!(side = ?finished_first, error = %e, "Relay direction failed");
    }

    let teardown = async {
        let _ = client_write.shutdown().await;
        let _ = backend_write.shutdown().await;
    };
    if timeout(TEARDOWN_TIMEOUT, teardown).await.is_err() {
        debug!("Relay teardown timed out");
    }

    RelayStats {
        bytes_to_backend,
        bytes_from_backend,
        finished_first,
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (mut client, client_side) = tokio::io::duplex(1024);
        let (backend_side, mut backend) = tokio::io::duplex(1024);

        let relay = tokio::spawn(relay(client_side, backend_side));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        let stats = timeout(TEST_TIMEOUT, relay).await.unwrap().unwrap();
        assert_eq!(stats.bytes_to_backend, 4);
        assert_eq!(stats.bytes_from_backend, 5);
        assert_eq!(stats.finished_first, Side::Client);
    }

    #[tokio::test]
    async fn test_client_close_tears_down_backend() {
        let (client, client_side) = tokio::io::duplex(1024);
        let (backend_side, mut backend) = tokio::io::duplex(1024);

        let relay = tokio::spawn(relay(client_side, backend_side));
        drop(client);

        // Backend never closes on its own; the relay must still finish and
        // the backend must observe EOF.
        let mut buf = Vec::new();
        timeout(TEST_TIMEOUT, backend.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let stats = timeout(TEST_TIMEOUT, relay).await.unwrap().unwrap();
        assert_eq!(stats.finished_first, Side::Client);
    }

    #[tokio::test]
    async fn test_backend_close_tears_down_client() {
        let (mut client, client_side) = tokio::io::duplex(1024);
        let (backend_side, mut backend) = tokio::io::duplex(1024);

        let relay = tokio::spawn(relay(client_side, backend_side));
        backend.write_all(b"bye").await.unwrap();
        drop(backend);

        let mut buf = Vec::new();
        timeout(TEST_TIMEOUT, client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, b"bye");

        let stats = timeout(TEST_TIMEOUT, relay).await.unwrap().unwrap();
        assert_eq!(stats.finished_first, Side::Backend);
        assert_eq!(stats.bytes_from_backend, 3);
    }

    #[tokio::test]
    async fn test_connect_upstream_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_upstream(&Upstream::new("127.0.0.1", port), DEFAULT_DIAL_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Dial { .. }));
        assert_eq!(err.reason_code(), "dial_failed");
    }

    #[tokio::test]
    async fn test_proxy_connection_replays_handshake() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = Upstream::new("127.0.0.1", backend.local_addr().unwrap().port());

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let mut client = TcpStream::connect(front_addr).await.unwrap();
        let (accepted, peer_addr) = front.accept().await.unwrap();

        let token = Token::new(&b"COOKIE"[..]);
        let proxy = tokio::spawn(async move {
            proxy_connection(accepted, peer_addr, &upstream, &token, DEFAULT_DIAL_TIMEOUT).await
        });

        let (mut backend_conn, _) = backend.accept().await.unwrap();
        client.write_all(b"data").await.unwrap();

        let mut buf = [0u8; 10];
        backend_conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"COOKIEdata");

        drop(backend_conn);
        let mut rest = Vec::new();
        timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();

        let stats = timeout(TEST_TIMEOUT, proxy).await.unwrap().unwrap().unwrap();
        assert_eq!(stats.finished_first, Side::Backend);
        assert_eq!(stats.bytes_to_backend, 4);
    }

    #[test]
    fn test_upstream_display() {
        assert_eq!(Upstream::new("localhost", 5202).to_string(), "localhost:5202");
    }
}
