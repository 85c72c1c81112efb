//! Handshake token extraction.
//!
//! An iperf3 client opens every connection of a test (control and data
//! streams) by sending the same fixed-size cookie. The router reads exactly
//! that many bytes before deciding where the connection goes. The bytes are
//! not validated beyond their length.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::HandshakeError;

/// iperf3 cookie size: 36 printable characters plus a trailing NUL.
pub const DEFAULT_TOKEN_LEN: usize = 37;

/// Default time a client gets to send its token.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque routing key read from the start of a client connection.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(Vec<u8>);

impl Token {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Cookies are printable ASCII; anything else is escaped so log lines stay
// on one line.
impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trimmed = match self.0.iter().rposition(|&b| b != 0) {
            Some(end) => &self.0[..=end],
            None => &[],
        };
        for &b in trimmed {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self)
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Read exactly `len` bytes from `reader` within `timeout`.
///
/// A peer that closes early yields [`HandshakeError::Short`] with the
/// number of bytes it did send.
pub async fn read_token<R>(
    reader: &mut R,
    len: usize,
    timeout: Duration,
) -> Result<Token, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    let mut filled = 0;

    let read_all = async {
        while filled < len {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(HandshakeError::Short {
                    received: filled,
                    expected: len,
                });
            }
            filled += n;
        }
        Ok(())
    };

    match tokio::time::timeout(timeout, read_all).await {
        Ok(Ok(())) => Ok(Token(buf)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(HandshakeError::Timeout(timeout)),
    }
}
