//! Backend output handling.
//!
//! Readiness is signalled by a marker string on the backend's stdout. Pipe
//! reads return arbitrary chunks, so the scanner carries the tail of the
//! previous chunk forward and a marker split across two reads still
//! matches.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, warn};

const READ_CHUNK: usize = 4096;

/// Incremental substring search over a byte stream.
#[derive(Debug)]
pub struct MarkerScanner {
    marker: Vec<u8>,
    carry: Vec<u8>,
}

impl MarkerScanner {
    pub fn new(marker: impl Into<Vec<u8>>) -> Self {
        Self {
            marker: marker.into(),
            carry: Vec::new(),
        }
    }

    /// Feed the next chunk. Returns true once the marker has been seen.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.marker.is_empty() {
            return true;
        }

        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(chunk);

        if window
            .windows(self.marker.len())
            .any(|w| w == self.marker.as_slice())
        {
            return true;
        }

        // Anything older than marker.len() - 1 bytes can no longer be part
        // of a match.
        let keep = self.marker.len() - 1;
        window.drain(..window.len().saturating_sub(keep));
        self.carry = window;
        false
    }
}

/// Read from `reader` until the scanner matches.
///
/// Returns `Ok(false)` if the stream ends first.
pub async fn wait_for_marker<R>(reader: &mut R, scanner: &mut MarkerScanner) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        if scanner.feed(&buf[..n]) {
            return Ok(true);
        }
    }
}

/// Which backend pipe is being drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Drain a backend pipe to the log until EOF.
///
/// The pipe must be read for the whole life of the backend, otherwise a
/// full pipe stalls it and a closed one kills it with SIGPIPE.
pub async fn forward_output<R>(reader: R, port: u16, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if text.is_empty() {
                    continue;
                }
                match stream {
                    OutputStream::Stdout => {
                        debug!(port = port, stream = stream.as_str(), line = %text, "Backend output")
                    }
                    OutputStream::Stderr => {
                        warn!(port = port, stream = stream.as_str(), line = %text, "Backend output")
                    }
                }
            }
            Err(e) => {
                debug!(port = port, stream = stream.as_str(), error = %e, "Backend output read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio_test::io::Builder;

    const MARKER: &str = "Server listening on";

    #[test]
    fn test_marker_in_single_chunk() {
        let mut scanner = MarkerScanner::new(MARKER);
        assert!(!scanner.feed(b"-----------------------------------------------------------\n"));
        assert!(scanner.feed(b"Server listening on 5202 (test #1)\n"));
    }

    #[rstest]
    #[case(1)]
    #[case(6)]
    #[case(7)]
    #[case(12)]
    #[case(18)]
    fn test_marker_split_across_chunks(#[case] split: usize) {
        let output = b"-----\nServer listening on 5202\n";
        let at = 6 + split;

        let mut scanner = MarkerScanner::new(MARKER);
        assert!(!scanner.feed(&output[..at]));
        assert!(scanner.feed(&output[at..]));
    }

    #[test]
    fn test_marker_split_across_many_small_chunks() {
        let mut scanner = MarkerScanner::new(MARKER);
        let output = b"noise Server listening on 5202";
        let seen = output.chunks(2).any(|chunk| scanner.feed(chunk));
        assert!(seen);
    }

    #[test]
    fn test_partial_marker_does_not_match() {
        let mut scanner = MarkerScanner::new(MARKER);
        assert!(!scanner.feed(b"Server listen"));
        assert!(!scanner.feed(b"ing elsewhere\n"));
        assert!(!scanner.feed(b"on 5202\n"));
    }

    #[test]
    fn test_empty_marker_matches_immediately() {
        let mut scanner = MarkerScanner::new("");
        assert!(scanner.feed(b""));
    }

    #[tokio::test]
    async fn test_wait_for_marker_split_reads() {
        let mut reader = Builder::new()
            .read(b"-----------\nServer lis")
            .read(b"tening on 5202\n")
            .build();
        let mut scanner = MarkerScanner::new(MARKER);

        assert!(wait_for_marker(&mut reader, &mut scanner).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_marker_eof() {
        let mut reader = Builder::new().read(b"iperf3: error - unable to start\n").build();
        let mut scanner = MarkerScanner::new(MARKER);

        assert!(!wait_for_marker(&mut reader, &mut scanner).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_marker_read_error() {
        let mut reader = Builder::new()
            .read(b"Server")
            .read_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();
        let mut scanner = MarkerScanner::new(MARKER);

        let err = wait_for_marker(&mut reader, &mut scanner).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_forward_output_drains_to_eof() {
        let reader = Builder::new()
            .read(b"Accepted connection from ::1\n")
            .read(b"\xff partial")
            .read(b" line\n")
            .build();

        // Finishing at all is the assertion: the mock panics if left unread.
        forward_output(reader, 5202, OutputStream::Stdout).await;
    }
}
