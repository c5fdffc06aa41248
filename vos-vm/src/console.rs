//! Serial console stream.
//!
//! QEMU exposes the guest's first serial port as a TCP server. The stream
//! connects with bounded retries, splits the byte stream into lines and ends
//! when the peer closes, a read fails or the run's liveness is revoked.

use std::fmt;

use futures::Stream;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::{Backoff, ConsoleSettings, Liveness};

/// Longest partial line kept before it is flushed without a newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Everything the console stream reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// The socket is open. `attempts` counts connection tries, this one included.
    Connected { attempts: u32 },
    /// One non-empty, trimmed line of guest output.
    Line(String),
    /// Every connection attempt failed; no lines will follow.
    Unavailable { attempts: u32 },
    /// The stream ended after a successful connection.
    Closed { reason: CloseReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ReadError(String),
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Accumulates console bytes and yields complete lines.
///
/// Bytes are decoded leniently (invalid UTF-8 becomes U+FFFD), lines are
/// trimmed and empty ones dropped. A partial line is held until its newline
/// arrives, unless it grows past [`MAX_LINE_BYTES`].
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for chunk in bytes.split_inclusive(|&b| b == b'\n') {
            self.pending.extend_from_slice(chunk);
            if chunk.ends_with(b"\n") || self.pending.len() >= MAX_LINE_BYTES {
                let raw = std::mem::take(&mut self.pending);
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();
                if !line.is_empty() {
                    lines.push(line.to_owned());
                }
            }
        }
        lines
    }

    /// Bytes of the unfinished line.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

/// Lazily connect to the console at `host:port` and stream its events.
///
/// Nothing happens until the stream is polled. Exactly one terminal event
/// is produced: [`ConsoleEvent::Unavailable`] if no connection was made, or
/// [`ConsoleEvent::Closed`] otherwise. A revocation before connecting ends
/// the stream without a terminal event. An unfinished last line is dropped.
pub fn console_stream(
    host: String,
    port: u16,
    liveness: Liveness,
    settings: ConsoleSettings,
) -> impl Stream<Item = ConsoleEvent> + Send + 'static {
    async_stream::stream! {
        let mut backoff = Backoff::new(
            settings.initial_delay,
            settings.backoff_factor,
            settings.max_delay,
        );
        let mut socket = None;
        let mut attempts = 0;

        while attempts < settings.max_attempts {
            // QEMU opens the listener shortly after spawn; wait before each try.
            if !liveness.sleep(backoff.next_delay()).await {
                return;
            }
            attempts += 1;

            match tokio::time::timeout(
                settings.connect_timeout,
                TcpStream::connect((host.as_str(), port)),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    socket = Some(stream);
                    break;
                }
                Ok(Err(e)) => tracing::debug!(attempt = attempts, port, "console connect failed: {e}"),
                Err(_) => tracing::debug!(attempt = attempts, port, "console connect timed out"),
            }
        }

        let mut socket = match socket {
            Some(socket) => socket,
            None => {
                yield ConsoleEvent::Unavailable { attempts };
                return;
            }
        };
        yield ConsoleEvent::Connected { attempts };

        let mut lines = LineBuffer::new();
        let mut buf = vec![0u8; settings.read_buffer.max(1)];
        let reason = loop {
            let read = tokio::select! {
                read = socket.read(&mut buf) => Some(read),
                () = liveness.revoked() => None,
            };
            match read {
                None => break CloseReason::Cancelled,
                Some(Ok(0)) => break CloseReason::PeerClosed,
                Some(Ok(n)) => {
                    for line in lines.push(&buf[..n]) {
                        yield ConsoleEvent::Line(line);
                    }
                }
                Some(Err(e)) => break CloseReason::ReadError(e.to_string()),
            }
        };
        drop(socket);
        yield ConsoleEvent::Closed { reason };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use proptest::prelude::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    fn fast_settings(max_attempts: u32) -> ConsoleSettings {
        ConsoleSettings {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            ..ConsoleSettings::default()
        }
    }

    #[test]
    fn line_buffer_joins_split_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"AB").is_empty(), "no newline yet");
        assert_eq!(buf.pending(), b"AB");
        assert_eq!(buf.push(b"CD\n"), ["ABCD"]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn line_buffer_trims_and_drops_blank_lines() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"  boot ok \r\n\n   \nnext\n");
        assert_eq!(lines, ["boot ok", "next"]);
    }

    #[test]
    fn line_buffer_replaces_invalid_utf8() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"bad \xff byte\n");
        assert_eq!(lines, ["bad \u{fffd} byte"]);
    }

    #[test]
    fn line_buffer_flushes_oversized_partial_line() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(&vec![b'x'; MAX_LINE_BYTES + 10]);
        assert_eq!(lines.len(), 1, "one flush past the cap");
        assert_eq!(lines[0].len(), MAX_LINE_BYTES + 10);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn line_buffer_splits_a_capped_line_across_reads() {
        // The cap is checked per read, so a line that fills it before its
        // newline arrives is delivered as two lines.
        let mut buf = LineBuffer::new();
        let head = buf.push(&vec![b'x'; MAX_LINE_BYTES]);
        assert_eq!(head.len(), 1);
        assert_eq!(head[0].len(), MAX_LINE_BYTES);
        assert_eq!(buf.push(b"tail\n"), ["tail"]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn line_buffer_keeps_a_line_that_ends_in_the_read_that_crosses_the_cap() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(&vec![b'x'; MAX_LINE_BYTES - 5]).is_empty());
        let lines = buf.push(b"yyyyyyyyyy\n");
        assert_eq!(lines.len(), 1, "newline in the same read keeps it whole");
        assert_eq!(lines[0].len(), MAX_LINE_BYTES + 5);
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_lines(
            text in "[a-z \n]{0,200}",
            split in 0usize..200,
        ) {
            let bytes = text.as_bytes();
            let split = split.min(bytes.len());

            let mut whole = LineBuffer::new();
            let expected = whole.push(bytes);

            let mut parts = LineBuffer::new();
            let mut got = parts.push(&bytes[..split]);
            got.extend(parts.push(&bytes[split..]));

            prop_assert_eq!(got, expected);
        }
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => l,
            Err(e) => panic!("bind: {e}"),
        };
        let port = match listener.local_addr() {
            Ok(a) => a.port(),
            Err(e) => panic!("local_addr: {e}"),
        };
        (listener, port)
    }

    #[tokio::test]
    async fn stream_yields_lines_then_peer_closed() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            let _ = sock.write_all(b"AB").await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = sock.write_all(b"CD\n\n  EF  \r\npartial").await;
        });

        let events: Vec<ConsoleEvent> =
            console_stream("127.0.0.1".to_owned(), port, Liveness::new(), fast_settings(5))
                .collect()
                .await;

        assert_eq!(
            events,
            [
                ConsoleEvent::Connected { attempts: 1 },
                ConsoleEvent::Line("ABCD".to_owned()),
                ConsoleEvent::Line("EF".to_owned()),
                ConsoleEvent::Closed { reason: CloseReason::PeerClosed },
            ]
        );
    }

    #[tokio::test]
    async fn stream_reports_unavailable_after_bounded_attempts() {
        let (listener, port) = listener().await;
        drop(listener);

        let events: Vec<ConsoleEvent> =
            console_stream("127.0.0.1".to_owned(), port, Liveness::new(), fast_settings(3))
                .collect()
                .await;

        assert_eq!(events, [ConsoleEvent::Unavailable { attempts: 3 }]);
    }

    #[tokio::test]
    async fn stream_ends_promptly_when_liveness_revoked() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let accepted = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(accepted);
        });

        let liveness = Liveness::new();
        let stream = console_stream("127.0.0.1".to_owned(), port, liveness.clone(), fast_settings(5));
        tokio::pin!(stream);

        assert_eq!(stream.next().await, Some(ConsoleEvent::Connected { attempts: 1 }));
        liveness.revoke();

        let next = tokio::time::timeout(Duration::from_secs(2), stream.next()).await;
        assert_eq!(
            next.ok().flatten(),
            Some(ConsoleEvent::Closed { reason: CloseReason::Cancelled })
        );
        server.abort();
    }
}
