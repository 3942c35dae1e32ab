// src/proxy/stream.rs
//
// Relays an SSE response from a pooled backend socket to the client. The
// client side is a hyper body channel, so chunk framing toward the client
// (including the terminating zero chunk) is produced by hyper; this module
// is responsible for the backend side: bounded reads, de-chunking the
// backend's own framing, sentinel detection, and disconnect handling.
use super::http1::ChunkedDecoder;
use crate::config::StreamConfig;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// `data: [DONE]` and a bare `[DONE]` both contain this needle, so one scan
/// covers both sentinel spellings.
const SENTINEL: &[u8] = b"[DONE]";

#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub bytes_forwarded: u64,
    pub duration: Duration,
    pub done_marker_seen: bool,
    pub backend_eof: bool,
    pub client_disconnected: bool,
    pub error: Option<String>,
}

impl StreamOutcome {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Sentinel scanner that survives a marker split across two reads by
/// carrying the last few bytes of the previous buffer.
struct DoneScanner {
    tail: Vec<u8>,
}

impl DoneScanner {
    fn new() -> Self {
        Self { tail: Vec::new() }
    }

    fn scan(&mut self, data: &[u8]) -> bool {
        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(data);
        let found = window.windows(SENTINEL.len()).any(|w| w == SENTINEL);
        let keep = window.len().min(SENTINEL.len() - 1);
        self.tail = window[window.len() - keep..].to_vec();
        found
    }
}

pub struct StreamRelay {
    config: StreamConfig,
}

impl StreamRelay {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    /// Pump backend bytes into the client body channel until the stream
    /// ends: `[DONE]` sentinel, backend EOF, an error, or the client going
    /// away (surfaced as a failed send).
    ///
    /// `initial` is whatever arrived with the response header;
    /// `backend_chunked` says whether those bytes (and the rest of the body)
    /// carry the backend's own chunked framing, which is stripped so the
    /// client receives pure SSE payload.
    pub async fn run<R>(
        &self,
        backend: &mut R,
        initial: Bytes,
        backend_chunked: bool,
        mut sender: hyper::body::Sender,
    ) -> StreamOutcome
    where
        R: AsyncRead + Unpin,
    {
        let start = Instant::now();
        let mut outcome = StreamOutcome::default();
        let mut decoder = backend_chunked.then(ChunkedDecoder::new);
        let mut scanner = DoneScanner::new();
        let mut buf = vec![0u8; self.config.buffer_size.max(1)];

        let mut finished = false;

        if !initial.is_empty() {
            finished = self
                .relay_bytes(&initial, &mut decoder, &mut scanner, &mut sender, &mut outcome)
                .await;
        }

        while !finished {
            let read = match timeout(self.config.read_timeout(), backend.read(&mut buf)).await {
                Err(_) => {
                    outcome.error = Some("streaming read timed out".to_string());
                    warn!(timeout = ?self.config.read_timeout(), "Streaming read timed out");
                    break;
                }
                Ok(Err(e)) => {
                    outcome.error = Some(format!("backend read error: {e}"));
                    warn!(error = %e, "Streaming read failed");
                    break;
                }
                Ok(Ok(0)) => {
                    outcome.backend_eof = true;
                    debug!("Backend closed the stream");
                    break;
                }
                Ok(Ok(n)) => n,
            };

            finished = self
                .relay_bytes(&buf[..read], &mut decoder, &mut scanner, &mut sender, &mut outcome)
                .await;
        }

        if outcome.error.is_some() {
            // Abort instead of a clean final chunk so the client can tell
            // the stream was truncated.
            sender.abort();
        }

        outcome.duration = start.elapsed();
        info!(
            bytes = outcome.bytes_forwarded,
            duration_ms = outcome.duration.as_millis() as u64,
            done = outcome.done_marker_seen,
            backend_eof = outcome.backend_eof,
            client_disconnected = outcome.client_disconnected,
            "Stream complete"
        );
        outcome
    }

    /// Decode, scan, and forward one buffer. Returns true when the relay
    /// should stop.
    async fn relay_bytes(
        &self,
        raw: &[u8],
        decoder: &mut Option<ChunkedDecoder>,
        scanner: &mut DoneScanner,
        sender: &mut hyper::body::Sender,
        outcome: &mut StreamOutcome,
    ) -> bool {
        let payload: Bytes = match decoder {
            Some(decoder) => {
                let mut decoded = Vec::with_capacity(raw.len());
                if let Err(e) = decoder.decode(raw, &mut decoded) {
                    outcome.error = Some(format!("backend chunk framing error: {e}"));
                    return true;
                }
                Bytes::from(decoded)
            }
            None => Bytes::copy_from_slice(raw),
        };

        let done = self.config.detect_done_marker && !payload.is_empty() && scanner.scan(&payload);

        if !payload.is_empty() {
            let len = payload.len() as u64;
            if sender.send_data(payload).await.is_err() {
                outcome.client_disconnected = true;
                debug!("Client disconnected during stream");
                return true;
            }
            outcome.bytes_forwarded += len;
        }

        if done {
            outcome.done_marker_seen = true;
            debug!("Stream sentinel received");
            return true;
        }

        if let Some(decoder) = decoder {
            if decoder.is_done() {
                outcome.backend_eof = true;
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn relay(buffer_size: usize) -> StreamRelay {
        StreamRelay::new(StreamConfig {
            buffer_size,
            read_timeout_secs: 5,
            detect_done_marker: true,
            forward_chunked: true,
        })
    }

    async fn collect(body: hyper::Body) -> Vec<u8> {
        hyper::body::to_bytes(body).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn forwards_until_done_sentinel() {
        let (sender, body) = hyper::Body::channel();
        let (mut backend_write, mut backend_read) = tokio::io::duplex(4096);

        let events = b"data: {\"x\":1}\n\ndata: {\"x\":2}\n\ndata: [DONE]\n\n";
        backend_write.write_all(events).await.unwrap();

        let relay = relay(8192);
        let task = tokio::spawn(async move {
            relay.run(&mut backend_read, Bytes::new(), false, sender).await
        });

        let received = collect(body).await;
        let outcome = task.await.unwrap();

        assert_eq!(received, events);
        assert!(outcome.done_marker_seen);
        assert!(!outcome.client_disconnected);
        assert_eq!(outcome.bytes_forwarded, events.len() as u64);
    }

    #[tokio::test]
    async fn initial_bytes_are_the_first_chunk() {
        let (sender, body) = hyper::Body::channel();
        let (mut backend_write, mut backend_read) = tokio::io::duplex(4096);

        backend_write
            .write_all(b"data: [DONE]\n\n")
            .await
            .unwrap();

        let relay = relay(8192);
        let initial = Bytes::from_static(b"data: early\n\n");
        let task = tokio::spawn(async move {
            relay.run(&mut backend_read, initial, false, sender).await
        });

        let received = collect(body).await;
        let outcome = task.await.unwrap();
        assert_eq!(received, b"data: early\n\ndata: [DONE]\n\n");
        assert!(outcome.done_marker_seen);
    }

    #[tokio::test]
    async fn sentinel_split_across_reads_is_detected() {
        let (sender, body) = hyper::Body::channel();
        let (mut backend_write, mut backend_read) = tokio::io::duplex(16);

        let relay = relay(4);
        let task = tokio::spawn(async move {
            relay.run(&mut backend_read, Bytes::new(), false, sender).await
        });

        // Tiny writes so [DONE] straddles read boundaries.
        for piece in [&b"data: [DO"[..], &b"NE]\n\n"[..]] {
            backend_write.write_all(piece).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let received = collect(body).await;
        let outcome = task.await.unwrap();
        // The relay stops with the read that completed the sentinel, so
        // bytes after it may be cut off; the sentinel itself must be intact.
        assert!(String::from_utf8(received).unwrap().contains("data: [DONE]"));
        assert!(outcome.done_marker_seen);
    }

    #[tokio::test]
    async fn backend_chunked_framing_is_stripped() {
        let (sender, body) = hyper::Body::channel();
        let (mut backend_write, mut backend_read) = tokio::io::duplex(4096);

        backend_write
            .write_all(b"f\r\ndata: {\"x\":1}\n\n\r\ne\r\ndata: [DONE]\n\n\r\n0\r\n\r\n")
            .await
            .unwrap();

        let relay = relay(8192);
        let task = tokio::spawn(async move {
            relay.run(&mut backend_read, Bytes::new(), true, sender).await
        });

        let received = collect(body).await;
        let outcome = task.await.unwrap();
        assert_eq!(received, b"data: {\"x\":1}\n\ndata: [DONE]\n\n");
        assert!(outcome.done_marker_seen);
    }

    #[tokio::test]
    async fn backend_eof_ends_the_stream() {
        let (sender, body) = hyper::Body::channel();
        let (mut backend_write, mut backend_read) = tokio::io::duplex(4096);

        backend_write.write_all(b"data: a\n\n").await.unwrap();
        drop(backend_write);

        let relay = relay(8192);
        let task = tokio::spawn(async move {
            relay.run(&mut backend_read, Bytes::new(), false, sender).await
        });

        let received = collect(body).await;
        let outcome = task.await.unwrap();
        assert_eq!(received, b"data: a\n\n");
        assert!(outcome.backend_eof);
        assert!(!outcome.done_marker_seen);
    }

    #[tokio::test]
    async fn client_disconnect_stops_the_relay() {
        let (sender, body) = hyper::Body::channel();
        let (mut backend_write, mut backend_read) = tokio::io::duplex(64);

        drop(body);

        let relay = relay(8192);
        let task = tokio::spawn(async move {
            relay.run(&mut backend_read, Bytes::new(), false, sender).await
        });

        // Keep feeding; the relay should notice the dead client quickly.
        let _ = backend_write.write_all(b"data: a\n\ndata: b\n\n").await;

        let outcome = task.await.unwrap();
        assert!(outcome.client_disconnected);
    }

    #[test]
    fn scanner_keeps_a_tail_between_buffers() {
        let mut scanner = DoneScanner::new();
        assert!(!scanner.scan(b"data: [DO"));
        assert!(scanner.scan(b"NE]"));

        let mut scanner = DoneScanner::new();
        assert!(!scanner.scan(b"data: {\"x\":1}"));
        assert!(scanner.scan(b"data: [DONE]\n\n"));
    }
}
