//! Container log streaming
//!
//! Adapts the agent's `Logs` chunk stream into a byte reader for the
//! kubelet log endpoint. The reader buffers whole lines, honors the byte
//! limit exactly, applies the since-filters (which a line-count tail
//! overrides) and optionally prefixes timestamps, caching any overflow
//! between reads.

use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tonic::{Status, Streaming};
use tracing::{debug, error};

use supernetes_proto::WorkloadLogChunk;

/// Options for a container log request, mirroring the kubelet query
/// parameters.
#[derive(Debug, Clone, Default)]
pub struct ContainerLogOpts {
    /// Keep the stream open and follow new lines
    pub follow: bool,
    /// Deliver only the latest `tail` lines, overrides the since-filters
    pub tail: i64,
    /// Stop after exactly this many bytes, when positive
    pub limit_bytes: i64,
    /// Skip lines older than this many seconds, when positive
    pub since_seconds: i64,
    /// Skip lines from before this instant
    pub since_time: Option<DateTime<Utc>>,
    /// Prefix each line with its RFC 3339 timestamp
    pub timestamps: bool,
    /// Logs of the previous container instance. Scheduler jobs are one-shot
    /// and can only be resubmitted under a fresh identifier, so there never
    /// is a previous instance; the flag is accepted and ignored.
    pub previous: bool,
}

/// Buffers traffic between the workload log stream and the calling reader
pub struct LogReader {
    opts: ContainerLogOpts,
    chunks: mpsc::Receiver<Result<WorkloadLogChunk, Status>>,
    cache: Vec<u8>,
    delivered: i64,
    done: bool,
    /// Keeps the request side of the RPC open while the reader lives
    _request_guard: Option<mpsc::Sender<supernetes_proto::WorkloadLogRequest>>,
}

impl LogReader {
    /// Spawn a receiver task pumping the given RPC stream and return the
    /// reader over it. The request sender is held so that dropping the
    /// reader closes the client's sending side, signalling the agent to
    /// stop.
    pub fn start(
        mut stream: Streaming<WorkloadLogChunk>,
        opts: ContainerLogOpts,
        request_guard: mpsc::Sender<supernetes_proto::WorkloadLogRequest>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1024);

        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return; // Reader is gone
                        }
                    }
                    Ok(None) => return, // Clean end of stream
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                }
            }
        });

        Self::from_channel(rx, opts, Some(request_guard))
    }

    /// Build a reader over an already-pumped chunk channel
    pub fn from_channel(
        chunks: mpsc::Receiver<Result<WorkloadLogChunk, Status>>,
        opts: ContainerLogOpts,
        request_guard: Option<mpsc::Sender<supernetes_proto::WorkloadLogRequest>>,
    ) -> Self {
        Self {
            opts,
            chunks,
            cache: Vec::new(),
            delivered: 0,
            done: false,
            _request_guard: request_guard,
        }
    }

    /// Whether a chunk passes the since-filters
    fn wanted(&self, chunk: &WorkloadLogChunk) -> bool {
        if self.opts.tail > 0 {
            return true; // Tailing a line count overrides the since-filters
        }

        let timestamp = chunk
            .timestamp
            .as_ref()
            .and_then(|t| DateTime::from_timestamp(t.seconds, t.nanos.max(0) as u32))
            .unwrap_or_default();

        if self.opts.since_seconds > 0 {
            let cutoff = Utc::now() - chrono::Duration::seconds(self.opts.since_seconds);
            if timestamp < cutoff {
                return false; // Log line too old
            }
        }

        if let Some(since) = self.opts.since_time {
            if timestamp < since {
                return false; // Log line too old
            }
        }

        true
    }

    /// Render a chunk into its output bytes
    fn render(&self, chunk: &WorkloadLogChunk) -> Vec<u8> {
        let mut line = Vec::with_capacity(chunk.line.len() + 1);

        if self.opts.timestamps {
            let timestamp = chunk
                .timestamp
                .as_ref()
                .and_then(|t| DateTime::from_timestamp(t.seconds, t.nanos.max(0) as u32))
                .unwrap_or_default();
            line.extend_from_slice(
                format!("{} ", timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)).as_bytes(),
            );
        }

        line.extend_from_slice(&chunk.line);
        line.push(b'\n');
        line
    }

    /// Move bytes from the cache into `buf`, applying the byte limit. Once
    /// the limit is reached the reader is closed and the rest is dropped.
    fn drain_cache(&mut self, buf: &mut ReadBuf<'_>) -> usize {
        let mut n = self.cache.len().min(buf.remaining());

        if self.opts.limit_bytes > 0 {
            let allowed = (self.opts.limit_bytes - self.delivered).max(0) as usize;
            if n >= allowed {
                n = allowed;
                self.done = true; // Output must not exceed the limit
            }
        }

        buf.put_slice(&self.cache[..n]);
        self.cache.drain(..n);
        self.delivered += n as i64;

        if self.done {
            self.cache.clear();
            self.chunks.close();
        }

        n
    }
}

impl AsyncRead for LogReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            // Serve cached data first
            if !self.cache.is_empty() {
                self.drain_cache(buf);
                return Poll::Ready(Ok(()));
            }

            if self.done {
                return Poll::Ready(Ok(())); // EOF
            }

            match self.chunks.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(Ok(())); // EOF
                }
                Poll::Ready(Some(Err(status))) => {
                    self.done = true;
                    self.cache.clear(); // Send nothing after an error

                    // EOF and cancellation are expected stream terminations
                    if status.code() == tonic::Code::Cancelled {
                        debug!("log stream cancelled");
                        return Poll::Ready(Ok(()));
                    }

                    error!(error = %status, "streaming logs failed");
                    return Poll::Ready(Err(std::io::Error::other(status)));
                }
                Poll::Ready(Some(Ok(chunk))) => {
                    if !self.wanted(&chunk) {
                        continue; // Filtered out, receive the next one
                    }

                    self.cache = self.render(&chunk);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::Timestamp;
    use tokio::io::AsyncReadExt;

    fn chunk(seconds: i64, line: &str) -> Result<WorkloadLogChunk, Status> {
        Ok(WorkloadLogChunk {
            timestamp: Some(Timestamp { seconds, nanos: 0 }),
            line: line.as_bytes().to_vec(),
        })
    }

    async fn read_all(mut reader: LogReader) -> (Vec<u8>, Option<std::io::Error>) {
        let mut out = Vec::new();
        let mut buf = [0u8; 7]; // Small buffer to exercise the cache
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => return (out, None),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => return (out, Some(e)),
            }
        }
    }

    #[tokio::test]
    async fn test_delivers_lines_with_newlines() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(1, "hello")).await.unwrap();
        tx.send(chunk(2, "world")).await.unwrap();
        drop(tx);

        let reader = LogReader::from_channel(rx, ContainerLogOpts::default(), None);
        let (out, err) = read_all(reader).await;
        assert!(err.is_none());
        assert_eq!(out, b"hello\nworld\n");
    }

    #[tokio::test]
    async fn test_limit_bytes_is_exact() {
        let (tx, rx) = mpsc::channel(8);
        for i in 0..10 {
            tx.send(chunk(i, "0123456789")).await.unwrap();
        }
        drop(tx);

        let opts = ContainerLogOpts {
            limit_bytes: 25,
            ..Default::default()
        };
        let reader = LogReader::from_channel(rx, opts, None);
        let (out, err) = read_all(reader).await;
        assert!(err.is_none());
        // Exactly min(limit, stream bytes)
        assert_eq!(out.len(), 25);
        assert_eq!(&out[..11], b"0123456789\n");
    }

    #[tokio::test]
    async fn test_limit_bytes_larger_than_stream() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(1, "abc")).await.unwrap();
        drop(tx);

        let opts = ContainerLogOpts {
            limit_bytes: 1000,
            ..Default::default()
        };
        let reader = LogReader::from_channel(rx, opts, None);
        let (out, _) = read_all(reader).await;
        assert_eq!(out, b"abc\n");
    }

    #[tokio::test]
    async fn test_since_time_filters_old_lines() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(100, "old")).await.unwrap();
        tx.send(chunk(200, "new")).await.unwrap();
        drop(tx);

        let opts = ContainerLogOpts {
            since_time: DateTime::from_timestamp(150, 0),
            ..Default::default()
        };
        let reader = LogReader::from_channel(rx, opts, None);
        let (out, _) = read_all(reader).await;
        assert_eq!(out, b"new\n");
    }

    #[tokio::test]
    async fn test_tail_overrides_since_filters() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(100, "old")).await.unwrap();
        drop(tx);

        let opts = ContainerLogOpts {
            tail: 5,
            since_time: DateTime::from_timestamp(150, 0),
            ..Default::default()
        };
        let reader = LogReader::from_channel(rx, opts, None);
        let (out, _) = read_all(reader).await;
        assert_eq!(out, b"old\n");
    }

    #[tokio::test]
    async fn test_timestamps_prefix() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(0, "hello")).await.unwrap();
        drop(tx);

        let opts = ContainerLogOpts {
            timestamps: true,
            ..Default::default()
        };
        let reader = LogReader::from_channel(rx, opts, None);
        let (out, _) = read_all(reader).await;
        assert_eq!(out, b"1970-01-01T00:00:00Z hello\n");
    }

    #[tokio::test]
    async fn test_cancellation_reads_as_eof() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(1, "partial")).await.unwrap();
        tx.send(Err(Status::cancelled("context canceled")))
            .await
            .unwrap();
        drop(tx);

        let reader = LogReader::from_channel(rx, ContainerLogOpts::default(), None);
        let (out, err) = read_all(reader).await;
        assert!(err.is_none());
        assert_eq!(out, b"partial\n");
    }

    #[tokio::test]
    async fn test_other_errors_surface() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(Err(Status::internal("boom"))).await.unwrap();
        drop(tx);

        let reader = LogReader::from_channel(rx, ContainerLogOpts::default(), None);
        let (out, err) = read_all(reader).await;
        assert!(out.is_empty());
        assert!(err.is_some());
    }
}
