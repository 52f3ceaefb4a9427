//! Loopback MJPEG HTTP server.
//!
//! Accepts TCP connections on 127.0.0.1, discards the request head,
//! and answers every path with an unbounded
//! `multipart/x-mixed-replace` JPEG stream:
//!
//! ```text
//! HTTP/1.1 200 OK
//! Content-Type: multipart/x-mixed-replace; boundary=--mjpegstream
//!
//! --mjpegstream
//! Content-Type: image/jpeg
//! Content-Length: <N>
//!
//! <N JPEG bytes>
//! --mjpegstream
//! ...
//! ```
//!
//! Each client gets its own task and its own cursor into the shared
//! [`FrameRing`]; a slow client lags and silently loses evicted
//! frames rather than ever blocking the encoder side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::frame::EncodedFrame;
use crate::ring::FrameRing;

/// Multipart boundary token, as it appears on the wire.
const BOUNDARY: &str = "--mjpegstream";

/// Documented stream path (any path is served identically).
pub const STREAM_PATH: &str = "/stream.mjpeg";

/// Upper bound on request bytes read before streaming starts.
const MAX_REQUEST_BYTES: usize = 4096;

/// Idle delay while a client waits for the ring to advance.
const IDLE_POLL: Duration = Duration::from_millis(1);

const RESPONSE_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: multipart/x-mixed-replace; boundary=--mjpegstream\r\n\
Cache-Control: no-cache, no-store, must-revalidate\r\n\
Connection: close\r\n\
\r\n";

// ── MjpegServer ──────────────────────────────────────────────────

/// The HTTP side of the pipeline: listener, acceptor task, and the
/// frame ring shared with the encoder side.
#[derive(Debug)]
pub struct MjpegServer {
    ring: Arc<FrameRing>,
    port: u16,
    running: Arc<AtomicBool>,
    acceptor: JoinHandle<()>,
}

impl MjpegServer {
    /// Bind 127.0.0.1 at `port` (0 = ephemeral) and start accepting.
    /// Returns the server with the actually-bound port.
    pub async fn start(port: u16, ring: Arc<FrameRing>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| ServerError::HttpBindFailed { port, source })?;
        let bound_port = listener
            .local_addr()
            .map_err(|source| ServerError::HttpBindFailed { port, source })?
            .port();

        let running = Arc::new(AtomicBool::new(true));
        let acceptor = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&ring),
            Arc::clone(&running),
        ));

        info!("mjpeg server listening on 127.0.0.1:{bound_port}");
        Ok(Self {
            ring,
            port: bound_port,
            running,
            acceptor,
        })
    }

    /// The actually-bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The stream URL external consumers open.
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, STREAM_PATH)
    }

    /// Append an encoded frame to the shared ring.
    pub fn submit(&self, frame: EncodedFrame) {
        self.ring.push(Arc::new(frame));
    }

    /// Stop accepting and wind down client loops.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.acceptor.abort();
    }
}

// ── Acceptor ─────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, ring: Arc<FrameRing>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept error: {e}");
                continue;
            }
        };
        debug!("client connected from {peer}");

        let ring = Arc::clone(&ring);
        let running = Arc::clone(&running);
        tokio::spawn(async move {
            match serve_client(stream, ring, running).await {
                Ok(()) => debug!("client {peer} finished"),
                Err(e) => debug!("client {peer} closed: {}", ServerError::ClientWrite(e)),
            }
        });
    }
}

// ── Per-client loop ──────────────────────────────────────────────

/// Serve one accepted connection until it errors or the server stops.
async fn serve_client(
    mut stream: TcpStream,
    ring: Arc<FrameRing>,
    running: Arc<AtomicBool>,
) -> std::io::Result<()> {
    discard_request(&mut stream).await?;
    stream.write_all(RESPONSE_HEAD).await?;

    // Warm-up: replay whatever the ring currently holds so the client
    // has an image immediately, then continue from the latest index.
    let (warmup, mut cursor) = ring.snapshot();
    for frame in &warmup {
        write_part(&mut stream, frame).await?;
    }
    stream.flush().await?;

    while running.load(Ordering::SeqCst) {
        let (frames, next) = ring.since(cursor);
        cursor = next;
        if frames.is_empty() {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        }
        for frame in &frames {
            write_part(&mut stream, frame).await?;
        }
        stream.flush().await?;
    }
    Ok(())
}

/// Read and discard the request head up to the first blank line,
/// bounded to [`MAX_REQUEST_BYTES`]. The path is intentionally
/// ignored; every request gets the stream.
async fn discard_request(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed before sending a request",
            ));
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") || head.len() >= MAX_REQUEST_BYTES {
            return Ok(());
        }
    }
}

/// Write one multipart frame. The boundary precedes every part; no
/// terminating boundary exists because the stream is unbounded.
async fn write_part<W>(writer: &mut W, frame: &EncodedFrame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!(
        "{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.data.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&frame.data).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> EncodedFrame {
        EncodedFrame::new(payload.to_vec(), 2, 2)
    }

    #[tokio::test]
    async fn part_framing_is_exact() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let f = frame(&[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        write_part(&mut cursor, &f).await.unwrap();
        let buf = cursor.into_inner();

        let expected_prefix =
            b"--mjpegstream\r\nContent-Type: image/jpeg\r\nContent-Length: 6\r\n\r\n";
        assert!(buf.starts_with(expected_prefix));
        assert_eq!(&buf[expected_prefix.len()..expected_prefix.len() + 6], f.data.as_slice());
        assert!(buf.ends_with(b"\r\n"));
    }

    #[tokio::test]
    async fn bind_is_loopback_and_ephemeral() {
        let ring = Arc::new(FrameRing::new(5));
        let server = MjpegServer::start(0, ring).await.unwrap();
        assert!(server.port() > 0);
        assert_eq!(
            server.url(),
            format!("http://127.0.0.1:{}/stream.mjpeg", server.port())
        );
        server.stop();
    }

    #[tokio::test]
    async fn bind_conflict_reports_http_bind_failed() {
        let ring = Arc::new(FrameRing::new(5));
        let first = MjpegServer::start(0, Arc::clone(&ring)).await.unwrap();
        let err = MjpegServer::start(first.port(), ring).await.unwrap_err();
        assert!(matches!(err, ServerError::HttpBindFailed { .. }));
        first.stop();
    }
}
