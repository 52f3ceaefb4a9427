//! Domain-specific error types for the streaming server.
//!
//! All fallible operations return `Result<T, ServerError>`. Startup
//! errors are fatal (the driver logs them and exits 1); everything
//! raised per frame, per client, per line or per touch is recoverable
//! and handled at the site that observes it.

use thiserror::Error;

/// The canonical error type for the streaming server.
#[derive(Debug, Error)]
pub enum ServerError {
    // ── Startup (fatal) ──────────────────────────────────────────
    /// A command-line argument could not be interpreted.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// A required private framework bundle could not be loaded.
    #[error("framework missing: {0}")]
    FrameworkMissing(String),

    /// No simulator device matched the requested UDID.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The device exposes no IO port with a readable display surface.
    #[error("no display surface on device {0}")]
    NoDisplaySurface(String),

    /// The HTTP listener could not bind its loopback port.
    #[error("http bind failed on port {port}: {source}")]
    HttpBindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    // ── Per frame (recoverable) ──────────────────────────────────
    /// The hardware codec did not complete within its deadline.
    #[error("hardware encode timed out after {0} ms")]
    EncodeTimeout(u64),

    /// The codec reported a failure for one frame.
    #[error("encode failed: {0}")]
    EncodeFailure(String),

    // ── Per client (recoverable) ─────────────────────────────────
    /// A client socket write failed; only that client is closed.
    #[error("client write error: {0}")]
    ClientWrite(#[from] std::io::Error),

    // ── Per line (recoverable) ───────────────────────────────────
    /// A stdin line did not match the command grammar.
    #[error("invalid command: {0}")]
    CommandParse(String),

    // ── Per touch (recoverable) ──────────────────────────────────
    /// The HID client rejected a message. Injection is best-effort.
    #[error("hid send failed: {0}")]
    HidSend(String),
}

impl ServerError {
    /// Whether this error must terminate the process at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServerError::BadArgument(_)
                | ServerError::FrameworkMissing(_)
                | ServerError::DeviceNotFound(_)
                | ServerError::NoDisplaySurface(_)
                | ServerError::HttpBindFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ServerError::DeviceNotFound("X".into()).is_fatal());
        assert!(ServerError::FrameworkMissing("CoreSimulator".into()).is_fatal());
        assert!(!ServerError::EncodeTimeout(100).is_fatal());
        assert!(!ServerError::CommandParse("touch banana".into()).is_fatal());
    }

    #[test]
    fn display_carries_context() {
        let e = ServerError::HttpBindFailed {
            port: 8081,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        let msg = e.to_string();
        assert!(msg.contains("8081"));

        let e = ServerError::EncodeTimeout(100);
        assert!(e.to_string().contains("100"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: ServerError = io_err.into();
        assert!(matches!(e, ServerError::ClientWrite(_)));
    }
}
