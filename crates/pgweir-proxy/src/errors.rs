//! Session error classification and SQLSTATE codes

use crate::protocol::FrameError;

/// PostgreSQL SQLSTATE error codes used on rejection paths.
/// See: https://www.postgresql.org/docs/current/errcodes-appendix.html
pub mod sqlstate {
    // Class 08 — Connection Exception
    pub const CONNECTION_FAILURE: &str = "08006";

    // Class 53 — Insufficient Resources
    pub const TOO_MANY_CONNECTIONS: &str = "53300";
}

/// Why a session ended. Everything non-local inside a session funnels into
/// one of these; the session task performs teardown exactly once on the way
/// out.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Client or backend sent bytes that do not frame. No ErrorResponse is
    /// sent for a client-side violation.
    #[error("protocol violation: {0}")]
    Frame(#[from] FrameError),

    /// Could not establish a fresh backend connection.
    #[error("backend connect failed: {0}")]
    BackendConnect(std::io::Error),

    /// Parked in the wait queue past the configured timeout.
    #[error("timed out waiting for a backend connection")]
    WaitTimeout,

    /// Backend closed the connection while the session still needed it.
    #[error("backend closed connection")]
    BackendEof,

    /// Client hung up while the proxy was still establishing its backend.
    #[error("client closed connection")]
    ClientEof,

    /// Socket-level failure on either side.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
