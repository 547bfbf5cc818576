//! Error taxonomy for the LSP engine.

use std::io;
use std::time::Duration;

use crate::message::RequestId;
use crate::session::SessionState;

/// Errors returned by the transport, codec, correlation engine and session.
///
/// A JSON-RPC error object sent by the server is *not* an `LspError`; it is
/// returned as data in [`ResponsePayload::Error`](crate::ResponsePayload::Error).
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("transport closed")]
    TransportClosed,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("stream ended mid-frame: {0}")]
    TruncatedStream(String),

    #[error("invalid JSON-RPC payload: {0}")]
    InvalidPayload(String),

    #[error("initialize handshake failed: {0}")]
    HandshakeFailure(String),

    /// The request stays registered; pass `id` to `Session::abandon` to
    /// drop it.
    #[error("request {id} ({method}) timed out after {elapsed:?}")]
    TimedOut {
        id: RequestId,
        method: String,
        elapsed: Duration,
    },

    #[error("`{operation}` is not valid while the session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LspError {
    /// Framing and parse errors are confined to the read loop; the session
    /// keeps reading after one.
    #[must_use]
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_) | Self::TruncatedStream(_) | Self::InvalidPayload(_)
        )
    }
}

/// Write errors that mean the peer is gone rather than a local failure.
pub(crate) fn is_closed_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
