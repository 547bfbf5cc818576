//! Client-side engine for talking to language servers over stdio.
//!
//! Layers, bottom-up: [`codec`] frames bytes, [`message`] classifies JSON-RPC
//! payloads, [`transport`] owns the child process, [`correlation`] matches
//! responses to requests, and [`Session`] drives the LSP lifecycle on top.
//! Nothing here knows about specific LSP methods beyond the handshake.

pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod message;
pub mod session;
pub mod transport;

pub use codec::{Frame, FrameReader, FrameWriter};
pub use config::{ServerConfig, Timeouts};
pub use correlation::{Awaited, Correlator, DiagnosticEvent, Dispatch, ResponseSlot};
pub use error::LspError;
pub use message::{
    Message, Notification, RemoteError, Request, RequestId, Response, ResponsePayload,
};
pub use session::{Session, SessionState};
pub use transport::{Inbound, InboundEvent, ProcessHandle, ProcessState, Received, Transport};
