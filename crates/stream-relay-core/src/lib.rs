//! Session registry and per-session transport for JSON-RPC over streamable
//! HTTP. Nothing in this crate knows about HTTP; see the `stream-relay` crate
//! for the axum surface.

pub mod error;
pub mod events;
pub mod handler;
pub mod handshake;
pub mod jsonrpc;
pub mod metrics;
pub mod session;
pub mod transport;

pub use error::TransportError;
pub use events::{EventId, EventStream, ServerEvent};
pub use handler::{RequestHandler, SessionContext};
pub use handshake::is_initialize_request;
pub use session::{Session, SessionConfig, SessionId, SessionManager, SessionTable};
pub use transport::{CloseReason, Transport, TransportState};
