use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Unknown id, or a transport that has already closed. Callers cannot tell
    /// these apart and should re-handshake.
    #[error("Session not found")]
    SessionNotFound,
    #[error("Session already initialized")]
    AlreadyInitialized,
    #[error("Session already has {0} active event stream(s)")]
    SubscriberLimit(usize),
    #[error("Invalid event id: {0}")]
    InvalidEventId(String),
    #[error("Could not allocate a unique session id after {0} attempts")]
    IdSpaceExhausted(usize),
}
