//! Error types for the session layer.

use thiserror::Error;

/// Errors that can occur while driving a session state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The peer violated the protocol state machine: an acknowledgment for
    /// an identifier that is not in flight, an acknowledgment that does not
    /// match the stage the identifier is in, or a packet type that is not
    /// valid in the current connection state. Always fatal to the session.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// All 65535 packet identifiers are in flight. Not fatal: the caller
    /// should queue or reject the request and retry after an acknowledgment
    /// frees an identifier.
    #[error("packet identifier space exhausted")]
    IdentifierSpaceExhausted,

    /// A packet arrived (or a request was made) while no session is
    /// established.
    #[error("session not established")]
    SessionNotEstablished,

    /// The packet is structurally invalid for its type, e.g. a packet that
    /// requires an identifier carrying the reserved value 0.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// An identifier was registered twice without being released.
    #[error("packet identifier {0} is already in flight")]
    DuplicateIdentifier(u16),

    /// Configuration could not be parsed or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether this error must terminate the session. Violations and
    /// malformed packets indicate a non-conformant peer; identifier
    /// exhaustion and configuration problems do not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_) | Self::MalformedPacket(_)
        )
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
