use std::io;

/// A line or datagram that could not be decoded.
///
/// Recoverable at the message boundary: callers drop the offending message
/// and keep their loop running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command in {0:?}")]
    UnknownCommand(String),

    #[error("{tag} expects {expected} field(s), found {found}")]
    MalformedFields {
        tag: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("field {0:?} contains a reserved character")]
    InvalidField(String),

    #[error("{tag} payload is missing the ':' separator")]
    MissingSeparator { tag: &'static str },

    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid datagram endpoint {0:?}")]
    InvalidAddress(String),
}

/// Failures a client can hit before its loops start or while they run.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("screen name '{0}' is already taken")]
    NameConflict(String),

    #[error("unexpected reply from server: {0}")]
    UnexpectedReply(String),

    #[error("server closed the connection")]
    ConnectionClosed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
