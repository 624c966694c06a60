use std::fmt;

/// The error taxonomy surfaced by the core.
///
/// `Good` (success) is represented as `Ok(())` everywhere an operation
/// returns a `Result`; [`Status`] below is the variant of this taxonomy that
/// crosses the application-callback boundary, where a "no error" case still
/// needs to be representable as a value.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required parameter was missing, or present with the wrong type.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not legal in the current state (e.g. nested `run`,
    /// `free` while `Started`).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An Event Source with that name is already registered on this loop.
    #[error("event source name already registered: {0}")]
    NameConflict(String),

    /// No connection, timer, or Event Source exists with the given id/name.
    #[error("not found: {0}")]
    NotFound(String),

    /// Allocation, file-descriptor exhaustion, or address-in-use.
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// An outbound connect failed at the socket layer.
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    /// The connection is closed (peer-initiated or local).
    #[error("connection closed")]
    ConnectionClosed,

    /// Reentrancy violation or otherwise inconsistent internal state.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Status code delivered through a connection callback.
///
/// Unlike [`Error`], `Good` is a representable value here: callbacks receive
/// exactly one status per invocation and must be able to say "this call
/// succeeded" as a value rather than via the absence of an `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Good,
    ConnectionRejected,
    ConnectionClosed,
}

impl Status {
    pub fn is_good(self) -> bool {
        matches!(self, Status::Good)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Good => write!(f, "good"),
            Status::ConnectionRejected => write!(f, "connection rejected"),
            Status::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        match err {
            Error::ConnectionRejected(_) => Status::ConnectionRejected,
            Error::ConnectionClosed => Status::ConnectionClosed,
            _ => Status::ConnectionClosed,
        }
    }
}
