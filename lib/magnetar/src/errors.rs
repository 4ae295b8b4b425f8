use crate::result_code::ResultCode;
use crate::txn::CommitStage;
use std::fmt;
use std::io;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the client can surface, classified into exactly one kind.
#[derive(Debug)]
pub enum ErrorKind {
    /// Server returned a result code not otherwise specialized.
    Server(ResultCode),
    /// Socket or total budget exhausted. `client` distinguishes a
    /// client-side deadline from a server-reported timeout.
    Timeout { client: bool },
    /// Pre- or mid-transport I/O failure.
    Connection(io::ErrorKind, String),
    /// Malformed server response.
    Parse(String),
    /// Node circuit breaker open; the retry loop should prefer another node.
    Backoff,
    /// Caller misuse detected before any I/O.
    InvalidArgument(String),
    /// The per-node connection cap was reached.
    NoMoreConnections,
    /// The routing layer could not supply a node.
    InvalidNode,
    /// A streaming command was terminated by the caller.
    Terminated,
    /// Cancellation token observed; not a timeout.
    Cancelled,
    /// UDF execution failed server-side; carries the parsed failure text.
    Udf(String),
    /// Multi-record transaction commit/abort composite failure.
    Commit(Box<CommitFailure>),
}

/// Composite cause attached to a failed commit or abort, carrying the
/// per-record outcomes of the verify and roll passes for diagnosis.
#[derive(Debug)]
pub struct CommitFailure {
    pub stage: CommitStage,
    pub verify_records: Vec<crate::batch::BatchRecord>,
    pub roll_records: Vec<crate::batch::BatchRecord>,
    pub cause: Error,
    /// Failure of the secondary roll-back/close issued while unwinding.
    pub secondary: Option<Error>,
}

/// Timeout configuration in force when a command finally failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicySnapshot {
    pub socket_timeout: Duration,
    pub total_timeout: Duration,
    pub max_retries: u32,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    /// Name of the node the final attempt ran against, when one was picked.
    pub node: Option<String>,
    /// 1-based attempt count at the moment the error surfaced.
    pub iteration: u32,
    /// True when a write may or may not have been applied at the server.
    pub in_doubt: bool,
    pub policy: PolicySnapshot,
}

impl Error {
    #[inline]
    pub fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            node: None,
            iteration: 0,
            in_doubt: false,
            policy: PolicySnapshot::default(),
        }
    }

    #[inline]
    pub fn server(code: ResultCode) -> Error {
        Error::new(ErrorKind::Server(code))
    }

    #[inline]
    pub fn parse<S: Into<String>>(what: S) -> Error {
        Error::new(ErrorKind::Parse(what.into()))
    }

    #[inline]
    pub fn invalid_argument<S: Into<String>>(what: S) -> Error {
        Error::new(ErrorKind::InvalidArgument(what.into()))
    }

    /// Server result code carried by this error, if it is a server error.
    #[inline]
    pub fn result_code(&self) -> Option<ResultCode> {
        match self.kind {
            ErrorKind::Server(code) => Some(code),
            _ => None,
        }
    }

    /// True when the failure left the connection stream clean, so it may be
    /// returned to the pool. Server responses are read in full before being
    /// classified; everything transport- or parse-shaped taints the stream.
    #[inline]
    pub fn keep_connection(&self) -> bool {
        match self.kind {
            ErrorKind::Server(_) | ErrorKind::Udf(_) => true,
            _ => false,
        }
    }

    /// True when the retry loop may run another attempt for this failure.
    #[inline]
    pub fn retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Server(ResultCode::Timeout) => true,
            ErrorKind::Server(ResultCode::DeviceOverload) => true,
            ErrorKind::Server(_) | ErrorKind::Udf(_) => false,
            ErrorKind::Timeout { .. } => true,
            ErrorKind::Connection(..) => true,
            ErrorKind::Parse(_) => true,
            ErrorKind::Backoff => true,
            ErrorKind::NoMoreConnections => true,
            ErrorKind::InvalidArgument(_)
            | ErrorKind::InvalidNode
            | ErrorKind::Terminated
            | ErrorKind::Cancelled
            | ErrorKind::Commit(_) => false,
        }
    }

    /// True when the failure was a client-side socket deadline. Those skip
    /// the between-retry sleep since the budget already drained.
    #[inline]
    pub fn client_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout { client: true })
    }

    /// True when the failure cannot have applied at the server: the request
    /// either never hit the wire or was rejected with a definitive response.
    #[inline]
    pub fn definitely_not_applied(&self) -> bool {
        match self.kind {
            ErrorKind::Server(ResultCode::Timeout) => false,
            ErrorKind::Server(_) | ErrorKind::Udf(_) => true,
            ErrorKind::Backoff | ErrorKind::NoMoreConnections | ErrorKind::InvalidNode => true,
            ErrorKind::InvalidArgument(_) | ErrorKind::Cancelled => true,
            _ => false,
        }
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind)
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                Error::new(ErrorKind::Timeout { client: true })
            }
            kind => Error::new(ErrorKind::Connection(kind, err.to_string())),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::Server(code) => write!(f, "server error: {}", code)?,
            ErrorKind::Timeout { client: true } => write!(f, "client timeout")?,
            ErrorKind::Timeout { client: false } => write!(f, "server timeout")?,
            ErrorKind::Connection(kind, msg) => write!(f, "connection error ({:?}): {}", kind, msg)?,
            ErrorKind::Parse(msg) => write!(f, "parse error: {}", msg)?,
            ErrorKind::Backoff => write!(f, "node in backoff")?,
            ErrorKind::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg)?,
            ErrorKind::NoMoreConnections => write!(f, "connection pool exhausted")?,
            ErrorKind::InvalidNode => write!(f, "no node available for partition")?,
            ErrorKind::Terminated => write!(f, "stream terminated by caller")?,
            ErrorKind::Cancelled => write!(f, "cancelled")?,
            ErrorKind::Udf(msg) => write!(f, "udf error: {}", msg)?,
            ErrorKind::Commit(fail) => {
                write!(f, "transaction {:?} failed: {}", fail.stage, fail.cause)?
            }
        }
        if let Some(node) = &self.node {
            write!(f, " [node {}, iteration {}]", node, self.iteration)?;
        }
        if self.in_doubt {
            write!(f, " (in doubt)")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_timeout_maps_to_client_timeout() {
        let err: Error = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(matches!(err.kind, ErrorKind::Timeout { client: true }));
        assert!(err.retryable());
        assert!(err.client_timeout());
    }

    #[test]
    fn test_io_reset_maps_to_connection() {
        let err: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(err.kind, ErrorKind::Connection(..)));
        assert!(err.retryable());
        assert!(!err.keep_connection());
    }

    #[test]
    fn test_server_error_keeps_connection_and_surfaces() {
        let err = Error::server(ResultCode::GenerationError);
        assert!(err.keep_connection());
        assert!(!err.retryable());
        assert!(err.definitely_not_applied());
    }

    #[test]
    fn test_server_timeout_retries_and_stays_in_doubt() {
        let err = Error::server(ResultCode::Timeout);
        assert!(err.retryable());
        assert!(!err.definitely_not_applied());
    }

    #[test]
    fn test_device_overload_retries() {
        assert!(Error::server(ResultCode::DeviceOverload).retryable());
    }
}
