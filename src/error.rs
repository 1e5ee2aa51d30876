//! The typed error taxonomy for every fallible operation this crate exposes.

use std::io;

use windows_sys::Win32::Networking::WinSock::{WSAECONNABORTED, WSAECONNREFUSED, WSAECONNRESET};

/// Crate-wide result alias, as the rest of this codebase's Windows-facing
/// modules alias their error type.
pub type Result<T> = std::result::Result<T, IocpError>;

/// Everything that can go wrong issuing, awaiting, or tearing down an
/// overlapped I/O operation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IocpError {
    /// A submission verb was called on an operation object that already has
    /// kind `read`, `write`, `accept`, `connect`, or `disconnect`.
    #[error("operation already attempted")]
    AlreadyAttempted,

    /// `getresult` was called on an operation that was never submitted.
    #[error("operation not yet attempted")]
    NotAttempted,

    /// `getresult` was called on an operation whose submission verb failed
    /// synchronously.
    #[error("operation failed to start")]
    NotStarted,

    /// A write-style borrow was longer than a single overlapped call can
    /// carry (the transfer length is a 32-bit `DWORD`).
    #[error("buffer of {0} bytes exceeds the maximum length of a single overlapped I/O call")]
    BufferTooLarge(usize),

    /// The address-binding helper or the connect verb were given a tuple
    /// shape that is neither an IPv4 (2-field) nor an IPv6 (4-field) address.
    #[error("expected an address tuple of length 2 or 4, got {0}")]
    BadAddressTuple(usize),

    /// The remote peer actively refused the connection.
    #[error("connection refused")]
    ConnectionRefused(#[source] io::Error),

    /// The connection was aborted by the local or the remote stack.
    #[error("connection aborted")]
    ConnectionAborted(#[source] io::Error),

    /// The remote peer reset the connection.
    #[error("connection reset")]
    ConnectionReset(#[source] io::Error),

    /// Any other OS error, surfaced unchanged.
    #[error(transparent)]
    Os(#[from] io::Error),
}

impl IocpError {
    /// Classifies a raw OS error, promoting the handful of connection-level
    /// codes callers usually want to match on to their own variants and
    /// falling back to [`IocpError::Os`] for everything else.
    pub(crate) fn from_os(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) if code == WSAECONNREFUSED => IocpError::ConnectionRefused(err),
            Some(code) if code == WSAECONNABORTED => IocpError::ConnectionAborted(err),
            Some(code) if code == WSAECONNRESET => IocpError::ConnectionReset(err),
            _ => IocpError::Os(err),
        }
    }

    pub(crate) fn from_raw_os_error(code: i32) -> Self {
        Self::from_os(io::Error::from_raw_os_error(code))
    }
}

/// Interop with callers that only deal in `std::io::Error`, the common case
/// for anything handed to a `Read`/`Write`-shaped abstraction.
impl From<IocpError> for io::Error {
    fn from(err: IocpError) -> io::Error {
        match err {
            IocpError::Os(err)
            | IocpError::ConnectionRefused(err)
            | IocpError::ConnectionAborted(err)
            | IocpError::ConnectionReset(err) => err,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
