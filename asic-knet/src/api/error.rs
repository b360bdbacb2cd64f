use std::fmt;

use crate::dma::{AllocError, DmaError};
use crate::tx::TxError;

pub type Errno = nix::errno::Errno;

/// A boxed error produced by an external collaborator (network stack, broadcast facility).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced synchronously to control-plane callers.
///
/// Data-path failures never show up here; they are counted and dropped.
#[derive(Debug)]
pub enum Error {
    /// Channel index out of range or of the wrong class.
    InvalidChannel(u32),
    /// Logical port, slice or port-within-slice out of range.
    InvalidPort(u32),
    /// A malformed argument.
    InvalidArgument(&'static str),
    /// A name exceeds the fixed name length.
    NameTooLong,
    /// An entry with the same name or binding already exists.
    Exists,
    /// No entry with the given id or name.
    NotFound,
    /// The id space of a table is exhausted.
    TableFull,
    /// A bounded wait expired.
    TimedOut,
    /// The channel has not been initialized.
    NotReady,
    /// Buffer allocation failed.
    Alloc(AllocError),
    /// DMA mapping failed.
    Dma(DmaError),
    /// Transmit was rejected.
    Tx(TxError),
    /// The external collaborator rejected a registration.
    Registration(BoxError),
}

impl Error {
    /// Map onto an errno for an ioctl-style front end.
    pub fn errno(&self) -> Errno {
        match self {
            Error::InvalidChannel(_) | Error::InvalidPort(_) | Error::InvalidArgument(_) => {
                Errno::EINVAL
            }
            Error::NameTooLong => Errno::ENAMETOOLONG,
            Error::Exists => Errno::EEXIST,
            Error::NotFound => Errno::ENODATA,
            Error::TableFull => Errno::ENOSPC,
            Error::TimedOut => Errno::EAGAIN,
            Error::NotReady => Errno::ENODEV,
            Error::Alloc(_) => Errno::ENOMEM,
            Error::Dma(_) => Errno::EFAULT,
            Error::Tx(e) => e.errno(),
            Error::Registration(_) => Errno::EFAULT,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidChannel(ch) => write!(f, "invalid channel {ch}"),
            Error::InvalidPort(p) => write!(f, "invalid port {p}"),
            Error::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Error::NameTooLong => write!(f, "name too long"),
            Error::Exists => write!(f, "entry already exists"),
            Error::NotFound => write!(f, "entry not found"),
            Error::TableFull => write!(f, "no free id"),
            Error::TimedOut => write!(f, "timed out"),
            Error::NotReady => write!(f, "channel not initialized"),
            Error::Alloc(e) => write!(f, "allocation failed: {e}"),
            Error::Dma(e) => write!(f, "dma mapping failed: {e}"),
            Error::Tx(e) => write!(f, "transmit failed: {e}"),
            Error::Registration(e) => write!(f, "registration rejected: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Alloc(e) => Some(e),
            Error::Dma(e) => Some(e),
            Error::Tx(e) => Some(e),
            Error::Registration(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<AllocError> for Error {
    fn from(e: AllocError) -> Self {
        Error::Alloc(e)
    }
}

impl From<DmaError> for Error {
    fn from(e: DmaError) -> Self {
        Error::Dma(e)
    }
}

impl From<TxError> for Error {
    fn from(e: TxError) -> Self {
        Error::Tx(e)
    }
}
