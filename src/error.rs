use std::error;
use std::fmt;

/// Errors that a [`HashMap`](crate::HashMap) operation can return.
///
/// Every error is reported to the immediate caller; the map never logs,
/// retries, or swallows a failure internally.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// A construction parameter was rejected.
    ///
    /// Detected before any allocation or locking, therefore an
    /// [`InvalidArgument`](Self::InvalidArgument) never leaves partial state
    /// behind.
    InvalidArgument(&'static str),

    /// A bucket lock could not be acquired within the configured wait limit.
    ///
    /// The operation had no effect, and the caller may simply retry it.
    LockTimeout,

    /// Memory for an enlarged bucket array could not be allocated.
    ///
    /// Only the growth attempt is abandoned; the map remains fully usable at
    /// its current capacity.
    ResourceExhausted,
}

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(reason) => write!(f, "invalid argument: {reason}"),
            Self::LockTimeout => f.write_str("bucket lock wait limit exceeded"),
            Self::ResourceExhausted => f.write_str("bucket array allocation failed"),
        }
    }
}

impl error::Error for Error {}
