//! Error type.
//!
//! This is the shared error type for the whole crate. Backends translate
//! native failures into one of these kinds; no native error codes leak
//! through the public surface.

use std::{error, fmt};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    /// Unspecified failure in the backend or a native call.
    Fail,
    /// Recognised operation that this backend does not implement.
    Unimplemented,
    /// Format or capability not supported by the device.
    Unsupported,
    InvalidArgument,
    InvalidState,
    /// Asynchronous result not available yet.
    NotReady,
    OutOfMemory,
    /// The device was lost. Sticky on the facade until teardown.
    DeviceLost,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Error::Fail => "unspecified failure",
            Error::Unimplemented => "not implemented",
            Error::Unsupported => "unsupported format or capability",
            Error::InvalidArgument => "invalid argument",
            Error::InvalidState => "invalid state",
            Error::NotReady => "not ready",
            Error::OutOfMemory => "out of memory",
            Error::DeviceLost => "device lost",
        };
        f.write_str(s)
    }
}

impl error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
