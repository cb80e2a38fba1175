use std::fmt;

use thiserror::Error;

/// The category of an [`Error`].
///
/// The category decides how the stream controller propagates the error: warnings are advisory and
/// never interrupt the operation that produced them, every other kind aborts a running stream when
/// it is funneled to an error callback, or is returned to the caller otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A non-critical condition, e.g. starting a stream that is already running.
    Warning,
    /// The caller violated the API contract, e.g. a control operation on a closed stream.
    InvalidUse,
    /// A device index was out of range or the device cannot serve the requested direction.
    InvalidDevice,
    /// A stream parameter (channel count, sample rate, ...) was rejected.
    InvalidParameter,
    /// Enumeration found no usable device.
    NoDevicesFound,
    /// The device exists but could not be acquired, for example because it was unplugged.
    DeviceUnavailable,
    /// A buffer could not be allocated.
    MemoryError,
    /// A backend or native call failed.
    SystemError,
    /// The stream worker thread could not be created or joined.
    ThreadError,
    /// The native driver reported an unrecoverable failure.
    DriverError,
}

impl ErrorKind {
    /// Whether this kind is advisory only.
    pub fn is_warning(&self) -> bool {
        *self == ErrorKind::Warning
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::Warning => "warning",
            ErrorKind::InvalidUse => "invalid use",
            ErrorKind::InvalidDevice => "invalid device",
            ErrorKind::InvalidParameter => "invalid parameter",
            ErrorKind::NoDevicesFound => "no devices found",
            ErrorKind::DeviceUnavailable => "device unavailable",
            ErrorKind::MemoryError => "memory error",
            ErrorKind::SystemError => "system error",
            ErrorKind::ThreadError => "thread error",
            ErrorKind::DriverError => "driver error",
        };
        f.write_str(name)
    }
}

/// An error produced by a stream, a host or one of the host's devices.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Warning, message)
    }

    pub fn invalid_use(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidUse, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::SystemError, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Some error has occurred that is specific to the backend from which it was produced.
///
/// This error is often used as a catch-all in cases where:
///
/// - It is unclear exactly what error might be produced by the backend API.
/// - No error was expected to occur at all, but we return an error to avoid the possibility of a
///   `panic!` caused by some unforeseen or unknown reason.
///
/// It always surfaces as an [`ErrorKind::SystemError`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("A backend-specific error has occurred: {description}")]
pub struct BackendSpecificError {
    pub description: String,
}

impl From<BackendSpecificError> for Error {
    fn from(err: BackendSpecificError) -> Self {
        Error::new(ErrorKind::SystemError, err.description)
    }
}

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Wraps an unexpected error from a native API into a [`BackendSpecificError`].
pub(crate) fn backend_specific_error(description: impl fmt::Display) -> BackendSpecificError {
    BackendSpecificError {
        description: description.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::new(ErrorKind::InvalidDevice, "device index 4 is out of range");
        assert_eq!(
            err.to_string(),
            "invalid device: device index 4 is out of range"
        );
    }

    #[test]
    fn backend_errors_are_system_errors() {
        let err: Error = backend_specific_error("lock failed").into();
        assert_eq!(err.kind(), ErrorKind::SystemError);
        assert_eq!(err.message(), "lock failed");
        assert!(!err.kind().is_warning());
    }
}
