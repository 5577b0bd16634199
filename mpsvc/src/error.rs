// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// The kind of failure reported by the MP services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    /// A bad or missing argument.
    InvalidParameter,
    /// The processor index does not exist.
    NotFound,
    /// The operation was attempted from the wrong processor.
    DeviceError,
    /// The target processor is not in a state that allows the operation.
    NotReady,
    /// The operation cannot be completed by this platform or at this time.
    Unsupported,
    /// A spin-wait exceeded the bound given by the caller.
    Timeout,
}

/// The high bit marks a firmware status value as an error.
const EFI_ERROR_BIT: usize = 1 << (usize::BITS - 1);

impl Status {
    /// Returns the firmware status code of this error kind.
    pub const fn efi_status(self) -> usize {
        let code = match self {
            Status::InvalidParameter => 2,
            Status::Unsupported => 3,
            Status::NotReady => 6,
            Status::DeviceError => 7,
            Status::NotFound => 14,
            Status::Timeout => 18,
        };
        EFI_ERROR_BIT | code
    }
}

/// The error type returned by the APIs of this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    status: Status,
    msg: Option<&'static str>,
}

impl Error {
    /// Creates an error of the given kind.
    pub const fn new(status: Status) -> Self {
        Error { status, msg: None }
    }

    /// Creates an error of the given kind with a static description.
    pub const fn with_message(status: Status, msg: &'static str) -> Self {
        Error {
            status,
            msg: Some(msg),
        }
    }

    /// Returns the kind of the error.
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Returns the description attached to the error, if any.
    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::new(status)
    }
}

impl AsRef<Error> for Error {
    fn as_ref(&self) -> &Error {
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.status, msg),
            None => write!(f, "{:?}", self.status),
        }
    }
}

/// Returns early with an [`Error`] of the given [`Status`].
#[macro_export]
macro_rules! return_status {
    ($status: expr) => {
        return Err($crate::Error::new($status))
    };
}

/// Returns early with an [`Error`] of the given [`Status`] and message.
#[macro_export]
macro_rules! return_status_with_message {
    ($status: expr, $message: expr) => {
        return Err($crate::Error::with_message($status, $message))
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn efi_status_codes() {
        assert_eq!(Status::InvalidParameter.efi_status(), EFI_ERROR_BIT | 2);
        assert_eq!(Status::NotFound.efi_status(), EFI_ERROR_BIT | 14);
        assert_eq!(Status::Timeout.efi_status(), EFI_ERROR_BIT | 18);
        assert_ne!(Status::NotReady.efi_status() & EFI_ERROR_BIT, 0);
    }

    #[test]
    fn message_is_kept() {
        fn fails() -> crate::Result<()> {
            return_status_with_message!(Status::NotReady, "processor is busy");
        }

        let err = fails().unwrap_err();
        assert_eq!(err.status(), Status::NotReady);
        assert_eq!(err.message(), Some("processor is busy"));
        assert_eq!(Error::from(Status::NotFound).message(), None);
    }
}
