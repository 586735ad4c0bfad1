//! Error type shared by every device operation.
//!
//! Session-level outcomes (`WouldBlock`, `NotPermitted`, `NotSupported`) go
//! back to the immediate caller. `DeviceGone` ends the session that saw it.
//! `AllocationFailure` and `RegistrationFailure` only come out of device
//! startup, after everything acquired so far has been released.

use thiserror::Error;

/// Errors reported by the device, its sessions and the namespace.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DevError {
    /// Non-blocking read with no data ready. Try again later.
    #[error("operation would block")]
    WouldBlock,

    /// The device does not accept writes.
    #[error("operation not permitted")]
    NotPermitted,

    /// Control-channel command the device does not implement.
    #[error("control command not supported")]
    NotSupported,

    /// The device was torn down while the operation was in progress.
    #[error("device is gone")]
    DeviceGone,

    /// A name or number could not be allocated during startup.
    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    /// A resource could not be registered during startup.
    #[error("registration failed: {0}")]
    RegistrationFailure(String),

    /// No device is bound under the requested name.
    #[error("no such device: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result alias used across the crate.
pub type DevResult<T = ()> = Result<T, DevError>;

impl DevError {
    /// Returns `true` when the caller may simply retry the operation.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, DevError::WouldBlock)
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use nix::errno::Errno;

        impl DevError {
            /// The POSIX error code a character device would hand back for this error.
            pub fn errno(&self) -> Errno {
                match self {
                    DevError::WouldBlock => Errno::EAGAIN,
                    DevError::NotPermitted => Errno::EPERM,
                    DevError::NotSupported => Errno::ENOTTY,
                    DevError::DeviceGone => Errno::ENODEV,
                    DevError::AllocationFailure(_) => Errno::ENOMEM,
                    DevError::RegistrationFailure(_) => Errno::EBUSY,
                    DevError::NotFound(_) => Errno::ENXIO,
                    DevError::InvalidInput(_) => Errno::EINVAL,
                }
            }
        }
    }
}

/// Builds a [`DevError`] and logs it at `warn` level.
///
/// Unit variants take just the name, the others take a message:
///
/// ```rust,ignore
/// let e = dev_err_type!(WouldBlock);
/// let e = dev_err_type!(NotFound, "userspace");
/// ```
#[macro_export]
macro_rules! dev_err_type {
    ($err:ident) => {{
        let e = $crate::DevError::$err;
        $crate::__priv::warn!("[DevError::{:?}]", e);
        e
    }};
    ($err:ident, $msg:expr) => {{
        let e = $crate::DevError::$err(::std::string::String::from($msg));
        $crate::__priv::warn!("[DevError::{:?}]", e);
        e
    }};
}

/// Same as [`dev_err_type!`] but wrapped in `Err`.
#[macro_export]
macro_rules! dev_err {
    ($err:ident) => {
        Err($crate::dev_err_type!($err))
    };
    ($err:ident, $msg:expr) => {
        Err($crate::dev_err_type!($err, $msg))
    };
}
