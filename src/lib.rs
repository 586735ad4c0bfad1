//! # userdev
//!
//! An emulated character device whose only job is to become "ready" on a
//! fixed period and to hand a constant 4-byte record to whoever reads it.
//! The interesting part is the readiness/blocking protocol under concurrent
//! open, read, timer fire and teardown.
//!
//! ## Architecture
//!
//! ### Core
//! - [`Readiness`]: single-slot flag plus the wait/wake primitive
//! - [`PeriodicProducer`]: timer thread that marks the flag ready every period
//! - [`DeviceLifecycle`]: Active/Removing/Removed with in-flight tracking
//!
//! ### Sessions
//! - [`UserspaceDevice`]: the device operations ([`CharDeviceOps`])
//! - [`Session`]: one open handle, blocking or non-blocking for its lifetime
//!
//! ### Publication
//! - [`Namespace`]: device numbers, classes and named nodes
//! - [`Device`]: startup into a namespace, and teardown out of it
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use userdev::{Device, DeviceConfig, Namespace, OpenFlags};
//!
//! let namespace = Arc::new(Namespace::new());
//! let device = Device::start(
//!     DeviceConfig::new().with_period(Duration::from_secs(1)),
//!     &namespace,
//! )?;
//!
//! let session = namespace.open("userspace", OpenFlags::BLOCKING)?;
//! let mut buf = [0u8; 4];
//! let n = session.read(&mut buf)?; // returns at once: the device starts ready
//! let n = session.read(&mut buf)?; // parks until the next period
//! # let _ = n;
//!
//! session.close();
//! device.teardown();
//! # Ok::<(), userdev::DevError>(())
//! ```

#[macro_use]
extern crate log;

#[macro_use]
mod error;

mod cancel;
mod config;
mod device;
mod file;
mod lifecycle;
mod namespace;
mod readiness;
mod stats;
mod timer;

pub mod notify;

pub use cancel::CancelToken;
pub use config::{DEFAULT_CLASS_NAME, DEFAULT_DEVICE_NAME, DEFAULT_PERIOD, DeviceConfig};
pub use device::{Device, PAYLOAD, PAYLOAD_LEN, UserspaceDevice};
pub use error::{DevError, DevResult};
pub use file::{CharDeviceOps, FileContext, OpenFlags, Session, SessionId};
pub use lifecycle::{AccessGuard, DeviceLifecycle, DeviceState};
pub use namespace::{DevNum, Namespace};
pub use notify::{ConsumerId, ControlCommand, PROCESS_ID};
pub use readiness::{Consume, Readiness, ReadinessFlag, ReadinessStats, WaitOutcome};
pub use stats::DeviceStats;
pub use timer::{PeriodicProducer, ProducerStats};

#[doc(hidden)]
pub mod __priv {
    pub use log::warn;
}
