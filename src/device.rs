//! The readiness device and its startup/teardown handle.
//!
//! [`UserspaceDevice`] serves sessions: each successful read consumes one
//! readiness event and yields [`PAYLOAD`]. [`Device`] publishes it in a
//! [`Namespace`], drives it with a [`PeriodicProducer`] and tears both down.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::DeviceConfig;
use crate::error::{DevError, DevResult};
use crate::file::{CharDeviceOps, FileContext, OpenFlags, Session};
use crate::lifecycle::{DeviceLifecycle, DeviceState};
use crate::namespace::{DevNum, Namespace};
use crate::notify::{ConsumerId, ControlCommand};
use crate::readiness::{Consume, Readiness, WaitOutcome};
use crate::stats::DeviceStats;
use crate::timer::PeriodicProducer;

/// Length of every successful read.
pub const PAYLOAD_LEN: usize = 4;
/// Bytes delivered by every successful read.
pub const PAYLOAD: [u8; PAYLOAD_LEN] = *b"test";

const FIRST_MINOR: u32 = 0;
const MINOR_COUNT: u32 = 1;

/// The readiness device: what every session reads from.
///
/// One instance is shared by all sessions, the producer and the namespace.
pub struct UserspaceDevice {
    name: String,
    readiness: Readiness,
    lifecycle: DeviceLifecycle,
    cancel: CancelToken,
    stats: DeviceStats,
}

impl UserspaceDevice {
    /// Creates an active device with an empty readiness flag.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            readiness: Readiness::new(),
            lifecycle: DeviceLifecycle::new(),
            cancel: CancelToken::new(),
            stats: DeviceStats::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    #[inline]
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    #[inline]
    pub fn state(&self) -> DeviceState {
        self.lifecycle.state()
    }

    /// Stops accepting operations and releases every blocked reader with
    /// `DeviceGone`. Returns once nothing is in flight.
    ///
    /// Returns `false` if shutdown already started elsewhere. In that case
    /// this still waits for in-flight operations to drain.
    pub fn shutdown(&self) -> bool {
        if !self.lifecycle.begin_removal() {
            self.lifecycle.wait_idle();
            return false;
        }
        self.cancel.cancel();
        self.readiness.interrupt_all();
        self.lifecycle.wait_idle();
        self.lifecycle.complete_removal();
        debug!("{}: shut down", self.name);
        true
    }
}

impl CharDeviceOps for UserspaceDevice {
    fn open(&self, file: &FileContext) -> DevResult {
        trace!("{}: open {:?} {:?}", self.name, file.id(), file.flags());
        if !self.lifecycle.is_active() {
            return Err(DevError::DeviceGone);
        }
        self.stats.record_open();
        Ok(())
    }

    fn release(&self, file: &FileContext) {
        trace!("{}: release {:?}", self.name, file.id());
        self.stats.record_close();
    }

    fn read(&self, file: &FileContext, buf: &mut [u8]) -> DevResult<usize> {
        trace!("{}: read {:?} len={}", self.name, file.id(), buf.len());
        let _guard = self.lifecycle.try_begin().ok_or(DevError::DeviceGone)?;

        if buf.len() < PAYLOAD_LEN {
            return dev_err!(
                InvalidInput,
                format!("read buffer of {} bytes, need {PAYLOAD_LEN}", buf.len())
            );
        }

        loop {
            if self.readiness.try_consume() == Consume::Consumed {
                break;
            }
            if file.flags().is_nonblocking() {
                self.stats.record_would_block();
                return Err(DevError::WouldBlock);
            }
            if self.readiness.wait_until_ready(&self.cancel) == WaitOutcome::Cancelled {
                self.stats.record_interrupted_read();
                debug!("{}: read {:?} interrupted by teardown", self.name, file.id());
                return Err(DevError::DeviceGone);
            }
        }

        buf[..PAYLOAD_LEN].copy_from_slice(&PAYLOAD);
        self.stats.record_read();
        Ok(PAYLOAD_LEN)
    }

    fn write(&self, file: &FileContext, buf: &[u8]) -> DevResult<usize> {
        trace!("{}: write {:?} len={}", self.name, file.id(), buf.len());
        self.stats.record_rejected_write();
        Err(DevError::NotPermitted)
    }

    fn ioctl(&self, file: &FileContext, cmd: u32, arg: usize) -> DevResult<usize> {
        let command = ControlCommand::decode(cmd, arg);
        debug!("{}: ioctl {:?} {:?} not supported", self.name, file.id(), command);
        self.stats.record_unsupported_command();
        Err(DevError::NotSupported)
    }
}

impl core::fmt::Debug for UserspaceDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UserspaceDevice")
            .field("name", &self.name)
            .field("state", &self.lifecycle.state())
            .field("readiness", &self.readiness)
            .finish()
    }
}

/// How far startup got in the namespace. Ordered by acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Step {
    Nothing,
    Region,
    Class,
    Node,
    Bound,
}

/// Namespace resources held by a running device.
struct Registration {
    namespace: Arc<Namespace>,
    devnum: DevNum,
    class: String,
    node: String,
    reached: Step,
}

impl Registration {
    /// Runs every startup step. On failure, releases whatever was acquired.
    fn acquire(
        namespace: &Arc<Namespace>,
        config: &DeviceConfig,
        ops: Arc<dyn CharDeviceOps>,
    ) -> DevResult<Self> {
        let mut registration = Registration {
            namespace: Arc::clone(namespace),
            devnum: DevNum::new(config.major.unwrap_or(0), FIRST_MINOR),
            class: config.class_name.clone(),
            node: config.name.clone(),
            reached: Step::Nothing,
        };
        match registration.acquire_steps(config, ops) {
            Ok(()) => Ok(registration),
            Err(e) => {
                error!("{}: startup failed after {:?}: {}", config.name, registration.reached, e);
                registration.release();
                Err(e)
            }
        }
    }

    fn acquire_steps(&mut self, config: &DeviceConfig, ops: Arc<dyn CharDeviceOps>) -> DevResult {
        self.devnum = match config.major {
            Some(major) => {
                let devnum = DevNum::new(major, FIRST_MINOR);
                self.namespace.register_region(devnum, MINOR_COUNT, &config.name)?;
                devnum
            }
            None => self
                .namespace
                .alloc_region(FIRST_MINOR, MINOR_COUNT, &config.name)?,
        };
        self.reached = Step::Region;

        self.namespace.create_class(&self.class)?;
        self.reached = Step::Class;

        self.namespace.create_node(&self.class, self.devnum, &self.node)?;
        self.reached = Step::Node;

        self.namespace.bind(&self.node, ops)?;
        self.reached = Step::Bound;
        Ok(())
    }

    /// Releases in strict reverse order of acquisition. Idempotent.
    ///
    /// Returns `true` if anything was still held.
    fn release(&mut self) -> bool {
        let held = self.reached > Step::Nothing;
        if self.reached >= Step::Bound {
            self.namespace.unbind(&self.node);
        }
        if self.reached >= Step::Node {
            self.namespace.destroy_node(&self.node);
        }
        if self.reached >= Step::Class {
            self.namespace.destroy_class(&self.class);
        }
        if self.reached >= Step::Region {
            self.namespace.unregister_region(self.devnum, MINOR_COUNT);
        }
        self.reached = Step::Nothing;
        held
    }
}

/// A started device: the shared core, its producer and its place in the
/// namespace.
///
/// Dropping the handle tears the device down.
pub struct Device {
    core: Arc<UserspaceDevice>,
    devnum: DevNum,
    period: Duration,
    producer: Mutex<Option<PeriodicProducer>>,
    registration: Mutex<Registration>,
}

impl Device {
    /// Starts a device and publishes it in `namespace`.
    ///
    /// Startup registers the device number, creates the class and the node,
    /// binds the device to the node, sets the initial readiness and arms
    /// the producer. If any step fails, the earlier ones are undone in
    /// reverse order and the error is returned.
    pub fn start(config: DeviceConfig, namespace: &Arc<Namespace>) -> DevResult<Self> {
        config.validate()?;
        info!(
            "{}: starting (class {}, period {:?})",
            config.name, config.class_name, config.period
        );

        let core = Arc::new(UserspaceDevice::new(config.name.clone()));
        if config.initially_ready {
            core.readiness.mark_ready();
        }

        let mut registration = Registration::acquire(namespace, &config, core.clone())?;

        let producer = PeriodicProducer::start(&config.name, config.period, {
            let core = Arc::clone(&core);
            move |_| core.readiness.mark_ready()
        });
        let producer = match producer {
            Ok(producer) => producer,
            Err(e) => {
                error!("{}: startup failed arming producer: {}", config.name, e);
                registration.release();
                return Err(e);
            }
        };

        info!("{}: ready as {}", config.name, registration.devnum);
        Ok(Self {
            devnum: registration.devnum,
            period: config.period,
            core,
            producer: Mutex::new(Some(producer)),
            registration: Mutex::new(registration),
        })
    }

    /// Opens a session directly on this device.
    pub fn open(&self, flags: OpenFlags) -> DevResult<Session> {
        Session::open(self.core.clone(), flags)
    }

    /// Opens a session owned by `consumer`.
    pub fn open_as(&self, flags: OpenFlags, consumer: ConsumerId) -> DevResult<Session> {
        Session::open_as(self.core.clone(), flags, consumer)
    }

    /// Stops the device.
    ///
    /// Cancels the producer, releases every blocked reader with `DeviceGone`,
    /// waits for in-flight operations and leaves the namespace. Safe to call
    /// more than once; later calls do nothing.
    pub fn teardown(&self) {
        let fires = lock(&self.producer)
            .take()
            .map(|mut producer| producer.cancel().fires);

        // The core may already be shut down through `core()`; the namespace
        // resources are released regardless.
        let shut_down = self.core.shutdown();
        let released = lock(&self.registration).release();
        if !shut_down && !released {
            return;
        }

        let readiness = self.core.readiness.stats();
        info!(
            "{}: torn down ({} fires, {} produced, {} consumed, {} interrupted reads)",
            self.core.name,
            fires.unwrap_or(0),
            readiness.produced,
            readiness.consumed,
            self.core.stats.interrupted_reads()
        );
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    #[inline]
    pub fn devnum(&self) -> DevNum {
        self.devnum
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    #[inline]
    pub fn state(&self) -> DeviceState {
        self.core.state()
    }

    #[inline]
    pub fn readiness(&self) -> &Readiness {
        self.core.readiness()
    }

    #[inline]
    pub fn stats(&self) -> &DeviceStats {
        self.core.stats()
    }

    /// The shared core, as bound in the namespace.
    #[inline]
    pub fn core(&self) -> &Arc<UserspaceDevice> {
        &self.core
    }

    /// Producer fires so far, or `None` once the producer is cancelled.
    pub fn producer_fires(&self) -> Option<u64> {
        lock(&self.producer).as_ref().map(PeriodicProducer::fires)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("core", &self.core)
            .field("devnum", &self.devnum)
            .field("period", &self.period)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
