//! Device lifecycle with in-flight operation tracking.
//!
//! State and the number of operations in progress share one `AtomicU32`,
//! so "is the device still active?" and "count me in" happen in a single
//! compare-and-swap. Teardown flips the state to `Removing` and then waits
//! for the count to drain before declaring the device `Removed`.
//!
//! Layout: `[state(8 bits) | in_flight(24 bits)]`
//!
//! ```text
//! ┌────────┐  begin_removal()  ┌──────────┐  wait_idle() + complete_removal()  ┌─────────┐
//! │ Active │ ────────────────> │ Removing │ ─────────────────────────────────> │ Removed │
//! └────────┘                   └──────────┘                                    └─────────┘
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Lifecycle states of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    /// Accepting operations.
    Active = 0,
    /// Teardown started; new operations are refused.
    Removing = 1,
    /// Teardown finished.
    Removed = 2,
}

impl DeviceState {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => DeviceState::Active,
            1 => DeviceState::Removing,
            _ => DeviceState::Removed,
        }
    }
}

const STATE_SHIFT: u32 = 24;
const COUNT_MASK: u32 = (1 << STATE_SHIFT) - 1;

#[inline]
const fn pack(state: DeviceState, count: u32) -> u32 {
    ((state as u32) << STATE_SHIFT) | count
}

/// Lifecycle tracker shared by the device and every open session.
pub struct DeviceLifecycle {
    word: AtomicU32,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl DeviceLifecycle {
    /// Creates a lifecycle in the `Active` state with nothing in flight.
    pub fn new() -> Self {
        Self {
            word: AtomicU32::new(pack(DeviceState::Active, 0)),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> DeviceState {
        DeviceState::from_bits(self.word.load(Ordering::Acquire) >> STATE_SHIFT)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == DeviceState::Active
    }

    /// Operations currently in progress.
    #[inline]
    pub fn in_flight(&self) -> usize {
        (self.word.load(Ordering::Acquire) & COUNT_MASK) as usize
    }

    /// Registers one operation if the device is still `Active`.
    ///
    /// The returned guard ends the operation when dropped.
    pub fn try_begin(&self) -> Option<AccessGuard<'_>> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if DeviceState::from_bits(current >> STATE_SHIFT) != DeviceState::Active {
                return None;
            }
            let count = current & COUNT_MASK;
            if count == COUNT_MASK {
                warn!("lifecycle: in-flight counter saturated");
                return None;
            }
            match self.word.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(AccessGuard { lifecycle: self }),
                Err(actual) => current = actual,
            }
        }
    }

    fn end(&self) {
        let previous = self.word.fetch_sub(1, Ordering::AcqRel);
        if previous & COUNT_MASK == 1 {
            // Serialise with a waiter that checked the count but has not parked yet.
            let _guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.idle.notify_all();
        }
    }

    /// Moves `Active → Removing`, keeping the in-flight count.
    ///
    /// Returns `false` if removal already started.
    pub fn begin_removal(&self) -> bool {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if DeviceState::from_bits(current >> STATE_SHIFT) != DeviceState::Active {
                return false;
            }
            let next = pack(DeviceState::Removing, current & COUNT_MASK);
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Blocks until no operation is in flight.
    pub fn wait_idle(&self) {
        let mut guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.in_flight() != 0 {
            guard = self.idle.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) but gives up after `timeout`.
    ///
    /// Returns `true` if the device went idle in time.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.in_flight() != 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .idle
                .wait_timeout(guard, deadline - now)
                .map(|(g, _)| g)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }

    /// Moves to `Removed`. Call after [`wait_idle`](Self::wait_idle).
    pub fn complete_removal(&self) {
        self.word
            .store(pack(DeviceState::Removed, 0), Ordering::Release);
    }
}

impl Default for DeviceLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for DeviceLifecycle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceLifecycle")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// One in-flight operation. Dropping it ends the operation.
#[must_use = "the operation ends as soon as the guard is dropped"]
pub struct AccessGuard<'a> {
    lifecycle: &'a DeviceLifecycle,
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.end();
    }
}
