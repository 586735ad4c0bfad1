//! Readiness core: a single-slot "data available" flag guarded by a condition
//! variable.
//!
//! # Protocol
//!
//! ```text
//!            mark_ready()               try_consume() wins
//!  ┌───────┐ ─────────────> ┌───────┐ ───────────────────> ┌───────┐
//!  │ Empty │                │ Ready │                      │ Empty │
//!  └───────┘ <───────────── └───────┘                      └───────┘
//! ```
//!
//! The producer calls [`Readiness::mark_ready`], which flips the flag and
//! wakes at most one parked reader. Readers run
//!
//! ```text
//! loop {
//!     if try_consume() == Consumed { done }
//!     if non-blocking { WouldBlock }
//!     if wait_until_ready(token) == Cancelled { DeviceGone }
//! }
//! ```
//!
//! A wake is only a hint. The woken reader goes back through `try_consume`,
//! so two readers racing on one event cannot both succeed.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::cancel::CancelToken;

/// Value of the shared readiness flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessFlag {
    Empty,
    Ready,
}

/// Why [`Readiness::wait_until_ready`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The flag was observed `Ready`. The caller must still consume it.
    Ready,
    /// The cancel token fired.
    Cancelled,
}

/// Result of [`Readiness::try_consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consume {
    Consumed,
    Empty,
}

/// Snapshot of the readiness counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadinessStats {
    /// Number of `Empty → Ready` transitions.
    pub produced: u64,
    /// Number of `Ready → Empty` transitions.
    pub consumed: u64,
    /// Threads currently parked in `wait_until_ready`.
    pub waiters: usize,
}

struct State {
    flag: ReadinessFlag,
    produced: u64,
    consumed: u64,
    waiters: usize,
}

/// The flag plus its wait/wake primitive.
///
/// All mutation goes through [`mark_ready`](Self::mark_ready) and
/// [`try_consume`](Self::try_consume).
pub struct Readiness {
    state: Mutex<State>,
    cond: Condvar,
}

impl Readiness {
    /// Creates an empty readiness core.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                flag: ReadinessFlag::Empty,
                produced: 0,
                consumed: 0,
                waiters: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the flag to `Ready` and wakes at most one waiter.
    ///
    /// Idempotent while the flag is already `Ready`.
    pub fn mark_ready(&self) {
        {
            let mut state = self.lock();
            if state.flag == ReadinessFlag::Empty {
                state.flag = ReadinessFlag::Ready;
                state.produced += 1;
            }
            trace!(
                "readiness: mark_ready (produced={}, waiters={})",
                state.produced, state.waiters
            );
        }
        self.cond.notify_one();
    }

    /// Atomically takes the readiness event if there is one. Never blocks.
    pub fn try_consume(&self) -> Consume {
        let mut state = self.lock();
        match state.flag {
            ReadinessFlag::Ready => {
                state.flag = ReadinessFlag::Empty;
                state.consumed += 1;
                trace!("readiness: consumed event #{}", state.consumed);
                Consume::Consumed
            }
            ReadinessFlag::Empty => Consume::Empty,
        }
    }

    /// Parks the caller until the flag reads `Ready` or `cancel` fires.
    ///
    /// Cancellation wins over readiness. A `Ready` outcome does not reserve
    /// the event for the caller.
    pub fn wait_until_ready(&self, cancel: &CancelToken) -> WaitOutcome {
        let mut state = self.lock();
        state.waiters += 1;
        let outcome = loop {
            if cancel.is_cancelled() {
                break WaitOutcome::Cancelled;
            }
            if state.flag == ReadinessFlag::Ready {
                break WaitOutcome::Ready;
            }
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        };
        state.waiters -= 1;
        outcome
    }

    /// Wakes every waiter so it re-checks its cancel token.
    ///
    /// Cancel the token first. Taking the lock here orders the wake after
    /// any waiter that already checked the token and is about to park.
    pub fn interrupt_all(&self) {
        let waiters = self.lock().waiters;
        debug!("readiness: interrupting {} waiter(s)", waiters);
        self.cond.notify_all();
    }

    /// Current flag value.
    pub fn flag(&self) -> ReadinessFlag {
        self.lock().flag
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.flag() == ReadinessFlag::Ready
    }

    pub fn stats(&self) -> ReadinessStats {
        let state = self.lock();
        ReadinessStats {
            produced: state.produced,
            consumed: state.consumed,
            waiters: state.waiters,
        }
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Readiness {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("Readiness")
            .field("flag", &state.flag)
            .field("produced", &state.produced)
            .field("consumed", &state.consumed)
            .field("waiters", &state.waiters)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn wait_for_waiters(readiness: &Readiness, n: usize) {
        for _ in 0..500 {
            if readiness.stats().waiters == n {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("expected {} waiters, found {}", n, readiness.stats().waiters);
    }

    #[test]
    fn test_starts_empty() {
        let readiness = Readiness::new();
        assert_eq!(readiness.flag(), ReadinessFlag::Empty);
        assert_eq!(readiness.try_consume(), Consume::Empty);
        assert_eq!(readiness.stats(), ReadinessStats::default());
    }

    #[test]
    fn test_mark_then_consume_once() {
        let readiness = Readiness::new();
        readiness.mark_ready();
        assert!(readiness.is_ready());

        assert_eq!(readiness.try_consume(), Consume::Consumed);
        assert_eq!(readiness.try_consume(), Consume::Empty);
        assert_eq!(readiness.flag(), ReadinessFlag::Empty);
    }

    #[test]
    fn test_mark_ready_is_idempotent() {
        let readiness = Readiness::new();
        readiness.mark_ready();
        readiness.mark_ready();
        readiness.mark_ready();

        let stats = readiness.stats();
        assert_eq!(stats.produced, 1);

        assert_eq!(readiness.try_consume(), Consume::Consumed);
        assert_eq!(readiness.try_consume(), Consume::Empty);
    }

    #[test]
    fn test_wait_returns_immediately_when_ready() {
        let readiness = Readiness::new();
        let token = CancelToken::new();
        readiness.mark_ready();

        assert_eq!(readiness.wait_until_ready(&token), WaitOutcome::Ready);
        // Waiting does not consume.
        assert!(readiness.is_ready());
        assert_eq!(readiness.stats().waiters, 0);
    }

    #[test]
    fn test_cancel_wins_over_ready() {
        let readiness = Readiness::new();
        let token = CancelToken::new();
        readiness.mark_ready();
        token.cancel();

        assert_eq!(readiness.wait_until_ready(&token), WaitOutcome::Cancelled);
    }

    #[test]
    fn test_waiter_woken_by_mark_ready() {
        let readiness = Arc::new(Readiness::new());
        let token = CancelToken::new();

        let waiter = {
            let readiness = Arc::clone(&readiness);
            let token = token.clone();
            thread::spawn(move || readiness.wait_until_ready(&token))
        };

        wait_for_waiters(&readiness, 1);
        readiness.mark_ready();

        assert_eq!(waiter.join().unwrap(), WaitOutcome::Ready);
        assert_eq!(readiness.try_consume(), Consume::Consumed);
    }

    #[test]
    fn test_interrupt_releases_all_waiters() {
        let readiness = Arc::new(Readiness::new());
        let token = CancelToken::new();
        let (tx, rx) = mpsc::channel();

        for _ in 0..4 {
            let readiness = Arc::clone(&readiness);
            let token = token.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                tx.send(readiness.wait_until_ready(&token)).unwrap();
            });
        }

        wait_for_waiters(&readiness, 4);
        token.cancel();
        readiness.interrupt_all();

        for _ in 0..4 {
            let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(outcome, WaitOutcome::Cancelled);
        }
        assert_eq!(readiness.stats().waiters, 0);
    }

    #[test]
    fn test_racing_consumers_take_each_event_once() {
        let readiness = Arc::new(Readiness::new());
        let token = CancelToken::new();
        let wins = Arc::new(AtomicUsize::new(0));
        let events = 50;

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let readiness = Arc::clone(&readiness);
                let token = token.clone();
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    loop {
                        if readiness.try_consume() == Consume::Consumed {
                            wins.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }
                        if readiness.wait_until_ready(&token) == WaitOutcome::Cancelled {
                            break;
                        }
                    }
                })
            })
            .collect();

        for _ in 0..events {
            readiness.mark_ready();
            thread::sleep(Duration::from_millis(1));
        }

        // Let the last event drain before cancelling.
        for _ in 0..500 {
            if !readiness.is_ready() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        token.cancel();
        readiness.interrupt_all();
        for consumer in consumers {
            consumer.join().unwrap();
        }

        let stats = readiness.stats();
        assert_eq!(wins.load(Ordering::SeqCst) as u64, stats.consumed);
        assert!(stats.consumed <= stats.produced);
        assert!(stats.produced <= events);
    }
}
