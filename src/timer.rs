//! Periodic producer: a dedicated thread that fires a callback every period.
//!
//! Each fire runs the callback and then re-arms at `now + period`, whether
//! or not anybody consumed the previous event. [`PeriodicProducer::cancel`]
//! stops the thread. A fire already running when cancel arrives completes,
//! but the producer does not re-arm after it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::DevResult;

/// Counters returned when the producer is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Completed fires.
    pub fires: u64,
}

struct Control {
    stopped: bool,
    fires: u64,
}

struct Shared {
    control: Mutex<Control>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running periodic timer thread.
pub struct PeriodicProducer {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    period: Duration,
}

impl PeriodicProducer {
    /// Spawns the timer thread. The first fire happens one `period` from now.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a zero period, `AllocationFailure` if the thread
    /// cannot be spawned.
    pub fn start<F>(name: &str, period: Duration, on_fire: F) -> DevResult<Self>
    where
        F: FnMut(Instant) + Send + 'static,
    {
        if period.is_zero() {
            return dev_err!(InvalidInput, "producer period must be non-zero");
        }

        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                stopped: false,
                fires: 0,
            }),
            cond: Condvar::new(),
        });

        let handle = thread::Builder::new()
            .name(format!("{name}-timer"))
            .spawn({
                let shared = Arc::clone(&shared);
                move || timer_loop(shared, period, on_fire)
            })
            .map_err(|e| dev_err_type!(AllocationFailure, format!("timer thread: {e}")))?;

        info!("timer: armed {:?} period for {}", period, name);
        Ok(Self {
            shared,
            handle: Some(handle),
            period,
        })
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Completed fires so far.
    pub fn fires(&self) -> u64 {
        self.shared.lock().fires
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().stopped
    }

    /// Stops the timer and joins its thread.
    ///
    /// Idempotent. Once this returns, the callback will not run again.
    pub fn cancel(&mut self) -> ProducerStats {
        {
            let mut control = self.shared.lock();
            control.stopped = true;
        }
        self.shared.cond.notify_all();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("timer: producer thread panicked");
            }
            debug!("timer: cancelled");
        }
        ProducerStats {
            fires: self.shared.lock().fires,
        }
    }
}

impl Drop for PeriodicProducer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl core::fmt::Debug for PeriodicProducer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let control = self.shared.lock();
        f.debug_struct("PeriodicProducer")
            .field("period", &self.period)
            .field("fires", &control.fires)
            .field("stopped", &control.stopped)
            .finish()
    }
}

fn timer_loop<F>(shared: Arc<Shared>, period: Duration, mut on_fire: F)
where
    F: FnMut(Instant),
{
    let mut deadline = Instant::now() + period;
    loop {
        {
            let mut control = shared.lock();
            loop {
                if control.stopped {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                control = shared
                    .cond
                    .wait_timeout(control, deadline - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
        }

        let now = Instant::now();
        trace!("timer: fire at {:?}", now);
        on_fire(now);

        let mut control = shared.lock();
        control.fires += 1;
        if control.stopped {
            return;
        }
        deadline = Instant::now() + period;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_zero_period_rejected() {
        let result = PeriodicProducer::start("zero", Duration::ZERO, |_| {});
        assert!(result.is_err());
    }

    #[test]
    fn test_fires_repeatedly() {
        let count = Arc::new(AtomicU64::new(0));
        let mut producer = PeriodicProducer::start("rearm", Duration::from_millis(10), {
            let count = Arc::clone(&count);
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(120));
        let stats = producer.cancel();

        assert!(stats.fires >= 3, "only {} fires", stats.fires);
        assert_eq!(stats.fires, count.load(Ordering::SeqCst));
    }

    #[test]
    fn test_no_fire_after_cancel() {
        let count = Arc::new(AtomicU64::new(0));
        let mut producer = PeriodicProducer::start("stop", Duration::from_millis(5), {
            let count = Arc::clone(&count);
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        producer.cancel();
        let after_cancel = count.load(Ordering::SeqCst);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
        assert!(producer.is_cancelled());

        // Second cancel is harmless.
        assert_eq!(producer.cancel().fires, after_cancel);
    }

    #[test]
    fn test_cancel_before_first_fire() {
        let count = Arc::new(AtomicU64::new(0));
        let mut producer = PeriodicProducer::start("idle", Duration::from_secs(3600), {
            let count = Arc::clone(&count);
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        let started = Instant::now();
        let stats = producer.cancel();
        assert_eq!(stats.fires, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
