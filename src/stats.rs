//! Per-device operation counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// Operation counters for one device. All updates are relaxed.
#[derive(Debug, Default)]
pub struct DeviceStats {
    reads: AtomicU64,
    would_blocks: AtomicU64,
    interrupted_reads: AtomicU64,
    rejected_writes: AtomicU64,
    unsupported_commands: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident) => {
        #[inline]
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_read, reads, reads);
    counter!(record_would_block, would_blocks, would_blocks);
    counter!(record_interrupted_read, interrupted_reads, interrupted_reads);
    counter!(record_rejected_write, rejected_writes, rejected_writes);
    counter!(record_unsupported_command, unsupported_commands, unsupported_commands);
    counter!(record_open, sessions_opened, sessions_opened);
    counter!(record_close, sessions_closed, sessions_closed);

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> u64 {
        self.sessions_opened()
            .saturating_sub(self.sessions_closed())
    }
}
