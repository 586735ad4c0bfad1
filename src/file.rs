//! Open handles to a character device.
//!
//! A [`Session`] pairs a device's [`CharDeviceOps`] with the per-open state
//! in [`FileContext`]: the open mode, fixed for the life of the session, and
//! an optional owning consumer. Sessions hold a reference to the device and
//! never a copy of its state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::DevResult;
use crate::notify::{ConsumerId, ControlCommand};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Open mode of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    nonblocking: bool,
}

impl OpenFlags {
    /// Reads park until data is ready.
    pub const BLOCKING: Self = Self { nonblocking: false };
    /// Reads fail with `WouldBlock` when no data is ready.
    pub const NONBLOCKING: Self = Self { nonblocking: true };

    #[inline]
    pub const fn is_nonblocking(self) -> bool {
        self.nonblocking
    }
}

/// Identifier of one open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

/// Per-open state handed to every device operation.
#[derive(Debug, Clone)]
pub struct FileContext {
    id: SessionId,
    flags: OpenFlags,
    owner: Option<ConsumerId>,
}

impl FileContext {
    fn new(flags: OpenFlags, owner: Option<ConsumerId>) -> Self {
        Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            flags,
            owner,
        }
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    #[inline]
    pub fn owner(&self) -> Option<ConsumerId> {
        self.owner
    }
}

/// Operations a character device provides to its sessions.
pub trait CharDeviceOps: Send + Sync {
    /// Called once per new session. An error aborts the open.
    fn open(&self, _file: &FileContext) -> DevResult {
        Ok(())
    }

    /// Called once when a session closes.
    fn release(&self, _file: &FileContext) {}

    fn read(&self, file: &FileContext, buf: &mut [u8]) -> DevResult<usize>;

    fn write(&self, file: &FileContext, buf: &[u8]) -> DevResult<usize>;

    /// Control channel: out-of-band commands, distinct from read/write.
    fn ioctl(&self, file: &FileContext, cmd: u32, arg: usize) -> DevResult<usize>;
}

/// One open handle to a device.
///
/// `Session` is `Sync`: several threads may read through the same handle.
/// Closing consumes it, so no operation can be running on it at that point.
pub struct Session {
    ops: Arc<dyn CharDeviceOps>,
    ctx: FileContext,
    released: bool,
}

impl Session {
    /// Opens a session with no owning consumer.
    pub fn open(ops: Arc<dyn CharDeviceOps>, flags: OpenFlags) -> DevResult<Self> {
        Self::open_inner(ops, FileContext::new(flags, None))
    }

    /// Opens a session on behalf of `owner`.
    pub fn open_as(
        ops: Arc<dyn CharDeviceOps>,
        flags: OpenFlags,
        owner: ConsumerId,
    ) -> DevResult<Self> {
        Self::open_inner(ops, FileContext::new(flags, Some(owner)))
    }

    fn open_inner(ops: Arc<dyn CharDeviceOps>, ctx: FileContext) -> DevResult<Self> {
        ops.open(&ctx)?;
        Ok(Self {
            ops,
            ctx,
            released: false,
        })
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.ctx.id
    }

    #[inline]
    pub fn flags(&self) -> OpenFlags {
        self.ctx.flags
    }

    #[inline]
    pub fn owner(&self) -> Option<ConsumerId> {
        self.ctx.owner
    }

    /// Reads into `buf`, returning the number of bytes produced.
    pub fn read(&self, buf: &mut [u8]) -> DevResult<usize> {
        self.ops.read(&self.ctx, buf)
    }

    pub fn write(&self, buf: &[u8]) -> DevResult<usize> {
        self.ops.write(&self.ctx, buf)
    }

    /// Issues a raw control-channel request.
    pub fn ioctl(&self, cmd: u32, arg: usize) -> DevResult<usize> {
        self.ops.ioctl(&self.ctx, cmd, arg)
    }

    /// Issues a decoded control-channel command.
    pub fn control(&self, command: ControlCommand) -> DevResult<usize> {
        let (cmd, arg) = command.encode();
        self.ioctl(cmd, arg)
    }

    /// Asks the device to deliver asynchronous readiness notifications to
    /// `consumer`.
    ///
    /// The readiness device does not implement this and answers
    /// `NotSupported`. Callers should fall back to blocking reads.
    pub fn register_consumer(&self, consumer: ConsumerId) -> DevResult {
        self.control(ControlCommand::ProcessId(consumer)).map(|_| ())
    }

    /// Closes the session. Dropping it has the same effect.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.ops.release(&self.ctx);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.ctx.id)
            .field("flags", &self.ctx.flags)
            .field("owner", &self.ctx.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DevError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl CharDeviceOps for Recorder {
        fn open(&self, file: &FileContext) -> DevResult {
            self.push(format!("open nonblocking={}", file.flags().is_nonblocking()));
            Ok(())
        }

        fn release(&self, _file: &FileContext) {
            self.push("release".into());
        }

        fn read(&self, _file: &FileContext, buf: &mut [u8]) -> DevResult<usize> {
            buf[0] = 7;
            Ok(1)
        }

        fn write(&self, _file: &FileContext, _buf: &[u8]) -> DevResult<usize> {
            Err(DevError::NotPermitted)
        }

        fn ioctl(&self, _file: &FileContext, cmd: u32, arg: usize) -> DevResult<usize> {
            self.push(format!("ioctl {cmd:#x} {arg}"));
            Err(DevError::NotSupported)
        }
    }

    #[test]
    fn test_open_read_close() {
        let device = Arc::new(Recorder::default());
        let session = Session::open(device.clone(), OpenFlags::NONBLOCKING).unwrap();
        assert!(session.flags().is_nonblocking());
        assert_eq!(session.owner(), None);

        let mut buf = [0u8; 4];
        assert_eq!(session.read(&mut buf), Ok(1));
        assert_eq!(buf[0], 7);
        assert_eq!(session.write(b"no"), Err(DevError::NotPermitted));

        session.close();
        assert_eq!(device.events(), vec!["open nonblocking=true", "release"]);
    }

    #[test]
    fn test_drop_releases_once() {
        let device = Arc::new(Recorder::default());
        {
            let _session = Session::open(device.clone(), OpenFlags::BLOCKING).unwrap();
        }
        assert_eq!(device.events(), vec!["open nonblocking=false", "release"]);
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let device = Arc::new(Recorder::default());
        let a = Session::open(device.clone(), OpenFlags::BLOCKING).unwrap();
        let b = Session::open(device.clone(), OpenFlags::BLOCKING).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_register_consumer_goes_through_control_channel() {
        let device = Arc::new(Recorder::default());
        let session =
            Session::open_as(device.clone(), OpenFlags::BLOCKING, ConsumerId(4242)).unwrap();
        assert_eq!(session.owner(), Some(ConsumerId(4242)));

        assert_eq!(
            session.register_consumer(ConsumerId(4242)),
            Err(DevError::NotSupported)
        );
        let (cmd, _) = ControlCommand::ProcessId(ConsumerId(4242)).encode();
        assert!(device.events().contains(&format!("ioctl {cmd:#x} 4242")));
    }
}
