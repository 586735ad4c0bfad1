//! Consumer identity and the control-channel command set.
//!
//! A consumer can ask the device to notify it asynchronously instead of
//! blocking in `read`. The request travels over the control channel as
//! [`ControlCommand::ProcessId`], encoded like a Linux `_IOW('k', 1, pid_t)`
//! request. The readiness device answers every command with `NotSupported`,
//! so the asynchronous path is never armed and consumers fall back to
//! blocking reads.
//!
//! ```text
//! consumer ── ProcessId(pid) ──> Session::control ──> device.ioctl ──> NotSupported
//!     │
//!     └── install_async_handler()   (SIGIO handler, counts deliveries)
//! ```

#[cfg(unix)]
pub mod signal;

/// Magic byte of the control-channel request codes.
pub const CONTROL_MAGIC: u8 = b'k';

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Request code of [`ControlCommand::ProcessId`].
        pub const PROCESS_ID: u32 = nix::request_code_write!(
            CONTROL_MAGIC,
            1,
            core::mem::size_of::<nix::libc::pid_t>()
        ) as u32;
    } else {
        /// Request code of [`ControlCommand::ProcessId`]: `_IOW('k', 1, i32)`.
        pub const PROCESS_ID: u32 = (1 << 30) | (4 << 16) | ((CONTROL_MAGIC as u32) << 8) | 1;
    }
}

/// Identifies a consumer process that may receive notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsumerId(pub i32);

impl core::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

#[cfg(unix)]
impl From<nix::unistd::Pid> for ConsumerId {
    fn from(pid: nix::unistd::Pid) -> Self {
        ConsumerId(pid.as_raw())
    }
}

/// A decoded control-channel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Register `ConsumerId` as the target of readiness notifications.
    ProcessId(ConsumerId),
    /// Any request code the device does not know.
    Unknown { cmd: u32, arg: usize },
}

impl ControlCommand {
    pub fn decode(cmd: u32, arg: usize) -> Self {
        match cmd {
            PROCESS_ID => ControlCommand::ProcessId(ConsumerId(arg as i32)),
            _ => ControlCommand::Unknown { cmd, arg },
        }
    }

    /// Returns the `(cmd, arg)` pair carried by the control channel.
    pub fn encode(self) -> (u32, usize) {
        match self {
            ControlCommand::ProcessId(id) => (PROCESS_ID, id.0 as u32 as usize),
            ControlCommand::Unknown { cmd, arg } => (cmd, arg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_id_layout() {
        // _IOW: direction "write" in the top bits, magic in bits 8..16, number 1.
        assert_eq!((PROCESS_ID >> 8) & 0xff, CONTROL_MAGIC as u32);
        assert_eq!(PROCESS_ID & 0xff, 1);
        assert_eq!((PROCESS_ID >> 16) & 0x1fff, 4);
    }

    #[test]
    fn test_decode() {
        assert_eq!(
            ControlCommand::decode(PROCESS_ID, 1234),
            ControlCommand::ProcessId(ConsumerId(1234))
        );
        assert_eq!(
            ControlCommand::decode(0xdead, 7),
            ControlCommand::Unknown { cmd: 0xdead, arg: 7 }
        );
    }

    #[test]
    fn test_encode_matches_decode() {
        let command = ControlCommand::ProcessId(ConsumerId(99));
        let (cmd, arg) = command.encode();
        assert_eq!(cmd, PROCESS_ID);
        assert_eq!(ControlCommand::decode(cmd, arg), command);
    }
}
