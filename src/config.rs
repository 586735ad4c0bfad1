//! Device startup configuration and its `USERDEV_*` environment overrides.

use core::time::Duration;
use std::str::FromStr;

use crate::error::DevResult;

/// Node name the device is published under unless configured otherwise.
pub const DEFAULT_DEVICE_NAME: &str = "userspace";
/// Class the device node is created in.
pub const DEFAULT_CLASS_NAME: &str = "chardev";
/// Interval between two readiness events.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(5);

/// Startup configuration for a [`UserspaceDevice`](crate::UserspaceDevice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Stable name the device is reachable under.
    pub name: String,
    /// Class the node is created in.
    pub class_name: String,
    /// Producer period.
    pub period: Duration,
    /// Fixed major number, or `None` for dynamic allocation.
    pub major: Option<u32>,
    /// Whether the readiness flag starts out `ready`.
    pub initially_ready: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::from(DEFAULT_DEVICE_NAME),
            class_name: String::from(DEFAULT_CLASS_NAME),
            period: DEFAULT_PERIOD,
            major: None,
            initially_ready: true,
        }
    }
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_major(mut self, major: u32) -> Self {
        self.major = Some(major);
        self
    }

    pub fn initially_ready(mut self, ready: bool) -> Self {
        self.initially_ready = ready;
        self
    }

    /// Builds a configuration from `USERDEV_*` environment variables.
    ///
    /// Unset or unparseable variables keep their default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a caller-supplied lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| parse_var::<u64>(&v));

        Self {
            name: lookup("USERDEV_NAME").unwrap_or(defaults.name),
            class_name: lookup("USERDEV_CLASS").unwrap_or(defaults.class_name),
            period: parse("USERDEV_PERIOD_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.period),
            major: lookup("USERDEV_MAJOR")
                .and_then(|v| parse_var::<u32>(&v))
                .or(defaults.major),
            initially_ready: lookup("USERDEV_INITIALLY_READY")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(defaults.initially_ready),
        }
    }

    /// Checks the configuration before any resource is acquired.
    pub fn validate(&self) -> DevResult {
        if self.name.is_empty() {
            return dev_err!(InvalidInput, "device name is empty");
        }
        if self.class_name.is_empty() {
            return dev_err!(InvalidInput, "class name is empty");
        }
        if self.period.is_zero() {
            return dev_err!(InvalidInput, "producer period must be non-zero");
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}
