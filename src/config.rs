//! Driver configuration.
//!
//! [`MonsoonConfig`] is built once and handed to the driver; nothing in the
//! crate reads process-wide settings.

use crate::control::UsbPassthrough;
use crate::serial_link::DEFAULT_READ_TIMEOUT;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Default output rate of a collection session.
pub const DEFAULT_OUTPUT_HZ: u32 = 5000;

/// What to do when no meter is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Fail right away.
    NoWait,
    /// Rescan at `interval` until a meter shows up or the caller cancels.
    Forever { interval: Duration },
    /// Scan at most `attempts` times.
    Attempts { attempts: u32, interval: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Forever {
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonsoonConfig {
    /// Use exactly this serial device instead of scanning.
    pub device: Option<String>,
    /// Only accept the meter with this serial number.
    pub serial_number: Option<u16>,
    pub retry: RetryPolicy,
    pub read_timeout: Duration,
    /// Where per-device lock files live.
    pub lock_dir: PathBuf,
    /// Pause between voltage steps while ramping.
    pub ramp_step_delay: Duration,
}

impl Default for MonsoonConfig {
    fn default() -> Self {
        Self {
            device: None,
            serial_number: None,
            retry: RetryPolicy::default(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            lock_dir: std::env::temp_dir(),
            ramp_step_delay: Duration::from_millis(100),
        }
    }
}

impl MonsoonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn serial_number(mut self, serial_number: u16) -> Self {
        self.serial_number = Some(serial_number);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shorthand for [`RetryPolicy::NoWait`].
    pub fn no_wait(self) -> Self {
        self.retry(RetryPolicy::NoWait)
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    pub fn ramp_step_delay(mut self, delay: Duration) -> Self {
        self.ramp_step_delay = delay;
        self
    }
}

/// How many output samples a collection session produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLimit {
    Count(u64),
    Unbounded,
}

impl SampleLimit {
    /// `-1` means unbounded, as on the command line.
    pub fn from_signed(samples: i64) -> Self {
        u64::try_from(samples).map_or(SampleLimit::Unbounded, SampleLimit::Count)
    }

    pub fn remaining(self, emitted: u64) -> Option<u64> {
        match self {
            SampleLimit::Count(n) => Some(n.saturating_sub(emitted)),
            SampleLimit::Unbounded => None,
        }
    }
}

/// Options of a single collection session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRequest {
    pub samples: SampleLimit,
    pub output_hz: u32,
    pub rolling_average: Option<NonZeroUsize>,
    /// Stamp each output with the wall-clock second it was produced in.
    pub timestamp: bool,
}

impl CollectionRequest {
    pub fn new(samples: SampleLimit) -> Self {
        Self {
            samples,
            output_hz: DEFAULT_OUTPUT_HZ,
            rolling_average: None,
            timestamp: false,
        }
    }

    pub fn output_hz(mut self, hz: u32) -> Self {
        self.output_hz = hz;
        self
    }

    pub fn rolling_average(mut self, depth: usize) -> Self {
        self.rolling_average = NonZeroUsize::new(depth);
        self
    }

    pub fn timestamp(mut self, enabled: bool) -> Self {
        self.timestamp = enabled;
        self
    }
}

/// One-shot output settings applied right after connecting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterSettings {
    pub voltage: Option<f64>,
    /// Ramp up to `voltage` instead of jumping to it.
    pub ramp: bool,
    pub max_current: Option<f64>,
    pub max_power_up_current: Option<f64>,
    pub usb_passthrough: Option<UsbPassthrough>,
}
