//! # Monsoon RS
//!
//! A Rust driver for the Monsoon USB power monitor.
//!
//! The meter speaks a small binary protocol over a CDC-ACM serial port. This
//! crate frames and checks that protocol, keeps the meter's current
//! calibration, turns streamed ADC readings into amperes and resamples the
//! meter's native rate to whatever output rate the caller asks for.
//!
//! ## Features
//!
//! - **Device discovery**: Scans `ttyACM*` ports, locks one meter exclusively
//!   and optionally matches its serial number
//! - **Output control**: Set or ramp the output voltage, current limits and
//!   USB passthrough
//! - **Calibrated streaming**: Fine/coarse two-point calibration applied on
//!   the fly
//! - **Exact resampling**: Integer accumulator, no drift between native and
//!   output rates, optional rolling average
//! - **DataFrame output**: Uses `polars` for collected samples
//!
//! ## Examples
//!
//! ### Connecting and setting the output
//!
//! ```rust,no_run
//! use monsoon_rs::{Monsoon, MonsoonConfig};
//!
//! let mut monsoon = Monsoon::connect(&MonsoonConfig::new())?;
//! monsoon.ramp_voltage(monsoon.start_voltage(), 4.2)?;
//! monsoon.set_max_current(3.0)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Collecting samples
//!
//! ```rust,no_run
//! use monsoon_rs::{CollectionRequest, Monsoon, MonsoonConfig, SampleLimit};
//! use std::sync::atomic::AtomicBool;
//!
//! let config = MonsoonConfig::new().serial_number(12345).no_wait();
//! let mut monsoon = Monsoon::connect(&config)?;
//!
//! let request = CollectionRequest::new(SampleLimit::Count(50))
//!     .output_hz(10)
//!     .rolling_average(5);
//! let cancel = AtomicBool::new(false);
//! monsoon.collect(&request, &cancel, |s| {
//!     println!("{:.6} {:.6}", s.sample.value, s.sample.rolling_average.unwrap_or_default());
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Resampling on its own
//!
//! ```rust
//! use monsoon_rs::Resampler;
//!
//! let mut resampler = Resampler::new(5000, 5, None).unwrap();
//! resampler.extend(std::iter::repeat_n(0.25, 1000));
//! let out = resampler.step().unwrap();
//! assert_eq!(out.len(), 1);
//! assert_eq!(out[0].value, 0.25);
//! ```

pub mod calibration;
pub mod collection;
pub mod config;
pub mod control;
pub mod data_stream;
pub mod device_locator;
pub mod frame_codec;
pub mod monsoon;
pub mod resampler;
pub mod serial_link;
pub mod status;

// Re-export the main types for convenience
pub use calibration::{CalibrationState, Channel};
pub use collection::{CollectionError, CollectionSummary, StopReason, TimedSample};
pub use config::{CollectionRequest, MeterSettings, MonsoonConfig, RetryPolicy, SampleLimit};
pub use control::{ControlError, CurrentLimit, UsbPassthrough};
pub use data_stream::{DataPacket, DataStream, PacketKind, Reading, ReadingRaw};
pub use device_locator::{ConnectorError, DeviceLocator, DeviceLock, PortProvider, SerialPortProvider};
pub use frame_codec::FrameRead;
pub use monsoon::{Monsoon, StreamRead};
pub use resampler::{OutputSample, Resampler, ResamplerError};
pub use serial_link::{LinkError, MonsoonLink, Transport};
pub use status::{StatusRaw, StatusRecord, StatusValue};
