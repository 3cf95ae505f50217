//! Collection sessions: stream, calibrate and resample in one blocking loop.

use crate::config::CollectionRequest;
use crate::monsoon::{Monsoon, StreamRead};
use crate::resampler::{OutputSample, Resampler, ResamplerError};
use crate::serial_link::{LinkError, Transport};
use polars::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const TIME_COLUMN_NAME: &str = "time_s";
const CURRENT_COLUMN_NAME: &str = "current_a";
const AVERAGE_COLUMN_NAME: &str = "rolling_avg_a";
const TIMESTAMP_COLUMN_NAME: &str = "timestamp";

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("No status from the meter, cannot determine its sample rate")]
    NoStatus,

    #[error("Resampler configuration error: {0}")]
    Resampler(#[from] ResamplerError),

    #[error("Failed to build sample table: {0}")]
    Table(#[from] PolarsError),
}

/// A resampled output with its wall-clock second, if requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedSample {
    pub sample: OutputSample,
    pub timestamp: Option<u64>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requested number of samples was emitted.
    Completed,
    /// The meter stopped sending data.
    EndOfStream,
    /// The caller's cancellation flag was set.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSummary {
    pub native_hz: u32,
    pub output_hz: u32,
    /// Outputs handed to the sink.
    pub emitted: u64,
    /// Native samples folded into outputs.
    pub consumed: u64,
    pub stop_reason: StopReason,
}

impl<T: Transport> Monsoon<T> {
    /// Run a collection session, handing each output sample to `sink`.
    ///
    /// The meter is put into a known state, its native rate is read from a
    /// fresh status record, and measurement data is resampled to
    /// `request.output_hz`. Collection is stopped on the meter before this
    /// returns, whatever the reason for returning.
    pub fn collect<F>(
        &mut self,
        request: &CollectionRequest,
        cancel: &AtomicBool,
        mut sink: F,
    ) -> Result<CollectionSummary, CollectionError>
    where
        F: FnMut(TimedSample),
    {
        let _span = tracing::debug_span!("collect", samples = ?request.samples, hz = request.output_hz)
            .entered();

        self.stop_data_collection()?;
        let status = self.status()?.ok_or(CollectionError::NoStatus)?;
        let native_hz = status.sample_rate_hz();
        let mut resampler =
            Resampler::new(native_hz, request.output_hz, request.rolling_average)?;
        log::debug!(
            "Native rate {} Hz, output rate {} Hz",
            native_hz,
            request.output_hz
        );

        let result = match self.start_data_collection() {
            Ok(()) => self.run_session(&mut resampler, request, cancel, &mut sink),
            Err(e) => Err(e.into()),
        };
        let stopped = self.stop_data_collection();

        let (stop_reason, emitted) = result?;
        stopped?;
        Ok(CollectionSummary {
            native_hz,
            output_hz: request.output_hz,
            emitted,
            consumed: resampler.consumed(),
            stop_reason,
        })
    }

    /// Feed the resampler one frame at a time until the session ends.
    /// Returns why it ended and how many outputs reached `sink`.
    fn run_session<F>(
        &mut self,
        resampler: &mut Resampler,
        request: &CollectionRequest,
        cancel: &AtomicBool,
        sink: &mut F,
    ) -> Result<(StopReason, u64), CollectionError>
    where
        F: FnMut(TimedSample),
    {
        let mut emitted = 0u64;
        loop {
            #[cfg(feature = "cpu-profiling")]
            let _zone = tracy_client::span!("collection step");

            if request.samples.remaining(emitted) == Some(0) {
                return Ok((StopReason::Completed, emitted));
            }
            if cancel.load(Ordering::SeqCst) {
                log::info!("Interrupted");
                return Ok((StopReason::Cancelled, emitted));
            }

            match resampler.step() {
                Some(outputs) => {
                    let timestamp = request.timestamp.then(unix_seconds);
                    let take = request
                        .samples
                        .remaining(emitted)
                        .map_or(outputs.len(), |n| outputs.len().min(n as usize));
                    for sample in outputs.into_iter().take(take) {
                        sink(TimedSample { sample, timestamp });
                        emitted += 1;
                    }
                }
                None => match self.read_stream_frame()? {
                    StreamRead::Samples(samples) => resampler.extend(samples),
                    StreamRead::Nothing => {}
                    StreamRead::EndOfStream => return Ok((StopReason::EndOfStream, emitted)),
                },
            }
        }
    }

    /// Run a session and gather its output in a table with one row per sample.
    pub fn collect_frame(
        &mut self,
        request: &CollectionRequest,
        cancel: &AtomicBool,
    ) -> Result<(DataFrame, CollectionSummary), CollectionError> {
        let mut samples = Vec::new();
        let summary = self.collect(request, cancel, |s| samples.push(s))?;
        let df = samples_to_dataframe(&samples, request.output_hz)?;
        Ok((df, summary))
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Build a table of output samples. Time is relative to the first sample.
pub fn samples_to_dataframe(
    samples: &[TimedSample],
    output_hz: u32,
) -> Result<DataFrame, PolarsError> {
    let period = 1.0 / f64::from(output_hz.max(1));
    let time: Vec<f64> = (0..samples.len()).map(|i| i as f64 * period).collect();
    let current: Vec<f64> = samples.iter().map(|s| s.sample.value).collect();
    let average: Vec<Option<f64>> = samples.iter().map(|s| s.sample.rolling_average).collect();
    let timestamp: Vec<Option<u64>> = samples.iter().map(|s| s.timestamp).collect();

    DataFrame::new(vec![
        Column::new(TIME_COLUMN_NAME.into(), time),
        Column::new(CURRENT_COLUMN_NAME.into(), current),
        Column::new(AVERAGE_COLUMN_NAME.into(), average),
        Column::new(TIMESTAMP_COLUMN_NAME.into(), timestamp),
    ])
}
