//! Exact-ratio sample rate conversion.
//!
//! Converts `native_hz` input samples per second into `output_hz` output
//! samples per second with a Bresenham-style integer error accumulator, so
//! rates that don't divide each other never drift over long runs. The
//! accumulator holds
//!
//! ```text
//! offset = consumed * output_hz - emitted * native_hz
//! ```
//!
//! and stays within `0..native_hz` between steps.

use std::collections::VecDeque;
use std::num::NonZeroUsize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResamplerError {
    #[error("Native sample rate must be greater than 0")]
    ZeroNativeRate,

    #[error("Output sample rate must be greater than 0")]
    ZeroOutputRate,
}

/// One resampled value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputSample {
    /// Mean of the native samples folded into this output.
    pub value: f64,
    /// Mean over the most recent outputs, when a rolling window is configured.
    pub rolling_average: Option<f64>,
}

/// Mean over the last `depth` values, most recent first.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    window: VecDeque<f64>,
    depth: NonZeroUsize,
}

impl RollingAverage {
    pub fn new(depth: NonZeroUsize) -> Self {
        Self {
            window: VecDeque::with_capacity(depth.get()),
            depth,
        }
    }

    /// Add a value and return the mean of the window including it.
    pub fn push(&mut self, value: f64) -> f64 {
        self.window.push_front(value);
        self.window.truncate(self.depth.get());
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Resampler {
    native_hz: u64,
    output_hz: u64,
    offset: u64,
    consumed: u64,
    emitted: u64,
    pending: VecDeque<f64>,
    rolling: Option<RollingAverage>,
}

impl Resampler {
    pub fn new(
        native_hz: u32,
        output_hz: u32,
        rolling_window: Option<NonZeroUsize>,
    ) -> Result<Self, ResamplerError> {
        if native_hz == 0 {
            return Err(ResamplerError::ZeroNativeRate);
        }
        if output_hz == 0 {
            return Err(ResamplerError::ZeroOutputRate);
        }

        Ok(Self {
            native_hz: u64::from(native_hz),
            output_hz: u64::from(output_hz),
            offset: 0,
            consumed: 0,
            emitted: 0,
            pending: VecDeque::new(),
            rolling: rolling_window.map(RollingAverage::new),
        })
    }

    /// Buffer native samples.
    pub fn extend<I: IntoIterator<Item = f64>>(&mut self, samples: I) {
        self.pending.extend(samples);
    }

    /// Native samples required before the next output can be produced.
    pub fn needed(&self) -> usize {
        (self.native_hz - self.offset).div_ceil(self.output_hz) as usize
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Consume the next group of native samples and return the outputs it
    /// produces: usually one, several when upsampling. Returns `None` when
    /// not enough samples are buffered yet.
    pub fn step(&mut self) -> Option<Vec<OutputSample>> {
        let need = self.needed();
        if self.pending.len() < need {
            return None;
        }

        let value = self.pending.drain(..need).sum::<f64>() / need as f64;
        self.consumed += need as u64;
        self.offset += need as u64 * self.output_hz;

        let mut outputs = Vec::with_capacity((self.offset / self.native_hz) as usize);
        while self.offset >= self.native_hz {
            let rolling_average = self.rolling.as_mut().map(|r| r.push(value));
            outputs.push(OutputSample {
                value,
                rolling_average,
            });
            self.offset -= self.native_hz;
            self.emitted += 1;
        }
        Some(outputs)
    }
}
