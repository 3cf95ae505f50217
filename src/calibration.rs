/// Amperes spanned between the zero and reference readings on the coarse channel.
pub const COARSE_REFERENCE_AMPS: f64 = 2.88;

/// Amperes spanned between the zero and reference readings on the fine channel.
pub const FINE_REFERENCE_AMPS: f64 = 0.0332;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Fine,
    Coarse,
}

impl Channel {
    /// The low bit of a raw main-channel reading selects the coarse range.
    ///
    /// The test is made on the raw value before masking, which is how the
    /// device encodes it on the wire.
    pub fn of_raw(raw: i16) -> Self {
        if raw & 1 != 0 {
            Channel::Coarse
        } else {
            Channel::Fine
        }
    }

    fn reference_amps(self) -> f64 {
        match self {
            Channel::Fine => FINE_REFERENCE_AMPS,
            Channel::Coarse => COARSE_REFERENCE_AMPS,
        }
    }
}

/// Two-point linear calibration of a single current range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelCalibration {
    zero: Option<i16>,
    reference: Option<i16>,
    scale: Option<f64>,
}

impl ChannelCalibration {
    pub fn zero(&self) -> Option<i16> {
        self.zero
    }

    pub fn reference(&self) -> Option<i16> {
        self.reference
    }

    /// Amperes per ADC count, `None` while calibration is pending.
    pub fn scale(&self) -> Option<f64> {
        self.scale
    }

    fn update_scale(&mut self, channel: Channel) {
        if let (Some(zero), Some(reference)) = (self.zero, self.reference) {
            // Equal readings keep whatever scale we had.
            if reference != zero {
                self.scale =
                    Some(channel.reference_amps() / (f64::from(reference) - f64::from(zero)));
            }
        }
    }

    fn to_amps(&self, raw: f64) -> Option<f64> {
        let zero = f64::from(self.zero?);
        Some((raw - zero) * self.scale?)
    }
}

/// Calibration of both current ranges, fed by calibration packets from the
/// data stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationState {
    fine: ChannelCalibration,
    coarse: ChannelCalibration,
}

impl CalibrationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, channel: Channel) -> &ChannelCalibration {
        match channel {
            Channel::Fine => &self.fine,
            Channel::Coarse => &self.coarse,
        }
    }

    pub fn set_zero(&mut self, fine: i16, coarse: i16) {
        log::debug!("Zero calibration: fine 0x{:04x}, coarse 0x{:04x}", fine, coarse);
        self.fine.zero = Some(fine);
        self.coarse.zero = Some(coarse);
        self.refresh();
    }

    pub fn set_reference(&mut self, fine: i16, coarse: i16) {
        log::debug!("Reference calibration: fine 0x{:04x}, coarse 0x{:04x}", fine, coarse);
        self.fine.reference = Some(fine);
        self.coarse.reference = Some(coarse);
        self.refresh();
    }

    fn refresh(&mut self) {
        self.fine.update_scale(Channel::Fine);
        self.coarse.update_scale(Channel::Coarse);
    }

    /// Both ranges have a usable scale.
    pub fn is_ready(&self) -> bool {
        self.fine.scale.is_some() && self.coarse.scale.is_some()
    }

    /// Convert a raw main-channel reading to amperes.
    pub fn current_amps(&self, raw_main: i16) -> Option<f64> {
        match Channel::of_raw(raw_main) {
            Channel::Coarse => self.coarse.to_amps(f64::from(raw_main & !1)),
            Channel::Fine => self.fine.to_amps(f64::from(raw_main)),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
