use crate::serial_link::LinkError;
use std::fmt;
use std::str::FromStr;

/// Lowest voltage a ramp starts from; the meter does not regulate below it.
pub const RAMP_MIN_VOLTAGE: f64 = 3.0;

/// Upper bound for both current limits, in amperes.
pub const MAX_CURRENT_AMPS: f64 = 8.0;

const RAMP_STEP_CENTIVOLTS: i64 = 10;

pub const START_COLLECTION: [&[u8]; 2] = [
    &[0x01, 0x1b, 0x01],
    &[0x02, 0xff, 0xff, 0xff, 0xff, 0x03, 0xe8],
];
pub const STOP_COLLECTION: [u8; 2] = [0x03, 0x00];

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Current {value} A out of range (0 to 8 A)")]
    InvalidCurrent { value: f64 },

    #[error("Bad passthrough mode '{0}', expected one of: off, on, auto")]
    InvalidPassthrough(String),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

/// Whether the meter's USB port forwards to the device under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsbPassthrough {
    Off = 0,
    On = 1,
    #[default]
    Auto = 2,
}

impl UsbPassthrough {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsbPassthrough::Off => "off",
            UsbPassthrough::On => "on",
            UsbPassthrough::Auto => "auto",
        }
    }
}

impl FromStr for UsbPassthrough {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(UsbPassthrough::Off),
            "on" => Ok(UsbPassthrough::On),
            "auto" => Ok(UsbPassthrough::Auto),
            other => Err(ControlError::InvalidPassthrough(other.to_string())),
        }
    }
}

impl fmt::Display for UsbPassthrough {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which current limit a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentLimit {
    /// Limit while the device under test is running.
    RunTime,
    /// Limit during power-up.
    PowerUp,
}

impl CurrentLimit {
    const fn registers(self) -> (u8, u8) {
        match self {
            CurrentLimit::RunTime => (0x0a, 0x0b),
            CurrentLimit::PowerUp => (0x08, 0x09),
        }
    }
}

/// Payload for setting the output voltage. Zero turns the output off.
///
/// The device range is not checked here; values outside a byte saturate.
pub fn set_voltage_command(volts: f64) -> [u8; 3] {
    if volts == 0.0 {
        [0x01, 0x01, 0x00]
    } else {
        [0x01, 0x01, ((volts - 2.0) * 100.0).round() as u8]
    }
}

/// Payloads for setting a current limit: low byte first, then high byte of
/// the inverted 10-bit value.
pub fn current_limit_commands(limit: CurrentLimit, amps: f64) -> Result<[[u8; 3]; 2], ControlError> {
    if !(0.0..=MAX_CURRENT_AMPS).contains(&amps) {
        return Err(ControlError::InvalidCurrent { value: amps });
    }

    let value = 1023 - ((amps / MAX_CURRENT_AMPS) * 1023.0) as u16;
    let (low_register, high_register) = limit.registers();
    Ok([
        [0x01, low_register, (value & 0xff) as u8],
        [0x01, high_register, (value >> 8) as u8],
    ])
}

pub fn usb_passthrough_command(mode: UsbPassthrough) -> [u8; 3] {
    [0x01, 0x10, mode as u8]
}

/// Voltages visited when ramping from `start` to `end`.
///
/// Starts at `start` (raised to [`RAMP_MIN_VOLTAGE`]), climbs in 0.1 V steps
/// while below `end` and always finishes exactly on `end`.
pub fn ramp_steps(start: f64, end: f64) -> Vec<f64> {
    let start_cv = (start.max(RAMP_MIN_VOLTAGE) * 100.0).round() as i64;
    let end_cv = (end * 100.0).round() as i64;

    let mut steps: Vec<f64> = (start_cv..end_cv)
        .step_by(RAMP_STEP_CENTIVOLTS as usize)
        .map(|cv| cv as f64 / 100.0)
        .collect();
    steps.push(end);
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_voltage_encoding() {
        assert_eq!(set_voltage_command(0.0), [0x01, 0x01, 0x00]);
        assert_eq!(set_voltage_command(4.2), [0x01, 0x01, 220]);
        assert_eq!(set_voltage_command(4.1), [0x01, 0x01, 210]);
        assert_eq!(set_voltage_command(2.01), [0x01, 0x01, 1]);
    }

    #[test]
    fn test_current_limit_encoding() {
        assert_eq!(
            current_limit_commands(CurrentLimit::RunTime, 8.0).unwrap(),
            [[0x01, 0x0a, 0x00], [0x01, 0x0b, 0x00]]
        );
        assert_eq!(
            current_limit_commands(CurrentLimit::RunTime, 0.0).unwrap(),
            [[0x01, 0x0a, 0xff], [0x01, 0x0b, 0x03]]
        );
        // 1023 - trunc(0.25 * 1023) = 1023 - 255 = 768 = 0x300
        assert_eq!(
            current_limit_commands(CurrentLimit::PowerUp, 2.0).unwrap(),
            [[0x01, 0x08, 0x00], [0x01, 0x09, 0x03]]
        );
    }

    #[test]
    fn test_current_limit_out_of_range() {
        assert!(matches!(
            current_limit_commands(CurrentLimit::RunTime, 8.5),
            Err(ControlError::InvalidCurrent { .. })
        ));
        assert!(current_limit_commands(CurrentLimit::PowerUp, -0.1).is_err());
        assert!(current_limit_commands(CurrentLimit::PowerUp, f64::NAN).is_err());
    }

    #[test]
    fn test_passthrough_parsing() {
        assert_eq!("off".parse::<UsbPassthrough>().unwrap(), UsbPassthrough::Off);
        assert_eq!("on".parse::<UsbPassthrough>().unwrap(), UsbPassthrough::On);
        assert_eq!("auto".parse::<UsbPassthrough>().unwrap(), UsbPassthrough::Auto);
        assert!(matches!(
            "sometimes".parse::<UsbPassthrough>(),
            Err(ControlError::InvalidPassthrough(mode)) if mode == "sometimes"
        ));
        assert_eq!(usb_passthrough_command(UsbPassthrough::Auto), [0x01, 0x10, 0x02]);
    }

    #[test]
    fn test_ramp_is_monotonic_and_ends_on_target() {
        let steps = ramp_steps(3.0, 4.2);
        assert_eq!(steps.first(), Some(&3.0));
        assert_eq!(steps.last(), Some(&4.2));
        assert_eq!(steps.len(), 13);
        for pair in steps.windows(2) {
            assert!(pair[1] > pair[0]);
            assert!(pair[1] - pair[0] <= 0.1 + 1e-9);
        }
    }

    #[test]
    fn test_ramp_clamps_start_and_handles_odd_targets() {
        let steps = ramp_steps(0.0, 3.25);
        assert_eq!(steps, vec![3.0, 3.1, 3.2, 3.25]);

        // Already above the target: only the final set.
        assert_eq!(ramp_steps(4.5, 4.0), vec![4.0]);
    }
}
