use crate::config::{MeterSettings, MonsoonConfig};
use crate::control::{
    current_limit_commands, ramp_steps, set_voltage_command, usb_passthrough_command, ControlError,
    CurrentLimit, UsbPassthrough, START_COLLECTION, STOP_COLLECTION,
};
use crate::data_stream::DataStream;
use crate::device_locator::{ConnectorError, DeviceLocator, DeviceLock};
use crate::frame_codec::FrameRead;
use crate::serial_link::{LinkError, MonsoonLink, Transport};
use crate::status::{StatusRecord, STATUS_REQUEST};
use serialport::SerialPort;
use std::thread;
use std::time::Duration;

/// Outcome of reading one frame while collection is running.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRead {
    /// Calibrated current samples in amperes.
    Samples(Vec<f64>),
    /// The frame carried no usable measurements.
    Nothing,
    /// The meter stayed silent until the read timeout.
    EndOfStream,
}

/// A connection to one Monsoon power monitor.
///
/// Obtained through [`Monsoon::connect`], which finds and locks a meter, or
/// through [`Monsoon::new`] on an already opened transport.
#[derive(Debug)]
pub struct Monsoon<T: Transport = Box<dyn SerialPort>> {
    link: MonsoonLink<T>,
    stream: DataStream,
    usb_passthrough: UsbPassthrough,
    start_voltage: f64,
    ramp_step_delay: Duration,
    lock: Option<DeviceLock>,
}

impl Monsoon {
    /// Find, lock and open a meter as described by `config`.
    pub fn connect(config: &MonsoonConfig) -> Result<Self, ConnectorError> {
        DeviceLocator::new(config.clone()).locate()
    }
}

impl<T: Transport> Monsoon<T> {
    pub fn new(transport: T, config: &MonsoonConfig) -> Self {
        Self {
            link: MonsoonLink::new(transport),
            stream: DataStream::new(),
            usb_passthrough: UsbPassthrough::default(),
            start_voltage: 0.0,
            ramp_step_delay: config.ramp_step_delay,
            lock: None,
        }
    }

    /// Keep the device lock for as long as this connection lives.
    pub(crate) fn attach(&mut self, lock: DeviceLock, start_voltage: f64) {
        log::debug!("Holding lock {}", lock.path().display());
        self.lock = Some(lock);
        self.start_voltage = start_voltage;
    }

    /// Output voltage the meter reported when we connected.
    pub fn start_voltage(&self) -> f64 {
        self.start_voltage
    }

    pub fn link(&self) -> &MonsoonLink<T> {
        &self.link
    }

    pub fn data_stream(&self) -> &DataStream {
        &self.stream
    }

    /// Request a status record and wait for it, skipping any other packets.
    /// Returns `None` if the meter didn't answer before the read timeout.
    pub fn status(&mut self) -> Result<Option<StatusRecord>, LinkError> {
        self.link.send(&STATUS_REQUEST)?;
        loop {
            match self.link.receive()? {
                FrameRead::NoData => return Ok(None),
                FrameRead::Dropped => {}
                FrameRead::Frame(bytes) => match StatusRecord::decode(&bytes) {
                    Ok(status) => return Ok(Some(status)),
                    Err(e) => log::debug!(
                        "Wanted status, dropped type=0x{:02x}, len={}: {}",
                        bytes.first().copied().unwrap_or(0),
                        bytes.len(),
                        e
                    ),
                },
            }
        }
    }

    /// Set the output voltage, 0 to disable.
    pub fn set_voltage(&mut self, volts: f64) -> Result<(), LinkError> {
        log::debug!("Setting voltage to {}", volts);
        self.link.send(&set_voltage_command(volts))
    }

    /// Walk the output voltage up to `end` in small steps so the meter's
    /// overvoltage protection doesn't trip.
    pub fn ramp_voltage(&mut self, start: f64, end: f64) -> Result<(), LinkError> {
        let steps = ramp_steps(start, end);
        let last = steps.len().saturating_sub(1);
        for (i, volts) in steps.into_iter().enumerate() {
            self.set_voltage(volts)?;
            if i < last {
                thread::sleep(self.ramp_step_delay);
            }
        }
        Ok(())
    }

    pub fn set_max_current(&mut self, amps: f64) -> Result<(), ControlError> {
        self.set_current_limit(CurrentLimit::RunTime, amps)
    }

    pub fn set_max_power_up_current(&mut self, amps: f64) -> Result<(), ControlError> {
        self.set_current_limit(CurrentLimit::PowerUp, amps)
    }

    fn set_current_limit(&mut self, limit: CurrentLimit, amps: f64) -> Result<(), ControlError> {
        // Validate before anything goes out on the wire.
        let commands = current_limit_commands(limit, amps)?;
        log::debug!("Setting {:?} current limit to {} A", limit, amps);
        for command in &commands {
            self.link.send(command)?;
        }
        Ok(())
    }

    pub fn set_usb_passthrough(&mut self, mode: UsbPassthrough) -> Result<(), LinkError> {
        log::debug!("Setting USB passthrough to {}", mode);
        self.link.send(&usb_passthrough_command(mode))?;
        self.usb_passthrough = mode;
        Ok(())
    }

    /// Last passthrough mode set through this connection.
    pub fn usb_passthrough(&self) -> UsbPassthrough {
        self.usb_passthrough
    }

    /// Apply one-shot output settings in the order the meter expects them:
    /// voltage, run-time current, passthrough, power-up current.
    pub fn apply_settings(&mut self, settings: &MeterSettings) -> Result<(), ControlError> {
        if let Some(volts) = settings.voltage {
            if settings.ramp {
                self.ramp_voltage(self.start_voltage, volts)?;
            } else {
                self.set_voltage(volts)?;
            }
        }
        if let Some(amps) = settings.max_current {
            self.set_max_current(amps)?;
        }
        if let Some(mode) = settings.usb_passthrough {
            self.set_usb_passthrough(mode)?;
        }
        if let Some(amps) = settings.max_power_up_current {
            self.set_max_power_up_current(amps)?;
        }
        Ok(())
    }

    /// Tell the meter to start streaming measurements.
    pub fn start_data_collection(&mut self) -> Result<(), LinkError> {
        log::debug!("Starting data collection");
        for command in START_COLLECTION {
            self.link.send(command)?;
        }
        Ok(())
    }

    pub fn stop_data_collection(&mut self) -> Result<(), LinkError> {
        log::debug!("Stopping data collection");
        self.link.send(&STOP_COLLECTION)
    }

    pub(crate) fn flush_input(&mut self) -> Result<(), LinkError> {
        self.link.flush_input()
    }

    /// Read a single frame of the data stream. Calibration packets update
    /// calibration and yield [`StreamRead::Nothing`], as do dropped frames.
    pub fn read_stream_frame(&mut self) -> Result<StreamRead, LinkError> {
        Ok(match self.link.receive()? {
            FrameRead::NoData => StreamRead::EndOfStream,
            FrameRead::Dropped => StreamRead::Nothing,
            FrameRead::Frame(bytes) => match self.stream.process_frame(&bytes) {
                Some(samples) => StreamRead::Samples(samples),
                None => StreamRead::Nothing,
            },
        })
    }

    /// Read until a measurement packet arrives and return its calibrated
    /// current samples in amperes. Calibration packets are absorbed on the
    /// way. `None` means the stream went silent.
    pub fn collect_data(&mut self) -> Result<Option<Vec<f64>>, LinkError> {
        loop {
            match self.read_stream_frame()? {
                StreamRead::Samples(samples) => return Ok(Some(samples)),
                StreamRead::Nothing => {}
                StreamRead::EndOfStream => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_codec::encode_frame;
    use crate::serial_link::mock::ScriptedTransport;
    use crate::status::testing::raw_status;
    use zerocopy::byteorder::big_endian::U16;

    fn monsoon_with_input(input: Vec<u8>) -> Monsoon<ScriptedTransport> {
        let config = MonsoonConfig::new().ramp_step_delay(Duration::ZERO);
        Monsoon::new(ScriptedTransport::with_input(input), &config)
    }

    fn written(monsoon: &Monsoon<ScriptedTransport>) -> &[u8] {
        &monsoon.link().transport().written
    }

    fn frames(payloads: &[&[u8]]) -> Vec<u8> {
        payloads.iter().flat_map(|p| encode_frame(p)).collect()
    }

    #[test]
    fn test_status_skips_other_frames() {
        let status = raw_status(|s| {
            s.serial_number = U16::new(99);
            s.voltage1 = U16::new(29_600);
        });
        let input = frames(&[&[0x21, 0x00, 0, 0], &status]);
        let mut monsoon = monsoon_with_input(input);

        let record = monsoon.status().unwrap().unwrap();
        assert_eq!(record.serial_number(), 99);
        assert!((record.voltage1() - 3.7).abs() < 1e-9);
        assert_eq!(written(&monsoon), encode_frame(&STATUS_REQUEST).as_slice());
    }

    #[test]
    fn test_status_times_out() {
        let mut monsoon = monsoon_with_input(frames(&[&[0x21, 0x00, 0, 0]]));
        assert_eq!(monsoon.status().unwrap(), None);
    }

    #[test]
    fn test_invalid_current_is_not_sent() {
        let mut monsoon = monsoon_with_input(Vec::new());
        assert!(matches!(
            monsoon.set_max_current(9.0),
            Err(ControlError::InvalidCurrent { .. })
        ));
        assert!(written(&monsoon).is_empty());
    }

    #[test]
    fn test_ramp_sends_one_command_per_step() {
        let mut monsoon = monsoon_with_input(Vec::new());
        monsoon.ramp_voltage(3.0, 4.2).unwrap();

        let expected: Vec<u8> = ramp_steps(3.0, 4.2)
            .into_iter()
            .flat_map(|v| encode_frame(&set_voltage_command(v)))
            .collect();
        assert_eq!(written(&monsoon), expected.as_slice());

        let arguments: Vec<u8> = written(&monsoon).chunks(5).map(|frame| frame[3]).collect();
        assert_eq!(arguments.first(), Some(&100));
        assert_eq!(arguments.last(), Some(&220));
        assert!(arguments.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[test]
    fn test_apply_settings_order() {
        let mut monsoon = monsoon_with_input(Vec::new());
        monsoon
            .apply_settings(&MeterSettings {
                voltage: Some(3.7),
                ramp: false,
                max_current: Some(8.0),
                max_power_up_current: Some(8.0),
                usb_passthrough: Some(UsbPassthrough::Off),
            })
            .unwrap();

        let expected = frames(&[
            &[0x01, 0x01, 170],
            &[0x01, 0x0a, 0x00],
            &[0x01, 0x0b, 0x00],
            &[0x01, 0x10, 0x00],
            &[0x01, 0x08, 0x00],
            &[0x01, 0x09, 0x00],
        ]);
        assert_eq!(written(&monsoon), expected.as_slice());
        assert_eq!(monsoon.usb_passthrough(), UsbPassthrough::Off);
    }

    #[test]
    fn test_set_voltage_and_passthrough() {
        let mut monsoon = monsoon_with_input(Vec::new());
        assert_eq!(monsoon.usb_passthrough(), UsbPassthrough::Auto);

        monsoon.set_voltage(0.0).unwrap();
        monsoon.set_voltage(4.2).unwrap();
        monsoon.set_usb_passthrough(UsbPassthrough::On).unwrap();

        let expected = frames(&[&[0x01, 0x01, 0], &[0x01, 0x01, 220], &[0x01, 0x10, 0x01]]);
        assert_eq!(written(&monsoon), expected.as_slice());
        assert_eq!(monsoon.usb_passthrough(), UsbPassthrough::On);
    }

    #[test]
    fn test_status_after_settings_reports_configured_state() {
        let status = raw_status(|s| s.output_voltage_setting = 170);
        let transport = ScriptedTransport::default()
            .reply_to(encode_frame(&STATUS_REQUEST), encode_frame(&status));
        let mut monsoon = Monsoon::new(transport, &MonsoonConfig::new());

        monsoon
            .apply_settings(&MeterSettings {
                voltage: Some(3.7),
                ..MeterSettings::default()
            })
            .unwrap();
        let record = monsoon.status().unwrap().unwrap();

        assert!((record.output_voltage_setting() - 3.7).abs() < 1e-9);
        let expected = frames(&[&[0x01, 0x01, 170], &STATUS_REQUEST]);
        assert_eq!(written(&monsoon), expected.as_slice());
    }

    #[test]
    fn test_start_and_stop_commands() {
        let mut monsoon = monsoon_with_input(Vec::new());
        monsoon.start_data_collection().unwrap();
        monsoon.stop_data_collection().unwrap();

        let expected = frames(&[
            &[0x01, 0x1b, 0x01],
            &[0x02, 0xff, 0xff, 0xff, 0xff, 0x03, 0xe8],
            &[0x03, 0x00],
        ]);
        assert_eq!(written(&monsoon), expected.as_slice());
    }

    #[test]
    fn test_collect_data_skips_bad_frames() {
        let mut corrupted = encode_frame(&[0x20, 0x01, 0, 0, 0, 50, 0, 0, 0, 0, 0, 0, 0]);
        corrupted[3] ^= 0xff;

        let mut input = corrupted;
        input.extend(frames(&[
            &crate::data_stream::testing::data_payload(0, 1, &[50, 100]),
            &crate::data_stream::testing::data_payload(1, 2, &[350, 1100]),
            &crate::data_stream::testing::data_payload(2, 0, &[50, 101]),
        ]));
        let mut monsoon = monsoon_with_input(input);

        assert_eq!(monsoon.collect_data().unwrap(), Some(vec![0.0, 0.0]));
        assert_eq!(monsoon.collect_data().unwrap(), None);
    }
}
