//! Decoding of the fixed-layout status record.
//!
//! The record is a packed big-endian structure. Raw values are converted to
//! physical units by rules keyed on the field name, e.g. every field ending in
//! `Resistor` is an offset from 50 mOhm in 0.1 mOhm steps.

use std::collections::BTreeMap;
use std::fmt;
use zerocopy::byteorder::big_endian::{I16, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Leading tag of a status record.
pub const STATUS_PACKET_TYPE: u8 = 0x10;

/// Payload of the "get status" command.
pub const STATUS_REQUEST: [u8; 3] = [0x01, 0x00, 0x00];

/// Size of a status record payload in bytes.
pub const STATUS_RECORD_LEN: usize = size_of::<StatusRaw>();

/// Status record exactly as it sits on the wire.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct StatusRaw {
    pub packet_type: u8,
    pub firmware_version: u8,
    pub protocol_version: u8,
    pub main_fine_current: I16,
    pub usb_fine_current: I16,
    pub aux_fine_current: I16,
    pub voltage1: U16,
    pub main_coarse_current: I16,
    pub usb_coarse_current: I16,
    pub aux_coarse_current: I16,
    pub voltage2: U16,
    pub output_voltage_setting: u8,
    pub temperature: u8,
    pub status: u8,
    pub reserved: u8,
    pub leds: u8,
    pub main_fine_resistor: i8,
    pub serial_number: U16,
    pub sample_rate: u8, // kHz
    pub dac_cal_low: U16,
    pub dac_cal_high: U16,
    pub power_up_current_limit: U16,
    pub run_time_current_limit: U16,
    pub power_up_time: u8,
    pub usb_fine_resistor: i8,
    pub aux_fine_resistor: i8,
    pub initial_usb_voltage: U16,
    pub initial_aux_voltage: U16,
    pub hardware_revision: u8,
    pub temperature_limit: u8,
    pub usb_passthrough_mode: u8,
    pub main_coarse_resistor: i8,
    pub usb_coarse_resistor: i8,
    pub aux_coarse_resistor: i8,
    pub def_main_fine_resistor: i8,
    pub def_usb_fine_resistor: i8,
    pub def_aux_fine_resistor: i8,
    pub def_main_coarse_resistor: i8,
    pub def_usb_coarse_resistor: i8,
    pub def_aux_coarse_resistor: i8,
    pub event_code: u8,
    pub event_data: U16,
}

/// Number of named fields in a status record.
pub const STATUS_FIELD_COUNT: usize = 41;

impl StatusRaw {
    /// Raw field values under the names the meter's documentation uses.
    pub fn fields(&self) -> [(&'static str, i32); STATUS_FIELD_COUNT] {
        [
            ("packetType", i32::from(self.packet_type)),
            ("firmwareVersion", i32::from(self.firmware_version)),
            ("protocolVersion", i32::from(self.protocol_version)),
            ("mainFineCurrent", i32::from(self.main_fine_current.get())),
            ("usbFineCurrent", i32::from(self.usb_fine_current.get())),
            ("auxFineCurrent", i32::from(self.aux_fine_current.get())),
            ("voltage1", i32::from(self.voltage1.get())),
            ("mainCoarseCurrent", i32::from(self.main_coarse_current.get())),
            ("usbCoarseCurrent", i32::from(self.usb_coarse_current.get())),
            ("auxCoarseCurrent", i32::from(self.aux_coarse_current.get())),
            ("voltage2", i32::from(self.voltage2.get())),
            ("outputVoltageSetting", i32::from(self.output_voltage_setting)),
            ("temperature", i32::from(self.temperature)),
            ("status", i32::from(self.status)),
            ("leds", i32::from(self.leds)),
            ("mainFineResistor", i32::from(self.main_fine_resistor)),
            ("serialNumber", i32::from(self.serial_number.get())),
            ("sampleRate", i32::from(self.sample_rate)),
            ("dacCalLow", i32::from(self.dac_cal_low.get())),
            ("dacCalHigh", i32::from(self.dac_cal_high.get())),
            ("powerUpCurrentLimit", i32::from(self.power_up_current_limit.get())),
            ("runTimeCurrentLimit", i32::from(self.run_time_current_limit.get())),
            ("powerUpTime", i32::from(self.power_up_time)),
            ("usbFineResistor", i32::from(self.usb_fine_resistor)),
            ("auxFineResistor", i32::from(self.aux_fine_resistor)),
            ("initialUsbVoltage", i32::from(self.initial_usb_voltage.get())),
            ("initialAuxVoltage", i32::from(self.initial_aux_voltage.get())),
            ("hardwareRevision", i32::from(self.hardware_revision)),
            ("temperatureLimit", i32::from(self.temperature_limit)),
            ("usbPassthroughMode", i32::from(self.usb_passthrough_mode)),
            ("mainCoarseResistor", i32::from(self.main_coarse_resistor)),
            ("usbCoarseResistor", i32::from(self.usb_coarse_resistor)),
            ("auxCoarseResistor", i32::from(self.aux_coarse_resistor)),
            ("defMainFineResistor", i32::from(self.def_main_fine_resistor)),
            ("defUsbFineResistor", i32::from(self.def_usb_fine_resistor)),
            ("defAuxFineResistor", i32::from(self.def_aux_fine_resistor)),
            ("defMainCoarseResistor", i32::from(self.def_main_coarse_resistor)),
            ("defUsbCoarseResistor", i32::from(self.def_usb_coarse_resistor)),
            ("defAuxCoarseResistor", i32::from(self.def_aux_coarse_resistor)),
            ("eventCode", i32::from(self.event_code)),
            ("eventData", i32::from(self.event_data.get())),
        ]
    }
}

/// Unit conversion applied to a status field, chosen by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    /// Output voltage setting: `2.0 + raw * 0.01` volts.
    VoltageSetting,
    /// Raw ADC current; converting to amperes needs calibration data.
    RawCurrent,
    /// Measured voltage: `raw * 0.000125` volts.
    Voltage,
    /// Shunt resistor: `0.05 + raw * 0.0001` ohms.
    Resistor,
    /// Auxiliary channel shunt resistor, 50 mOhm above [`FieldClass::Resistor`].
    AuxResistor,
    /// Current limit: `8 * (1023 - raw) / 1023` amperes.
    CurrentLimit,
    Plain,
}

impl FieldClass {
    pub fn for_name(name: &str) -> Self {
        if name.ends_with("VoltageSetting") {
            FieldClass::VoltageSetting
        } else if name.ends_with("FineCurrent") || name.ends_with("CoarseCurrent") {
            FieldClass::RawCurrent
        } else if name.starts_with("voltage") || name.ends_with("Voltage") {
            FieldClass::Voltage
        } else if name.ends_with("Resistor") {
            if name.starts_with("aux") || name.starts_with("defAux") {
                FieldClass::AuxResistor
            } else {
                FieldClass::Resistor
            }
        } else if name.ends_with("CurrentLimit") {
            FieldClass::CurrentLimit
        } else {
            FieldClass::Plain
        }
    }

    pub fn convert(self, raw: i32) -> StatusValue {
        let raw_f = f64::from(raw);
        match self {
            FieldClass::VoltageSetting => StatusValue::Float(2.0 + raw_f * 0.01),
            FieldClass::RawCurrent | FieldClass::Plain => StatusValue::Int(raw),
            FieldClass::Voltage => StatusValue::Float(raw_f * 0.000125),
            FieldClass::Resistor => StatusValue::Float(0.05 + raw_f * 0.0001),
            FieldClass::AuxResistor => StatusValue::Float(0.05 + raw_f * 0.0001 + 0.05),
            FieldClass::CurrentLimit => StatusValue::Float(8.0 * (1023.0 - raw_f) / 1023.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusValue {
    Int(i32),
    Float(f64),
}

impl StatusValue {
    pub fn as_f64(self) -> f64 {
        match self {
            StatusValue::Int(v) => f64::from(v),
            StatusValue::Float(v) => v,
        }
    }
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusValue::Int(v) => write!(f, "{}", v),
            StatusValue::Float(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("Wrong status record length: expected {expected}, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("Not a status record: type 0x{0:02x}")]
    WrongType(u8),
}

/// Decoded status record with every field converted to its unit.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    fields: BTreeMap<&'static str, StatusValue>,
}

impl StatusRecord {
    /// Decode a status payload (without length and checksum bytes).
    pub fn decode(bytes: &[u8]) -> Result<Self, StatusError> {
        let raw = StatusRaw::ref_from_bytes(bytes).map_err(|_| StatusError::WrongLength {
            expected: STATUS_RECORD_LEN,
            actual: bytes.len(),
        })?;
        if raw.packet_type != STATUS_PACKET_TYPE {
            return Err(StatusError::WrongType(raw.packet_type));
        }

        let fields = raw
            .fields()
            .into_iter()
            .map(|(name, value)| (name, FieldClass::for_name(name).convert(value)))
            .collect();
        Ok(Self { fields })
    }

    pub fn get(&self, name: &str) -> Option<StatusValue> {
        self.fields.get(name).copied()
    }

    /// All fields, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, StatusValue)> + '_ {
        self.fields.iter().map(|(name, value)| (*name, *value))
    }

    fn float(&self, name: &str) -> f64 {
        self.get(name).map_or(0.0, StatusValue::as_f64)
    }

    fn int(&self, name: &str) -> i32 {
        match self.get(name) {
            Some(StatusValue::Int(v)) => v,
            Some(StatusValue::Float(v)) => v as i32,
            None => 0,
        }
    }

    pub fn serial_number(&self) -> u16 {
        self.int("serialNumber") as u16
    }

    /// Native sample rate in samples per second (the record reports kHz).
    pub fn sample_rate_hz(&self) -> u32 {
        self.int("sampleRate") as u32 * 1000
    }

    /// Voltage currently present on the main output.
    pub fn voltage1(&self) -> f64 {
        self.float("voltage1")
    }

    pub fn output_voltage_setting(&self) -> f64 {
        self.float("outputVoltageSetting")
    }

    pub fn run_time_current_limit(&self) -> f64 {
        self.float("runTimeCurrentLimit")
    }

    pub fn power_up_current_limit(&self) -> f64 {
        self.float("powerUpCurrentLimit")
    }

    pub fn usb_passthrough_mode(&self) -> u8 {
        self.int("usbPassthroughMode") as u8
    }

    pub fn firmware_version(&self) -> u8 {
        self.int("firmwareVersion") as u8
    }
}

impl fmt::Display for StatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use zerocopy::FromZeros;

    /// Raw status payload: all zero apart from the packet type and whatever
    /// `fill` sets.
    pub fn raw_status(fill: impl FnOnce(&mut StatusRaw)) -> Vec<u8> {
        let mut raw = StatusRaw::new_zeroed();
        raw.packet_type = STATUS_PACKET_TYPE;
        fill(&mut raw);
        raw.as_bytes().to_vec()
    }
}
