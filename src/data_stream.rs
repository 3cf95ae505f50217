//! Streamed measurement and calibration packets.
//!
//! While collection is running the meter sends packets laid out as
//!
//! ```text
//! [0x2s][type][x][y] { [main:i16][usb:i16][aux:i16][voltage:i16] } ... [trailer]
//! ```
//!
//! where `s` is a 4-bit sequence number and `type` is 0 for measurements,
//! 1 for zero calibration and 2 for reference calibration.

use crate::calibration::CalibrationState;
use zerocopy::byteorder::big_endian::I16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Smallest frame that carries one reading tuple.
pub const MIN_DATA_PACKET_LEN: usize = HEADER_LEN + TUPLE_LEN + 1;

/// Readings per packet never exceed this.
pub const MAX_READINGS: usize = 4;

const HEADER_LEN: usize = 4;
const TUPLE_LEN: usize = size_of::<ReadingRaw>();
const DATA_MARKER_MIN: u8 = 0x20;
const DATA_MARKER_MAX: u8 = 0x2f;

/// Reading tuple as it sits on the wire.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ReadingRaw {
    pub main: I16,
    pub usb: I16,
    pub aux: I16,
    pub voltage: I16,
}

/// One simultaneous reading of the four ADC channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub main: i16,
    pub usb: i16,
    pub aux: i16,
    pub voltage: i16,
}

impl From<ReadingRaw> for Reading {
    fn from(raw: ReadingRaw) -> Self {
        Self {
            main: raw.main.get(),
            usb: raw.usb.get(),
            aux: raw.aux.get(),
            voltage: raw.voltage.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Measurement,
    ZeroCalibration,
    ReferenceCalibration,
    Unknown(u8),
}

impl From<u8> for PacketKind {
    fn from(value: u8) -> Self {
        match value {
            0 => PacketKind::Measurement,
            1 => PacketKind::ZeroCalibration,
            2 => PacketKind::ReferenceCalibration,
            other => PacketKind::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// 4-bit rolling sequence number.
    pub sequence: u8,
    pub kind: PacketKind,
    pub readings: Vec<Reading>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("Wanted data, dropped type=0x{marker:02x}, len={len}")]
    NotData { marker: u8, len: usize },
}

impl DataPacket {
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        let marker = bytes.first().copied().unwrap_or(0);
        if bytes.len() < MIN_DATA_PACKET_LEN || !(DATA_MARKER_MIN..=DATA_MARKER_MAX).contains(&marker)
        {
            return Err(PacketError::NotData {
                marker,
                len: bytes.len(),
            });
        }

        // A tuple is only complete if at least one byte follows it.
        let readings = bytes[HEADER_LEN..bytes.len() - 1]
            .chunks_exact(TUPLE_LEN)
            .take(MAX_READINGS)
            .filter_map(|tuple| ReadingRaw::read_from_bytes(tuple).ok())
            .map(Reading::from)
            .collect();

        Ok(Self {
            sequence: marker & 0x0f,
            kind: PacketKind::from(bytes[1]),
            readings,
        })
    }
}

/// Turns data frames into calibrated current samples.
#[derive(Debug, Default)]
pub struct DataStream {
    calibration: CalibrationState,
    last_sequence: Option<u8>,
}

impl DataStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calibration(&self) -> &CalibrationState {
        &self.calibration
    }

    /// Forget calibration and sequence state, e.g. when collection restarts.
    pub fn reset(&mut self) {
        self.calibration.reset();
        self.last_sequence = None;
    }

    /// Handle one frame. Returns the calibrated samples of a measurement
    /// packet, or `None` if the frame carried no usable measurements.
    pub fn process_frame(&mut self, frame: &[u8]) -> Option<Vec<f64>> {
        let packet = match DataPacket::parse(frame) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("{}", e);
                return None;
            }
        };

        self.track_sequence(packet.sequence);

        match packet.kind {
            PacketKind::Measurement => {
                if !self.calibration.is_ready() {
                    log::warn!("Waiting for calibration, dropped data packet");
                    return None;
                }
                Some(
                    packet
                        .readings
                        .iter()
                        .filter_map(|r| self.calibration.current_amps(r.main))
                        .collect(),
                )
            }
            PacketKind::ZeroCalibration => {
                if let Some((fine, coarse)) = calibration_pair(&packet) {
                    self.calibration.set_zero(fine, coarse);
                }
                None
            }
            PacketKind::ReferenceCalibration => {
                if let Some((fine, coarse)) = calibration_pair(&packet) {
                    self.calibration.set_reference(fine, coarse);
                }
                None
            }
            PacketKind::Unknown(kind) => {
                log::warn!("Discarding data packet type=0x{:02x}", kind);
                None
            }
        }
    }

    fn track_sequence(&mut self, sequence: u8) {
        if let Some(last) = self.last_sequence {
            if sequence != last.wrapping_add(1) & 0x0f {
                log::warn!("Data sequence skipped, lost packet?");
            }
        }
        self.last_sequence = Some(sequence);
    }
}

/// Calibration packets carry the fine reading first and the coarse second.
fn calibration_pair(packet: &DataPacket) -> Option<(i16, i16)> {
    match packet.readings.as_slice() {
        [fine, coarse, ..] => Some((fine.main, coarse.main)),
        _ => {
            log::warn!(
                "Calibration packet with {} readings, expected at least 2",
                packet.readings.len()
            );
            None
        }
    }
}
