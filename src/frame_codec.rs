//! Length-prefixed, checksummed framing used on the Monsoon serial link.
//!
//! Every frame on the wire looks like `[length][payload...][checksum]` where
//! `length` counts the payload plus the checksum byte and
//! `checksum = (length + sum(payload)) mod 256`.

use std::io::{self, Read};

/// Outcome of reading one frame from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRead {
    /// A frame with a valid checksum. The payload excludes length and checksum.
    Frame(Vec<u8>),
    /// The device stayed silent until the read timeout expired.
    NoData,
    /// A frame arrived but failed validation and was discarded.
    Dropped,
}

/// Checksum over the length byte and the payload.
pub fn checksum(length: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(length, |acc, &byte| acc.wrapping_add(byte))
}

/// Wrap a payload in a length prefix and a trailing checksum.
///
/// Payloads are at most 254 bytes long; every command the meter understands
/// is a handful of bytes.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() < usize::from(u8::MAX));
    let length = (payload.len() + 1) as u8;

    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(length);
    frame.extend_from_slice(payload);
    frame.push(checksum(length, payload));
    frame
}

/// Read a single frame.
///
/// A timeout before or inside a frame is reported as [`FrameRead::NoData`],
/// a checksum mismatch as [`FrameRead::Dropped`]. Only other I/O failures are
/// returned as errors.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> io::Result<FrameRead> {
    let mut length = [0u8; 1];
    if !read_full(reader, &mut length)? {
        log::debug!("Timeout reading from serial port");
        return Ok(FrameRead::NoData);
    }

    let length = length[0];
    if length == 0 {
        return Ok(FrameRead::Frame(Vec::new()));
    }

    let mut body = vec![0u8; usize::from(length)];
    if !read_full(reader, &mut body)? {
        log::debug!("Timeout inside a frame of length {}", length);
        return Ok(FrameRead::NoData);
    }

    let Some(received) = body.pop() else {
        return Ok(FrameRead::Dropped);
    };
    let expected = checksum(length, &body);
    if received != expected {
        log::warn!(
            "Invalid checksum from serial port: got 0x{:02x}, expected 0x{:02x}",
            received,
            expected
        );
        return Ok(FrameRead::Dropped);
    }

    Ok(FrameRead::Frame(body))
}

/// Fill `buf` completely. Returns `false` when the stream timed out or ended
/// before the buffer was full.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(false)
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
