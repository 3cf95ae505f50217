use crate::frame_codec::{encode_frame, read_frame, FrameRead};
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

/// Default read timeout on the serial link. Silence beyond this is "no data".
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Baud rate is ignored by the CDC-ACM device but required to open the port.
const BAUD_RATE: u32 = 9600;

/// Byte stream the meter is reached over.
///
/// Implemented for real serial ports and for in-memory streams in tests.
pub trait Transport: Read + Write {
    /// Discard whatever the device already sent. Returns the number of bytes
    /// dropped, if known.
    fn discard_input(&mut self) -> io::Result<usize>;
}

impl Transport for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<usize> {
        let pending = self.bytes_to_read().map_err(io::Error::from)?;
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)?;
        Ok(pending as usize)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open a serial port the way the meter expects it.
pub fn open_serial(path: &str, timeout: Duration) -> Result<Box<dyn SerialPort>, LinkError> {
    log::debug!("Opening serial port {}", path);
    let port = serialport::new(path, BAUD_RATE).timeout(timeout).open()?;
    Ok(port)
}

/// Framed command/response link on top of a [`Transport`].
#[derive(Debug)]
pub struct MonsoonLink<T> {
    transport: T,
}

impl<T: Transport> MonsoonLink<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Frame and send one command payload.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        log::trace!("-> {:02x?}", payload);
        self.transport.write_all(&encode_frame(payload))?;
        self.transport.flush()?;
        Ok(())
    }

    /// Receive one frame.
    pub fn receive(&mut self) -> Result<FrameRead, LinkError> {
        Ok(read_frame(&mut self.transport)?)
    }

    /// Drop stale input left over from a previous session.
    pub fn flush_input(&mut self) -> Result<(), LinkError> {
        let flushed = self.transport.discard_input()?;
        if flushed > 0 {
            log::debug!("Dropped {} stale bytes", flushed);
        }
        Ok(())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}


#[cfg(test)]
mod tests {
    use super::mock::ScriptedTransport;
    use super::*;

    #[test]
    fn test_send_writes_framed_payload() {
        let mut link = MonsoonLink::new(ScriptedTransport::default());
        link.send(&[0x03, 0x00]).unwrap();
        assert_eq!(link.transport().written, vec![0x03, 0x03, 0x00, 0x06]);
    }

    #[test]
    fn test_flush_input_discards_pending_bytes() {
        let mut link = MonsoonLink::new(ScriptedTransport::with_input(encode_frame(&[1, 2])));
        link.flush_input().unwrap();
        assert_eq!(link.receive().unwrap(), FrameRead::NoData);
    }
}
