//! Serial link to the analyzer.

use crate::constants::*;
use crate::device::Command;
use crate::error::Result;
use crate::frame::{FrameReader, ResponseFrame};
use crate::host::CommandSender;
use log::{debug, error};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;

/// Open `port_name` with the analyzer's line settings (9600 8O1).
///
/// Reads time out quickly so that polling for a frame never stalls the
/// control loop.
pub fn open(port_name: &str) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(port_name, BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .parity(PARITY)
        .stop_bits(STOP_BITS)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(READ_TIMEOUT_MS))
        .open()?;
    Ok(port)
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>> {
    Ok(serialport::available_ports()?)
}

/// Frame level access to a byte transport
pub struct Link<T> {
    port: T,
    reader: FrameReader,
}

impl<T: Read + Write> Link<T> {
    pub fn new(port: T) -> Self {
        Self {
            port,
            reader: FrameReader::new(),
        }
    }

    /// Next complete response frame, if one is there.
    ///
    /// Bad frames are logged and dropped.
    pub fn poll(&mut self) -> Option<ResponseFrame> {
        match self.reader.read(&mut self.port) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropped response: {}", e);
                None
            }
        }
    }

    /// Whether checksums are still verified
    pub fn verifies_checksums(&self) -> bool {
        !self.reader.guard().is_disabled()
    }

    pub fn get_ref(&self) -> &T {
        &self.port
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.port
    }
}

impl<T: Write> CommandSender for Link<T> {
    fn send_command(&mut self, command: &Command) -> bool {
        let frame = command.frame();
        match frame.write_to(&mut self.port) {
            Ok(()) => {
                debug!("sent {}: {}", command.name(), frame.to_hex());
                true
            }
            Err(e) => {
                error!("cannot send {}: {}", command.name(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use std::io::Cursor;

    #[test]
    fn test_link_writes_frames() {
        let mut link = Link::new(Cursor::new(Vec::new()));
        assert!(link.send_command(&Device::EbcA20.connect()));
        assert!(link.send_command(&Device::EbcA20.stop()));
        assert_eq!(
            crate::frame::to_hex(link.get_ref().get_ref()),
            "fa0500000000000005f8fa0200000000000002f8"
        );
    }

    #[test]
    fn test_link_polls_frames() {
        let bytes = [
            0xfa, 0x0a, 0x00, 0x23, 0x10, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x23, 0x01, 0x8c,
            0x00, 0x00, 0x09, 0x82, 0xf8,
        ];
        let mut link = Link::new(Cursor::new(bytes.to_vec()));
        let frame = link.poll().unwrap();
        assert_eq!(frame.mode(), MODE_D_CC_ACTIVE);
        assert_eq!(frame.device_id(), DEVICE_ID_EBC_A20);
        assert!(link.poll().is_none());
        assert!(link.verifies_checksums());
    }
}
