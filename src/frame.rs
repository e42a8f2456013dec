//! Fixed-length framing with XOR checksum.
//!
//! Every frame starts with [`START_TAG`] and ends with [`END_TAG`]; the byte
//! before the end tag is the XOR of all bytes between the tags. The analyzer
//! never puts a checksum in the `0xF0..=0xFF` range on the wire: when the XOR
//! lands there only its low nibble is sent. Both forms are accepted on read.

use crate::constants::*;
use crate::error::{EbcError, Result};
use log::error;
use std::io::{ErrorKind, Read, Write};

/// XOR of all payload bytes
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, b| acc ^ b)
}

/// Checksum byte as it is transmitted, folded out of the tag range
pub fn wire_checksum(payload: &[u8]) -> u8 {
    let cs = checksum(payload);
    if cs & 0xF0 == 0xF0 {
        cs & 0x0F
    } else {
        cs
    }
}

/// Whether `received` is acceptable for a frame whose payload XORs to `computed`
pub fn checksum_matches(computed: u8, received: u8) -> bool {
    computed == received || (computed & 0xF0 == 0xF0 && computed & 0x0F == received)
}

/// Lowercase hex rendering without separators, e.g. `fa0500000000000005f8`
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn payload(bytes: &[u8]) -> &[u8] {
    &bytes[1..bytes.len() - 2]
}

fn write_frame<W: Write>(bytes: &[u8], writer: &mut W) -> Result<()> {
    let written = writer.write(bytes)?;
    if written < bytes.len() {
        error!("not enough data written");
        return Err(EbcError::ShortWrite {
            expected: bytes.len(),
            actual: written,
        });
    }
    writer.flush()?;
    Ok(())
}

/// Host -> analyzer frame: tag, command byte, 3 big-endian slots, checksum, tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: [u8; COMMAND_FRAME_LEN],
}

impl CommandFrame {
    pub fn new(command: u8, values: [u16; COMMAND_SLOTS]) -> Self {
        let mut bytes = [0u8; COMMAND_FRAME_LEN];
        bytes[0] = START_TAG;
        bytes[1] = command;
        for (i, value) in values.iter().enumerate() {
            bytes[2 * i + 2..2 * i + 4].copy_from_slice(&value.to_be_bytes());
        }
        bytes[COMMAND_FRAME_LEN - 2] = wire_checksum(payload(&bytes));
        bytes[COMMAND_FRAME_LEN - 1] = END_TAG;
        Self { bytes }
    }

    /// Parse and verify a complete command frame
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; COMMAND_FRAME_LEN] =
            bytes.try_into().map_err(|_| EbcError::ShortRead {
                expected: COMMAND_FRAME_LEN,
                actual: bytes.len(),
            })?;
        let computed = checksum(payload(&bytes));
        let received = bytes[COMMAND_FRAME_LEN - 2];
        if bytes[0] != START_TAG
            || bytes[COMMAND_FRAME_LEN - 1] != END_TAG
            || !checksum_matches(computed, received)
        {
            return Err(EbcError::ChecksumMismatch { computed, received });
        }
        Ok(Self { bytes })
    }

    pub fn command(&self) -> u8 {
        self.bytes[1]
    }

    pub fn values(&self) -> [u16; COMMAND_SLOTS] {
        std::array::from_fn(|i| u16::from_be_bytes([self.bytes[2 * i + 2], self.bytes[2 * i + 3]]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.bytes)
    }

    /// Write the whole frame; a short write is an error
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_frame(&self.bytes, writer)
    }
}

/// Analyzer -> host frame: tag, mode byte, 7 big-endian slots, device id, checksum, tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame {
    bytes: [u8; RESPONSE_FRAME_LEN],
}

impl ResponseFrame {
    /// Build a well-formed response frame, as the analyzer would send it
    pub fn new(mode: u8, values: [u16; RESPONSE_SLOTS], device_id: u8) -> Self {
        let mut bytes = [0u8; RESPONSE_FRAME_LEN];
        bytes[0] = START_TAG;
        bytes[1] = mode;
        for (i, value) in values.iter().enumerate() {
            bytes[2 * i + 2..2 * i + 4].copy_from_slice(&value.to_be_bytes());
        }
        bytes[RESPONSE_FRAME_LEN - 3] = device_id;
        bytes[RESPONSE_FRAME_LEN - 2] = wire_checksum(payload(&bytes));
        bytes[RESPONSE_FRAME_LEN - 1] = END_TAG;
        Self { bytes }
    }

    /// Wrap raw bytes without verification
    pub fn from_bytes(bytes: [u8; RESPONSE_FRAME_LEN]) -> Self {
        Self { bytes }
    }

    pub fn mode(&self) -> u8 {
        self.bytes[1]
    }

    pub fn values(&self) -> [u16; RESPONSE_SLOTS] {
        std::array::from_fn(|i| u16::from_be_bytes([self.bytes[2 * i + 2], self.bytes[2 * i + 3]]))
    }

    pub fn device_id(&self) -> u8 {
        self.bytes[RESPONSE_FRAME_LEN - 3]
    }

    pub fn as_bytes(&self) -> &[u8; RESPONSE_FRAME_LEN] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.bytes)
    }
}

/// Checksum verification with fail-open after repeated failures.
///
/// More than [`MAX_CHECKSUM_FAILURES`] consecutive failures disable the
/// verification for the rest of the session.
#[derive(Debug, Default)]
pub struct ChecksumGuard {
    failures: u32,
    disabled: bool,
}

impl ChecksumGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Check a whole frame, tags included
    pub fn verify(&mut self, bytes: &[u8]) -> Result<()> {
        // start tag, checksum and end tag at the very least
        if bytes.len() < 3 {
            return Err(EbcError::ShortRead {
                expected: 3,
                actual: bytes.len(),
            });
        }
        if self.disabled {
            return Ok(());
        }
        let computed = checksum(payload(bytes));
        let received = bytes[bytes.len() - 2];
        let valid = checksum_matches(computed, received);
        if valid {
            self.failures = 0;
        } else {
            error!("crc check failed: 0x{:x} != 0x{:x}", computed, received);
            self.failures += 1;
        }
        if self.failures > MAX_CHECKSUM_FAILURES {
            self.disabled = true;
            error!("crc check disabled!");
            return Ok(());
        }
        if valid {
            Ok(())
        } else {
            Err(EbcError::ChecksumMismatch { computed, received })
        }
    }
}

fn read_byte<R: Read>(reader: &mut R) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Pulls response frames out of a byte stream
#[derive(Debug, Default)]
pub struct FrameReader {
    guard: ChecksumGuard,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> &ChecksumGuard {
        &self.guard
    }

    /// Poll the stream for one response frame.
    ///
    /// Bytes before the start tag are discarded. `Ok(None)` means the stream
    /// had no frame to offer; a frame cut short or failing its checksum is
    /// dropped and reported as an error.
    pub fn read<R: Read>(&mut self, reader: &mut R) -> Result<Option<ResponseFrame>> {
        loop {
            match read_byte(reader)? {
                None => return Ok(None),
                Some(START_TAG) => break,
                Some(_) => continue,
            }
        }

        let mut bytes = [0u8; RESPONSE_FRAME_LEN];
        bytes[0] = START_TAG;
        let mut filled = 1;
        while filled < RESPONSE_FRAME_LEN {
            match read_byte(reader)? {
                Some(b) => {
                    bytes[filled] = b;
                    filled += 1;
                }
                None => {
                    error!("not enough data read");
                    return Err(EbcError::ShortRead {
                        expected: RESPONSE_FRAME_LEN,
                        actual: filled,
                    });
                }
            }
        }

        if let Err(e) = self.guard.verify(&bytes) {
            error!("crc check fails on read data: {}", to_hex(&bytes));
            return Err(e);
        }
        Ok(Some(ResponseFrame::from_bytes(bytes)))
    }
}
