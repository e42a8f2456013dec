//! Protocol constants for EBC analyzer communication.
//!
//! This module defines the constants used by the EBC serial protocol,
//! including frame layout, command and mode bytes, timing parameters and
//! serial port configuration.

/// First byte of every frame
pub const START_TAG: u8 = 0xFA;

/// Last byte of every frame
pub const END_TAG: u8 = 0xF8;

/// Length of a command frame (host -> analyzer)
pub const COMMAND_FRAME_LEN: usize = 10;

/// Length of a response frame (analyzer -> host)
pub const RESPONSE_FRAME_LEN: usize = 19;

/// Number of 16-bit parameter slots in a command frame
pub const COMMAND_SLOTS: usize = 3;

/// Number of 16-bit data slots in a response frame
pub const RESPONSE_SLOTS: usize = 7;

/// Consecutive checksum failures tolerated before verification is disabled
pub const MAX_CHECKSUM_FAILURES: u32 = 5;

/// Placeholder command code, never sent
pub const CMD_INVALID: u8 = 0x00;
/// Open the PC connection
pub const CMD_CONNECT: u8 = 0x05;
/// Close the PC connection
pub const CMD_DISCONNECT: u8 = 0x06;
/// Stop the running program
pub const CMD_STOP: u8 = 0x02;
/// Continue a stopped program (display only)
pub const CMD_CONTINUE: u8 = 0x18;
/// Discharge with constant current
pub const CMD_D_CC: u8 = 0x01;
/// Discharge with constant power
pub const CMD_D_CP: u8 = 0x11;
/// Charge with constant voltage
pub const CMD_C_CV: u8 = 0x21;

/// Placeholder mode, never received from a healthy device
pub const MODE_INVALID: u8 = 0xFF;
pub const MODE_D_CC_ACTIVE: u8 = 0x0A;
pub const MODE_D_CC_STOPPED: u8 = 0x00;
pub const MODE_D_CC_FINISHED: u8 = 0x14;
pub const MODE_D_CP_ACTIVE: u8 = 0x0B;
pub const MODE_D_CP_STOPPED: u8 = 0x01;
pub const MODE_D_CP_FINISHED: u8 = 0x15;
pub const MODE_C_CV_ACTIVE: u8 = 0x0C;
pub const MODE_C_CV_STOPPED: u8 = 0x02;
pub const MODE_C_CV_FINISHED: u8 = 0x16;

/// Device id byte reported by the EBC-A20
pub const DEVICE_ID_EBC_A20: u8 = 0x09;

/// Baud rate (9600 bps)
pub const BAUD_RATE: u32 = 9600;

/// Parity configuration (8O1 line)
pub const PARITY: serialport::Parity = serialport::Parity::Odd;

/// Stop bits configuration
pub const STOP_BITS: serialport::StopBits = serialport::StopBits::One;

/// Read timeout in milliseconds, short enough for reads to act as polls
pub const READ_TIMEOUT_MS: u64 = 50;

/// Time the state machine waits in the initial state for the init event
pub const INIT_TIMEOUT_MS: u64 = 5000;

/// Interval between connect attempts
pub const CONNECT_RETRY_MS: u64 = 3000;

/// Time an issued command waits for telemetry before it is queued again
pub const COMMAND_RETRY_MS: u64 = 3000;

/// Time spent repeating the disconnect before giving up
pub const DISCONNECT_TIMEOUT_MS: u64 = 3000;

/// Pause before every program step except the first one of a run
pub const STEP_SETTLE_MS: u64 = 5000;
