//! Error types for EBC protocol operations.

use crate::types::PackingKind;
use thiserror::Error;

/// Result type alias for EBC operations.
pub type Result<T> = std::result::Result<T, EbcError>;

/// Error types for EBC analyzer communication and program handling.
#[derive(Error, Debug)]
pub enum EbcError {
    /// Serial port communication error
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON document
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Fewer bytes than a full frame could be read
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Fixed frame length
        expected: usize,
        /// Bytes actually read
        actual: usize,
    },

    /// Fewer bytes than a full frame were written
    #[error("Short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite {
        /// Fixed frame length
        expected: usize,
        /// Bytes actually written
        actual: usize,
    },

    /// Frame checksum validation failed
    #[error("Checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the payload
        computed: u8,
        /// Checksum byte found in the frame
        received: u8,
    },

    /// Command is not declared by the device schema
    #[error("Command {command:#04x} is not defined on controller {model}")]
    UnknownCommand {
        /// Command code
        command: u8,
        /// Model name of the schema
        model: &'static str,
    },

    /// Command name could not be resolved
    #[error("Unknown command name: {0}")]
    UnknownCommandName(String),

    /// Supplied parameters do not match the declared shape
    #[error("Command {command}: parameter {aspect} do not match")]
    ParameterMismatch {
        /// Display name of the command
        command: &'static str,
        /// What differs: sizes, index, name or packing
        aspect: &'static str,
    },

    /// A mandatory parameter was not supplied
    #[error("Command {command}: missing parameter {name}")]
    MissingParameter {
        /// Display name of the command
        command: &'static str,
        /// Parameter name
        name: &'static str,
    },

    /// No encoder exists for the packing kind
    #[error("No encoder for packing {0:?}")]
    NoEncoder(PackingKind),

    /// Value cannot be represented on the wire
    #[error("Value {value} out of range for packing {packing:?}")]
    ValueOutOfRange {
        /// Physical value to encode
        value: f64,
        /// Packing kind of the slot
        packing: PackingKind,
    },

    /// No decoder exists for the packing kind
    #[error("No decoder for packing {0:?}")]
    NoDecoder(PackingKind),

    /// Program document violates a load rule
    #[error("Invalid program step {step}: {reason}")]
    InvalidProgram {
        /// Index of the offending step
        step: usize,
        /// Which rule was violated
        reason: String,
    },
}
