//! Device schemas.
//!
//! A schema declares which commands a device understands, how their
//! parameters are laid out, how response slots are to be read for every
//! mode and which response modes belong to which command lifecycle. The set
//! of schemas is closed: the EBC-A20 and a conservative fallback used for
//! every device id we do not know.

use crate::codec;
use crate::constants::*;
use crate::error::{EbcError, Result};
use crate::frame::{CommandFrame, ResponseFrame};
use crate::types::{names, PackingKind, Parameter, ParameterShape};
use log::error;
use serde_json::{json, Map, Value};

/// Lifecycle of one command as seen through response modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub command: u8,
    /// Every mode that may follow the command
    pub valid_modes: &'static [u8],
    pub active: Option<u8>,
    pub finished: Option<u8>,
    pub stopped: Option<u8>,
}

impl CommandDescriptor {
    const fn plain(command: u8, valid_modes: &'static [u8]) -> Self {
        Self {
            command,
            valid_modes,
            active: None,
            finished: None,
            stopped: None,
        }
    }

    /// `modes` is ordered active, finished, stopped
    const fn lifecycle(command: u8, modes: &'static [u8; 3]) -> Self {
        Self {
            command,
            valid_modes: modes,
            active: Some(modes[0]),
            finished: Some(modes[1]),
            stopped: Some(modes[2]),
        }
    }
}

const D_CC_MODES: [u8; 3] = [MODE_D_CC_ACTIVE, MODE_D_CC_FINISHED, MODE_D_CC_STOPPED];
const D_CP_MODES: [u8; 3] = [MODE_D_CP_ACTIVE, MODE_D_CP_FINISHED, MODE_D_CP_STOPPED];
const C_CV_MODES: [u8; 3] = [MODE_C_CV_ACTIVE, MODE_C_CV_FINISHED, MODE_C_CV_STOPPED];
const STOPPED_MODES: [u8; 3] = [MODE_D_CC_STOPPED, MODE_D_CP_STOPPED, MODE_C_CV_STOPPED];
const CONNECTED_MODES: [u8; 6] = [
    MODE_D_CC_ACTIVE,
    MODE_D_CC_STOPPED,
    MODE_D_CP_ACTIVE,
    MODE_D_CP_STOPPED,
    MODE_C_CV_ACTIVE,
    MODE_C_CV_STOPPED,
];

// Every command may be sent at any time; each row lists the responses that
// can follow it.
const EBC_A20_COMMANDS: [CommandDescriptor; 6] = [
    CommandDescriptor::plain(CMD_CONNECT, &CONNECTED_MODES),
    CommandDescriptor::plain(CMD_DISCONNECT, &[]),
    CommandDescriptor::lifecycle(CMD_C_CV, &C_CV_MODES),
    CommandDescriptor::lifecycle(CMD_D_CC, &D_CC_MODES),
    CommandDescriptor::lifecycle(CMD_D_CP, &D_CP_MODES),
    CommandDescriptor::plain(CMD_STOP, &STOPPED_MODES),
];

const UNKNOWN_COMMANDS: [CommandDescriptor; 3] = [
    CommandDescriptor::plain(CMD_CONNECT, &STOPPED_MODES),
    CommandDescriptor::plain(CMD_DISCONNECT, &[]),
    CommandDescriptor::plain(CMD_STOP, &STOPPED_MODES),
];

const C_CV_PARAMETERS: [ParameterShape; 3] = [
    ParameterShape::required(0, names::CURRENT_A, PackingKind::CurrentSet),
    // 0.00-30.00 V, max 18 V while charging
    ParameterShape::required(1, names::VOLTAGE_V, PackingKind::VoltageSet),
    // 0.10-5.00 A
    ParameterShape::required(2, names::CUTOFF_A, PackingKind::CurrentSet),
];

const D_CC_PARAMETERS: [ParameterShape; 3] = [
    ParameterShape::required(0, names::CURRENT_A, PackingKind::CurrentSet),
    ParameterShape::required(1, names::CUTOFF_V, PackingKind::VoltageSet),
    ParameterShape::optional(2, names::MAX_TIME_M, PackingKind::Time),
];

const D_CP_PARAMETERS: [ParameterShape; 3] = [
    ParameterShape::required(0, names::POWER_W, PackingKind::Power),
    ParameterShape::required(1, names::CUTOFF_V, PackingKind::VoltageSet),
    ParameterShape::optional(2, names::MAX_TIME_M, PackingKind::Time),
];

// Slot 3 carries something we have not identified yet.
const D_CC_RESPONSE: [ParameterShape; 6] = [
    ParameterShape::required(0, names::CURRENT_A, PackingKind::Current),
    ParameterShape::required(1, names::VOLTAGE_V, PackingKind::Voltage),
    ParameterShape::required(2, names::CAPACITY_AH, PackingKind::Capacity),
    ParameterShape::required(4, names::CURRENT_SET_A, PackingKind::CurrentSet),
    ParameterShape::required(5, names::VOLTAGE_SET_V, PackingKind::VoltageSet),
    ParameterShape::required(6, names::MAX_TIME_M, PackingKind::Time),
];

const D_CP_RESPONSE: [ParameterShape; 6] = [
    ParameterShape::required(0, names::CURRENT_A, PackingKind::Current),
    ParameterShape::required(1, names::VOLTAGE_V, PackingKind::Voltage),
    ParameterShape::required(2, names::CAPACITY_AH, PackingKind::Capacity),
    ParameterShape::required(4, names::POWER_SET_W, PackingKind::Power),
    ParameterShape::required(5, names::VOLTAGE_SET_V, PackingKind::VoltageSet),
    ParameterShape::required(6, names::MAX_TIME_SET_M, PackingKind::Time),
];

const C_CV_RESPONSE: [ParameterShape; 6] = [
    ParameterShape::required(0, names::CURRENT_A, PackingKind::Current),
    ParameterShape::required(1, names::VOLTAGE_V, PackingKind::Voltage),
    ParameterShape::required(2, names::CAPACITY_AH, PackingKind::Capacity),
    ParameterShape::required(4, names::CURRENT_SET_A, PackingKind::CurrentSet),
    ParameterShape::required(5, names::VOLTAGE_SET_V, PackingKind::VoltageSet),
    ParameterShape::required(6, names::CUTOFF_A, PackingKind::Current),
];

/// Generic lifecycle queries on a raw mode byte
pub fn mode_is_active(mode: u8) -> bool {
    mode & 0xF8 == 0x08
}

pub fn mode_is_stopped(mode: u8) -> bool {
    mode & 0xF8 == 0x00
}

pub fn mode_is_finished(mode: u8) -> bool {
    mode & 0xF8 == 0x10
}

/// How a response mode relates to one command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    pub valid: bool,
    pub active: bool,
    pub finished: bool,
    pub stopped: bool,
}

/// Closed set of supported device schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    EbcA20,
    /// Fallback for unrecognised device ids: connect, disconnect and stop only
    Unknown,
}

impl Device {
    pub fn model(&self) -> &'static str {
        match self {
            Device::EbcA20 => "EBC-A20",
            Device::Unknown => "EBC-???",
        }
    }

    pub fn commands(&self) -> &'static [CommandDescriptor] {
        match self {
            Device::EbcA20 => &EBC_A20_COMMANDS,
            Device::Unknown => &UNKNOWN_COMMANDS,
        }
    }

    pub fn list_commands(&self) -> Vec<u8> {
        self.commands().iter().map(|c| c.command).collect()
    }

    pub fn descriptor(&self, command: u8) -> Option<&'static CommandDescriptor> {
        self.commands().iter().find(|c| c.command == command)
    }

    /// Declared parameter layout of a command, empty if it takes none
    pub fn parameter_shape(&self, command: u8) -> &'static [ParameterShape] {
        match (self, command) {
            (Device::EbcA20, CMD_C_CV) => &C_CV_PARAMETERS,
            (Device::EbcA20, CMD_D_CC) => &D_CC_PARAMETERS,
            (Device::EbcA20, CMD_D_CP) => &D_CP_PARAMETERS,
            _ => &[],
        }
    }

    /// Declared slot layout of a response in `mode`
    pub fn response_shape(&self, mode: u8) -> &'static [ParameterShape] {
        match (self, mode) {
            (Device::EbcA20, MODE_D_CC_ACTIVE | MODE_D_CC_STOPPED | MODE_D_CC_FINISHED) => {
                &D_CC_RESPONSE
            }
            (Device::EbcA20, MODE_D_CP_ACTIVE | MODE_D_CP_STOPPED | MODE_D_CP_FINISHED) => {
                &D_CP_RESPONSE
            }
            (Device::EbcA20, MODE_C_CV_ACTIVE | MODE_C_CV_STOPPED | MODE_C_CV_FINISHED) => {
                &C_CV_RESPONSE
            }
            _ => &[],
        }
    }

    /// Classify `mode` against `command`.
    ///
    /// Without a command, a mode is valid if any declared command accepts it.
    pub fn classify(&self, mode: u8, command: Option<u8>) -> Classification {
        let descriptor = match command {
            Some(command) => self.descriptor(command),
            None => self
                .commands()
                .iter()
                .find(|c| c.valid_modes.contains(&mode)),
        };
        let Some(descriptor) = descriptor else {
            return Classification::default();
        };
        let is = |m: Option<u8>| command.is_some() && m == Some(mode);
        Classification {
            valid: descriptor.valid_modes.contains(&mode),
            active: is(descriptor.active),
            finished: is(descriptor.finished),
            stopped: is(descriptor.stopped),
        }
    }

    /// Whether `mode` shows the device is talking to us
    pub fn confirms_connection(&self, mode: u8) -> bool {
        self.descriptor(CMD_CONNECT)
            .is_some_and(|c| c.valid_modes.contains(&mode))
    }

    pub fn mode_name(&self, mode: u8) -> &'static str {
        match mode {
            MODE_D_CC_ACTIVE => "D-CC (active)",
            MODE_D_CC_STOPPED => "D-CC (stopped)",
            MODE_D_CC_FINISHED => "D-CC (finished)",
            MODE_D_CP_ACTIVE => "D-CP (active)",
            MODE_D_CP_STOPPED => "D-CP (stopped)",
            MODE_D_CP_FINISHED => "D-CP (finished)",
            MODE_C_CV_ACTIVE => "C-CV (active)",
            MODE_C_CV_STOPPED => "C-CV (stopped)",
            MODE_C_CV_FINISHED => "C-CV (finished)",
            MODE_INVALID => "Invalid",
            _ => "Unknown",
        }
    }

    pub fn command_name(&self, command: u8) -> &'static str {
        match (self, command) {
            (_, CMD_CONNECT) => "Connect",
            (_, CMD_DISCONNECT) => "Disconnect",
            (_, CMD_STOP) => "Stop",
            (_, CMD_INVALID) => "Invalid",
            (Device::EbcA20, CMD_CONTINUE) => "Continue",
            (Device::EbcA20, CMD_C_CV) => "C-CV",
            (Device::EbcA20, CMD_D_CC) => "D-CC",
            (Device::EbcA20, CMD_D_CP) => "D-CP",
            _ => "UNKNOWN",
        }
    }

    /// Resolve a display name to a declared command
    pub fn command_by_name(&self, name: &str) -> Option<u8> {
        self.commands()
            .iter()
            .map(|c| c.command)
            .find(|&c| self.command_name(c) == name)
    }

    pub fn decode(&self, raw: u16, packing: PackingKind) -> Result<f64> {
        match self {
            Device::EbcA20 => codec::decode(raw, packing),
            Device::Unknown => Err(EbcError::NoDecoder(packing)),
        }
    }

    pub fn encode(&self, value: f64, packing: PackingKind) -> Result<u16> {
        match self {
            Device::EbcA20 => codec::encode(value, packing),
            Device::Unknown => Err(EbcError::NoEncoder(packing)),
        }
    }

    pub fn connect(&self) -> Command {
        Command::bare(*self, CMD_CONNECT)
    }

    pub fn disconnect(&self) -> Command {
        Command::bare(*self, CMD_DISCONNECT)
    }

    pub fn stop(&self) -> Command {
        Command::bare(*self, CMD_STOP)
    }

    /// Build a command after checking `parameters` against the declared shape.
    ///
    /// The parameters must match the shape one to one, in order, by index,
    /// name and packing.
    pub fn create_command(&self, command: u8, parameters: &[Parameter]) -> Result<Command> {
        if self.descriptor(command).is_none() {
            error!(
                "command 0x{:x} is not defined on controller {}",
                command,
                self.model()
            );
            return Err(EbcError::UnknownCommand {
                command,
                model: self.model(),
            });
        }

        let name = self.command_name(command);
        let mismatch = |aspect| {
            error!("command {}: parameter {} do not match", name, aspect);
            EbcError::ParameterMismatch {
                command: name,
                aspect,
            }
        };
        let shape = self.parameter_shape(command);
        if shape.len() != parameters.len() {
            return Err(mismatch("sizes"));
        }
        for (declared, given) in shape.iter().zip(parameters) {
            if declared.index != given.index {
                return Err(mismatch("index"));
            }
            if declared.name != given.name {
                return Err(mismatch("name"));
            }
            if declared.packing != given.packing {
                return Err(mismatch("packing"));
            }
        }

        let mut values = [0u16; COMMAND_SLOTS];
        for parameter in parameters {
            match self.encode(parameter.value, parameter.packing) {
                Ok(raw) => values[parameter.index] = raw,
                Err(e) => error!(
                    "there is no encoder for parameter {} in command message 0x{:x}: {}",
                    parameter.name, command, e
                ),
            }
        }

        Ok(Command {
            device: *self,
            code: command,
            values,
        })
    }

    /// Build a command from a JSON step such as
    /// `{"command": "C-CV", "parameters": {"currentA": 1.0, ...}}`.
    ///
    /// Optional parameters that are left out are sent as zero.
    pub fn command_from_json(&self, step: &Map<String, Value>) -> Result<Command> {
        let name = step.get("command").and_then(Value::as_str).unwrap_or("");
        let command = self
            .command_by_name(name)
            .ok_or_else(|| EbcError::UnknownCommandName(name.to_string()))?;
        let display = self.command_name(command);
        let supplied = step.get("parameters").and_then(Value::as_object);

        let mut parameters = Vec::new();
        for shape in self.parameter_shape(command) {
            let mut parameter = Parameter::from(shape);
            match supplied.and_then(|p| p.get(shape.name)) {
                Some(value) => {
                    parameter.value = value.as_f64().ok_or(EbcError::ParameterMismatch {
                        command: display,
                        aspect: "type",
                    })?;
                }
                None if shape.mandatory => {
                    error!(
                        "command {}: parameter not found in json object: {}",
                        display, shape.name
                    );
                    return Err(EbcError::MissingParameter {
                        command: display,
                        name: shape.name,
                    });
                }
                None => {}
            }
            parameters.push(parameter);
        }

        self.create_command(command, &parameters)
    }

    /// Decode a response frame into named physical values.
    ///
    /// Slots out of range or without a decoder are logged; the rest of the
    /// frame is still decoded.
    pub fn decode_response(&self, frame: &ResponseFrame) -> Telemetry {
        let mode = frame.mode();
        let slots = frame.values();
        let mut parameters = Vec::new();
        for shape in self.response_shape(mode) {
            let Some(&raw) = slots.get(shape.index) else {
                error!(
                    "parameter {} not in range of values of response message 0x{:x}",
                    shape.name, mode
                );
                continue;
            };
            let mut parameter = Parameter::from(shape);
            parameter.raw = raw;
            match self.decode(raw, shape.packing) {
                Ok(value) => parameter.value = value,
                Err(e) => error!(
                    "there is no decoder for parameter {} in response message 0x{:x}: {}",
                    shape.name, mode, e
                ),
            }
            parameters.push(parameter);
        }
        Telemetry {
            device: *self,
            mode,
            parameters,
        }
    }
}

/// Immutable id -> schema lookup
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Vec<(u8, Device)>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self {
            devices: vec![(DEVICE_ID_EBC_A20, Device::EbcA20)],
        }
    }
}

impl DeviceRegistry {
    /// Schema for a device id, [`Device::Unknown`] when not registered
    pub fn lookup(&self, id: u8) -> Device {
        self.devices
            .iter()
            .find(|(known, _)| *known == id)
            .map(|(_, device)| *device)
            .unwrap_or(Device::Unknown)
    }
}

/// A validated command ready for the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    device: Device,
    code: u8,
    values: [u16; COMMAND_SLOTS],
}

impl Command {
    fn bare(device: Device, code: u8) -> Self {
        Self {
            device,
            code,
            values: [0; COMMAND_SLOTS],
        }
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn name(&self) -> &'static str {
        self.device.command_name(self.code)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn frame(&self) -> CommandFrame {
        CommandFrame::new(self.code, self.values)
    }

    pub fn to_hex(&self) -> String {
        self.frame().to_hex()
    }
}

/// One decoded response frame
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub device: Device,
    pub mode: u8,
    pub parameters: Vec<Parameter>,
}

impl Telemetry {
    pub fn classify(&self, command: Option<u8>) -> Classification {
        self.device.classify(self.mode, command)
    }

    pub fn mode_name(&self) -> &'static str {
        self.device.mode_name(self.mode)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
    }

    /// `{"mode": "...", "parameters": {"name": value, ...}}`
    pub fn to_json(&self) -> Value {
        let parameters: Map<String, Value> = self
            .parameters
            .iter()
            .filter(|p| p.packing != PackingKind::None)
            .map(|p| (p.name.to_string(), json!(p.value)))
            .collect();
        json!({
            "mode": self.mode_name(),
            "parameters": parameters,
        })
    }
}
