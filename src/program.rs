//! Test programs: parsing the program document into executable steps.
//!
//! ```json
//! {
//!   "name": "capacity test",
//!   "steps": [
//!     {"command": "C-CV", "parameters": {"currentA": 1.0, "voltageV": 4.2, "cutoffA": 0.1}},
//!     {"command": "Wait", "minutes": 5},
//!     {"command": "D-CC", "parameters": {"currentA": 1.0, "cutoffV": 2.5},
//!      "stopCondition": {"capacityAh": "50%"}},
//!     {"command": "Cycle", "step": 0, "count": 3}
//!   ]
//! }
//! ```

use crate::device::{Command, Device};
use crate::error::{EbcError, Result};
use crate::types::names;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Shortest accepted wait in seconds
const MIN_WAIT_SECONDS: u64 = 5;

/// Rule that stops a running command before the device finishes it
#[derive(Debug, Clone, PartialEq)]
pub enum StopCondition {
    None,
    /// Stop once the parameter reaches `threshold`
    Absolute {
        parameter: String,
        threshold: f64,
    },
    /// Stop once the parameter reaches `percent` of the capacity recorded by
    /// the nearest preceding command step
    Percent {
        parameter: String,
        percent: f64,
    },
}

impl StopCondition {
    fn parse(step: usize, object: &Map<String, Value>) -> Result<Self> {
        let mut condition = StopCondition::None;
        for (key, value) in object {
            if key != names::CAPACITY_AH {
                return Err(invalid(step, "invalid parameter name of stop condition"));
            }
            let parameter = key.clone();
            condition = match value {
                Value::Number(n) => StopCondition::Absolute {
                    parameter,
                    threshold: n
                        .as_f64()
                        .ok_or_else(|| invalid(step, "invalid stop condition value"))?,
                },
                Value::String(s) => match s.trim().strip_suffix('%') {
                    Some(percent) => StopCondition::Percent {
                        parameter,
                        percent: parse_number(step, percent)?,
                    },
                    None => StopCondition::Absolute {
                        parameter,
                        threshold: parse_number(step, s)?,
                    },
                },
                _ => return Err(invalid(step, "invalid stop condition value")),
            };
        }
        Ok(condition)
    }

    pub fn parameter(&self) -> Option<&str> {
        match self {
            StopCondition::None => None,
            StopCondition::Absolute { parameter, .. } | StopCondition::Percent { parameter, .. } => {
                Some(parameter)
            }
        }
    }
}

impl fmt::Display for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCondition::None => write!(f, "stop condition \"none\""),
            StopCondition::Absolute {
                parameter,
                threshold,
            } => write!(
                f,
                "stop condition \"absolute\" (\"{}\" = {:.3})",
                parameter, threshold
            ),
            StopCondition::Percent { parameter, percent } => write!(
                f,
                "stop condition \"percent\" (\"{}\" = {:.0}%)",
                parameter, percent
            ),
        }
    }
}

fn parse_number(step: usize, text: &str) -> Result<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| invalid(step, "invalid stop condition value"))
}

fn invalid(step: usize, reason: &str) -> EbcError {
    EbcError::InvalidProgram {
        step,
        reason: reason.to_string(),
    }
}

/// One program step with its runtime state
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Wait {
        seconds: u32,
    },
    /// Jump back to `target` until it has been repeated `count` times
    Cycle {
        target: usize,
        count: u16,
        completed: u16,
    },
    Command {
        command: Command,
        stop: StopCondition,
        active: bool,
        stop_issued: bool,
        /// Capacity seen in the last active response
        capacity: f64,
    },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Wait { .. } => "Wait",
            Step::Cycle { .. } => "Cycle",
            Step::Command { command, .. } => command.name(),
        }
    }
}

/// Human readable wait duration, whole minutes where possible
pub fn format_duration(seconds: u32) -> String {
    if seconds % 60 != 0 {
        format!("{}s", seconds)
    } else {
        format!("{}m", seconds / 60)
    }
}

#[derive(Debug, Deserialize)]
struct ProgramDocument {
    #[serde(default)]
    name: String,
    #[serde(default)]
    steps: Vec<Value>,
}

/// A loaded program
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Program {
    /// Parse a program document, resolving command steps against `device`.
    ///
    /// The first violation rejects the whole document.
    pub fn parse(device: Device, json: &str) -> Result<Self> {
        let document: ProgramDocument = serde_json::from_str(json)?;
        let mut steps = Vec::with_capacity(document.steps.len());

        for value in &document.steps {
            let index = steps.len();
            let object = value
                .as_object()
                .ok_or_else(|| invalid(index, "cannot cast to object"))?;
            let step = match object.get("command").and_then(Value::as_str) {
                Some("Wait") => parse_wait(index, object)?,
                Some("Cycle") => parse_cycle(index, object)?,
                _ => parse_command(device, index, object)?,
            };
            debug!("added step {}: {}", index, step.name());
            steps.push(step);
        }

        Ok(Program {
            name: document.name,
            steps,
        })
    }
}

fn parse_wait(index: usize, object: &Map<String, Value>) -> Result<Step> {
    let field = |key: &str| object.get(key).and_then(Value::as_u64).unwrap_or(0);
    let seconds = match field("seconds") {
        s if s >= MIN_WAIT_SECONDS => s,
        _ => match field("minutes") {
            m if m >= 1 => m * 60,
            _ => return Err(invalid(index, "duration")),
        },
    };
    let seconds = u32::try_from(seconds).map_err(|_| invalid(index, "duration"))?;
    Ok(Step::Wait { seconds })
}

fn parse_cycle(index: usize, object: &Map<String, Value>) -> Result<Step> {
    let target = object
        .get("step")
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid(index, "destination"))?;
    // only steps declared before this one can be jumped to
    if target >= index as u64 {
        return Err(invalid(index, "destination"));
    }
    let count = object
        .get("count")
        .and_then(Value::as_u64)
        .and_then(|c| u16::try_from(c).ok())
        .ok_or_else(|| invalid(index, "count"))?;
    Ok(Step::Cycle {
        target: target as usize,
        count,
        completed: 0,
    })
}

fn parse_command(device: Device, index: usize, object: &Map<String, Value>) -> Result<Step> {
    let command = device
        .command_from_json(object)
        .map_err(|e| invalid(index, &format!("invalid command: {}", e)))?;
    let stop = match object.get("stopCondition") {
        Some(Value::Object(condition)) => StopCondition::parse(index, condition)?,
        Some(Value::Null) | None => StopCondition::None,
        Some(_) => return Err(invalid(index, "invalid stop condition")),
    };
    debug!("step {}: {} / {}", index, command.name(), stop);
    Ok(Step::Command {
        command,
        stop,
        active: false,
        stop_issued: false,
        capacity: 0.0,
    })
}

/// Kind specific part of a step record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StepDetail {
    Wait {
        duration: String,
    },
    Cycle {
        cycle_step: usize,
        num: u16,
        count: u16,
    },
    Command {
        #[serde(rename = "capacityAh")]
        capacity_ah: f64,
    },
}

/// Record of one completed step, as published in the result list
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: usize,
    pub command: String,
    #[serde(flatten)]
    pub detail: StepDetail,
    pub finished_at: DateTime<Utc>,
}
