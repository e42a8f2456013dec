//! Seams between the control logic and whatever hosts it.
//!
//! The session talks to the analyzer, the host UI and itself only through
//! these traits. Channel senders implement them so a host can simply listen
//! on the receiving ends.

use crate::device::Command;
use std::sync::mpsc::Sender;

/// Hands a command to the wire.
pub trait CommandSender {
    /// Returns false when the command could not be delivered
    fn send_command(&mut self, command: &Command) -> bool;
}

/// Receives published key/value pairs for display.
pub trait ReportSink {
    fn report(&mut self, key: &str, value: &str) -> bool;
}

/// Notifications the program executor raises for the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorEvent {
    CommandFinished,
    ProgramEnded,
}

pub trait EventNotifier {
    fn notify(&mut self, event: ExecutorEvent);
}

impl CommandSender for Sender<Command> {
    fn send_command(&mut self, command: &Command) -> bool {
        self.send(command.clone()).is_ok()
    }
}

impl ReportSink for Sender<(String, String)> {
    fn report(&mut self, key: &str, value: &str) -> bool {
        self.send((key.to_string(), value.to_string())).is_ok()
    }
}

impl EventNotifier for Sender<ExecutorEvent> {
    fn notify(&mut self, event: ExecutorEvent) {
        // The receiver only goes away on shutdown
        let _ = self.send(event);
    }
}

/// Report sink that remembers the last value of every key
#[derive(Debug, Default)]
pub struct Reports {
    values: std::collections::BTreeMap<String, String>,
}

impl Reports {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

impl ReportSink for Reports {
    fn report(&mut self, key: &str, value: &str) -> bool {
        self.values.insert(key.to_string(), value.to_string());
        true
    }
}
